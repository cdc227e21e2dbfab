//! End-to-end desk tests.
//!
//! Tests cover: a seeded desk routing an escalation through assignment,
//! response and resolution; the periodic scan (at-risk, breach, timeout
//! handoff) and its idempotence; a scan that meets an unroutable escalation;
//! resolution retries; the event log; the scheduler loop.

use chrono::{TimeZone, Utc};
use escalation_core::{
    assignment_engine::{AssignmentOutcome, AssignmentRule},
    clock::ManualClock,
    config::{DeskConfig, SchedulerConfig},
    error::DeskError,
    notification_dispatcher::{HistoryQuery, NotificationPayload},
    notification_preferences::{NotificationPriority, NotificationType},
    repository::{TeamRepository, WorkloadRepository},
    scheduler::DeskScheduler,
    setup::DeskSetup,
    sla_tracker::{ComplianceLevel, SlaClock},
    team::{Escalation, Severity},
    DeskStore, EscalationDesk,
};
use serde_json::json;
use std::sync::Arc;

struct Fixture {
    store: Arc<DeskStore>,
    clock: Arc<ManualClock>,
    desk: Arc<EscalationDesk>,
}

/// t1 = [a, b] led by `lead`, falling back to t2 = [x].
/// Legal escalations wait for a manual pick, timing out after 10 minutes.
fn setup() -> DeskSetup {
    serde_json::from_value(json!({
        "members": [
            { "member_id": "a",    "name": "Ana",   "role": "standard",  "max_active_assignments": 5 },
            { "member_id": "b",    "name": "Ben",   "role": "senior",    "max_active_assignments": 5 },
            { "member_id": "lead", "name": "Lea",   "role": "team_lead", "max_active_assignments": 5 },
            { "member_id": "x",    "name": "Xavi",  "role": "standard",  "max_active_assignments": 5 }
        ],
        "teams": [
            { "team_id": "t1", "name": "Disputes", "member_ids": ["a", "b"], "lead_ids": ["lead"],
              "default_strategy": "load_balanced", "fallback_team_id": "t2" },
            { "team_id": "t2", "name": "Overflow", "member_ids": ["x"], "default_strategy": "load_balanced" }
        ],
        "rules": [
            { "rule_id": "legal", "team_id": "t1", "name": "Legal review", "context": "legal",
              "strategy": "manual", "escalate_if_unassigned_after_minutes": 10, "priority": 10, "enabled": true },
            { "rule_id": "fraud", "team_id": "t1", "name": "Fraud desk", "context": "fraud",
              "strategy": "skill_matched", "skills_required": ["fraud"], "priority": 20, "enabled": true }
        ],
        "sla_configurations": [
            { "team_id": "t1", "response_time_minutes": 30, "resolution_time_minutes": 240,
              "warning_threshold_minutes": 15, "critical_threshold_minutes": 5 }
        ],
        "directory": [
            { "user_id": "lead", "roles": ["supervisor"] }
        ]
    }))
    .expect("setup document")
}

fn build() -> Fixture {
    let store = Arc::new(DeskStore::in_memory().expect("open store"));
    store.migrate().expect("migrate");
    setup().apply(&store).expect("apply setup");
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
    let desk = Arc::new(EscalationDesk::new(store.clone(), clock.clone(), DeskConfig::default()));
    Fixture { store, clock, desk }
}

fn escalation(id: &str, context: &str, severity: Severity) -> Escalation {
    Escalation {
        escalation_id: id.into(),
        team_id: "t1".into(),
        context: context.into(),
        level: 1,
        severity,
        skills_required: vec![],
        title: format!("Dispute {id}"),
    }
}

fn event_types(desk: &EscalationDesk, subject: &str) -> Vec<String> {
    desk.events_for(subject).unwrap().into_iter().map(|e| e.event_type).collect()
}

fn inbox_kinds(desk: &EscalationDesk, recipient: &str) -> Vec<NotificationType> {
    let mut kinds: Vec<NotificationType> = desk
        .notifications
        .history(recipient, &HistoryQuery::default())
        .unwrap()
        .into_iter()
        .map(|n| n.kind)
        .collect();
    kinds.reverse();
    kinds
}

/// Created, answered, resolved: tracker, workload, inbox and log agree.
#[tokio::test]
async fn escalation_lifecycle() {
    let f = build();
    let outcome = f
        .desk
        .handle_escalation_created(&escalation("e1", "billing", Severity::High))
        .await
        .unwrap();
    let AssignmentOutcome::Assigned { assignment, rule } = outcome else {
        panic!("expected assignment");
    };
    assert_eq!(assignment.member_id, "a");
    assert_eq!(rule.rule_id, None);

    let tracker = f.desk.sla.tracker("e1").unwrap().expect("tracker created");
    assert_eq!(tracker.member_id, "a");
    assert_eq!((tracker.response_deadline - tracker.created_at).num_minutes(), 30);
    assert_eq!(event_types(&f.desk, "e1"), vec!["escalation_assigned", "sla_tracker_created"]);

    let inbox = f.desk.notifications.history("a", &HistoryQuery::default()).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationType::EscalationAssigned);
    assert_eq!(inbox[0].priority, NotificationPriority::High);
    assert_eq!(event_types(&f.desk, "a"), vec!["notification_dispatched"]);

    f.clock.advance_minutes(12);
    f.desk.handle_response("e1").await.unwrap();
    f.desk.handle_response("e1").await.unwrap();
    assert_eq!(inbox_kinds(&f.desk, "lead"), vec![NotificationType::ResponseRecorded], "lead told once");

    f.clock.advance_minutes(48);
    let tracker = f.desk.handle_resolution("e1").await.unwrap();
    assert!(tracker.resolved_at.is_some());
    assert_eq!(f.store.open_assignment_count("a").unwrap(), 0);
    assert_eq!(f.desk.sla.check_compliance("e1").unwrap().level, ComplianceLevel::Resolved);
    assert_eq!(
        event_types(&f.desk, "e1"),
        vec![
            "escalation_assigned",
            "sla_tracker_created",
            "response_recorded",
            "assignment_completed",
            "resolution_recorded",
        ]
    );

    // Repeating the resolution records nothing new.
    f.desk.handle_resolution("e1").await.unwrap();
    assert_eq!(event_types(&f.desk, "e1").len(), 5);
    assert_eq!(
        inbox_kinds(&f.desk, "lead"),
        vec![NotificationType::ResponseRecorded, NotificationType::EscalationResolved]
    );
}

/// The scan warns once, breaches once, and stays quiet afterwards.
#[tokio::test]
async fn scan_warns_then_breaches_once() {
    let f = build();
    f.desk
        .handle_escalation_created(&escalation("e1", "billing", Severity::Medium))
        .await
        .unwrap();

    f.clock.advance_minutes(10);
    let report = f.desk.scan().await.unwrap();
    assert!(report.at_risk.is_empty() && report.breaches.is_empty());

    f.clock.advance_minutes(6);
    let report = f.desk.scan().await.unwrap();
    assert_eq!(report.at_risk.len(), 1);
    assert_eq!(report.at_risk[0].clock, SlaClock::Response);
    assert!(f.desk.scan().await.unwrap().at_risk.is_empty());

    f.clock.advance_minutes(15);
    let report = f.desk.scan().await.unwrap();
    assert_eq!(report.breaches.len(), 1);
    assert_eq!(report.breaches[0].clock, SlaClock::Response);
    let again = f.desk.scan().await.unwrap();
    assert!(again.breaches.is_empty() && again.at_risk.is_empty());

    assert_eq!(f.store.count_events("sla_at_risk").unwrap(), 1);
    assert_eq!(f.store.count_events("sla_breached").unwrap(), 1);
    assert_eq!(
        inbox_kinds(&f.desk, "a"),
        vec![NotificationType::EscalationAssigned, NotificationType::SlaWarning, NotificationType::SlaBreach]
    );
    assert_eq!(inbox_kinds(&f.desk, "lead"), vec![NotificationType::SlaBreach]);
}

/// Manual escalations alert the lead, then move to the fallback team when
/// nobody picks them up in time.
#[tokio::test]
async fn manual_escalation_times_out_to_fallback_team() {
    let f = build();
    let outcome = f
        .desk
        .handle_escalation_created(&escalation("e1", "legal", Severity::High))
        .await
        .unwrap();
    assert!(matches!(outcome, AssignmentOutcome::AwaitingManualAssignment { .. }));
    assert!(f.desk.sla.tracker("e1").unwrap().is_none(), "no tracker before assignment");
    assert_eq!(inbox_kinds(&f.desk, "lead"), vec![NotificationType::ManualAssignmentRequired]);
    assert_eq!(f.store.list_pending().unwrap().len(), 1);

    f.clock.advance_minutes(11);
    let report = f.desk.scan().await.unwrap();
    assert_eq!(report.handoffs.len(), 1);
    assert_eq!(report.handoffs[0].to_team.as_deref(), Some("t2"));

    let tracker = f.desk.sla.tracker("e1").unwrap().expect("tracker after handoff");
    assert_eq!(tracker.team_id, "t2");
    assert_eq!(tracker.member_id, "x");
    assert!(f.store.list_pending().unwrap().is_empty());
    assert_eq!(
        event_types(&f.desk, "e1"),
        vec![
            "manual_assignment_required",
            "escalation_timed_out",
            "escalation_assigned",
            "sla_tracker_created",
        ]
    );
    assert_eq!(inbox_kinds(&f.desk, "x"), vec![NotificationType::EscalationAssigned]);
}

/// t3 falls back to a team that does not exist. Its overdue escalation is
/// reported and parked; the rest of the scan carries on.
#[tokio::test]
async fn scan_continues_past_an_unroutable_escalation() {
    let f = build();
    let mut t3 = f.store.team("t2").unwrap();
    t3.team_id = "t3".into();
    t3.fallback_team_id = Some("ghost".into());
    f.store.upsert_team(&t3).unwrap();
    let rule: AssignmentRule = serde_json::from_value(json!({
        "rule_id": "t3-legal", "team_id": "t3", "name": "Legal review", "context": "legal",
        "strategy": "manual", "escalate_if_unassigned_after_minutes": 10, "priority": 10, "enabled": true
    }))
    .unwrap();
    f.store.upsert_rule(&rule).unwrap();

    f.desk
        .handle_escalation_created(&escalation("e0", "billing", Severity::Medium))
        .await
        .unwrap();
    f.desk
        .handle_escalation_created(&escalation("e1", "legal", Severity::High))
        .await
        .unwrap();
    let mut stranded = escalation("e2", "legal", Severity::High);
    stranded.team_id = "t3".into();
    f.desk.handle_escalation_created(&stranded).await.unwrap();

    f.clock.advance_minutes(40);
    let report = f.desk.scan().await.expect("scan survives a bad row");

    assert_eq!(report.handoffs.len(), 1);
    assert_eq!(report.handoffs[0].escalation_id, "e1");
    assert_eq!(report.failed_handoffs.len(), 1);
    assert_eq!(report.failed_handoffs[0].escalation_id, "e2");
    assert_eq!(report.failed_handoffs[0].from_team, "t3");
    assert!(
        report.breaches.iter().any(|b| b.tracker.escalation_id == "e0" && b.clock == SlaClock::Response),
        "breach detection still ran"
    );

    let tracker = f.desk.sla.tracker("e1").unwrap().expect("fallback assignment has a tracker");
    assert_eq!(tracker.member_id, "x");
    f.desk.handle_response("e1").await.unwrap();

    let parked = f.desk.assignments.pending("e2").unwrap().expect("e2 stays queued");
    assert_eq!(parked.escalate_at, None);
    assert_eq!(event_types(&f.desk, "e2").last().map(String::as_str), Some("handoff_failed"));

    let again = f.desk.scan().await.expect("second scan");
    assert!(again.handoffs.is_empty() && again.failed_handoffs.is_empty());
    assert_eq!(f.store.count_events("handoff_failed").unwrap(), 1);
}

/// A resolution already stamped on the tracker, with the assignment still
/// open, is finished by the next resolution call.
#[tokio::test]
async fn resolution_retry_completes_open_assignment() {
    let f = build();
    f.desk
        .handle_escalation_created(&escalation("e1", "billing", Severity::Low))
        .await
        .unwrap();
    f.clock.advance_minutes(20);
    f.desk.sla.record_resolution("e1").unwrap();
    assert_eq!(f.store.open_assignment_count("a").unwrap(), 1);

    f.desk.handle_resolution("e1").await.unwrap();
    assert_eq!(f.store.open_assignment_count("a").unwrap(), 0);
    assert_eq!(f.store.active_counts(&["a".to_string()]).unwrap()["a"], 0);
    assert_eq!(
        event_types(&f.desk, "e1"),
        vec!["escalation_assigned", "sla_tracker_created", "assignment_completed"]
    );

    f.desk.handle_resolution("e1").await.unwrap();
    assert_eq!(event_types(&f.desk, "e1").len(), 3);
}

#[tokio::test]
async fn manual_assignment_starts_the_clocks() {
    let f = build();
    f.desk
        .handle_escalation_created(&escalation("e1", "legal", Severity::Low))
        .await
        .unwrap();
    f.clock.advance_minutes(3);
    let outcome = f.desk.assign_manually("e1", "b").await.unwrap();
    assert!(matches!(outcome, AssignmentOutcome::Assigned { .. }));

    let tracker = f.desk.sla.tracker("e1").unwrap().expect("tracker");
    assert_eq!(tracker.member_id, "b");
    assert_eq!(tracker.created_at, Utc.with_ymd_and_hms(2026, 3, 2, 9, 3, 0).unwrap());

    f.clock.advance_minutes(20);
    assert!(f.desk.scan().await.unwrap().handoffs.is_empty(), "assigned escalations never time out");
}

/// No one holds the required skill: the caller gets the error and nothing
/// is assigned.
#[tokio::test]
async fn no_eligible_member_is_reported() {
    let f = build();
    let err = f
        .desk
        .handle_escalation_created(&escalation("e1", "fraud", Severity::Critical))
        .await
        .unwrap_err();
    assert!(matches!(err, DeskError::NoEligibleMember { .. }), "got {err:?}");
    assert!(f.desk.sla.tracker("e1").unwrap().is_none());
    assert!(event_types(&f.desk, "e1").is_empty());
}

/// A team sized for two warns its lead on the second assignment.
#[tokio::test]
async fn capacity_warning_reaches_lead() {
    let f = build();
    let mut team = f.store.team("t1").unwrap();
    team.capacity_ceiling = Some(2);
    f.store.upsert_team(&team).unwrap();

    f.desk
        .handle_escalation_created(&escalation("e1", "billing", Severity::Low))
        .await
        .unwrap();
    assert!(event_types(&f.desk, "t1").is_empty());

    f.desk
        .handle_escalation_created(&escalation("e2", "billing", Severity::Low))
        .await
        .unwrap();
    assert_eq!(event_types(&f.desk, "t1"), vec!["capacity_warning"]);
    assert_eq!(inbox_kinds(&f.desk, "lead"), vec![NotificationType::WorkloadAlert]);
}

/// Role fan-out goes through the desk and is logged per recipient.
#[tokio::test]
async fn notify_role_logs_each_recipient() {
    let f = build();
    let payload = NotificationPayload::new(
        "",
        NotificationType::System,
        NotificationPriority::Normal,
        "Maintenance",
        "Desk maintenance at 18:00",
    );
    let results = f.desk.notify_role("supervisor", &payload).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results["lead"].is_ok());
    assert_eq!(event_types(&f.desk, "lead"), vec!["notification_dispatched"]);
}

#[tokio::test]
async fn cleanup_is_logged() {
    let f = build();
    f.desk
        .handle_escalation_created(&escalation("e1", "billing", Severity::Low))
        .await
        .unwrap();
    let id = f.desk.notifications.history("a", &HistoryQuery::default()).unwrap()[0]
        .notification_id
        .clone();
    f.desk.notifications.archive("a", &id).unwrap();

    assert_eq!(f.desk.cleanup().unwrap(), 0);
    f.clock.advance(chrono::Duration::days(31));
    assert_eq!(f.desk.cleanup().unwrap(), 1);
    assert_eq!(event_types(&f.desk, "desk"), vec!["notifications_cleaned_up"]);
}

/// The scheduler's first tick runs a scan straight away.
#[tokio::test]
async fn scheduler_runs_scan_until_stopped() {
    let f = build();
    f.desk
        .handle_escalation_created(&escalation("e1", "billing", Severity::Medium))
        .await
        .unwrap();
    f.clock.advance_minutes(31);

    let config = SchedulerConfig { scan_interval_secs: 1, cleanup_interval_secs: 60 };
    let (handle, stop) = DeskScheduler::new(f.desk.clone(), config).spawn();

    let mut flagged = false;
    for _ in 0..100 {
        if f.store.count_events("sla_breached").unwrap() > 0 {
            flagged = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    stop.send(true).unwrap();
    handle.await.unwrap();

    assert!(flagged, "scheduler never scanned");
    assert_eq!(f.store.count_events("sla_breached").unwrap(), 1);
}

#[test]
fn setup_with_unknown_references_is_rejected() {
    let store = DeskStore::in_memory().unwrap();
    store.migrate().unwrap();
    let mut bad = setup();
    bad.teams[0].member_ids.push("ghost".into());
    bad.teams[1].fallback_team_id = Some("t2".into());
    bad.rules[0].target_team_id = Some("nowhere".into());

    let errors = bad.validate(&store);
    assert_eq!(errors.len(), 3, "{errors:?}");
    assert!(matches!(bad.apply(&store), Err(DeskError::Validation(_))));
}

/// Rule targets and timeouts must be positive and at most a year.
#[test]
fn rule_minutes_are_validated() {
    let store = DeskStore::in_memory().unwrap();
    store.migrate().unwrap();
    assert!(setup().validate(&store).is_empty());

    let mut bad = setup();
    bad.rules[1].response_time_minutes = Some(-30);
    bad.rules[1].resolution_time_minutes = Some(0);
    bad.rules[0].escalate_if_unassigned_after_minutes = Some(i64::MAX);

    assert_eq!(bad.rules[1].validate().len(), 2);
    let errors = bad.validate(&store);
    assert_eq!(errors.len(), 3, "{errors:?}");
    assert!(errors.iter().all(|e| e.starts_with("rule ")), "{errors:?}");
    assert!(matches!(bad.apply(&store), Err(DeskError::Validation(_))));
    assert!(store.team("t1").is_err(), "nothing applied");
}
