//! Assignment rule engine tests.
//!
//! Tests cover: rule priority and predicate matching, the team default,
//! every selection strategy, manual assignment and the unassigned-timeout
//! handoff to a fallback team.

use chrono::{TimeZone, Utc};
use escalation_core::{
    assignment_engine::{AssignmentEngine, AssignmentOutcome, AssignmentRule},
    clock::ManualClock,
    config::{AssignmentConfig, WorkloadConfig},
    error::DeskError,
    repository::{TeamRepository, WorkloadRepository},
    store::DeskStore,
    team::{
        AssignmentStrategy, AvailabilityWindow, Escalation, ExpertiseLevel, MemberRole, MemberSkill,
        Severity, Team, TeamMember,
    },
    workload_balancer::WorkloadBalancer,
};
use std::sync::Arc;

struct Fixture {
    store: Arc<DeskStore>,
    clock: Arc<ManualClock>,
    balancer: Arc<WorkloadBalancer>,
    engine: AssignmentEngine,
}

fn member(id: &str) -> TeamMember {
    TeamMember {
        member_id: id.into(),
        name: id.to_uppercase(),
        role: MemberRole::Standard,
        skills: vec![],
        max_active_assignments: 5,
        current_assignment_count: 0,
        is_available: true,
        availability: None,
        on_leave: false,
    }
}

fn team(id: &str, members: &[&str], strategy: AssignmentStrategy) -> Team {
    Team {
        team_id: id.into(),
        name: format!("Team {id}"),
        member_ids: members.iter().map(|m| m.to_string()).collect(),
        lead_ids: vec![],
        default_strategy: strategy,
        capacity_ceiling: None,
        load_balancing_enabled: true,
        fallback_team_id: None,
    }
}

fn rule(id: &str, team_id: &str, strategy: AssignmentStrategy, priority: i32) -> AssignmentRule {
    AssignmentRule {
        rule_id: id.into(),
        team_id: team_id.into(),
        name: id.into(),
        context: None,
        level: None,
        severity: None,
        strategy,
        target_team_id: None,
        skills_required: vec![],
        role_filter: None,
        response_time_minutes: None,
        resolution_time_minutes: None,
        escalate_if_unassigned_after_minutes: None,
        priority,
        enabled: true,
    }
}

fn escalation(id: &str, severity: Severity) -> Escalation {
    Escalation {
        escalation_id: id.into(),
        team_id: "t1".into(),
        context: "payments".into(),
        level: 1,
        severity,
        skills_required: vec![],
        title: format!("Escalation {id}"),
    }
}

/// Team t1 = [a, b, c], load balanced by default. Monday 09:00 UTC.
fn build() -> Fixture {
    let store = Arc::new(DeskStore::in_memory().expect("open store"));
    store.migrate().expect("migrate");
    for id in ["a", "b", "c"] {
        store.upsert_member(&member(id)).unwrap();
    }
    store
        .upsert_team(&team("t1", &["a", "b", "c"], AssignmentStrategy::LoadBalanced))
        .unwrap();

    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
    let balancer = Arc::new(WorkloadBalancer::new(
        store.clone(),
        store.clone(),
        clock.clone(),
        WorkloadConfig::default(),
    ));
    let engine = AssignmentEngine::new(store.clone(), balancer.clone(), clock.clone(), AssignmentConfig::default());
    Fixture { store, clock, balancer, engine }
}

fn assigned_member(outcome: &AssignmentOutcome) -> &str {
    match outcome {
        AssignmentOutcome::Assigned { assignment, .. } => &assignment.member_id,
        other => panic!("expected an assignment, got {other:?}"),
    }
}

/// With no rules, the team's default strategy and SLA defaults apply.
#[test]
fn no_rule_uses_team_default() {
    let f = build();
    let m = f.engine.match_rule(&escalation("e1", Severity::Low), "t1").unwrap();
    assert_eq!(m.rule_id, None);
    assert_eq!(m.strategy, AssignmentStrategy::LoadBalanced);
    assert_eq!(m.response_time_minutes, None);
}

/// The highest-priority matching rule wins; non-matching and disabled
/// rules are passed over.
#[test]
fn highest_priority_matching_rule_wins() {
    let f = build();
    let mut critical_only = rule("critical", "t1", AssignmentStrategy::RoundRobin, 100);
    critical_only.severity = Some(Severity::Critical);
    let mut disabled = rule("disabled", "t1", AssignmentStrategy::Manual, 90);
    disabled.enabled = false;
    let mut payments = rule("payments", "t1", AssignmentStrategy::SkillMatched, 50);
    payments.context = Some("payments".into());
    payments.response_time_minutes = Some(10);
    let catch_all = rule("catch-all", "t1", AssignmentStrategy::Availability, 10);
    for r in [&critical_only, &disabled, &payments, &catch_all] {
        f.store.upsert_rule(r).unwrap();
    }

    let m = f.engine.match_rule(&escalation("e1", Severity::High), "t1").unwrap();
    assert_eq!(m.rule_id.as_deref(), Some("payments"));
    assert_eq!(m.strategy, AssignmentStrategy::SkillMatched);
    assert_eq!(m.response_time_minutes, Some(10));

    let m = f.engine.match_rule(&escalation("e2", Severity::Critical), "t1").unwrap();
    assert_eq!(m.rule_id.as_deref(), Some("critical"));

    let mut other = escalation("e3", Severity::Low);
    other.context = "onboarding".into();
    let m = f.engine.match_rule(&other, "t1").unwrap();
    assert_eq!(m.rule_id.as_deref(), Some("catch-all"));
}

/// Round robin walks the fixed member order and wraps.
#[test]
fn round_robin_rotates_in_member_order() {
    let f = build();
    f.store
        .upsert_team(&team("t1", &["a", "b", "c"], AssignmentStrategy::RoundRobin))
        .unwrap();

    let picks: Vec<String> = (0..4)
        .map(|i| {
            let outcome = f.engine.assign(&escalation(&format!("e{i}"), Severity::Low)).unwrap();
            assigned_member(&outcome).to_string()
        })
        .collect();
    assert_eq!(picks, vec!["a", "b", "c", "a"]);
}

/// Load balanced picks the member with the fewest open assignments.
#[test]
fn load_balanced_spreads_work() {
    let f = build();
    let mut counts = std::collections::HashMap::new();
    for i in 0..6 {
        let outcome = f.engine.assign(&escalation(&format!("e{i}"), Severity::Medium)).unwrap();
        *counts.entry(assigned_member(&outcome).to_string()).or_insert(0) += 1;
    }
    assert_eq!(counts.get("a"), Some(&2));
    assert_eq!(counts.get("b"), Some(&2));
    assert_eq!(counts.get("c"), Some(&2));
}

/// Members at their own capacity are skipped while anyone has headroom.
#[test]
fn load_balanced_skips_members_at_capacity() {
    let f = build();
    let mut small = member("a");
    small.max_active_assignments = 1;
    f.store.upsert_member(&small).unwrap();
    f.balancer
        .record_assignment("t1", "a", &escalation("held", Severity::Low))
        .unwrap();
    f.balancer
        .record_assignment("t1", "b", &escalation("held-b1", Severity::Low))
        .unwrap();
    f.balancer
        .record_assignment("t1", "b", &escalation("held-b2", Severity::Low))
        .unwrap();
    f.balancer
        .record_assignment("t1", "c", &escalation("held-c1", Severity::Low))
        .unwrap();
    f.balancer
        .record_assignment("t1", "c", &escalation("held-c2", Severity::Low))
        .unwrap();

    // a has the lowest load (1) but is full.
    let outcome = f.engine.assign(&escalation("e1", Severity::Low)).unwrap();
    assert_ne!(assigned_member(&outcome), "a");
}

/// Skill matching considers only members holding a required skill.
#[test]
fn skill_matched_filters_candidates() {
    let f = build();
    let mut c = member("c");
    c.skills = vec![MemberSkill { skill: "sepa".into(), level: ExpertiseLevel::Expert }];
    f.store.upsert_member(&c).unwrap();
    let mut r = rule("sepa", "t1", AssignmentStrategy::SkillMatched, 10);
    r.skills_required = vec!["sepa".into(), "swift".into()];
    f.store.upsert_rule(&r).unwrap();

    let outcome = f.engine.assign(&escalation("e1", Severity::High)).unwrap();
    assert_eq!(assigned_member(&outcome), "c");

    let mut r = rule("swift", "t1", AssignmentStrategy::SkillMatched, 20);
    r.skills_required = vec!["swift".into()];
    f.store.upsert_rule(&r).unwrap();
    let err = f.engine.assign(&escalation("e2", Severity::High)).unwrap_err();
    assert!(matches!(err, DeskError::NoEligibleMember { .. }), "got {err:?}");
}

/// Availability respects the working window at the current instant.
#[test]
fn availability_uses_working_window() {
    let f = build();
    // 09:00 Monday. a works nights, b is flagged away, c works days.
    let mut a = member("a");
    a.availability = Some(AvailabilityWindow { start_minute: 22 * 60, end_minute: 6 * 60, days_of_week: vec![] });
    let mut b = member("b");
    b.is_available = false;
    let mut c = member("c");
    c.availability = Some(AvailabilityWindow { start_minute: 8 * 60, end_minute: 17 * 60, days_of_week: vec![1, 2, 3, 4, 5] });
    for m in [&a, &b, &c] {
        f.store.upsert_member(m).unwrap();
    }
    f.store.upsert_rule(&rule("avail", "t1", AssignmentStrategy::Availability, 10)).unwrap();

    let outcome = f.engine.assign(&escalation("e1", Severity::Medium)).unwrap();
    assert_eq!(assigned_member(&outcome), "c");

    // Monday 23:00: only a is on shift.
    f.clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap());
    let outcome = f.engine.assign(&escalation("e2", Severity::Medium)).unwrap();
    assert_eq!(assigned_member(&outcome), "a");
}

/// A member on leave is never auto-assigned by any strategy.
#[test]
fn member_on_leave_is_never_chosen() {
    let f = build();
    let mut a = member("a");
    a.on_leave = true;
    f.store.upsert_member(&a).unwrap();

    for (i, strategy) in [
        AssignmentStrategy::RoundRobin,
        AssignmentStrategy::LoadBalanced,
        AssignmentStrategy::Availability,
    ]
    .into_iter()
    .enumerate()
    {
        f.store.upsert_team(&team("t1", &["a", "b", "c"], strategy)).unwrap();
        for j in 0..3 {
            let outcome = f.engine.assign(&escalation(&format!("e{i}-{j}"), Severity::Low)).unwrap();
            assert_ne!(assigned_member(&outcome), "a", "{strategy:?} picked a member on leave");
        }
    }
}

/// The role filter narrows candidates to one role.
#[test]
fn role_filter_restricts_candidates() {
    let f = build();
    let mut b = member("b");
    b.role = MemberRole::Senior;
    f.store.upsert_member(&b).unwrap();
    let mut r = rule("seniors", "t1", AssignmentStrategy::LoadBalanced, 10);
    r.role_filter = Some(MemberRole::Senior);
    f.store.upsert_rule(&r).unwrap();

    for i in 0..3 {
        let outcome = f.engine.assign(&escalation(&format!("e{i}"), Severity::Low)).unwrap();
        assert_eq!(assigned_member(&outcome), "b");
    }
}

/// Manual strategy parks the escalation until someone assigns it.
#[test]
fn manual_strategy_waits_then_assigns() {
    let f = build();
    f.store.upsert_rule(&rule("manual", "t1", AssignmentStrategy::Manual, 10)).unwrap();

    let outcome = f.engine.assign(&escalation("e1", Severity::High)).unwrap();
    assert!(matches!(outcome, AssignmentOutcome::AwaitingManualAssignment { escalate_at: None, .. }));
    assert!(f.engine.pending("e1").unwrap().is_some());
    assert_eq!(f.store.open_assignment_count("b").unwrap(), 0);

    let outcome = f.engine.assign_manually("e1", "b").unwrap();
    assert_eq!(assigned_member(&outcome), "b");
    assert!(f.engine.pending("e1").unwrap().is_none());
    assert_eq!(f.store.open_assignment_count("b").unwrap(), 1);

    let err = f.engine.assign_manually("e1", "c").unwrap_err();
    assert!(err.is_not_found(), "second manual assignment should find nothing pending");
}

/// A rule can route to another team's members.
#[test]
fn target_team_routes_elsewhere() {
    let f = build();
    f.store.upsert_member(&member("x")).unwrap();
    f.store.upsert_team(&team("t2", &["x"], AssignmentStrategy::LoadBalanced)).unwrap();
    let mut r = rule("to-t2", "t1", AssignmentStrategy::LoadBalanced, 10);
    r.target_team_id = Some("t2".into());
    f.store.upsert_rule(&r).unwrap();

    let outcome = f.engine.assign(&escalation("e1", Severity::Medium)).unwrap();
    match outcome {
        AssignmentOutcome::Assigned { assignment, rule } => {
            assert_eq!(assignment.member_id, "x");
            assert_eq!(assignment.team_id, "t2");
            assert_eq!(rule.team_id, "t2");
        }
        other => panic!("expected assignment, got {other:?}"),
    }
}

/// Left unassigned past the rule's timeout, the escalation is handed to the
/// team's fallback team on the next scan, and only once.
#[test]
fn unassigned_timeout_hands_to_fallback_team() {
    let f = build();
    f.store.upsert_member(&member("x")).unwrap();
    f.store.upsert_team(&team("t2", &["x"], AssignmentStrategy::LoadBalanced)).unwrap();
    let mut t1 = team("t1", &["a", "b", "c"], AssignmentStrategy::LoadBalanced);
    t1.fallback_team_id = Some("t2".into());
    f.store.upsert_team(&t1).unwrap();
    let mut r = rule("manual-15", "t1", AssignmentStrategy::Manual, 10);
    r.escalate_if_unassigned_after_minutes = Some(15);
    f.store.upsert_rule(&r).unwrap();

    let outcome = f.engine.assign(&escalation("e1", Severity::High)).unwrap();
    match &outcome {
        AssignmentOutcome::AwaitingManualAssignment { escalate_at, .. } => {
            assert_eq!(*escalate_at, Some(Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap()));
        }
        other => panic!("expected manual wait, got {other:?}"),
    }

    f.clock.advance_minutes(14);
    assert!(f.engine.escalate_unassigned().unwrap().is_empty(), "not due yet");

    f.clock.advance_minutes(2);
    let handoffs = f.engine.escalate_unassigned().unwrap();
    assert_eq!(handoffs.len(), 1);
    let h = &handoffs[0];
    assert_eq!(h.from_team, "t1");
    assert_eq!(h.to_team.as_deref(), Some("t2"));
    assert_eq!(h.hops, 1);
    assert_eq!(assigned_member(h.outcome.as_ref().expect("assigned in fallback")), "x");
    assert!(f.engine.pending("e1").unwrap().is_none());

    assert!(f.engine.escalate_unassigned().unwrap().is_empty(), "handoff happens once");
}

/// Without a fallback team the escalation stays queued for manual
/// assignment and stops timing out.
#[test]
fn unassigned_timeout_without_fallback_stays_queued() {
    let f = build();
    let mut r = rule("manual-5", "t1", AssignmentStrategy::Manual, 10);
    r.escalate_if_unassigned_after_minutes = Some(5);
    f.store.upsert_rule(&r).unwrap();
    f.engine.assign(&escalation("e1", Severity::Low)).unwrap();

    f.clock.advance_minutes(6);
    let handoffs = f.engine.escalate_unassigned().unwrap();
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0].to_team, None);
    assert!(handoffs[0].outcome.is_none());

    let pending = f.engine.pending("e1").unwrap().expect("still pending");
    assert_eq!(pending.escalate_at, None);
    f.clock.advance_minutes(60);
    assert!(f.engine.escalate_unassigned().unwrap().is_empty());
}
