//! SLA tracker tests.
//!
//! Tests cover: idempotent tracker creation, response and resolution
//! stamping on both sides of the deadline, compliance levels, breach
//! detection that fires once, the at-risk window and team metrics.

use chrono::{DateTime, Duration, TimeZone, Utc};
use escalation_core::{
    clock::{Clock, ManualClock},
    config::SlaConfig,
    error::DeskError,
    sla_tracker::{
        ComplianceLevel, SlaClock, SlaConfiguration, SlaStatus, SlaTrackerService, MAX_SLA_MINUTES,
        REASON_RESPONSE_OVERDUE,
    },
    store::DeskStore,
    team::Severity,
    workload_balancer::AssignmentRecord,
};
use std::sync::Arc;

struct Fixture {
    clock: Arc<ManualClock>,
    sla: SlaTrackerService,
}

fn nine_am() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn build() -> Fixture {
    let store = Arc::new(DeskStore::in_memory().expect("open store"));
    store.migrate().expect("migrate");
    let clock = Arc::new(ManualClock::new(nine_am()));
    let sla = SlaTrackerService::new(store, clock.clone(), SlaConfig::default());
    Fixture { clock, sla }
}

fn assignment(escalation_id: &str, at: DateTime<Utc>) -> AssignmentRecord {
    AssignmentRecord {
        assignment_id: format!("asg-{escalation_id}"),
        team_id: "t1".into(),
        member_id: "a".into(),
        escalation_id: escalation_id.into(),
        severity: Severity::High,
        context: "payments".into(),
        created_at: at,
        completed: false,
        completed_at: None,
    }
}

fn targets(response: i64, resolution: i64) -> SlaConfiguration {
    SlaConfiguration {
        team_id: "t1".into(),
        response_time_minutes: response,
        resolution_time_minutes: resolution,
        warning_threshold_minutes: 15,
        critical_threshold_minutes: 5,
    }
}

fn open(f: &Fixture, escalation_id: &str, config: &SlaConfiguration) {
    f.sla
        .create_tracker(escalation_id, &assignment(escalation_id, f.clock.now()), config)
        .unwrap();
}

/// A second create for the same escalation returns the first tracker.
#[test]
fn create_tracker_is_idempotent() {
    let f = build();
    let config = targets(30, 240);
    let first = f.sla.create_tracker("e1", &assignment("e1", nine_am()), &config).unwrap();
    assert_eq!(first.response_deadline, nine_am() + Duration::minutes(30));
    assert_eq!(first.resolution_deadline, nine_am() + Duration::hours(4));
    assert_eq!(first.response_status, SlaStatus::InProgress);

    f.clock.advance_minutes(10);
    let second = f.sla.create_tracker("e1", &assignment("e1", f.clock.now()), &targets(5, 10)).unwrap();
    assert_eq!(second, first);
}

/// Response at +29 of a 30 minute target is in time; at +31 it breaches.
#[test]
fn response_deadline_is_exact() {
    let f = build();
    let config = targets(30, 240);
    open(&f, "on-time", &config);
    open(&f, "late", &config);

    f.clock.advance_minutes(29);
    let t = f.sla.record_response("on-time").unwrap();
    assert!(!t.response_breached);
    assert_eq!(t.response_status, SlaStatus::InProgress);
    assert_eq!(t.first_response_at, Some(nine_am() + Duration::minutes(29)));

    f.clock.advance_minutes(2);
    let t = f.sla.record_response("late").unwrap();
    assert!(t.response_breached);
    assert_eq!(t.response_status, SlaStatus::Breached);
    assert_eq!(t.breach_reason.as_deref(), Some(REASON_RESPONSE_OVERDUE));
}

/// Only the first response counts.
#[test]
fn record_response_keeps_first_stamp() {
    let f = build();
    open(&f, "e1", &targets(30, 240));
    f.clock.advance_minutes(5);
    let first = f.sla.record_response("e1").unwrap();
    f.clock.advance_minutes(60);
    let again = f.sla.record_response("e1").unwrap();
    assert_eq!(again.first_response_at, first.first_response_at);
    assert!(!again.response_breached);
}

#[test]
fn stamping_without_tracker_is_tracker_not_found() {
    let f = build();
    let err = f.sla.record_response("ghost").unwrap_err();
    assert!(matches!(err, DeskError::TrackerNotFound { .. }), "got {err:?}");
    let err = f.sla.record_resolution("ghost").unwrap_err();
    assert!(matches!(err, DeskError::TrackerNotFound { .. }), "got {err:?}");
}

/// Untracked escalations report as compliant with the NotTracked level.
#[test]
fn compliance_without_tracker_is_not_tracked() {
    let f = build();
    let report = f.sla.check_compliance("ghost").unwrap();
    assert_eq!(report.level, ComplianceLevel::NotTracked);
    assert!(report.compliant);
}

/// 15/60 minute targets opened at 09:00: Warning at 09:50 with ten minutes
/// left, Critical at 09:57, breached at 10:05.
#[test]
fn compliance_levels_follow_remaining_time() {
    let f = build();
    let config = targets(15, 60);
    f.sla.set_configuration(&config).unwrap();
    open(&f, "e1", &config);

    f.clock.advance_minutes(20);
    let report = f.sla.check_compliance("e1").unwrap();
    assert_eq!(report.level, ComplianceLevel::OnTrack);

    f.clock.advance_minutes(30);
    let report = f.sla.check_compliance("e1").unwrap();
    assert_eq!(report.level, ComplianceLevel::Warning);
    assert_eq!(report.status, "Warning - SLA approaching");
    assert!(report.compliant);
    assert_eq!(report.time_remaining_ms, Duration::minutes(10).num_milliseconds());

    f.clock.advance_minutes(7);
    let report = f.sla.check_compliance("e1").unwrap();
    assert_eq!(report.level, ComplianceLevel::Critical);
    assert!(report.compliant);

    f.clock.advance_minutes(8);
    let report = f.sla.check_compliance("e1").unwrap();
    assert_eq!(report.level, ComplianceLevel::Breached);
    assert!(!report.compliant);
    assert_eq!(report.time_remaining_ms, -Duration::minutes(5).num_milliseconds());
}

/// Resolving an unanswered escalation stamps the response as well.
#[test]
fn resolution_stamps_missing_response() {
    let f = build();
    open(&f, "e1", &targets(30, 240));
    f.clock.advance_minutes(10);
    let t = f.sla.record_resolution("e1").unwrap();
    assert_eq!(t.resolved_at, Some(f.clock.now()));
    assert_eq!(t.first_response_at, t.resolved_at);
    assert_eq!(t.resolution_status, SlaStatus::Resolved);
    assert!(!t.breached());

    f.clock.advance_minutes(10);
    let again = f.sla.record_resolution("e1").unwrap();
    assert_eq!(again.resolved_at, t.resolved_at, "second resolution is a no-op");

    let report = f.sla.check_compliance("e1").unwrap();
    assert_eq!(report.level, ComplianceLevel::Resolved);
    assert!(report.compliant);
}

#[test]
fn late_resolution_fails_the_sla() {
    let f = build();
    open(&f, "e1", &targets(15, 60));
    f.clock.advance_minutes(5);
    f.sla.record_response("e1").unwrap();
    f.clock.advance_minutes(70);
    let t = f.sla.record_resolution("e1").unwrap();
    assert_eq!(t.resolution_status, SlaStatus::Failed);
    assert!(t.resolution_breached);
    assert!(!t.response_breached);

    let report = f.sla.check_compliance("e1").unwrap();
    assert_eq!(report.level, ComplianceLevel::ResolvedLate);
    assert!(!report.compliant);
}

/// Each clock is flagged exactly once, however often the scan runs.
#[test]
fn detect_breaches_flags_each_clock_once() {
    let f = build();
    open(&f, "e1", &targets(30, 240));

    f.clock.advance_minutes(29);
    assert!(f.sla.detect_breaches().unwrap().is_empty());

    f.clock.advance_minutes(2);
    let flags = f.sla.detect_breaches().unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].clock, SlaClock::Response);
    assert_eq!(flags[0].overdue_ms, Duration::minutes(1).num_milliseconds());
    assert!(f.sla.detect_breaches().unwrap().is_empty(), "response flagged twice");

    f.clock.set(nine_am() + Duration::minutes(241));
    let flags = f.sla.detect_breaches().unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].clock, SlaClock::Resolution);
    assert!(f.sla.detect_breaches().unwrap().is_empty(), "resolution flagged twice");

    let t = f.sla.tracker("e1").unwrap().expect("tracker");
    assert!(t.response_breached && t.resolution_breached);
    assert_eq!(t.breach_reason.as_deref(), Some(REASON_RESPONSE_OVERDUE));
}

/// Listing breaches reads the tracker without flagging it.
#[test]
fn breached_slas_is_read_only() {
    let f = build();
    open(&f, "e1", &targets(30, 240));
    open(&f, "e2", &targets(60, 240));
    f.clock.advance_minutes(45);

    let breached = f.sla.breached_slas("t1").unwrap();
    assert_eq!(breached.len(), 1);
    assert_eq!(breached[0].escalation_id, "e1");
    assert!(!f.sla.tracker("e1").unwrap().unwrap().response_breached);
}

/// The derived AT_RISK status and the one-shot warning both key off the
/// warning threshold.
#[test]
fn at_risk_window_and_single_warning() {
    let f = build();
    let config = targets(30, 240);
    f.sla.set_configuration(&config).unwrap();
    open(&f, "e1", &config);

    f.clock.advance_minutes(10);
    let t = f.sla.tracker("e1").unwrap().unwrap();
    let warn = Duration::minutes(15);
    assert_eq!(t.effective_status(SlaClock::Response, f.clock.now(), warn), SlaStatus::InProgress);
    assert!(f.sla.take_at_risk().unwrap().is_empty());

    let upcoming = f.sla.upcoming_breaches("t1", Some(30)).unwrap();
    assert_eq!(upcoming.len(), 1);
    assert_eq!(upcoming[0].time_remaining_ms, Duration::minutes(20).num_milliseconds());
    assert!(f.sla.upcoming_breaches("t1", Some(5)).unwrap().is_empty());

    f.clock.advance_minutes(8);
    assert_eq!(t.effective_status(SlaClock::Response, f.clock.now(), warn), SlaStatus::AtRisk);
    let at_risk = f.sla.take_at_risk().unwrap();
    assert_eq!(at_risk.len(), 1);
    assert_eq!(at_risk[0].clock, SlaClock::Response);
    assert!(f.sla.take_at_risk().unwrap().is_empty(), "warning sent twice");

    f.clock.advance_minutes(20);
    assert_eq!(t.effective_status(SlaClock::Response, f.clock.now(), warn), SlaStatus::Breached);
}

#[test]
fn invalid_configuration_is_rejected() {
    let f = build();
    let mut bad = targets(0, 60);
    bad.warning_threshold_minutes = 2;
    let err = f.sla.set_configuration(&bad).unwrap_err();
    match err {
        DeskError::Validation(errors) => assert_eq!(errors.len(), 2, "{errors:?}"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(f.sla.configuration_for("t1").unwrap().response_time_minutes, 30, "defaults kept");

    assert_eq!(targets(30, MAX_SLA_MINUTES + 1).validate().len(), 1);
    assert!(f.sla.set_configuration(&targets(30, MAX_SLA_MINUTES)).is_ok());
}

/// One on time, one late on both clocks, one still running.
#[test]
fn team_metrics_summarize_window() {
    let f = build();
    let config = targets(30, 60);
    open(&f, "e1", &config);
    open(&f, "e2", &config);

    f.clock.advance_minutes(20);
    f.sla.record_resolution("e1").unwrap();

    f.clock.set(nine_am() + Duration::minutes(50));
    open(&f, "e3", &config);
    f.clock.advance_minutes(5);
    f.sla.record_response("e3").unwrap();

    f.clock.set(nine_am() + Duration::minutes(70));
    f.sla.record_resolution("e2").unwrap();

    let m = f.sla.team_sla_metrics("t1", 30).unwrap();
    assert_eq!(m.total, 3);
    assert_eq!(m.resolved, 2);
    assert_eq!(m.open, 1);
    assert_eq!(m.breached, 1);
    assert!((m.compliance_rate - 200.0 / 3.0).abs() < 1e-6, "rate {}", m.compliance_rate);
    assert!((m.response_compliance_rate - 200.0 / 3.0).abs() < 1e-6);
    assert_eq!(m.avg_resolution_minutes, Some(45.0));

    let empty = f.sla.team_sla_metrics("t2", 30).unwrap();
    assert_eq!(empty.total, 0);
    assert_eq!(empty.compliance_rate, 100.0);
}
