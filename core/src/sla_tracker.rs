//! SLA Tracker: one deadline record per assigned escalation.
//!
//! STATE MACHINE (response and resolution clocks run independently):
//!
//!   NOT_STARTED → IN_PROGRESS → { BREACHED | RESOLVED | FAILED }
//!
//!   - `create_tracker` opens both clocks IN_PROGRESS with deadlines fixed at
//!     creation time (now + configured minutes).
//!   - `record_response` is terminal for the response clock: BREACHED when
//!     late, otherwise it stays IN_PROGRESS.
//!   - `record_resolution` is terminal for the resolution clock: FAILED when
//!     late, otherwise RESOLVED.
//!
//! AT_RISK is never stored. It is derived at read time from the time left
//! on a running clock, so wall-clock drift can never leave a stale label.
//!
//! Writes against an escalation with no tracker fail with TrackerNotFound:
//! deadlines must originate at assignment time.

use crate::{
    clock::Clock,
    config::SlaConfig,
    error::{DeskError, DeskResult},
    repository::SlaTrackerRepository,
    types::{EntityId, EscalationId, MemberId, TeamId},
    workload_balancer::AssignmentRecord,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const REASON_RESPONSE_OVERDUE: &str = "response_overdue";
pub const REASON_RESOLUTION_OVERDUE: &str = "resolution_overdue";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    NotStarted,
    InProgress,
    AtRisk,
    Breached,
    Resolved,
    Failed,
}

impl SlaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::AtRisk => "at_risk",
            Self::Breached => "breached",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "at_risk" => Some(Self::AtRisk),
            "breached" => Some(Self::Breached),
            "resolved" => Some(Self::Resolved),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlaClock {
    Response,
    Resolution,
}

/// One year. Upper bound for every configured minute value.
pub const MAX_SLA_MINUTES: i64 = 365 * 24 * 60;

/// Row from the `sla_configuration` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaConfiguration {
    pub team_id: TeamId,
    pub response_time_minutes: i64,
    pub resolution_time_minutes: i64,
    pub warning_threshold_minutes: i64,
    pub critical_threshold_minutes: i64,
}

impl SlaConfiguration {
    pub fn from_defaults(team_id: &str, defaults: &SlaConfig) -> Self {
        Self {
            team_id: team_id.to_string(),
            response_time_minutes: defaults.response_time_minutes,
            resolution_time_minutes: defaults.resolution_time_minutes,
            warning_threshold_minutes: defaults.warning_threshold_minutes,
            critical_threshold_minutes: defaults.critical_threshold_minutes,
        }
    }

    /// Same thresholds, rule-specific targets where given.
    pub fn with_targets(&self, response: Option<i64>, resolution: Option<i64>) -> Self {
        Self {
            response_time_minutes: response.unwrap_or(self.response_time_minutes),
            resolution_time_minutes: resolution.unwrap_or(self.resolution_time_minutes),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.response_time_minutes <= 0 {
            errors.push("response time must be positive".to_string());
        }
        if self.resolution_time_minutes <= 0 {
            errors.push("resolution time must be positive".to_string());
        }
        if self.response_time_minutes > MAX_SLA_MINUTES || self.resolution_time_minutes > MAX_SLA_MINUTES {
            errors.push(format!("targets must not exceed {MAX_SLA_MINUTES} minutes"));
        }
        if self.critical_threshold_minutes < 0 || self.warning_threshold_minutes < self.critical_threshold_minutes {
            errors.push("thresholds must satisfy 0 <= critical <= warning".to_string());
        }
        errors
    }
}

/// Row from the `sla_tracker` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaTracker {
    pub escalation_id: EscalationId,
    pub assignment_id: EntityId,
    pub team_id: TeamId,
    pub member_id: MemberId,
    pub created_at: DateTime<Utc>,
    pub response_deadline: DateTime<Utc>,
    pub resolution_deadline: DateTime<Utc>,
    pub response_status: SlaStatus,
    pub resolution_status: SlaStatus,
    pub response_breached: bool,
    pub resolution_breached: bool,
    pub breach_reason: Option<String>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub warning_sent: bool,
}

impl SlaTracker {
    pub fn breached(&self) -> bool {
        self.response_breached
            || self.resolution_breached
            || self.response_status == SlaStatus::Breached
            || self.resolution_status == SlaStatus::Failed
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Stored status, or BREACHED / AT_RISK derived for a running clock.
    pub fn effective_status(&self, clock: SlaClock, now: DateTime<Utc>, warning: Duration) -> SlaStatus {
        let (stamped, deadline, stored) = match clock {
            SlaClock::Response => (self.first_response_at.is_some(), self.response_deadline, self.response_status),
            SlaClock::Resolution => (self.resolved_at.is_some(), self.resolution_deadline, self.resolution_status),
        };
        if stamped || stored != SlaStatus::InProgress {
            return stored;
        }
        if now > deadline {
            SlaStatus::Breached
        } else if deadline - now < warning {
            SlaStatus::AtRisk
        } else {
            stored
        }
    }

    /// Running clock with the nearest deadline, if any clock is still running.
    pub fn next_deadline(&self) -> Option<(SlaClock, DateTime<Utc>)> {
        if self.first_response_at.is_none() {
            Some((SlaClock::Response, self.response_deadline))
        } else if self.resolved_at.is_none() {
            Some((SlaClock::Resolution, self.resolution_deadline))
        } else {
            None
        }
    }

    fn overdue(&self, now: DateTime<Utc>) -> bool {
        (self.first_response_at.is_none() && now > self.response_deadline)
            || (self.resolved_at.is_none() && now > self.resolution_deadline)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceLevel {
    OnTrack,
    Warning,
    Critical,
    Breached,
    Resolved,
    ResolvedLate,
    NotTracked,
}

impl ComplianceLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OnTrack => "On track",
            Self::Warning => "Warning - SLA approaching",
            Self::Critical => "Critical - SLA deadline imminent",
            Self::Breached => "SLA breached",
            Self::Resolved => "Resolved within SLA",
            Self::ResolvedLate => "Resolved after SLA deadline",
            Self::NotTracked => "No SLA tracker",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceReport {
    pub escalation_id: EscalationId,
    pub compliant: bool,
    pub level: ComplianceLevel,
    pub status: String,
    /// Against the resolution deadline. Negative when overdue.
    pub time_remaining_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpcomingBreach {
    pub tracker: SlaTracker,
    pub clock: SlaClock,
    pub deadline: DateTime<Utc>,
    pub time_remaining_ms: i64,
}

/// A breach flagged by the scan. Each clock is flagged at most once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreachFlag {
    pub tracker: SlaTracker,
    pub clock: SlaClock,
    pub overdue_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamSlaMetrics {
    pub team_id: TeamId,
    pub days_back: i64,
    pub total: usize,
    pub resolved: usize,
    pub open: usize,
    pub breached: usize,
    /// Percentage of trackers with no breach. 100.0 when there are none.
    pub compliance_rate: f64,
    pub response_compliance_rate: f64,
    pub avg_resolution_minutes: Option<f64>,
}

// ── Service ──────────────────────────────────────────────────────────────────

pub struct SlaTrackerService {
    repo: Arc<dyn SlaTrackerRepository>,
    clock: Arc<dyn Clock>,
    defaults: SlaConfig,
}

impl SlaTrackerService {
    pub fn new(repo: Arc<dyn SlaTrackerRepository>, clock: Arc<dyn Clock>, defaults: SlaConfig) -> Self {
        Self { repo, clock, defaults }
    }

    /// Stored configuration for the team, or the desk defaults.
    pub fn configuration_for(&self, team_id: &str) -> DeskResult<SlaConfiguration> {
        Ok(self
            .repo
            .sla_configuration(team_id)?
            .unwrap_or_else(|| SlaConfiguration::from_defaults(team_id, &self.defaults)))
    }

    pub fn set_configuration(&self, config: &SlaConfiguration) -> DeskResult<()> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(DeskError::Validation(errors));
        }
        self.repo.upsert_sla_configuration(config)
    }

    /// Open the tracker for an assignment. A second call for the same
    /// escalation returns the existing tracker unchanged.
    pub fn create_tracker(
        &self,
        escalation_id: &str,
        assignment: &AssignmentRecord,
        config: &SlaConfiguration,
    ) -> DeskResult<SlaTracker> {
        if let Some(existing) = self.repo.tracker(escalation_id)? {
            return Ok(existing);
        }
        let now = self.clock.now();
        let tracker = SlaTracker {
            escalation_id: escalation_id.to_string(),
            assignment_id: assignment.assignment_id.clone(),
            team_id: assignment.team_id.clone(),
            member_id: assignment.member_id.clone(),
            created_at: now,
            response_deadline: now + Duration::minutes(config.response_time_minutes),
            resolution_deadline: now + Duration::minutes(config.resolution_time_minutes),
            response_status: SlaStatus::InProgress,
            resolution_status: SlaStatus::InProgress,
            response_breached: false,
            resolution_breached: false,
            breach_reason: None,
            first_response_at: None,
            resolved_at: None,
            warning_sent: false,
        };
        let stored = self.repo.insert_tracker_if_absent(&tracker)?;
        log::info!(
            "sla tracker opened for {escalation_id}: respond by {}, resolve by {}",
            stored.response_deadline,
            stored.resolution_deadline
        );
        Ok(stored)
    }

    fn existing(&self, escalation_id: &str) -> DeskResult<SlaTracker> {
        self.repo.tracker(escalation_id)?.ok_or_else(|| DeskError::TrackerNotFound {
            escalation_id: escalation_id.to_string(),
        })
    }

    pub fn tracker(&self, escalation_id: &str) -> DeskResult<Option<SlaTracker>> {
        self.repo.tracker(escalation_id)
    }

    /// Stamp the first response. Repeat calls return the first stamp.
    pub fn record_response(&self, escalation_id: &str) -> DeskResult<SlaTracker> {
        let tracker = self.existing(escalation_id)?;
        if tracker.first_response_at.is_some() {
            return Ok(tracker);
        }
        let now = self.clock.now();
        self.stamp_response(&tracker, now)?;
        self.existing(escalation_id)
    }

    fn stamp_response(&self, tracker: &SlaTracker, now: DateTime<Utc>) -> DeskResult<()> {
        let late = now > tracker.response_deadline;
        let status = if late { SlaStatus::Breached } else { SlaStatus::InProgress };
        if self.repo.stamp_response(&tracker.escalation_id, now, status)? {
            if late {
                self.repo.flag_breach(&tracker.escalation_id, SlaClock::Response, REASON_RESPONSE_OVERDUE)?;
                log::warn!("response for {} recorded after deadline", tracker.escalation_id);
            } else {
                log::info!("response for {} recorded in time", tracker.escalation_id);
            }
        }
        Ok(())
    }

    /// Stamp resolution. An unanswered tracker gets its response stamped too.
    pub fn record_resolution(&self, escalation_id: &str) -> DeskResult<SlaTracker> {
        let tracker = self.existing(escalation_id)?;
        if tracker.resolved_at.is_some() {
            return Ok(tracker);
        }
        let now = self.clock.now();
        if tracker.first_response_at.is_none() {
            self.stamp_response(&tracker, now)?;
        }
        let late = now > tracker.resolution_deadline;
        let status = if late { SlaStatus::Failed } else { SlaStatus::Resolved };
        if self.repo.stamp_resolution(escalation_id, now, status)? {
            if late {
                self.repo.flag_breach(escalation_id, SlaClock::Resolution, REASON_RESOLUTION_OVERDUE)?;
                log::warn!("escalation {escalation_id} resolved after deadline");
            } else {
                log::info!("escalation {escalation_id} resolved within SLA");
            }
        }
        self.existing(escalation_id)
    }

    pub fn check_compliance(&self, escalation_id: &str) -> DeskResult<ComplianceReport> {
        let Some(tracker) = self.repo.tracker(escalation_id)? else {
            return Ok(ComplianceReport {
                escalation_id: escalation_id.to_string(),
                compliant: true,
                level: ComplianceLevel::NotTracked,
                status: ComplianceLevel::NotTracked.label().to_string(),
                time_remaining_ms: 0,
            });
        };
        let config = self.configuration_for(&tracker.team_id)?;

        let (level, remaining) = match tracker.resolved_at {
            Some(done) => {
                let remaining = (tracker.resolution_deadline - done).num_milliseconds();
                let level = if tracker.resolution_status == SlaStatus::Failed {
                    ComplianceLevel::ResolvedLate
                } else {
                    ComplianceLevel::Resolved
                };
                (level, remaining)
            }
            None => {
                let remaining = (tracker.resolution_deadline - self.clock.now()).num_milliseconds();
                let minute = 60_000i64;
                let level = if remaining < 0 {
                    ComplianceLevel::Breached
                } else if remaining < config.critical_threshold_minutes * minute {
                    ComplianceLevel::Critical
                } else if remaining < config.warning_threshold_minutes * minute {
                    ComplianceLevel::Warning
                } else {
                    ComplianceLevel::OnTrack
                };
                (level, remaining)
            }
        };

        Ok(ComplianceReport {
            escalation_id: escalation_id.to_string(),
            compliant: !matches!(level, ComplianceLevel::Breached | ComplianceLevel::ResolvedLate),
            level,
            status: level.label().to_string(),
            time_remaining_ms: remaining,
        })
    }

    /// Trackers with a recorded breach or an overdue running clock. Read-only.
    pub fn breached_slas(&self, team_id: &str) -> DeskResult<Vec<SlaTracker>> {
        let now = self.clock.now();
        Ok(self
            .repo
            .trackers_for_team(team_id)?
            .into_iter()
            .filter(|t| t.breached() || t.overdue(now))
            .collect())
    }

    /// Running clocks whose deadline falls within the window. Read-only.
    pub fn upcoming_breaches(&self, team_id: &str, window_minutes: Option<i64>) -> DeskResult<Vec<UpcomingBreach>> {
        let window = Duration::minutes(window_minutes.unwrap_or(self.defaults.upcoming_window_minutes));
        let now = self.clock.now();
        let mut out: Vec<UpcomingBreach> = self
            .repo
            .trackers_for_team(team_id)?
            .into_iter()
            .filter_map(|t| upcoming(t, now, window))
            .collect();
        out.sort_by_key(|u| u.deadline);
        Ok(out)
    }

    pub fn team_sla_metrics(&self, team_id: &str, days_back: i64) -> DeskResult<TeamSlaMetrics> {
        let now = self.clock.now();
        let trackers = self.repo.trackers_created_since(team_id, now - Duration::days(days_back))?;

        let total = trackers.len();
        let resolved: Vec<&SlaTracker> = trackers.iter().filter(|t| !t.is_open()).collect();
        let breached = trackers.iter().filter(|t| t.breached() || t.overdue(now)).count();
        let response_ok = trackers
            .iter()
            .filter(|t| t.effective_status(SlaClock::Response, now, Duration::zero()) != SlaStatus::Breached)
            .count();

        let pct = |n: usize| if total == 0 { 100.0 } else { n as f64 / total as f64 * 100.0 };
        let avg_resolution_minutes = if resolved.is_empty() {
            None
        } else {
            let sum: i64 = resolved
                .iter()
                .filter_map(|t| t.resolved_at.map(|r| (r - t.created_at).num_minutes()))
                .sum();
            Some(sum as f64 / resolved.len() as f64)
        };

        Ok(TeamSlaMetrics {
            team_id: team_id.to_string(),
            days_back,
            total,
            resolved: resolved.len(),
            open: total - resolved.len(),
            breached,
            compliance_rate: pct(total - breached),
            response_compliance_rate: pct(response_ok),
            avg_resolution_minutes,
        })
    }

    /// Scan every running tracker and flag newly overdue clocks.
    pub fn detect_breaches(&self) -> DeskResult<Vec<BreachFlag>> {
        let now = self.clock.now();
        let mut flags = Vec::new();
        for tracker in self.repo.open_trackers()? {
            if tracker.first_response_at.is_none()
                && !tracker.response_breached
                && now > tracker.response_deadline
                && self.repo.flag_breach(&tracker.escalation_id, SlaClock::Response, REASON_RESPONSE_OVERDUE)?
            {
                flags.push(BreachFlag {
                    overdue_ms: (now - tracker.response_deadline).num_milliseconds(),
                    clock: SlaClock::Response,
                    tracker: tracker.clone(),
                });
            }
            if !tracker.resolution_breached
                && now > tracker.resolution_deadline
                && self.repo.flag_breach(&tracker.escalation_id, SlaClock::Resolution, REASON_RESOLUTION_OVERDUE)?
            {
                flags.push(BreachFlag {
                    overdue_ms: (now - tracker.resolution_deadline).num_milliseconds(),
                    clock: SlaClock::Resolution,
                    tracker,
                });
            }
        }
        for f in &flags {
            log::warn!(
                "SLA BREACH: {} ({:?}) overdue by {}s",
                f.tracker.escalation_id,
                f.clock,
                f.overdue_ms / 1000
            );
        }
        Ok(flags)
    }

    /// Running trackers entering the warning window that have not been warned yet.
    pub fn take_at_risk(&self) -> DeskResult<Vec<UpcomingBreach>> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for tracker in self.repo.open_trackers()? {
            if tracker.warning_sent {
                continue;
            }
            let config = self.configuration_for(&tracker.team_id)?;
            let window = Duration::minutes(config.warning_threshold_minutes);
            if let Some(u) = upcoming(tracker, now, window) {
                if self.repo.flag_warning_sent(&u.tracker.escalation_id)? {
                    out.push(u);
                }
            }
        }
        Ok(out)
    }
}

fn upcoming(tracker: SlaTracker, now: DateTime<Utc>, window: Duration) -> Option<UpcomingBreach> {
    let (clock, deadline) = tracker.next_deadline()?;
    if deadline <= now || deadline > now + window {
        return None;
    }
    Some(UpcomingBreach {
        time_remaining_ms: (deadline - now).num_milliseconds(),
        clock,
        deadline,
        tracker,
    })
}
