//! Repository seams.
//!
//! Each component talks to storage through one of these traits and takes it
//! as an `Arc<dyn ...>` constructor argument. `DeskStore` implements all of
//! them on SQLite; tests use `DeskStore::in_memory()` as the fake.
//!
//! RULE: only the store executes SQL. Components never see a connection.

use crate::{
    assignment_engine::{AssignmentRule, PendingEscalation},
    error::DeskResult,
    event::EventLogEntry,
    notification_dispatcher::{DeliveryOutcome, HistoryQuery, NotificationCounts, NotificationRecord},
    notification_preferences::{Channel, NotificationPreferences},
    sla_tracker::{SlaClock, SlaConfiguration, SlaStatus, SlaTracker},
    team::{Team, TeamMember},
    types::{MemberId, RecipientId},
    workload_balancer::{AssignmentRecord, WorkloadSnapshot},
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

pub trait TeamRepository: Send + Sync {
    fn team(&self, team_id: &str) -> DeskResult<Team>;
    fn list_teams(&self) -> DeskResult<Vec<Team>>;
    fn upsert_team(&self, team: &Team) -> DeskResult<()>;

    fn member(&self, member_id: &str) -> DeskResult<TeamMember>;
    /// Members of the team in the team's fixed order. Unknown ids are skipped.
    fn team_members(&self, team_id: &str) -> DeskResult<Vec<TeamMember>>;
    /// Insert or update a member. Never touches the active-assignment counter.
    fn upsert_member(&self, member: &TeamMember) -> DeskResult<()>;

    /// Enabled rules, highest priority first.
    fn enabled_rules(&self, team_id: &str) -> DeskResult<Vec<AssignmentRule>>;
    fn upsert_rule(&self, rule: &AssignmentRule) -> DeskResult<()>;

    /// Atomically return the team's rotation cursor modulo `len` and advance it.
    fn next_round_robin_index(&self, team_id: &str, len: usize) -> DeskResult<usize>;

    fn upsert_pending(&self, pending: &PendingEscalation) -> DeskResult<()>;
    fn pending(&self, escalation_id: &str) -> DeskResult<Option<PendingEscalation>>;
    /// Pending escalations whose timeout is at or before `now`.
    fn due_pending(&self, now: DateTime<Utc>) -> DeskResult<Vec<PendingEscalation>>;
    fn clear_pending(&self, escalation_id: &str) -> DeskResult<()>;
}

pub trait WorkloadRepository: Send + Sync {
    /// Insert the row and bump the member's counter in one transaction.
    fn insert_assignment(&self, record: &AssignmentRecord) -> DeskResult<()>;
    /// Mark open rows completed and decrement counters in one transaction.
    /// Returns the rows this call completed.
    fn complete_assignments(
        &self,
        team_id: &str,
        escalation_id: &str,
        at: DateTime<Utc>,
    ) -> DeskResult<Vec<AssignmentRecord>>;
    fn open_assignment(&self, escalation_id: &str) -> DeskResult<Option<AssignmentRecord>>;
    fn assignments_for_team(&self, team_id: &str) -> DeskResult<Vec<AssignmentRecord>>;
    /// Active counters for the given members. Missing members are absent from the map.
    fn active_counts(&self, member_ids: &[MemberId]) -> DeskResult<HashMap<MemberId, u32>>;
    /// `COUNT(*)` of open rows for the member, for invariant checks.
    fn open_assignment_count(&self, member_id: &str) -> DeskResult<u32>;
    fn save_workload_snapshot(&self, snapshot: &WorkloadSnapshot) -> DeskResult<()>;
    fn latest_workload_snapshot(&self, team_id: &str) -> DeskResult<Option<WorkloadSnapshot>>;
}

pub trait SlaTrackerRepository: Send + Sync {
    fn sla_configuration(&self, team_id: &str) -> DeskResult<Option<SlaConfiguration>>;
    fn upsert_sla_configuration(&self, config: &SlaConfiguration) -> DeskResult<()>;

    /// Insert unless a tracker exists for the escalation; return whichever is stored.
    fn insert_tracker_if_absent(&self, tracker: &SlaTracker) -> DeskResult<SlaTracker>;
    fn tracker(&self, escalation_id: &str) -> DeskResult<Option<SlaTracker>>;
    /// Stamp first response only if none is stamped yet. True if this call stamped.
    fn stamp_response(&self, escalation_id: &str, at: DateTime<Utc>, status: SlaStatus) -> DeskResult<bool>;
    /// Stamp resolution only if none is stamped yet. True if this call stamped.
    fn stamp_resolution(&self, escalation_id: &str, at: DateTime<Utc>, status: SlaStatus) -> DeskResult<bool>;
    /// Flag a breach on one clock once. True if this call flagged it.
    fn flag_breach(&self, escalation_id: &str, clock: SlaClock, reason: &str) -> DeskResult<bool>;
    /// Mark the at-risk warning as sent once. True if this call marked it.
    fn flag_warning_sent(&self, escalation_id: &str) -> DeskResult<bool>;
    fn trackers_for_team(&self, team_id: &str) -> DeskResult<Vec<SlaTracker>>;
    fn trackers_created_since(&self, team_id: &str, since: DateTime<Utc>) -> DeskResult<Vec<SlaTracker>>;
    /// Trackers whose resolution clock is still running, across all teams.
    fn open_trackers(&self) -> DeskResult<Vec<SlaTracker>>;
}

pub trait PreferenceRepository: Send + Sync {
    fn load_preferences(&self, recipient_id: &str) -> DeskResult<Option<NotificationPreferences>>;
    fn save_preferences(&self, prefs: &NotificationPreferences) -> DeskResult<()>;
    fn delete_preferences(&self, recipient_id: &str) -> DeskResult<()>;
}

pub trait NotificationRepository: Send + Sync {
    fn insert_notification(&self, record: &NotificationRecord) -> DeskResult<()>;
    fn attach_deliveries(
        &self,
        notification_id: &str,
        deliveries: &BTreeMap<Channel, DeliveryOutcome>,
    ) -> DeskResult<()>;
    fn notification(&self, recipient_id: &str, notification_id: &str) -> DeskResult<Option<NotificationRecord>>;
    fn notifications_for(&self, recipient_id: &str, query: &HistoryQuery) -> DeskResult<Vec<NotificationRecord>>;
    fn notification_counts(&self, recipient_id: &str) -> DeskResult<NotificationCounts>;
    /// Each mutator only touches rows not already in the target state and
    /// returns the number of rows it changed.
    fn mark_read(&self, recipient_id: &str, notification_id: &str, at: DateTime<Utc>) -> DeskResult<usize>;
    fn mark_all_read(&self, recipient_id: &str, at: DateTime<Utc>) -> DeskResult<usize>;
    fn archive(&self, recipient_id: &str, notification_id: &str, at: DateTime<Utc>) -> DeskResult<usize>;
    fn soft_delete(&self, recipient_id: &str, notification_id: &str, at: DateTime<Utc>) -> DeskResult<usize>;
    fn record_action(
        &self,
        recipient_id: &str,
        notification_id: &str,
        action: &str,
        at: DateTime<Utc>,
    ) -> DeskResult<usize>;
    /// Recipients holding archived or deleted rows created before `cutoff`.
    fn recipients_with_expired(&self, cutoff: DateTime<Utc>) -> DeskResult<Vec<RecipientId>>;
    /// Delete up to `limit` expired rows for one recipient in one transaction.
    fn delete_expired_batch(&self, recipient_id: &str, cutoff: DateTime<Utc>, limit: usize) -> DeskResult<usize>;
}

/// Read-through view of the identity layer's user roles.
pub trait RecipientDirectory: Send + Sync {
    fn recipients_with_role(&self, role: &str) -> DeskResult<Vec<RecipientId>>;
}

pub trait EventLog: Send + Sync {
    fn append_event(&self, entry: &EventLogEntry) -> DeskResult<()>;
    fn events_for_subject(&self, subject_id: &str) -> DeskResult<Vec<EventLogEntry>>;
}
