//! The desk event log: an audit trail of every state transition.
//!
//! RULE: the desk records an event for every transition it performs.
//! Components return results; only `EscalationDesk` writes events.

use crate::{
    notification_preferences::{Channel, NotificationType},
    sla_tracker::SlaClock,
    team::Severity,
    types::{EntityId, EscalationId, MemberId, RecipientId, TeamId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every event the desk records.
/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeskEvent {
    // ── Assignment events ──────────────────────────
    EscalationAssigned {
        escalation_id: EscalationId,
        team_id:       TeamId,
        member_id:     MemberId,
        rule_id:       Option<EntityId>,
        severity:      Severity,
    },
    ManualAssignmentRequired {
        escalation_id: EscalationId,
        team_id:       TeamId,
        escalate_at:   Option<DateTime<Utc>>,
    },
    EscalationTimedOut {
        escalation_id: EscalationId,
        from_team:     TeamId,
        to_team:       Option<TeamId>,
        hops:          u32,
    },
    AssignmentCompleted {
        escalation_id: EscalationId,
        team_id:       TeamId,
        member_id:     MemberId,
    },
    CapacityWarning {
        team_id:         TeamId,
        projected_total: u32,
        threshold:       u32,
    },

    // ── SLA events ─────────────────────────────────
    SlaTrackerCreated {
        escalation_id:       EscalationId,
        response_deadline:   DateTime<Utc>,
        resolution_deadline: DateTime<Utc>,
    },
    ResponseRecorded {
        escalation_id: EscalationId,
        responded_at:  DateTime<Utc>,
        breached:      bool,
    },
    ResolutionRecorded {
        escalation_id: EscalationId,
        resolved_at:   DateTime<Utc>,
        breached:      bool,
    },
    SlaBreached {
        escalation_id: EscalationId,
        team_id:       TeamId,
        clock:         SlaClock,
        overdue_ms:    i64,
    },
    SlaAtRisk {
        escalation_id:     EscalationId,
        team_id:           TeamId,
        clock:             SlaClock,
        time_remaining_ms: i64,
    },

    // ── Notification events ────────────────────────
    NotificationDispatched {
        notification_id: EntityId,
        recipient_id:    RecipientId,
        kind:            NotificationType,
        sent:            Vec<Channel>,
        failed:          Vec<Channel>,
    },
    NotificationSkipped {
        notification_id: EntityId,
        recipient_id:    RecipientId,
        kind:            NotificationType,
        reason:          String,
    },
    NotificationsCleanedUp {
        removed: usize,
    },

    // ── Scan events ────────────────────────────────
    HandoffFailed {
        escalation_id: EscalationId,
        from_team:     TeamId,
        reason:        String,
    },
}

impl DeskEvent {
    /// Stable name for the `event_type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            DeskEvent::EscalationAssigned { .. }       => "escalation_assigned",
            DeskEvent::ManualAssignmentRequired { .. } => "manual_assignment_required",
            DeskEvent::EscalationTimedOut { .. }       => "escalation_timed_out",
            DeskEvent::AssignmentCompleted { .. }      => "assignment_completed",
            DeskEvent::CapacityWarning { .. }          => "capacity_warning",
            DeskEvent::SlaTrackerCreated { .. }        => "sla_tracker_created",
            DeskEvent::ResponseRecorded { .. }         => "response_recorded",
            DeskEvent::ResolutionRecorded { .. }       => "resolution_recorded",
            DeskEvent::SlaBreached { .. }              => "sla_breached",
            DeskEvent::SlaAtRisk { .. }                => "sla_at_risk",
            DeskEvent::NotificationDispatched { .. }   => "notification_dispatched",
            DeskEvent::NotificationSkipped { .. }      => "notification_skipped",
            DeskEvent::NotificationsCleanedUp { .. }   => "notifications_cleaned_up",
            DeskEvent::HandoffFailed { .. }            => "handoff_failed",
        }
    }

    /// The entity an event is about, used to index the log.
    pub fn subject_id(&self) -> &str {
        match self {
            DeskEvent::EscalationAssigned { escalation_id, .. }
            | DeskEvent::ManualAssignmentRequired { escalation_id, .. }
            | DeskEvent::EscalationTimedOut { escalation_id, .. }
            | DeskEvent::AssignmentCompleted { escalation_id, .. }
            | DeskEvent::SlaTrackerCreated { escalation_id, .. }
            | DeskEvent::ResponseRecorded { escalation_id, .. }
            | DeskEvent::ResolutionRecorded { escalation_id, .. }
            | DeskEvent::SlaBreached { escalation_id, .. }
            | DeskEvent::SlaAtRisk { escalation_id, .. }
            | DeskEvent::HandoffFailed { escalation_id, .. } => escalation_id,
            DeskEvent::CapacityWarning { team_id, .. } => team_id,
            DeskEvent::NotificationDispatched { recipient_id, .. }
            | DeskEvent::NotificationSkipped { recipient_id, .. } => recipient_id,
            DeskEvent::NotificationsCleanedUp { .. } => "desk",
        }
    }
}

/// A persisted event log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLogEntry {
    pub id:          Option<i64>,
    pub occurred_at: DateTime<Utc>,
    pub source:      String,
    pub subject_id:  String,
    pub event_type:  String,
    pub payload:     String, // JSON-serialized DeskEvent
}

impl EventLogEntry {
    pub fn new(source: &str, at: DateTime<Utc>, event: &DeskEvent) -> serde_json::Result<Self> {
        Ok(Self {
            id:          None,
            occurred_at: at,
            source:      source.to_string(),
            subject_id:  event.subject_id().to_string(),
            event_type:  event.type_name().to_string(),
            payload:     serde_json::to_string(event)?,
        })
    }

    pub fn event(&self) -> serde_json::Result<DeskEvent> {
        serde_json::from_str(&self.payload)
    }
}
