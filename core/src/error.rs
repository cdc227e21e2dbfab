use thiserror::Error;

use crate::notification_preferences::Channel;

#[derive(Error, Debug)]
pub enum DeskError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("No SLA tracker exists for escalation '{escalation_id}'")]
    TrackerNotFound { escalation_id: String },

    #[error("No eligible member in team '{team_id}': {reason}")]
    NoEligibleMember { team_id: String, reason: String },

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Delivery via {channel} failed: {reason}")]
    Delivery { channel: Channel, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeskError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// True for both the generic and the tracker-specific not-found kinds.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::TrackerNotFound { .. })
    }
}

pub type DeskResult<T> = Result<T, DeskError>;
