//! Shared primitive types used across the desk.

use chrono::{DateTime, TimeZone, Utc};

/// A stable, unique identifier for any entity the desk stores.
pub type EntityId = String;

pub type TeamId = String;
pub type MemberId = String;
pub type EscalationId = String;

/// Identity-layer user id of a notification recipient.
pub type RecipientId = String;

/// Wall-clock instants are persisted as epoch milliseconds.
pub type Millis = i64;

pub fn to_millis(at: DateTime<Utc>) -> Millis {
    at.timestamp_millis()
}

pub fn from_millis(ms: Millis) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Mint a prefixed unique id, e.g. `asg-3f2c...`.
pub fn new_id(prefix: &str) -> EntityId {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
