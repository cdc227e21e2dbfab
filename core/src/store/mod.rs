//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call repository methods and never execute SQL directly.
//!
//! One connection sits behind a mutex. Every multi-statement write runs in a
//! transaction while the lock is held, so writers to the same member counter
//! or tracker row are serialized.

use crate::{
    error::{DeskError, DeskResult},
    event::EventLogEntry,
    repository::EventLog,
    types::{from_millis, to_millis},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Mutex, MutexGuard};

mod directory;
mod notification;
mod preferences;
mod sla;
mod team;
mod workload;

pub struct DeskStore {
    conn: Mutex<Connection>,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl DeskStore {
    pub fn open(path: &str) -> DeskResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> DeskResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    pub fn reopen(&self) -> DeskResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> DeskResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/002_teams.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/003_workload.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/004_sla.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/005_notifications.sql"))?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> DeskResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DeskError::LockPoisoned)
    }
}

// ── Column helpers ─────────────────────────────────────────────────

pub(crate) fn ms(at: DateTime<Utc>) -> i64 {
    to_millis(at)
}

pub(crate) fn opt_ms(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_millis)
}

pub(crate) fn at(ms: i64) -> DateTime<Utc> {
    from_millis(ms)
}

pub(crate) fn opt_at(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Parse an enum column, reporting unknown values as a conversion failure.
pub(crate) fn enum_col<T>(idx: usize, raw: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown value '{raw}'").into())
    })
}

pub(crate) fn json_col<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> DeskResult<String> {
    Ok(serde_json::to_string(value)?)
}

// ── Event log ──────────────────────────────────────────────────────

impl EventLog for DeskStore {
    fn append_event(&self, entry: &EventLogEntry) -> DeskResult<()> {
        self.lock()?.execute(
            "INSERT INTO event_log (occurred_at, source, subject_id, event_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ms(entry.occurred_at),
                entry.source,
                entry.subject_id,
                entry.event_type,
                entry.payload,
            ],
        )?;
        Ok(())
    }

    fn events_for_subject(&self, subject_id: &str) -> DeskResult<Vec<EventLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, occurred_at, source, subject_id, event_type, payload
             FROM event_log WHERE subject_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![subject_id], |row| {
                Ok(EventLogEntry {
                    id:          Some(row.get(0)?),
                    occurred_at: at(row.get(1)?),
                    source:      row.get(2)?,
                    subject_id:  row.get(3)?,
                    event_type:  row.get(4)?,
                    payload:     row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

impl DeskStore {
    /// Number of events of one type across the whole log.
    pub fn count_events(&self, event_type: &str) -> DeskResult<u32> {
        let n: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
            params![event_type],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }
}
