//! SLA configuration and tracker queries.
//!
//! Stamps and flags are conditional updates, so a repeated call changes
//! nothing and reports `false`.

use super::{at, enum_col, ms, opt_at, opt_ms, DeskStore};
use crate::{
    error::DeskResult,
    repository::SlaTrackerRepository,
    sla_tracker::{SlaClock, SlaConfiguration, SlaStatus, SlaTracker},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const TRACKER_COLS: &str = "escalation_id, assignment_id, team_id, member_id, created_at,
     response_deadline, resolution_deadline, response_status, resolution_status,
     response_breached, resolution_breached, breach_reason, first_response_at,
     resolved_at, warning_sent";

fn tracker_row(r: &Row) -> rusqlite::Result<SlaTracker> {
    Ok(SlaTracker {
        escalation_id: r.get(0)?,
        assignment_id: r.get(1)?,
        team_id: r.get(2)?,
        member_id: r.get(3)?,
        created_at: at(r.get(4)?),
        response_deadline: at(r.get(5)?),
        resolution_deadline: at(r.get(6)?),
        response_status: enum_col(7, &r.get::<_, String>(7)?, SlaStatus::parse)?,
        resolution_status: enum_col(8, &r.get::<_, String>(8)?, SlaStatus::parse)?,
        response_breached: r.get::<_, i32>(9)? != 0,
        resolution_breached: r.get::<_, i32>(10)? != 0,
        breach_reason: r.get(11)?,
        first_response_at: opt_at(r.get(12)?),
        resolved_at: opt_at(r.get(13)?),
        warning_sent: r.get::<_, i32>(14)? != 0,
    })
}

fn load_tracker(conn: &Connection, escalation_id: &str) -> DeskResult<Option<SlaTracker>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TRACKER_COLS} FROM sla_tracker WHERE escalation_id = ?1"),
            params![escalation_id],
            tracker_row,
        )
        .optional()?)
}

fn query_trackers(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> DeskResult<Vec<SlaTracker>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, tracker_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl SlaTrackerRepository for DeskStore {
    fn sla_configuration(&self, team_id: &str) -> DeskResult<Option<SlaConfiguration>> {
        Ok(self
            .lock()?
            .query_row(
                "SELECT team_id, response_time_minutes, resolution_time_minutes,
                        warning_threshold_minutes, critical_threshold_minutes
                 FROM sla_configuration WHERE team_id = ?1",
                params![team_id],
                |r| {
                    Ok(SlaConfiguration {
                        team_id: r.get(0)?,
                        response_time_minutes: r.get(1)?,
                        resolution_time_minutes: r.get(2)?,
                        warning_threshold_minutes: r.get(3)?,
                        critical_threshold_minutes: r.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    fn upsert_sla_configuration(&self, config: &SlaConfiguration) -> DeskResult<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO sla_configuration
                (team_id, response_time_minutes, resolution_time_minutes,
                 warning_threshold_minutes, critical_threshold_minutes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                config.team_id,
                config.response_time_minutes,
                config.resolution_time_minutes,
                config.warning_threshold_minutes,
                config.critical_threshold_minutes,
            ],
        )?;
        Ok(())
    }

    fn insert_tracker_if_absent(&self, t: &SlaTracker) -> DeskResult<SlaTracker> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO sla_tracker ({TRACKER_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                t.escalation_id,
                t.assignment_id,
                t.team_id,
                t.member_id,
                ms(t.created_at),
                ms(t.response_deadline),
                ms(t.resolution_deadline),
                t.response_status.as_str(),
                t.resolution_status.as_str(),
                t.response_breached as i32,
                t.resolution_breached as i32,
                t.breach_reason,
                opt_ms(t.first_response_at),
                opt_ms(t.resolved_at),
                t.warning_sent as i32,
            ],
        )?;
        Ok(load_tracker(&conn, &t.escalation_id)?.unwrap_or_else(|| t.clone()))
    }

    fn tracker(&self, escalation_id: &str) -> DeskResult<Option<SlaTracker>> {
        let conn = self.lock()?;
        load_tracker(&conn, escalation_id)
    }

    fn stamp_response(&self, escalation_id: &str, stamped_at: DateTime<Utc>, status: SlaStatus) -> DeskResult<bool> {
        let n = self.lock()?.execute(
            "UPDATE sla_tracker SET first_response_at = ?1, response_status = ?2
             WHERE escalation_id = ?3 AND first_response_at IS NULL",
            params![ms(stamped_at), status.as_str(), escalation_id],
        )?;
        Ok(n > 0)
    }

    fn stamp_resolution(&self, escalation_id: &str, stamped_at: DateTime<Utc>, status: SlaStatus) -> DeskResult<bool> {
        let n = self.lock()?.execute(
            "UPDATE sla_tracker SET resolved_at = ?1, resolution_status = ?2
             WHERE escalation_id = ?3 AND resolved_at IS NULL",
            params![ms(stamped_at), status.as_str(), escalation_id],
        )?;
        Ok(n > 0)
    }

    fn flag_breach(&self, escalation_id: &str, clock: SlaClock, reason: &str) -> DeskResult<bool> {
        let column = match clock {
            SlaClock::Response => "response_breached",
            SlaClock::Resolution => "resolution_breached",
        };
        let n = self.lock()?.execute(
            &format!(
                "UPDATE sla_tracker
                 SET {column} = 1, breach_reason = COALESCE(breach_reason, ?1)
                 WHERE escalation_id = ?2 AND {column} = 0"
            ),
            params![reason, escalation_id],
        )?;
        Ok(n > 0)
    }

    fn flag_warning_sent(&self, escalation_id: &str) -> DeskResult<bool> {
        let n = self.lock()?.execute(
            "UPDATE sla_tracker SET warning_sent = 1 WHERE escalation_id = ?1 AND warning_sent = 0",
            params![escalation_id],
        )?;
        Ok(n > 0)
    }

    fn trackers_for_team(&self, team_id: &str) -> DeskResult<Vec<SlaTracker>> {
        let conn = self.lock()?;
        query_trackers(
            &conn,
            &format!("SELECT {TRACKER_COLS} FROM sla_tracker WHERE team_id = ?1 ORDER BY created_at ASC"),
            params![team_id],
        )
    }

    fn trackers_created_since(&self, team_id: &str, since: DateTime<Utc>) -> DeskResult<Vec<SlaTracker>> {
        let conn = self.lock()?;
        query_trackers(
            &conn,
            &format!(
                "SELECT {TRACKER_COLS} FROM sla_tracker
                 WHERE team_id = ?1 AND created_at >= ?2 ORDER BY created_at ASC"
            ),
            params![team_id, ms(since)],
        )
    }

    fn open_trackers(&self) -> DeskResult<Vec<SlaTracker>> {
        let conn = self.lock()?;
        query_trackers(
            &conn,
            &format!("SELECT {TRACKER_COLS} FROM sla_tracker WHERE resolved_at IS NULL ORDER BY created_at ASC"),
            [],
        )
    }
}
