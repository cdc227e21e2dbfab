//! Workload assignment rows, member counters and snapshots.

use super::{at, enum_col, json_col, ms, opt_at, opt_ms, to_json, DeskStore};
use crate::{
    error::{DeskError, DeskResult},
    repository::WorkloadRepository,
    team::Severity,
    types::MemberId,
    workload_balancer::{AssignmentRecord, WorkloadSnapshot},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;

const ASSIGNMENT_COLS: &str = "assignment_id, team_id, member_id, escalation_id, severity,
     context, created_at, completed, completed_at";

fn assignment_row(r: &Row) -> rusqlite::Result<AssignmentRecord> {
    Ok(AssignmentRecord {
        assignment_id: r.get(0)?,
        team_id: r.get(1)?,
        member_id: r.get(2)?,
        escalation_id: r.get(3)?,
        severity: enum_col(4, &r.get::<_, String>(4)?, Severity::parse)?,
        context: r.get(5)?,
        created_at: at(r.get(6)?),
        completed: r.get::<_, i32>(7)? != 0,
        completed_at: opt_at(r.get(8)?),
    })
}

impl WorkloadRepository for DeskStore {
    fn insert_assignment(&self, record: &AssignmentRecord) -> DeskResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!("INSERT INTO workload_assignment ({ASSIGNMENT_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                record.assignment_id,
                record.team_id,
                record.member_id,
                record.escalation_id,
                record.severity.as_str(),
                record.context,
                ms(record.created_at),
                record.completed as i32,
                opt_ms(record.completed_at),
            ],
        )?;
        if !record.completed {
            let bumped = tx.execute(
                "UPDATE team_member SET current_assignment_count = current_assignment_count + 1
                 WHERE member_id = ?1",
                params![record.member_id],
            )?;
            if bumped == 0 {
                // Dropping the transaction rolls back the insert.
                return Err(DeskError::not_found("team member", record.member_id.clone()));
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn complete_assignments(
        &self,
        team_id: &str,
        escalation_id: &str,
        completed_at: DateTime<Utc>,
    ) -> DeskResult<Vec<AssignmentRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let open: Vec<AssignmentRecord> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ASSIGNMENT_COLS} FROM workload_assignment
                 WHERE team_id = ?1 AND escalation_id = ?2 AND completed = 0
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt
                .query_map(params![team_id, escalation_id], assignment_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut closed = Vec::with_capacity(open.len());
        for mut record in open {
            tx.execute(
                "UPDATE workload_assignment SET completed = 1, completed_at = ?1
                 WHERE assignment_id = ?2 AND completed = 0",
                params![ms(completed_at), record.assignment_id],
            )?;
            tx.execute(
                "UPDATE team_member
                 SET current_assignment_count = MAX(current_assignment_count - 1, 0)
                 WHERE member_id = ?1",
                params![record.member_id],
            )?;
            record.completed = true;
            record.completed_at = Some(completed_at);
            closed.push(record);
        }
        tx.commit()?;
        Ok(closed)
    }

    fn open_assignment(&self, escalation_id: &str) -> DeskResult<Option<AssignmentRecord>> {
        Ok(self
            .lock()?
            .query_row(
                &format!(
                    "SELECT {ASSIGNMENT_COLS} FROM workload_assignment
                     WHERE escalation_id = ?1 AND completed = 0
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![escalation_id],
                assignment_row,
            )
            .optional()?)
    }

    fn assignments_for_team(&self, team_id: &str) -> DeskResult<Vec<AssignmentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLS} FROM workload_assignment
             WHERE team_id = ?1 ORDER BY created_at ASC, assignment_id ASC"
        ))?;
        let rows = stmt.query_map(params![team_id], assignment_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn active_counts(&self, member_ids: &[MemberId]) -> DeskResult<HashMap<MemberId, u32>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT current_assignment_count FROM team_member WHERE member_id = ?1")?;
        let mut counts = HashMap::with_capacity(member_ids.len());
        for id in member_ids {
            if let Some(n) = stmt.query_row(params![id], |r| r.get::<_, u32>(0)).optional()? {
                counts.insert(id.clone(), n);
            }
        }
        Ok(counts)
    }

    fn open_assignment_count(&self, member_id: &str) -> DeskResult<u32> {
        let n: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM workload_assignment WHERE member_id = ?1 AND completed = 0",
            params![member_id],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    fn save_workload_snapshot(&self, snapshot: &WorkloadSnapshot) -> DeskResult<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO workload_snapshot (team_id, computed_at, snapshot)
             VALUES (?1, ?2, ?3)",
            params![snapshot.team_id, ms(snapshot.computed_at), to_json(snapshot)?],
        )?;
        Ok(())
    }

    fn latest_workload_snapshot(&self, team_id: &str) -> DeskResult<Option<WorkloadSnapshot>> {
        Ok(self
            .lock()?
            .query_row(
                "SELECT snapshot FROM workload_snapshot WHERE team_id = ?1",
                params![team_id],
                |r| json_col(0, &r.get::<_, String>(0)?),
            )
            .optional()?)
    }
}
