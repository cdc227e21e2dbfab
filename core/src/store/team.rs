//! Team, member, rule and pending-escalation queries.

use super::{at, enum_col, json_col, ms, opt_at, opt_ms, to_json, DeskStore};
use crate::{
    assignment_engine::{AssignmentRule, PendingEscalation},
    error::{DeskError, DeskResult},
    repository::TeamRepository,
    team::{AssignmentStrategy, MemberRole, Severity, Team, TeamMember},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const TEAM_COLS: &str = "team_id, name, member_ids, lead_ids, default_strategy,
     capacity_ceiling, load_balancing_enabled, fallback_team_id";

const MEMBER_COLS: &str = "member_id, name, role, skills, max_active_assignments,
     current_assignment_count, is_available, availability, on_leave";

const RULE_COLS: &str = "rule_id, team_id, name, context, level, severity, strategy,
     target_team_id, skills_required, role_filter, response_time_minutes,
     resolution_time_minutes, escalate_after_minutes, priority, enabled";

fn team_row(r: &Row) -> rusqlite::Result<Team> {
    Ok(Team {
        team_id: r.get(0)?,
        name: r.get(1)?,
        member_ids: json_col(2, &r.get::<_, String>(2)?)?,
        lead_ids: json_col(3, &r.get::<_, String>(3)?)?,
        default_strategy: enum_col(4, &r.get::<_, String>(4)?, AssignmentStrategy::parse)?,
        capacity_ceiling: r.get(5)?,
        load_balancing_enabled: r.get::<_, i32>(6)? != 0,
        fallback_team_id: r.get(7)?,
    })
}

fn member_row(r: &Row) -> rusqlite::Result<TeamMember> {
    let availability: Option<String> = r.get(7)?;
    Ok(TeamMember {
        member_id: r.get(0)?,
        name: r.get(1)?,
        role: enum_col(2, &r.get::<_, String>(2)?, MemberRole::parse)?,
        skills: json_col(3, &r.get::<_, String>(3)?)?,
        max_active_assignments: r.get(4)?,
        current_assignment_count: r.get(5)?,
        is_available: r.get::<_, i32>(6)? != 0,
        availability: availability.map(|a| json_col(7, &a)).transpose()?,
        on_leave: r.get::<_, i32>(8)? != 0,
    })
}

fn rule_row(r: &Row) -> rusqlite::Result<AssignmentRule> {
    let severity: Option<String> = r.get(5)?;
    let role_filter: Option<String> = r.get(9)?;
    Ok(AssignmentRule {
        rule_id: r.get(0)?,
        team_id: r.get(1)?,
        name: r.get(2)?,
        context: r.get(3)?,
        level: r.get(4)?,
        severity: severity.map(|s| enum_col(5, &s, Severity::parse)).transpose()?,
        strategy: enum_col(6, &r.get::<_, String>(6)?, AssignmentStrategy::parse)?,
        target_team_id: r.get(7)?,
        skills_required: json_col(8, &r.get::<_, String>(8)?)?,
        role_filter: role_filter.map(|s| enum_col(9, &s, MemberRole::parse)).transpose()?,
        response_time_minutes: r.get(10)?,
        resolution_time_minutes: r.get(11)?,
        escalate_if_unassigned_after_minutes: r.get(12)?,
        priority: r.get(13)?,
        enabled: r.get::<_, i32>(14)? != 0,
    })
}

fn pending_row(r: &Row) -> rusqlite::Result<PendingEscalation> {
    Ok(PendingEscalation {
        escalation: json_col(0, &r.get::<_, String>(0)?)?,
        rule: json_col(1, &r.get::<_, String>(1)?)?,
        created_at: at(r.get(2)?),
        escalate_at: opt_at(r.get(3)?),
        hops: r.get(4)?,
    })
}

fn load_team(conn: &Connection, team_id: &str) -> DeskResult<Team> {
    conn.query_row(
        &format!("SELECT {TEAM_COLS} FROM team WHERE team_id = ?1"),
        params![team_id],
        team_row,
    )
    .optional()?
    .ok_or_else(|| DeskError::not_found("team", team_id))
}

fn load_member(conn: &Connection, member_id: &str) -> DeskResult<Option<TeamMember>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MEMBER_COLS} FROM team_member WHERE member_id = ?1"),
            params![member_id],
            member_row,
        )
        .optional()?)
}

impl TeamRepository for DeskStore {
    fn team(&self, team_id: &str) -> DeskResult<Team> {
        let conn = self.lock()?;
        load_team(&conn, team_id)
    }

    fn list_teams(&self) -> DeskResult<Vec<Team>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {TEAM_COLS} FROM team ORDER BY team_id"))?;
        let teams = stmt.query_map([], team_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(teams)
    }

    fn upsert_team(&self, team: &Team) -> DeskResult<()> {
        self.lock()?.execute(
            "INSERT INTO team (team_id, name, member_ids, lead_ids, default_strategy,
                               capacity_ceiling, load_balancing_enabled, fallback_team_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(team_id) DO UPDATE SET
                name = excluded.name,
                member_ids = excluded.member_ids,
                lead_ids = excluded.lead_ids,
                default_strategy = excluded.default_strategy,
                capacity_ceiling = excluded.capacity_ceiling,
                load_balancing_enabled = excluded.load_balancing_enabled,
                fallback_team_id = excluded.fallback_team_id",
            params![
                team.team_id,
                team.name,
                to_json(&team.member_ids)?,
                to_json(&team.lead_ids)?,
                team.default_strategy.as_str(),
                team.capacity_ceiling,
                team.load_balancing_enabled as i32,
                team.fallback_team_id,
            ],
        )?;
        Ok(())
    }

    fn member(&self, member_id: &str) -> DeskResult<TeamMember> {
        let conn = self.lock()?;
        load_member(&conn, member_id)?.ok_or_else(|| DeskError::not_found("team member", member_id))
    }

    fn team_members(&self, team_id: &str) -> DeskResult<Vec<TeamMember>> {
        let conn = self.lock()?;
        let team = load_team(&conn, team_id)?;
        let mut members = Vec::with_capacity(team.member_ids.len());
        for id in &team.member_ids {
            match load_member(&conn, id)? {
                Some(m) => members.push(m),
                None => log::warn!("team {team_id} lists unknown member {id}"),
            }
        }
        Ok(members)
    }

    fn upsert_member(&self, member: &TeamMember) -> DeskResult<()> {
        let availability = member.availability.as_ref().map(to_json).transpose()?;
        self.lock()?.execute(
            "INSERT INTO team_member (member_id, name, role, skills, max_active_assignments,
                                      is_available, availability, on_leave)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(member_id) DO UPDATE SET
                name = excluded.name,
                role = excluded.role,
                skills = excluded.skills,
                max_active_assignments = excluded.max_active_assignments,
                is_available = excluded.is_available,
                availability = excluded.availability,
                on_leave = excluded.on_leave",
            params![
                member.member_id,
                member.name,
                member.role.as_str(),
                to_json(&member.skills)?,
                member.max_active_assignments,
                member.is_available as i32,
                availability,
                member.on_leave as i32,
            ],
        )?;
        Ok(())
    }

    fn enabled_rules(&self, team_id: &str) -> DeskResult<Vec<AssignmentRule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLS} FROM assignment_rule
             WHERE team_id = ?1 AND enabled = 1
             ORDER BY priority DESC, rule_id ASC"
        ))?;
        let rules = stmt.query_map(params![team_id], rule_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    fn upsert_rule(&self, rule: &AssignmentRule) -> DeskResult<()> {
        self.lock()?.execute(
            &format!(
                "INSERT OR REPLACE INTO assignment_rule ({RULE_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                rule.rule_id,
                rule.team_id,
                rule.name,
                rule.context,
                rule.level,
                rule.severity.map(|s| s.as_str()),
                rule.strategy.as_str(),
                rule.target_team_id,
                to_json(&rule.skills_required)?,
                rule.role_filter.map(|r| r.as_str()),
                rule.response_time_minutes,
                rule.resolution_time_minutes,
                rule.escalate_if_unassigned_after_minutes,
                rule.priority,
                rule.enabled as i32,
            ],
        )?;
        Ok(())
    }

    fn next_round_robin_index(&self, team_id: &str, len: usize) -> DeskResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let cursor: i64 = tx
            .query_row("SELECT rr_cursor FROM team WHERE team_id = ?1", params![team_id], |r| r.get(0))
            .optional()?
            .ok_or_else(|| DeskError::not_found("team", team_id))?;
        tx.execute("UPDATE team SET rr_cursor = rr_cursor + 1 WHERE team_id = ?1", params![team_id])?;
        tx.commit()?;
        Ok(cursor as usize % len.max(1))
    }

    fn upsert_pending(&self, pending: &PendingEscalation) -> DeskResult<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO pending_escalation
                (escalation_id, team_id, escalation, rule, created_at, escalate_at, hops)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pending.escalation.escalation_id,
                pending.rule.team_id,
                to_json(&pending.escalation)?,
                to_json(&pending.rule)?,
                ms(pending.created_at),
                opt_ms(pending.escalate_at),
                pending.hops,
            ],
        )?;
        Ok(())
    }

    fn pending(&self, escalation_id: &str) -> DeskResult<Option<PendingEscalation>> {
        Ok(self
            .lock()?
            .query_row(
                "SELECT escalation, rule, created_at, escalate_at, hops
                 FROM pending_escalation WHERE escalation_id = ?1",
                params![escalation_id],
                pending_row,
            )
            .optional()?)
    }

    fn due_pending(&self, now: DateTime<Utc>) -> DeskResult<Vec<PendingEscalation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT escalation, rule, created_at, escalate_at, hops
             FROM pending_escalation
             WHERE escalate_at IS NOT NULL AND escalate_at <= ?1
             ORDER BY escalate_at ASC, escalation_id ASC",
        )?;
        let rows = stmt.query_map(params![ms(now)], pending_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn clear_pending(&self, escalation_id: &str) -> DeskResult<()> {
        self.lock()?.execute(
            "DELETE FROM pending_escalation WHERE escalation_id = ?1",
            params![escalation_id],
        )?;
        Ok(())
    }
}

impl DeskStore {
    /// Every row in the manual-assignment queue, oldest first.
    pub fn list_pending(&self) -> DeskResult<Vec<PendingEscalation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT escalation, rule, created_at, escalate_at, hops
             FROM pending_escalation ORDER BY created_at ASC, escalation_id ASC",
        )?;
        let rows = stmt.query_map([], pending_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
