//! Workload Balancer.
//!
//! Write path: `record_assignment` / `complete_assignment` go through the
//! workload store, which bumps the member's active counter in the same
//! transaction as the assignment row. Nothing else writes that counter.
//!
//! Read model: after every write the team's `WorkloadSnapshot` is rebuilt
//! from the assignment rows by `project_workload` and stored as the team's
//! latest snapshot. The projection is a pure function so it can be run (and
//! tested) apart from the write path.
//!
//! The balancer keeps no cache between calls; every query reads the store.

use crate::{
    clock::Clock,
    config::WorkloadConfig,
    error::{DeskError, DeskResult},
    repository::{TeamRepository, WorkloadRepository},
    team::{Escalation, Severity, TeamMember},
    types::{new_id, EntityId, EscalationId, MemberId, TeamId},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

// ── Records ──────────────────────────────────────────────────────────────────

/// Row from the `workload_assignment` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentRecord {
    pub assignment_id: EntityId,
    pub team_id: TeamId,
    pub member_id: MemberId,
    pub escalation_id: EscalationId,
    pub severity: Severity,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberWorkload {
    pub member_id: MemberId,
    pub active_count: u32,
    pub active_by_priority: BTreeMap<String, u32>,
    pub active_by_context: BTreeMap<String, u32>,
    pub completed_count: u32,
    /// Completed / total assignments ever held, 0.0 when none.
    pub completion_rate: f64,
    /// Active count as a percentage of the member's capacity.
    pub capacity_pct: f64,
    pub estimated_next_available: DateTime<Utc>,
}

/// Latest projection for one team. Superseded on every write, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSnapshot {
    pub team_id: TeamId,
    pub computed_at: DateTime<Utc>,
    pub members: Vec<MemberWorkload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadBalance {
    pub loads: Vec<(MemberId, u32)>,
    pub average: f64,
    pub variance: f64,
    pub balanced: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapacityAdvisory {
    ApproachingCapacity,
    AvailableCapacity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacityProjection {
    pub current_total: u32,
    pub projected_total: u32,
    pub threshold: u32,
    pub utilization_pct: f64,
    pub advisory: CapacityAdvisory,
    pub message: String,
}

// ── Projection ───────────────────────────────────────────────────────────────

/// Rebuild per-member workload from assignment rows.
///
/// `members` fixes the output order; rows for members not listed are ignored.
pub fn project_workload(
    team_id: &str,
    members: &[TeamMember],
    assignments: &[AssignmentRecord],
    config: &WorkloadConfig,
    now: DateTime<Utc>,
) -> WorkloadSnapshot {
    let members = members
        .iter()
        .map(|member| {
            let mine: Vec<&AssignmentRecord> = assignments
                .iter()
                .filter(|a| a.member_id == member.member_id)
                .collect();

            let mut active_by_priority = BTreeMap::new();
            let mut active_by_context = BTreeMap::new();
            let mut active_count = 0u32;
            let mut completed_count = 0u32;
            let mut handled_minutes = Vec::new();

            for a in &mine {
                if a.completed {
                    completed_count += 1;
                    if let Some(done) = a.completed_at {
                        handled_minutes.push((done - a.created_at).num_minutes().max(0));
                    }
                } else {
                    active_count += 1;
                    *active_by_priority.entry(a.severity.as_str().to_string()).or_insert(0) += 1;
                    *active_by_context.entry(a.context.clone()).or_insert(0) += 1;
                }
            }

            let capacity = member.max_active_assignments.max(1);
            let completion_rate = if mine.is_empty() {
                0.0
            } else {
                completed_count as f64 / mine.len() as f64
            };

            // With headroom the member is free now; otherwise one average
            // handling time per assignment over capacity, plus one.
            let estimated_next_available = if active_count < capacity {
                now
            } else {
                let avg = if handled_minutes.is_empty() {
                    config.default_handling_minutes
                } else {
                    handled_minutes.iter().sum::<i64>() / handled_minutes.len() as i64
                };
                let queued = i64::from(active_count - capacity) + 1;
                now + Duration::minutes(avg * queued)
            };

            MemberWorkload {
                member_id: member.member_id.clone(),
                active_count,
                active_by_priority,
                active_by_context,
                completed_count,
                completion_rate,
                capacity_pct: active_count as f64 / capacity as f64 * 100.0,
                estimated_next_available,
            }
        })
        .collect();

    WorkloadSnapshot {
        team_id: team_id.to_string(),
        computed_at: now,
        members,
    }
}

/// Population variance.
fn variance(values: &[u32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let var = values.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var)
}

// ── Balancer ─────────────────────────────────────────────────────────────────

pub struct WorkloadBalancer {
    workload: Arc<dyn WorkloadRepository>,
    teams: Arc<dyn TeamRepository>,
    clock: Arc<dyn Clock>,
    config: WorkloadConfig,
}

impl WorkloadBalancer {
    pub fn new(
        workload: Arc<dyn WorkloadRepository>,
        teams: Arc<dyn TeamRepository>,
        clock: Arc<dyn Clock>,
        config: WorkloadConfig,
    ) -> Self {
        Self { workload, teams, clock, config }
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// Bind `escalation` to `member`. Fails with NotFound if the member is
    /// not part of the team.
    pub fn record_assignment(
        &self,
        team_id: &str,
        member_id: &str,
        escalation: &Escalation,
    ) -> DeskResult<AssignmentRecord> {
        let team = self.teams.team(team_id)?;
        if !team.member_ids.iter().any(|m| m == member_id) {
            return Err(DeskError::not_found(
                "team member",
                format!("{member_id} in team {team_id}"),
            ));
        }
        // Member row must exist for the counter update.
        self.teams.member(member_id)?;

        let record = AssignmentRecord {
            assignment_id: new_id("asg"),
            team_id: team_id.to_string(),
            member_id: member_id.to_string(),
            escalation_id: escalation.escalation_id.clone(),
            severity: escalation.severity,
            context: escalation.context.clone(),
            created_at: self.clock.now(),
            completed: false,
            completed_at: None,
        };
        self.workload.insert_assignment(&record)?;
        log::info!(
            "assignment {} : escalation {} -> {member_id} ({team_id})",
            record.assignment_id,
            record.escalation_id
        );

        self.refresh_snapshot(team_id)?;
        Ok(record)
    }

    /// Complete every open assignment for `escalation_id` in the team.
    /// Returns the records closed by this call; empty if already completed.
    pub fn complete_assignment(
        &self,
        escalation_id: &str,
        team_id: &str,
    ) -> DeskResult<Vec<AssignmentRecord>> {
        let closed = self
            .workload
            .complete_assignments(team_id, escalation_id, self.clock.now())?;
        if closed.is_empty() {
            log::debug!("no open assignment for {escalation_id} in {team_id}");
            return Ok(closed);
        }
        log::info!("escalation {escalation_id} completed ({} assignment(s))", closed.len());
        self.refresh_snapshot(team_id)?;
        Ok(closed)
    }

    /// Candidate with the lowest active count; ties keep input order.
    pub fn least_busy_member(&self, team_id: &str, candidates: &[MemberId]) -> DeskResult<MemberId> {
        let Some(first) = candidates.first() else {
            return Err(DeskError::NoEligibleMember {
                team_id: team_id.to_string(),
                reason: "candidate list is empty".into(),
            });
        };
        let counts = self.workload.active_counts(candidates)?;
        let mut best = first;
        let mut best_load = counts.get(first).copied().unwrap_or(0);
        for candidate in &candidates[1..] {
            let load = counts.get(candidate).copied().unwrap_or(0);
            if load < best_load {
                best = candidate;
                best_load = load;
            }
        }
        Ok(best.clone())
    }

    pub fn is_overloaded(&self, member_id: &str, max_capacity: Option<u32>) -> DeskResult<bool> {
        let max = max_capacity.unwrap_or(self.config.default_max_capacity);
        let counts = self.workload.active_counts(&[member_id.to_string()])?;
        Ok(counts.get(member_id).copied().unwrap_or(0) >= max)
    }

    pub fn workload_balance(&self, member_ids: &[MemberId]) -> DeskResult<WorkloadBalance> {
        let counts = self.workload.active_counts(member_ids)?;
        let loads: Vec<(MemberId, u32)> = member_ids
            .iter()
            .map(|m| (m.clone(), counts.get(m).copied().unwrap_or(0)))
            .collect();
        let values: Vec<u32> = loads.iter().map(|(_, l)| *l).collect();
        let (average, variance) = variance(&values);
        Ok(WorkloadBalance {
            loads,
            average,
            variance,
            balanced: variance < self.config.balance_variance_threshold,
        })
    }

    pub fn predict_capacity(
        &self,
        team_id: &str,
        member_ids: &[MemberId],
        additional_assignments: u32,
    ) -> DeskResult<CapacityProjection> {
        let threshold = self
            .teams
            .team(team_id)
            .ok()
            .and_then(|t| t.capacity_ceiling)
            .unwrap_or(self.config.team_capacity_threshold);
        let counts = self.workload.active_counts(member_ids)?;
        let current_total: u32 = member_ids.iter().map(|m| counts.get(m).copied().unwrap_or(0)).sum();
        let projected_total = current_total + additional_assignments;
        let utilization_pct = if threshold == 0 {
            100.0
        } else {
            projected_total as f64 / threshold as f64 * 100.0
        };

        let approaching =
            projected_total as f64 >= threshold as f64 * self.config.approaching_capacity_ratio;
        let (advisory, message) = if approaching {
            (
                CapacityAdvisory::ApproachingCapacity,
                format!(
                    "Team approaching capacity: {projected_total}/{threshold} assignments after {additional_assignments} more"
                ),
            )
        } else {
            (
                CapacityAdvisory::AvailableCapacity,
                format!(
                    "Team has capacity for {} more assignments",
                    threshold.saturating_sub(projected_total)
                ),
            )
        };

        Ok(CapacityProjection {
            current_total,
            projected_total,
            threshold,
            utilization_pct,
            advisory,
            message,
        })
    }

    /// Latest stored projection, or a fresh one if the team has none yet.
    pub fn snapshot(&self, team_id: &str) -> DeskResult<WorkloadSnapshot> {
        match self.workload.latest_workload_snapshot(team_id)? {
            Some(s) => Ok(s),
            None => self.build_snapshot(team_id),
        }
    }

    fn build_snapshot(&self, team_id: &str) -> DeskResult<WorkloadSnapshot> {
        let members = self.teams.team_members(team_id)?;
        let assignments = self.workload.assignments_for_team(team_id)?;
        Ok(project_workload(team_id, &members, &assignments, &self.config, self.clock.now()))
    }

    /// Recompute and store the team's projection.
    pub fn refresh_snapshot(&self, team_id: &str) -> DeskResult<WorkloadSnapshot> {
        let snapshot = self.build_snapshot(team_id)?;
        self.workload.save_workload_snapshot(&snapshot)?;
        log::debug!("workload snapshot refreshed for {team_id}");
        Ok(snapshot)
    }
}
