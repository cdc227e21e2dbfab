//! Assignment Rule Engine.
//!
//! For an incoming escalation:
//!   1. Scan the team's enabled rules, highest priority first. The first
//!      rule whose predicate matches wins. Unset predicate fields match anything.
//!   2. No match: fall back to the team's default strategy and SLA defaults.
//!   3. Resolve the strategy to a member (or to "awaiting manual assignment").
//!
//! Escalations left unassigned are kept as pending rows. A rule with an
//! `escalate_if_unassigned_after_minutes` gives the row a deadline; the
//! periodic scan hands overdue rows to the team's fallback team, one hop per
//! scan, up to `max_fallback_hops`.
//!
//! Members on leave are never auto-assigned. Load-based strategies skip
//! members at their own capacity while anyone else has headroom.

use crate::{
    clock::Clock,
    sla_tracker::MAX_SLA_MINUTES,
    config::AssignmentConfig,
    error::{DeskError, DeskResult},
    repository::TeamRepository,
    team::{AssignmentStrategy, Escalation, MemberRole, Severity, Team, TeamMember},
    types::{EntityId, EscalationId, MemberId, TeamId},
    workload_balancer::{AssignmentRecord, WorkloadBalancer},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── Data structs ─────────────────────────────────────────────────────────────

/// Row from the `assignment_rule` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentRule {
    pub rule_id: EntityId,
    /// Team that owns the rule.
    pub team_id: TeamId,
    pub name: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub severity: Option<Severity>,
    pub strategy: AssignmentStrategy,
    /// Route to another team's members. Defaults to the owning team.
    #[serde(default)]
    pub target_team_id: Option<TeamId>,
    #[serde(default)]
    pub skills_required: Vec<String>,
    #[serde(default)]
    pub role_filter: Option<MemberRole>,
    #[serde(default)]
    pub response_time_minutes: Option<i64>,
    #[serde(default)]
    pub resolution_time_minutes: Option<i64>,
    #[serde(default)]
    pub escalate_if_unassigned_after_minutes: Option<i64>,
    pub priority: i32,
    pub enabled: bool,
}

impl AssignmentRule {
    /// Minute fields must be positive and at most `MAX_SLA_MINUTES`.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let fields = [
            ("response time", self.response_time_minutes),
            ("resolution time", self.resolution_time_minutes),
            ("unassigned timeout", self.escalate_if_unassigned_after_minutes),
        ];
        for (what, minutes) in fields {
            if let Some(m) = minutes {
                if !(1..=MAX_SLA_MINUTES).contains(&m) {
                    errors.push(format!("{what} must be between 1 and {MAX_SLA_MINUTES} minutes, got {m}"));
                }
            }
        }
        errors
    }

    pub fn matches(&self, escalation: &Escalation) -> bool {
        self.context.as_ref().is_none_or(|c| *c == escalation.context)
            && self.level.is_none_or(|l| l == escalation.level)
            && self.severity.is_none_or(|s| s == escalation.severity)
    }
}

/// What the rule scan decided, before a member is picked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleMatch {
    pub rule_id: Option<EntityId>,
    /// Team whose members are candidates.
    pub team_id: TeamId,
    pub strategy: AssignmentStrategy,
    pub skills_required: Vec<String>,
    pub role_filter: Option<MemberRole>,
    /// `None` means use the team's SLA configuration.
    pub response_time_minutes: Option<i64>,
    pub resolution_time_minutes: Option<i64>,
    pub escalate_after_minutes: Option<i64>,
}

/// Row from the `pending_escalation` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEscalation {
    pub escalation: Escalation,
    pub rule: RuleMatch,
    pub created_at: DateTime<Utc>,
    /// `None` waits for a manual assignment indefinitely.
    pub escalate_at: Option<DateTime<Utc>>,
    pub hops: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Assigned {
        assignment: AssignmentRecord,
        rule: RuleMatch,
    },
    AwaitingManualAssignment {
        escalation_id: EscalationId,
        rule: RuleMatch,
        escalate_at: Option<DateTime<Utc>>,
    },
}

/// Result of handing one overdue escalation to a fallback team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutHandoff {
    pub escalation_id: EscalationId,
    pub escalation: Escalation,
    pub from_team: TeamId,
    pub to_team: Option<TeamId>,
    pub hops: u32,
    pub outcome: Option<AssignmentOutcome>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct AssignmentEngine {
    teams: Arc<dyn TeamRepository>,
    balancer: Arc<WorkloadBalancer>,
    clock: Arc<dyn Clock>,
    config: AssignmentConfig,
}

impl AssignmentEngine {
    pub fn new(
        teams: Arc<dyn TeamRepository>,
        balancer: Arc<WorkloadBalancer>,
        clock: Arc<dyn Clock>,
        config: AssignmentConfig,
    ) -> Self {
        Self { teams, balancer, clock, config }
    }

    /// Pick the rule (or the team default) for `escalation` within `team_id`.
    pub fn match_rule(&self, escalation: &Escalation, team_id: &str) -> DeskResult<RuleMatch> {
        let rules = self.teams.enabled_rules(team_id)?;
        if let Some(rule) = rules.iter().find(|r| r.matches(escalation)) {
            log::debug!("escalation {} matched rule {}", escalation.escalation_id, rule.rule_id);
            return Ok(RuleMatch {
                rule_id: Some(rule.rule_id.clone()),
                team_id: rule.target_team_id.clone().unwrap_or_else(|| team_id.to_string()),
                strategy: rule.strategy,
                skills_required: if rule.skills_required.is_empty() {
                    escalation.skills_required.clone()
                } else {
                    rule.skills_required.clone()
                },
                role_filter: rule.role_filter,
                response_time_minutes: rule.response_time_minutes,
                resolution_time_minutes: rule.resolution_time_minutes,
                escalate_after_minutes: rule.escalate_if_unassigned_after_minutes,
            });
        }

        let team = self.teams.team(team_id)?;
        Ok(RuleMatch {
            rule_id: None,
            team_id: team.team_id,
            strategy: team.default_strategy,
            skills_required: escalation.skills_required.clone(),
            role_filter: None,
            response_time_minutes: None,
            resolution_time_minutes: None,
            escalate_after_minutes: None,
        })
    }

    /// Resolve the strategy to a member. `Ok(None)` means manual assignment.
    pub fn select_member(&self, rule: &RuleMatch) -> DeskResult<Option<MemberId>> {
        if rule.strategy == AssignmentStrategy::Manual {
            return Ok(None);
        }
        let team = self.teams.team(&rule.team_id)?;
        let candidates: Vec<TeamMember> = self
            .teams
            .team_members(&rule.team_id)?
            .into_iter()
            .filter(|m| !m.on_leave)
            .filter(|m| rule.role_filter.is_none_or(|r| r == m.role))
            .collect();

        let no_one = |reason: &str| DeskError::NoEligibleMember {
            team_id: rule.team_id.clone(),
            reason: reason.to_string(),
        };

        match rule.strategy {
            AssignmentStrategy::Manual => Ok(None),
            AssignmentStrategy::RoundRobin => {
                if candidates.is_empty() {
                    return Err(no_one("no members to rotate through"));
                }
                let idx = self.teams.next_round_robin_index(&team.team_id, candidates.len())?;
                Ok(Some(candidates[idx].member_id.clone()))
            }
            AssignmentStrategy::LoadBalanced => {
                if candidates.is_empty() {
                    return Err(no_one("no active members"));
                }
                self.balanced_pick(&team, &candidates).map(Some)
            }
            AssignmentStrategy::SkillMatched => {
                let skilled: Vec<TeamMember> = if rule.skills_required.is_empty() {
                    candidates
                } else {
                    candidates
                        .into_iter()
                        .filter(|m| m.has_any_skill(&rule.skills_required))
                        .collect()
                };
                if skilled.is_empty() {
                    return Err(no_one(&format!(
                        "no member has any of [{}]",
                        rule.skills_required.join(", ")
                    )));
                }
                self.balanced_pick(&team, &skilled).map(Some)
            }
            AssignmentStrategy::Availability => {
                let now = self.clock.now();
                let available: Vec<TeamMember> =
                    candidates.into_iter().filter(|m| m.is_available_at(now)).collect();
                if available.is_empty() {
                    return Err(no_one("no member is currently available"));
                }
                self.balanced_pick(&team, &available).map(Some)
            }
        }
    }

    fn balanced_pick(&self, team: &Team, candidates: &[TeamMember]) -> DeskResult<MemberId> {
        if !team.load_balancing_enabled {
            return Ok(candidates[0].member_id.clone());
        }
        let with_headroom: Vec<MemberId> = candidates
            .iter()
            .filter(|m| !m.at_capacity())
            .map(|m| m.member_id.clone())
            .collect();
        let pool = if with_headroom.is_empty() {
            log::warn!("every candidate in {} is at capacity", team.team_id);
            candidates.iter().map(|m| m.member_id.clone()).collect()
        } else {
            with_headroom
        };
        self.balancer.least_busy_member(&team.team_id, &pool)
    }

    /// Route a new escalation raised against its own team.
    pub fn assign(&self, escalation: &Escalation) -> DeskResult<AssignmentOutcome> {
        let rule = self.match_rule(escalation, &escalation.team_id)?;
        self.route(escalation, rule, 0)
    }

    fn route(&self, escalation: &Escalation, rule: RuleMatch, hops: u32) -> DeskResult<AssignmentOutcome> {
        match self.select_member(&rule) {
            Ok(Some(member_id)) => {
                let assignment = self.balancer.record_assignment(&rule.team_id, &member_id, escalation)?;
                self.teams.clear_pending(&escalation.escalation_id)?;
                Ok(AssignmentOutcome::Assigned { assignment, rule })
            }
            Ok(None) => {
                let pending = self.park(escalation, &rule, hops)?;
                log::info!(
                    "escalation {} awaiting manual assignment in {}",
                    escalation.escalation_id,
                    rule.team_id
                );
                Ok(AssignmentOutcome::AwaitingManualAssignment {
                    escalation_id: escalation.escalation_id.clone(),
                    rule,
                    escalate_at: pending.escalate_at,
                })
            }
            Err(e @ DeskError::NoEligibleMember { .. }) => {
                // Keep the unassigned-timeout running so a fallback can pick it up.
                if rule.escalate_after_minutes.is_some() {
                    self.park(escalation, &rule, hops)?;
                }
                log::warn!("escalation {} not assigned: {e}", escalation.escalation_id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn park(&self, escalation: &Escalation, rule: &RuleMatch, hops: u32) -> DeskResult<PendingEscalation> {
        let now = self.clock.now();
        let pending = PendingEscalation {
            escalation: escalation.clone(),
            rule: rule.clone(),
            created_at: now,
            escalate_at: rule.escalate_after_minutes.map(|m| now + Duration::minutes(m)),
            hops,
        };
        self.teams.upsert_pending(&pending)?;
        Ok(pending)
    }

    /// Finish a manual assignment for a pending escalation.
    pub fn assign_manually(&self, escalation_id: &str, member_id: &str) -> DeskResult<AssignmentOutcome> {
        let pending = self
            .teams
            .pending(escalation_id)?
            .ok_or_else(|| DeskError::not_found("pending escalation", escalation_id))?;
        let assignment =
            self.balancer
                .record_assignment(&pending.rule.team_id, member_id, &pending.escalation)?;
        self.teams.clear_pending(escalation_id)?;
        Ok(AssignmentOutcome::Assigned { assignment, rule: pending.rule })
    }

    pub fn pending(&self, escalation_id: &str) -> DeskResult<Option<PendingEscalation>> {
        self.teams.pending(escalation_id)
    }

    /// Pending escalations whose unassigned timeout has passed.
    pub fn due_pending(&self) -> DeskResult<Vec<PendingEscalation>> {
        self.teams.due_pending(self.clock.now())
    }

    /// Hand every overdue pending escalation one hop to its fallback team.
    /// A row that cannot be handed off is logged and skipped; the rest still move.
    pub fn escalate_unassigned(&self) -> DeskResult<Vec<TimeoutHandoff>> {
        let mut handoffs = Vec::new();
        for pending in self.due_pending()? {
            let escalation_id = pending.escalation.escalation_id.clone();
            match self.hand_off(pending) {
                Ok(handoff) => handoffs.push(handoff),
                Err(e) => log::warn!("escalation {escalation_id} not handed off: {e}"),
            }
        }
        Ok(handoffs)
    }

    /// Move one overdue pending escalation a hop towards its fallback team.
    ///
    /// If the fallback cannot be resolved or routed to, the row loses its
    /// deadline and stays in the manual queue; later scans skip it.
    pub fn hand_off(&self, pending: PendingEscalation) -> DeskResult<TimeoutHandoff> {
        let escalation_id = pending.escalation.escalation_id.clone();
        let from_team = pending.rule.team_id.clone();

        let (to_team, rule) = match self.fallback_rule(&pending) {
            Ok(Some(target)) => target,
            Ok(None) => {
                // Nowhere left to go: keep it in the manual queue without a deadline.
                self.teams.upsert_pending(&PendingEscalation { escalate_at: None, ..pending.clone() })?;
                log::warn!("escalation {escalation_id} timed out in {from_team} with no fallback left");
                return Ok(TimeoutHandoff {
                    escalation_id,
                    escalation: pending.escalation,
                    from_team,
                    to_team: None,
                    hops: pending.hops,
                    outcome: None,
                });
            }
            Err(e) => {
                self.teams.upsert_pending(&PendingEscalation { escalate_at: None, ..pending })?;
                return Err(e);
            }
        };

        let hops = pending.hops + 1;
        log::warn!("escalation {escalation_id} unassigned in {from_team}, handing to {to_team}");
        let outcome = match self.route(&pending.escalation, rule, hops) {
            Ok(o) => Some(o),
            Err(DeskError::NoEligibleMember { .. }) => None,
            Err(e) => {
                self.teams.upsert_pending(&PendingEscalation { escalate_at: None, ..pending })?;
                return Err(e);
            }
        };
        if outcome.is_none() {
            // Still unassigned: park under the fallback team as a manual item.
            if self.teams.pending(&escalation_id)?.is_none_or(|p| p.hops < hops) {
                let rule = RuleMatch { team_id: to_team.clone(), ..pending.rule.clone() };
                self.teams.upsert_pending(&PendingEscalation {
                    rule,
                    escalate_at: None,
                    hops,
                    ..pending.clone()
                })?;
            }
        }
        Ok(TimeoutHandoff {
            escalation_id,
            escalation: pending.escalation,
            from_team,
            to_team: Some(to_team),
            hops,
            outcome,
        })
    }

    /// Fallback team and its matching rule, or `None` once the hop budget
    /// is spent or the team has no fallback.
    fn fallback_rule(&self, pending: &PendingEscalation) -> DeskResult<Option<(TeamId, RuleMatch)>> {
        let fallback = self.teams.team(&pending.rule.team_id)?.fallback_team_id;
        match fallback {
            Some(to_team) if pending.hops < self.config.max_fallback_hops => {
                let rule = self.match_rule(&pending.escalation, &to_team)?;
                Ok(Some((to_team, rule)))
            }
            _ => Ok(None),
        }
    }
}
