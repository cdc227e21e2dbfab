//! Seed document for an installation: teams, members, rules, SLA
//! configurations and directory roles, applied in dependency order.

use crate::{
    assignment_engine::AssignmentRule,
    error::{DeskError, DeskResult},
    repository::{SlaTrackerRepository, TeamRepository},
    sla_tracker::SlaConfiguration,
    store::DeskStore,
    team::{Team, TeamMember},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskSetup {
    pub members: Vec<TeamMember>,
    pub teams: Vec<Team>,
    pub rules: Vec<AssignmentRule>,
    pub sla_configurations: Vec<SlaConfiguration>,
    pub directory: Vec<DirectoryEntry>,
}

impl DeskSetup {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let setup: DeskSetup = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        Ok(setup)
    }

    /// Cross-reference checks: every team member, lead, rule owner and
    /// fallback must name something defined in this document or the store.
    pub fn validate(&self, store: &DeskStore) -> Vec<String> {
        let mut errors = Vec::new();
        let member_known = |id: &str| self.members.iter().any(|m| m.member_id == id) || store.member(id).is_ok();
        let team_known = |id: &str| self.teams.iter().any(|t| t.team_id == id) || store.team(id).is_ok();

        for team in &self.teams {
            for id in team.member_ids.iter().chain(&team.lead_ids) {
                if !member_known(id) {
                    errors.push(format!("team {} references unknown member {id}", team.team_id));
                }
            }
            if let Some(fallback) = &team.fallback_team_id {
                if fallback == &team.team_id {
                    errors.push(format!("team {} falls back to itself", team.team_id));
                } else if !team_known(fallback) {
                    errors.push(format!("team {} falls back to unknown team {fallback}", team.team_id));
                }
            }
        }
        for rule in &self.rules {
            if !team_known(&rule.team_id) {
                errors.push(format!("rule {} belongs to unknown team {}", rule.rule_id, rule.team_id));
            }
            if let Some(target) = &rule.target_team_id {
                if !team_known(target) {
                    errors.push(format!("rule {} targets unknown team {target}", rule.rule_id));
                }
            }
            errors.extend(rule.validate().into_iter().map(|e| format!("rule {}: {e}", rule.rule_id)));
        }
        for config in &self.sla_configurations {
            errors.extend(config.validate().into_iter().map(|e| format!("sla {}: {e}", config.team_id)));
        }
        errors
    }

    pub fn apply(&self, store: &DeskStore) -> DeskResult<()> {
        let errors = self.validate(store);
        if !errors.is_empty() {
            return Err(DeskError::Validation(errors));
        }
        for member in &self.members {
            store.upsert_member(member)?;
        }
        for team in &self.teams {
            store.upsert_team(team)?;
        }
        for rule in &self.rules {
            store.upsert_rule(rule)?;
        }
        for config in &self.sla_configurations {
            store.upsert_sla_configuration(config)?;
        }
        for entry in &self.directory {
            for role in &entry.roles {
                store.add_directory_role(&entry.user_id, role)?;
            }
        }
        log::info!(
            "setup applied: {} team(s), {} member(s), {} rule(s)",
            self.teams.len(),
            self.members.len(),
            self.rules.len()
        );
        Ok(())
    }
}
