//! Team, member and escalation records.
//!
//! These are the inputs the desk routes over. An `Escalation` is raised by
//! the incident-handling layer; the desk never decides what counts as one.

use crate::types::{EscalationId, MemberId, TeamId};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    TeamLead,
    Senior,
    Standard,
    Junior,
    Specialist,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TeamLead => "team_lead",
            Self::Senior => "senior",
            Self::Standard => "standard",
            Self::Junior => "junior",
            Self::Specialist => "specialist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "team_lead" => Some(Self::TeamLead),
            "senior" => Some(Self::Senior),
            "standard" => Some(Self::Standard),
            "junior" => Some(Self::Junior),
            "specialist" => Some(Self::Specialist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    RoundRobin,
    LoadBalanced,
    SkillMatched,
    Availability,
    Manual,
}

impl AssignmentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LoadBalanced => "load_balanced",
            Self::SkillMatched => "skill_matched",
            Self::Availability => "availability",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(Self::RoundRobin),
            "load_balanced" => Some(Self::LoadBalanced),
            "skill_matched" => Some(Self::SkillMatched),
            "availability" => Some(Self::Availability),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExpertiseLevel {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberSkill {
    pub skill: String,
    pub level: ExpertiseLevel,
}

/// Working window for a member. `days_of_week` uses 0 = Sunday.
/// An empty day list means every day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvailabilityWindow {
    pub start_minute: u32,
    pub end_minute: u32,
    #[serde(default)]
    pub days_of_week: Vec<u8>,
}

impl AvailabilityWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let day = at.weekday().num_days_from_sunday() as u8;
        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&day) {
            return false;
        }
        let minute = at.hour() * 60 + at.minute();
        if self.start_minute <= self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            minute >= self.start_minute || minute < self.end_minute
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMember {
    pub member_id: MemberId,
    pub name: String,
    pub role: MemberRole,
    #[serde(default)]
    pub skills: Vec<MemberSkill>,
    pub max_active_assignments: u32,
    /// Maintained by the workload store only. Ignored on insert.
    #[serde(default)]
    pub current_assignment_count: u32,
    #[serde(default = "default_true")]
    pub is_available: bool,
    #[serde(default)]
    pub availability: Option<AvailabilityWindow>,
    #[serde(default)]
    pub on_leave: bool,
}

fn default_true() -> bool {
    true
}

impl TeamMember {
    pub fn has_any_skill(&self, required: &[String]) -> bool {
        self.skills.iter().any(|s| required.contains(&s.skill))
    }

    /// Available flag set, not on leave, and inside the working window if one is set.
    pub fn is_available_at(&self, at: DateTime<Utc>) -> bool {
        self.is_available
            && !self.on_leave
            && self.availability.as_ref().is_none_or(|w| w.contains(at))
    }

    pub fn at_capacity(&self) -> bool {
        self.current_assignment_count >= self.max_active_assignments
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub team_id: TeamId,
    pub name: String,
    /// Fixed member order. Round-robin rotates through this list.
    pub member_ids: Vec<MemberId>,
    #[serde(default)]
    pub lead_ids: Vec<MemberId>,
    pub default_strategy: AssignmentStrategy,
    /// Total active assignments the team is sized for.
    #[serde(default)]
    pub capacity_ceiling: Option<u32>,
    #[serde(default = "default_true")]
    pub load_balancing_enabled: bool,
    /// Team that receives escalations left unassigned past their timeout.
    #[serde(default)]
    pub fallback_team_id: Option<TeamId>,
}

/// An incident raised somewhere in the system that needs a team response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Escalation {
    pub escalation_id: EscalationId,
    /// Team the escalation was raised against.
    pub team_id: TeamId,
    pub context: String,
    pub level: u32,
    pub severity: Severity,
    #[serde(default)]
    pub skills_required: Vec<String>,
    #[serde(default)]
    pub title: String,
}
