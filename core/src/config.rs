use serde::{Deserialize, Serialize};

// ── Workload ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Active assignments at which a member counts as overloaded.
    pub default_max_capacity: u32,
    /// Load variance below which a team counts as balanced.
    pub balance_variance_threshold: f64,
    /// Total active assignments a team can carry.
    pub team_capacity_threshold: u32,
    /// Fraction of the team threshold that triggers "approaching capacity".
    pub approaching_capacity_ratio: f64,
    /// Handling time assumed for a member with no completed assignments.
    pub default_handling_minutes: i64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            default_max_capacity: 5,
            balance_variance_threshold: 2.0,
            team_capacity_threshold: 20,
            approaching_capacity_ratio: 0.8,
            default_handling_minutes: 60,
        }
    }
}

// ── SLA ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    /// Used when a team has no stored SLA configuration.
    pub response_time_minutes: i64,
    pub resolution_time_minutes: i64,
    pub warning_threshold_minutes: i64,
    pub critical_threshold_minutes: i64,
    pub upcoming_window_minutes: i64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            response_time_minutes: 30,
            resolution_time_minutes: 240,
            warning_threshold_minutes: 15,
            critical_threshold_minutes: 5,
            upcoming_window_minutes: 30,
        }
    }
}

// ── Delivery ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-channel delivery timeout. A timeout is a `failed` outcome.
    pub channel_timeout_ms: u64,
    /// Rows deleted per transaction during cleanup.
    pub cleanup_batch_size: usize,
    /// Archived notifications older than this are purged by the scheduler.
    pub days_to_keep: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            channel_timeout_ms: 10_000,
            cleanup_batch_size: 100,
            days_to_keep: 30,
        }
    }
}

// ── Scheduler ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scan_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            cleanup_interval_secs: 3_600,
        }
    }
}

// ── Assignment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// How many times an unassigned escalation may cascade to a fallback team.
    pub max_fallback_hops: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self { max_fallback_hops: 3 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskConfig {
    pub workload: WorkloadConfig,
    pub sla: SlaConfig,
    pub delivery: DeliveryConfig,
    pub scheduler: SchedulerConfig,
    pub assignment: AssignmentConfig,
}

impl DeskConfig {
    /// Load from a JSON file. Missing sections and keys take their defaults.
    /// In tests, use `DeskConfig::default()`.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: DeskConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        Ok(config)
    }
}
