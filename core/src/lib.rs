//! Escalation desk core: assignment, workload balancing, SLA tracking and
//! notification delivery for escalations raised by the incident layer.

pub mod assignment_engine;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod notification_dispatcher;
pub mod notification_preferences;
pub mod repository;
pub mod scheduler;
pub mod setup;
pub mod sla_tracker;
pub mod store;
pub mod team;
pub mod types;
pub mod workload_balancer;

pub use engine::{EscalationDesk, ScanReport};
pub use error::{DeskError, DeskResult};
pub use store::DeskStore;
