//! Periodic desk work, independent of request traffic.
//!
//! Two timers: the scan (timeouts, breaches, at-risk warnings) and the
//! notification cleanup. A failing pass is logged and retried on the next tick.

use crate::{config::SchedulerConfig, engine::EscalationDesk};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

pub struct DeskScheduler {
    desk: Arc<EscalationDesk>,
    config: SchedulerConfig,
}

impl DeskScheduler {
    pub fn new(desk: Arc<EscalationDesk>, config: SchedulerConfig) -> Self {
        Self { desk, config }
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut scan = interval(Duration::from_secs(self.config.scan_interval_secs.max(1)));
        let mut cleanup = interval(Duration::from_secs(self.config.cleanup_interval_secs.max(1)));
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!(
            "scheduler started: scan every {}s, cleanup every {}s",
            self.config.scan_interval_secs,
            self.config.cleanup_interval_secs
        );

        loop {
            tokio::select! {
                _ = scan.tick() => {
                    if let Err(e) = self.desk.scan().await {
                        log::error!("scan failed: {e}");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.desk.cleanup() {
                        log::error!("notification cleanup failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("scheduler stopped");
    }

    /// Spawn onto the current runtime. Send `true` on the returned sender to stop.
    pub fn spawn(self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(rx));
        (handle, tx)
    }
}
