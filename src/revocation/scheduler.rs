use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, error, info};

use super::errors::RevocationResult;
use super::facade::RevocationService;
use super::sync::SyncReport;

/// Configuration for the revocation sync scheduler
#[derive(Debug, Clone)]
pub struct SyncSchedulerConfig {
    /// How often to check whether a sync is due (in seconds)
    pub check_interval_secs: u64,
}

impl Default for SyncSchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 3600, // 1 hour
        }
    }
}

/// Scheduler for periodic revocation list syncs
pub struct SyncScheduler {
    config: SyncSchedulerConfig,
    service: Arc<RevocationService>,
}

impl SyncScheduler {
    pub fn new(config: SyncSchedulerConfig, service: Arc<RevocationService>) -> Self {
        Self { config, service }
    }

    /// Sync now if one is due (for initial setup)
    pub async fn trigger_immediate_update(&self) -> RevocationResult<Option<SyncReport>> {
        debug!("Checking whether a revocation sync is due");
        self.service.sync_if_due().await
    }

    /// Start the scheduler (spawns background task)
    pub fn start(self) -> JoinHandle<()> {
        let check_interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        info!(
            "Starting revocation sync scheduler with interval of {} seconds",
            self.config.check_interval_secs
        );

        let scheduler = Arc::new(self);

        tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            ticker.tick().await; // First tick completes immediately

            loop {
                ticker.tick().await;
                debug!("Running scheduled revocation sync check");

                match scheduler.trigger_immediate_update().await {
                    Ok(Some(report)) if report.completed => {
                        info!(
                            "Scheduled revocation sync completed with {} downloads",
                            report.downloads
                        );
                    }
                    Ok(Some(report)) => {
                        debug!(
                            "Scheduled revocation sync stopped after {:?}",
                            report.phase
                        );
                    }
                    Ok(None) => debug!("Revocation sync not due"),
                    Err(e) => {
                        error!("Scheduled revocation sync failed: {}", e);
                    }
                }
            }
        })
    }
}
