use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};

use crate::services::matching::SosMatchService;

/// Background loop that escalates or cancels SOS bookings whose clinic
/// never answered. One instance per process; the per-booking lease keeps
/// several processes from double-escalating the same booking.
pub struct SosTimeoutSweeper {
    matching: Arc<SosMatchService>,
    sweep_interval_secs: u64,
    is_shutdown: RwLock<bool>,
}

impl SosTimeoutSweeper {
    pub fn new(matching: Arc<SosMatchService>, sweep_interval_secs: u64) -> Self {
        Self {
            matching,
            sweep_interval_secs,
            is_shutdown: RwLock::new(false),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            "SOS timeout sweeper started (every {}s)",
            self.sweep_interval_secs
        );
        let mut interval = tokio::time::interval(Duration::from_secs(self.sweep_interval_secs));

        loop {
            interval.tick().await;

            if *self.is_shutdown.read().await {
                break;
            }

            match self.matching.check_timeouts().await {
                Ok(summary) if summary.examined > 0 => {
                    info!(
                        "SOS sweep: {} awaiting confirmation, {} escalated, {} cancelled, {} busy",
                        summary.examined, summary.escalated, summary.cancelled, summary.raced
                    );
                }
                Ok(_) => debug!("SOS sweep: nothing awaiting confirmation"),
                Err(e) => error!("SOS timeout sweep failed: {}", e),
            }
        }

        info!("SOS timeout sweeper stopped");
    }

    pub async fn shutdown(&self) {
        info!("Shutting down SOS timeout sweeper");
        *self.is_shutdown.write().await = true;
    }
}
