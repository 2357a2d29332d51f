//! Drives a `Scheduler` from a real-time tick loop.

use crate::config::ClockResolution;
use crate::engine::Scheduler;
use std::future::Future;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

/// Calls `Scheduler::service` at a fixed rate until told to stop.
///
/// The scheduler is `!Send`, so the driver must run on a current-thread
/// runtime or inside a `LocalSet`.
pub struct Driver {
    scheduler: Scheduler,
    resolution: ClockResolution,
}

impl Driver {
    pub fn new(scheduler: Scheduler, resolution: ClockResolution) -> Self {
        Self {
            scheduler,
            resolution,
        }
    }

    /// A driver ticking at the scheduler's configured resolution.
    pub fn from_config(scheduler: Scheduler) -> Self {
        let resolution = scheduler.config().resolution;
        Self::new(scheduler, resolution)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Runs until Ctrl+C. Returns the number of ticks serviced.
    pub async fn run(&self) -> anyhow::Result<u64> {
        self.run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Runs until `shutdown` completes. Returns the number of ticks serviced.
    ///
    /// Initializes the scheduler first if nobody has yet. Ticks that fall
    /// behind are skipped rather than bunched up.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<u64> {
        if !self.scheduler.is_initialized() {
            self.scheduler.initialize()?;
        }

        let mut ticker = interval(self.resolution.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            "Driver running at {:?} ({} ticks/s).",
            self.resolution,
            self.resolution.ticks_per_second()
        );
        let mut ticks = 0_u64;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown signal received.");
                    break;
                }
                _ = ticker.tick() => {
                    self.scheduler.service()?;
                    ticks += 1;
                }
            }
        }
        info!("Driver stopped after {} ticks.", ticks);
        Ok(ticks)
    }
}
