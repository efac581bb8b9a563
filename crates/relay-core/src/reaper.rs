//! Idle reaper: cools warm workspaces whose idle deadline has passed.
//!
//! The sweep never touches `thread_id` or `volume_name`, so a cooled
//! workspace resumes its agent conversation when reopened. Per-workspace
//! failures are logged and skipped; the row stays warm and is retried on the
//! next tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use relay_db::Database;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::{self, Metrics};
use crate::sandbox::SandboxDriver;

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

pub struct IdleReaper {
    db: Database,
    driver: Arc<dyn SandboxDriver>,
    metrics: Metrics,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(db: Database, driver: Arc<dyn SandboxDriver>, metrics: Metrics) -> Self {
        Self {
            db,
            driver,
            metrics,
            interval: DEFAULT_REAP_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_once().await {
                    warn!(error = %err, "idle reaper sweep failed");
                }
            }
        })
    }

    /// One pass over expired warm workspaces. Returns how many were cooled.
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = Utc::now();
        let idle = self.db.list_idle_warm_workspaces(now).await?;
        let mut cooled = 0;
        for workspace in idle {
            let Some(container_id) = workspace.container_id.as_deref() else {
                continue;
            };
            match self.driver.stop_and_remove(container_id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(workspace_id = %workspace.id, error = %err, "idle stop failed");
                    continue;
                }
            }
            if let Err(err) = self.db.mark_workspace_cold(workspace.id).await {
                warn!(workspace_id = %workspace.id, error = %err, "cooling workspace failed");
                continue;
            }
            self.metrics.incr(metrics::WORKSPACES_REAPED_TOTAL);
            info!(workspace_id = %workspace.id, "workspace cooled after idle timeout");
            cooled += 1;
        }
        Ok(cooled)
    }
}
