//! Retention collectors: permanent deletion of expired cold workspace
//! volumes and expired evidence bundle files.
//!
//! Both sweeps run on an hourly cadence (plus once shortly after startup)
//! and can be triggered synchronously through the operator endpoint. Items
//! are processed independently; a failure skips the item and leaves it for
//! the next sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use relay_db::Database;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::{self, Metrics};
use crate::sandbox::SandboxDriver;
use crate::CoreConfig;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
pub const STARTUP_SWEEP_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSummary {
    pub workspaces_deleted: usize,
    pub bundles_deleted: usize,
}

pub struct RetentionCollector {
    db: Database,
    driver: Arc<dyn SandboxDriver>,
    metrics: Metrics,
    workspace_cold_ttl: chrono::Duration,
    evidence_ttl: chrono::Duration,
    interval: Duration,
}

impl RetentionCollector {
    pub fn new(
        db: Database,
        driver: Arc<dyn SandboxDriver>,
        metrics: Metrics,
        config: &CoreConfig,
    ) -> Self {
        Self {
            db,
            driver,
            metrics,
            workspace_cold_ttl: config.workspace_cold_ttl,
            evidence_ttl: config.evidence_ttl,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_SWEEP_DELAY).await;
            loop {
                match self.sweep_all().await {
                    Ok(summary) => info!(
                        workspaces = summary.workspaces_deleted,
                        bundles = summary.bundles_deleted,
                        "retention sweep complete"
                    ),
                    Err(err) => warn!(error = %err, "retention sweep failed"),
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    pub async fn sweep_all(&self) -> Result<RetentionSummary> {
        Ok(RetentionSummary {
            workspaces_deleted: self.sweep_workspaces().await?,
            bundles_deleted: self.sweep_evidence().await?,
        })
    }

    /// Deletes volumes of cold workspaces past `WorkspaceColdTTL` and marks
    /// the rows `deleted`. A missing volume is not an error; the row is
    /// still marked.
    pub async fn sweep_workspaces(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.workspace_cold_ttl;
        let expired = self.db.list_expired_cold_workspaces(cutoff).await?;
        let mut deleted = 0;
        for workspace in expired {
            let Some(volume_name) = workspace.volume_name.as_deref() else {
                continue;
            };
            match self.driver.delete_volume(volume_name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(workspace_id = %workspace.id, error = %err, "volume deletion failed");
                    continue;
                }
            }
            if let Err(err) = self.db.mark_workspace_deleted(workspace.id).await {
                warn!(workspace_id = %workspace.id, error = %err, "marking workspace deleted failed");
                continue;
            }
            self.metrics.incr(metrics::WORKSPACE_GC_TOTAL);
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Deletes bundle zips past `EvidenceTTL` and marks the rows `deleted`.
    /// A file already missing from disk is acceptable.
    pub async fn sweep_evidence(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.evidence_ttl;
        let expired = self.db.list_expired_bundles(cutoff).await?;
        let mut deleted = 0;
        for bundle in expired {
            let Some(bundle_path) = bundle.bundle_path.as_deref() else {
                continue;
            };
            match tokio::fs::remove_file(bundle_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(bundle_id = %bundle.id, error = %err, "bundle file deletion failed");
                    continue;
                }
            }
            if let Err(err) = self.db.mark_bundle_deleted(bundle.id).await {
                warn!(bundle_id = %bundle.id, error = %err, "marking bundle deleted failed");
                continue;
            }
            self.metrics.incr(metrics::EVIDENCE_GC_TOTAL);
            deleted += 1;
        }
        Ok(deleted)
    }
}
