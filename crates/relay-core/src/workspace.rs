//! Workspace lifecycle: open (with per-user LRU eviction) and stop.
//!
//! The single-warm invariant is enforced by the store's transactional
//! `open_workspace`; this service wraps it with the sandbox work that has to
//! happen outside the transaction and flips the row to `error` when that
//! work fails.

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use relay_db::{Database, ProjectRecord, WorkspaceRecord, WorkspaceState, WorkspaceWarmUpdate};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::metrics::{self, Metrics};
use crate::sandbox::{ContainerSpec, SandboxDriver, SandboxError};
use crate::CoreConfig;

pub struct WorkspaceService {
    db: Database,
    driver: Arc<dyn SandboxDriver>,
    config: Arc<CoreConfig>,
    metrics: Metrics,
}

impl WorkspaceService {
    pub fn new(
        db: Database,
        driver: Arc<dyn SandboxDriver>,
        config: Arc<CoreConfig>,
        metrics: Metrics,
    ) -> Self {
        Self {
            db,
            driver,
            config,
            metrics,
        }
    }

    /// Warms (or confirms) the workspace for `(user_id, project_id)`.
    ///
    /// Every other warm workspace of the user is evicted first, best-effort:
    /// eviction failures are logged and never block opening the target.
    #[instrument(skip(self))]
    pub async fn open(
        &self,
        user_id: Uuid,
        project_id: Uuid,
    ) -> Result<WorkspaceRecord, CoreError> {
        let project = self
            .db
            .fetch_project(project_id)
            .await?
            .filter(|project| project.user_id == user_id)
            .ok_or(CoreError::ProjectNotFound(project_id))?;

        // LRU pass: stop peer containers before the transaction flips their
        // rows; any row we miss here is still flipped cold transactionally.
        match self.db.list_warm_workspaces(user_id).await {
            Ok(peers) => {
                for peer in peers
                    .iter()
                    .filter(|peer| peer.project_id != project_id)
                {
                    if let Err(err) = self.stop(peer.id).await {
                        warn!(workspace_id = %peer.id, error = %err, "LRU eviction failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "listing warm workspaces for eviction failed"),
        }

        let outcome = self.db.open_workspace(user_id, project_id).await?;
        for displaced in &outcome.displaced {
            if let Some(container_id) = displaced.container_id.as_deref() {
                if let Err(err) = self.driver.stop_and_remove(container_id).await {
                    if !err.is_not_found() {
                        warn!(
                            workspace_id = %displaced.id,
                            error = %err,
                            "stopping displaced container failed"
                        );
                    }
                }
            }
        }

        let workspace = outcome.workspace;

        // Idempotent fast path: already warm with a live container.
        if let Some(container_id) = workspace.container_id.as_deref() {
            if workspace.state == WorkspaceState::Warm
                && self.driver.inspect(container_id).await.is_ok()
            {
                let now = Utc::now();
                self.db
                    .touch_workspace_after_run(
                        workspace.id,
                        None,
                        now,
                        now + self.config.warm_idle,
                    )
                    .await?;
                return self.reload(workspace.id).await;
            }
        }

        self.warm_up(&project, workspace).await
    }

    /// Runs the sandbox path for a workspace whose row is already `warm` in
    /// the store but has no live container.
    async fn warm_up(
        &self,
        project: &ProjectRecord,
        workspace: WorkspaceRecord,
    ) -> Result<WorkspaceRecord, CoreError> {
        let volume_name = workspace
            .volume_name
            .clone()
            .ok_or_else(|| CoreError::Storage(anyhow!("workspace {} has no volume", workspace.id)))?;

        if let Err(err) = self
            .retry_transient("ensure volume", || self.driver.ensure_volume(&volume_name))
            .await
        {
            self.mark_error(workspace.id).await;
            return Err(CoreError::SandboxFailure(err.into()));
        }

        let mut spec = ContainerSpec::new(
            format!("relay-ws-{}", workspace.id),
            self.config.workspace_image.clone(),
            volume_name.clone(),
        );
        spec.exposed_port = self.config.agent_port;
        if let Some(key) = &self.config.openai_api_key {
            spec.env.push(("OPENAI_API_KEY".to_string(), key.clone()));
        }
        if let Some(value) = &self.config.force_mock_codex {
            spec.env.push(("FORCE_MOCK_CODEX".to_string(), value.clone()));
        }
        if let Some(thread_id) = &workspace.thread_id {
            spec.env
                .push(("CODEX_THREAD_ID".to_string(), thread_id.clone()));
        }

        let container_id = match self
            .retry_transient("create container", || self.driver.create_container(&spec))
            .await
        {
            Ok(id) => id,
            Err(err) => {
                self.mark_error(workspace.id).await;
                return Err(CoreError::SandboxFailure(err.into()));
            }
        };

        if let Err(err) = self
            .retry_transient("start container", || {
                self.driver.start_container(&container_id)
            })
            .await
        {
            self.rollback_container(&container_id).await;
            self.mark_error(workspace.id).await;
            return Err(CoreError::SandboxFailure(err.into()));
        }

        let inspect = match self.driver.inspect(&container_id).await {
            Ok(inspect) => inspect,
            Err(err) => {
                self.rollback_container(&container_id).await;
                self.mark_error(workspace.id).await;
                return Err(CoreError::SandboxFailure(err.into()));
            }
        };

        if let Err(err) = self.clone_repo_if_needed(&container_id, project).await {
            self.rollback_container(&container_id).await;
            self.mark_error(workspace.id).await;
            return Err(err);
        }

        let now = Utc::now();
        let runtime_metadata = json!({
            "imageName": inspect.image_name,
            "imageDigest": inspect.image_digest,
            "volumeName": volume_name,
            "agentPort": self.config.agent_port,
        });
        self.db
            .mark_workspace_warm(WorkspaceWarmUpdate {
                id: workspace.id,
                container_id: &container_id,
                image_name: Some(&inspect.image_name),
                image_digest: inspect.image_digest.as_deref(),
                runtime_metadata: Some(&runtime_metadata),
                last_active_at: now,
                idle_expires_at: now + self.config.warm_idle,
            })
            .await?;

        self.metrics.incr(metrics::WORKSPACES_OPENED_TOTAL);
        info!(workspace_id = %workspace.id, container_id = %container_id, "workspace warm");
        self.reload(workspace.id).await
    }

    async fn clone_repo_if_needed(
        &self,
        container_id: &str,
        project: &ProjectRecord,
    ) -> Result<(), CoreError> {
        let repo_dir = "/workspace/repo";
        let probe = self
            .driver
            .exec(container_id, &["test", "-d", "/workspace/repo/.git"], "/workspace")
            .await
            .map_err(|err| CoreError::SandboxFailure(err.into()))?;
        if probe.succeeded() {
            return Ok(());
        }

        let mkdir = self
            .driver
            .exec(container_id, &["mkdir", "-p", repo_dir], "/workspace")
            .await
            .map_err(|err| CoreError::SandboxFailure(err.into()))?;
        if !mkdir.succeeded() {
            return Err(CoreError::SandboxFailure(anyhow!(
                "creating {repo_dir} failed: {}",
                mkdir.stderr
            )));
        }

        let clone = self
            .driver
            .exec(
                container_id,
                &["git", "clone", &project.repo_url, "."],
                repo_dir,
            )
            .await
            .map_err(|err| CoreError::SandboxFailure(err.into()))?;
        if !clone.succeeded() {
            return Err(CoreError::CloneFailure(clone.stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Stops the workspace container and flips the row to `cold`, retaining
    /// volume and thread id. Idempotent: a second call is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self, workspace_id: Uuid) -> Result<(), CoreError> {
        let workspace = self
            .db
            .fetch_workspace(workspace_id)
            .await?
            .ok_or(CoreError::WorkspaceNotFound(workspace_id))?;

        if let Some(container_id) = workspace.container_id.as_deref() {
            match self.driver.stop_and_remove(container_id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(CoreError::SandboxFailure(err.into())),
            }
        }
        if workspace.state == WorkspaceState::Warm {
            self.db.mark_workspace_cold(workspace_id).await?;
            info!(workspace_id = %workspace_id, "workspace cold");
        }
        Ok(())
    }

    async fn reload(&self, workspace_id: Uuid) -> Result<WorkspaceRecord, CoreError> {
        self.db
            .fetch_workspace(workspace_id)
            .await?
            .ok_or(CoreError::WorkspaceNotFound(workspace_id))
    }

    async fn mark_error(&self, workspace_id: Uuid) {
        if let Err(err) = self.db.mark_workspace_error(workspace_id).await {
            warn!(workspace_id = %workspace_id, error = %err, "marking workspace error failed");
        }
    }

    async fn rollback_container(&self, container_id: &str) {
        if let Err(err) = self.driver.stop_and_remove(container_id).await {
            if !err.is_not_found() {
                warn!(container_id, error = %err, "container rollback failed");
            }
        }
    }

    /// Runs a driver call, retrying once when the failure looks transient.
    async fn retry_transient<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, SandboxError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SandboxError>>,
    {
        match call().await {
            Ok(value) => Ok(value),
            Err(err) if err.is_transient() => {
                warn!(operation = what, error = %err, "transient sandbox failure; retrying once");
                call().await
            }
            Err(err) => Err(err),
        }
    }
}
