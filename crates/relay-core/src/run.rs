//! Run lifecycle: quota gate, per-workspace serialization, agent dispatch,
//! canonical event emission, completion bookkeeping and evidence scheduling.
//!
//! Unary and streaming entry points share one execution path; the only
//! difference is whether the event sink carries a transport channel and
//! whether synthesized tokens are paced.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use relay_db::{Database, NewRun, RunCompletion, RunRecord, RunStatus, WorkspaceRecord, WorkspaceState};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::agent::{AgentClient, AgentEndpoint, AgentReply};
use crate::error::CoreError;
use crate::events::{split_tokens, EventSink, RunEvent, TerminalStatus};
use crate::evidence::EvidenceScheduler;
use crate::keyed_mutex::KeyedMutex;
use crate::metrics::{self, Metrics};
use crate::quota::QuotaChecker;
use crate::sandbox::SandboxDriver;
use crate::CoreConfig;

/// Result of a completed run, as returned to unary callers.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub final_text: String,
    pub diff: String,
}

pub struct RunService {
    db: Database,
    driver: Arc<dyn SandboxDriver>,
    agent: Arc<dyn AgentClient>,
    locks: KeyedMutex,
    quota: QuotaChecker,
    evidence: EvidenceScheduler,
    metrics: Metrics,
    config: Arc<CoreConfig>,
}

impl RunService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        driver: Arc<dyn SandboxDriver>,
        agent: Arc<dyn AgentClient>,
        quota: QuotaChecker,
        evidence: EvidenceScheduler,
        metrics: Metrics,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            db,
            driver,
            agent,
            locks: KeyedMutex::new(),
            quota,
            evidence,
            metrics,
            config,
        }
    }

    /// Unary entry point: events are logged but not streamed.
    #[instrument(skip(self, cancel, prompt))]
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        user_id: Uuid,
        project_id: Uuid,
        prompt: &str,
    ) -> Result<RunOutput, CoreError> {
        let mut sink = EventSink::buffered();
        self.execute(cancel, user_id, project_id, prompt, &mut sink, false)
            .await
    }

    /// Streaming entry point: events are pushed to `transport` as they are
    /// produced. Failures surface as a terminal `run-complete` event before
    /// the error is returned, so the transport always closes cleanly.
    #[instrument(skip(self, cancel, prompt, transport))]
    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        user_id: Uuid,
        project_id: Uuid,
        prompt: &str,
        transport: mpsc::Sender<RunEvent>,
    ) -> Result<RunOutput, CoreError> {
        let mut sink = EventSink::with_transport(transport);
        self.execute(cancel, user_id, project_id, prompt, &mut sink, true)
            .await
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        user_id: Uuid,
        project_id: Uuid,
        prompt: &str,
        sink: &mut EventSink,
        streaming: bool,
    ) -> Result<RunOutput, CoreError> {
        // The id is allocated before the quota gate so denied streaming
        // requests still emit a well-formed terminal event; no Run row exists
        // for them.
        let run_id = Uuid::new_v4();
        let result = self
            .execute_inner(cancel, run_id, user_id, project_id, prompt, sink, streaming)
            .await;

        if let Err(err) = &result {
            if streaming && !sink.has_terminal_event() {
                let status = match err {
                    CoreError::AgentTimeout(_) => TerminalStatus::Timeout,
                    _ => TerminalStatus::Failed,
                };
                sink.emit(RunEvent::run_complete(
                    run_id,
                    status,
                    Some(err.stream_code().to_string()),
                ))
                .await;
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_inner(
        &self,
        cancel: &CancellationToken,
        run_id: Uuid,
        user_id: Uuid,
        project_id: Uuid,
        prompt: &str,
        sink: &mut EventSink,
        streaming: bool,
    ) -> Result<RunOutput, CoreError> {
        if !self.quota.check(user_id).await? {
            return Err(CoreError::QuotaExceeded);
        }

        let workspace = self
            .db
            .fetch_workspace_for_project(user_id, project_id)
            .await?
            .filter(|ws| ws.state == WorkspaceState::Warm && ws.container_id.is_some())
            .ok_or(CoreError::NoWarmWorkspace(project_id))?;

        let _guard = self.locks.acquire(&workspace.id.to_string()).await;

        // Re-read under the lock; a reaper or eviction may have won the race.
        let workspace = self
            .db
            .fetch_workspace(workspace.id)
            .await?
            .filter(|ws| ws.state == WorkspaceState::Warm && ws.container_id.is_some())
            .ok_or(CoreError::NoWarmWorkspace(project_id))?;
        let container_id = workspace
            .container_id
            .clone()
            .ok_or(CoreError::NoWarmWorkspace(project_id))?;

        let started_at = Utc::now();
        let run = self
            .db
            .insert_run(NewRun {
                id: run_id,
                user_id,
                project_id,
                workspace_id: workspace.id,
                prompt,
                started_at,
                image_name: workspace.image_name.as_deref(),
                image_digest: workspace.image_digest.as_deref(),
                env_snapshot: workspace.runtime_metadata.as_ref(),
            })
            .await?;

        sink.emit(RunEvent::run_start(run_id)).await;

        let agent_result = self
            .invoke_agent(cancel, &container_id, prompt, run_id)
            .await;

        match agent_result {
            Ok(reply) => {
                self.complete_success(run, &workspace, &container_id, reply, sink, streaming)
                    .await
            }
            Err(err) => {
                self.complete_failure(&run, &container_id, &err, sink).await;
                Err(err)
            }
        }
    }

    async fn invoke_agent(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        prompt: &str,
        run_id: Uuid,
    ) -> Result<AgentReply, CoreError> {
        let inspect = self
            .driver
            .inspect(container_id)
            .await
            .map_err(|err| CoreError::SandboxFailure(err.into()))?;
        let endpoint = AgentEndpoint::from_inspect(&inspect, self.config.agent_port)
            .ok_or_else(|| {
                CoreError::SandboxFailure(anyhow!("agent port {} not reachable", self.config.agent_port))
            })?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Canceled),
            outcome = tokio::time::timeout(
                self.config.run_timeout,
                self.agent.execute(&endpoint, prompt, run_id),
            ) => match outcome {
                Err(_) => Err(CoreError::AgentTimeout(self.config.run_timeout)),
                Ok(Err(err)) => Err(CoreError::AgentFailure(err.to_string())),
                Ok(Ok(reply)) => Ok(reply),
            },
        }
    }

    async fn complete_success(
        &self,
        run: RunRecord,
        workspace: &WorkspaceRecord,
        container_id: &str,
        reply: AgentReply,
        sink: &mut EventSink,
        streaming: bool,
    ) -> Result<RunOutput, CoreError> {
        let run_id = run.id;

        for (sequence, delta) in split_tokens(&reply.final_text).into_iter().enumerate() {
            sink.emit(RunEvent::token(run_id, delta, sequence as u64)).await;
            if streaming {
                if let Some(delay) = self.config.stream_token_delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if !reply.diff.is_empty() {
            sink.emit(RunEvent::diff(run_id, reply.diff.clone())).await;
        }

        let evidence_path = format!("/workspace/evidence/{run_id}");
        let has_command_log = self
            .probe_file(container_id, &format!("{evidence_path}/command_log.jsonl"))
            .await;
        let has_outputs_manifest = self
            .probe_file(container_id, &format!("{evidence_path}/outputs.json"))
            .await;
        let env_snapshot = augment_snapshot(
            run.env_snapshot.clone(),
            &evidence_path,
            has_command_log,
            has_outputs_manifest,
        );

        let finished_at = Utc::now();
        let duration_ms = (finished_at - run.started_at).num_milliseconds().max(0) as u64;
        let finished = self
            .db
            .finish_run(RunCompletion {
                id: run_id,
                status: RunStatus::Succeeded,
                final_text: Some(&reply.final_text),
                diff: (!reply.diff.is_empty()).then_some(reply.diff.as_str()),
                test_output: None,
                error_message: None,
                finished_at,
                duration_ms,
                input_tokens: None,
                output_tokens: None,
                git_commit: reply.git_commit.as_deref(),
                env_snapshot: Some(&env_snapshot),
            })
            .await?;

        let now = Utc::now();
        self.db
            .touch_workspace_after_run(
                workspace.id,
                reply.thread_id.as_deref(),
                now,
                now + self.config.warm_idle,
            )
            .await?;

        sink.emit(RunEvent::run_complete(run_id, TerminalStatus::Succeeded, None))
            .await;

        // The event log must land in the sandbox before the bundle job is
        // scheduled; the builder copies it out of the container.
        self.flush_event_log(container_id, run_id, sink).await;
        if let Err(err) = self.evidence.schedule(&finished).await {
            warn!(run_id = %run_id, error = %err, "scheduling evidence bundle failed");
        }
        self.metrics
            .incr_labeled(metrics::RUNS_TOTAL, &[("status", "succeeded")]);

        Ok(RunOutput {
            run_id,
            final_text: reply.final_text,
            diff: reply.diff,
        })
    }

    async fn complete_failure(
        &self,
        run: &RunRecord,
        container_id: &str,
        err: &CoreError,
        sink: &mut EventSink,
    ) {
        let (status, event_status) = match err {
            CoreError::AgentTimeout(_) => (RunStatus::Timeout, TerminalStatus::Timeout),
            _ => (RunStatus::Failed, TerminalStatus::Failed),
        };
        let message = err.to_string();

        let finished_at = Utc::now();
        let duration_ms = (finished_at - run.started_at).num_milliseconds().max(0) as u64;
        if let Err(db_err) = self
            .db
            .finish_run(RunCompletion {
                id: run.id,
                status,
                final_text: None,
                diff: None,
                test_output: None,
                error_message: Some(&message),
                finished_at,
                duration_ms,
                input_tokens: None,
                output_tokens: None,
                git_commit: None,
                env_snapshot: None,
            })
            .await
        {
            warn!(run_id = %run.id, error = %db_err, "recording run failure failed");
        }

        sink.emit(RunEvent::run_complete(run.id, event_status, Some(message)))
            .await;

        // Failed runs stay auditable: the event log and bundle are still
        // produced.
        self.flush_event_log(container_id, run.id, sink).await;
        match self.db.fetch_run(run.id).await {
            Ok(Some(finished)) => {
                if let Err(err) = self.evidence.schedule(&finished).await {
                    warn!(run_id = %run.id, error = %err, "scheduling evidence bundle failed");
                }
            }
            Ok(None) => warn!(run_id = %run.id, "run row missing after failure update"),
            Err(err) => warn!(run_id = %run.id, error = %err, "reloading failed run failed"),
        }
        self.metrics
            .incr_labeled(metrics::RUNS_TOTAL, &[("status", status.as_str())]);
    }

    async fn flush_event_log(&self, container_id: &str, run_id: Uuid, sink: &EventSink) {
        let payload = match sink.to_jsonl() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "serializing event log failed");
                return;
            }
        };
        let path = format!("/workspace/evidence/{run_id}/events.jsonl");
        if let Err(err) = self
            .driver
            .put_file(container_id, &path, payload.as_bytes())
            .await
        {
            warn!(run_id = %run_id, error = %err, "writing event log into sandbox failed");
        }
    }

    async fn probe_file(&self, container_id: &str, path: &str) -> bool {
        match self
            .driver
            .exec(container_id, &["test", "-f", path], "/")
            .await
        {
            Ok(output) => output.succeeded(),
            Err(err) => {
                warn!(container_id, path, error = %err, "evidence probe failed");
                false
            }
        }
    }
}

fn augment_snapshot(
    snapshot: Option<Value>,
    evidence_path: &str,
    has_command_log: bool,
    has_outputs_manifest: bool,
) -> Value {
    let mut snapshot = match snapshot {
        Some(Value::Object(map)) => Value::Object(map),
        Some(other) => json!({ "runtime": other }),
        None => json!({}),
    };
    if let Some(map) = snapshot.as_object_mut() {
        map.insert("evidencePath".to_string(), json!(evidence_path));
        map.insert("hasCommandLog".to_string(), json!(has_command_log));
        map.insert(
            "hasOutputsManifest".to_string(),
            json!(has_outputs_manifest),
        );
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_augmentation_preserves_existing_keys() {
        let base = json!({ "imageName": "relay-workspace:latest" });
        let merged = augment_snapshot(Some(base), "/workspace/evidence/abc", true, false);
        assert_eq!(merged["imageName"], "relay-workspace:latest");
        assert_eq!(merged["evidencePath"], "/workspace/evidence/abc");
        assert_eq!(merged["hasCommandLog"], true);
        assert_eq!(merged["hasOutputsManifest"], false);
    }
}
