//! Evidence bundle assembly.
//!
//! Completed runs leave an evidence directory inside the sandbox
//! (`/workspace/evidence/<run_id>/`). The builder copies it out as a tar
//! stream, re-roots the contents into a canonical `<run_id>/` staging
//! directory regardless of the tar's internal shape, adds the host-side
//! metadata files, and zips everything to `<EVIDENCE_ROOT>/<run_id>.zip`.
//!
//! Scheduling is a durable queue: the pending `evidence_bundles` row is the
//! work item, so bundles survive a crash between run completion and build.
//! The worker drains pending rows when nudged and on a poll interval.

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use relay_db::{BundleStatus, Database, RunRecord};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::error::CoreError;
use crate::metrics::{self, Metrics};
use crate::sandbox::SandboxDriver;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Files the agent is expected to have produced inside the evidence
/// directory. Their absence is logged, not fatal.
const EXPECTED_SANDBOX_FILES: &[&str] = &["command_log.jsonl", "outputs.json", "events.jsonl"];

/// Handle used by the run service to enqueue bundle jobs.
#[derive(Clone)]
pub struct EvidenceScheduler {
    db: Database,
    notify: Arc<Notify>,
}

impl EvidenceScheduler {
    /// Upserts the pending row and nudges the worker. Idempotent per run.
    pub async fn schedule(&self, run: &RunRecord) -> Result<()> {
        self.db.create_pending_bundle(run).await?;
        self.notify.notify_one();
        Ok(())
    }
}

pub struct EvidenceBuilder {
    db: Database,
    driver: Arc<dyn SandboxDriver>,
    evidence_root: PathBuf,
    metrics: Metrics,
}

impl EvidenceBuilder {
    pub fn new(
        db: Database,
        driver: Arc<dyn SandboxDriver>,
        evidence_root: PathBuf,
        metrics: Metrics,
    ) -> Self {
        Self {
            db,
            driver,
            evidence_root,
            metrics,
        }
    }

    /// Builds the bundle for one run, updating the bundle row to `ready` or
    /// `error`. Already-ready bundles short-circuit.
    pub async fn build(&self, run_id: Uuid) -> Result<PathBuf, CoreError> {
        let run = self
            .db
            .fetch_run(run_id)
            .await?
            .ok_or(CoreError::RunNotFound(run_id))?;
        let bundle = self.db.create_pending_bundle(&run).await?;
        if bundle.status == BundleStatus::Ready {
            if let Some(path) = bundle.bundle_path {
                return Ok(PathBuf::from(path));
            }
        }

        let workspace = match self.db.fetch_workspace(run.workspace_id).await? {
            Some(workspace) => workspace,
            None => {
                return Err(self
                    .fail(run_id, "workspace row missing for run".to_string())
                    .await);
            }
        };
        let Some(container_id) = workspace.container_id.clone() else {
            return Err(self
                .fail(run_id, "workspace container not available".to_string())
                .await);
        };

        let archive = match self
            .driver
            .get_archive(&container_id, &format!("/workspace/evidence/{run_id}/"))
            .await
        {
            Ok(archive) => archive,
            Err(err) => {
                return Err(self
                    .fail(run_id, format!("copying evidence out of sandbox: {err}"))
                    .await);
            }
        };

        let metadata = json!({
            "run": run,
            "workspace": workspace,
            "generated_at": Utc::now(),
        });
        let env_snapshot = json!({
            "runSnapshot": run.env_snapshot,
            "workspaceMetadata": workspace.runtime_metadata,
        });
        let input = StageInput {
            run_id,
            archive,
            evidence_root: self.evidence_root.clone(),
            metadata,
            env_snapshot,
            diff: run.diff.clone(),
        };

        let staged = tokio::task::spawn_blocking(move || stage_and_zip(input)).await;
        match staged {
            Ok(Ok(bundle_path)) => {
                self.db
                    .mark_bundle_ready(run_id, &bundle_path.to_string_lossy())
                    .await?;
                self.metrics
                    .incr_labeled(metrics::EVIDENCE_BUNDLES_TOTAL, &[("status", "ready")]);
                info!(run_id = %run_id, path = %bundle_path.display(), "evidence bundle ready");
                Ok(bundle_path)
            }
            Ok(Err(err)) => Err(self.fail(run_id, err.to_string()).await),
            Err(join_err) => Err(self.fail(run_id, format!("bundle task panicked: {join_err}")).await),
        }
    }

    async fn fail(&self, run_id: Uuid, message: String) -> CoreError {
        if let Err(err) = self.db.mark_bundle_error(run_id, &message).await {
            warn!(run_id = %run_id, error = %err, "marking bundle error failed");
        }
        self.metrics
            .incr_labeled(metrics::EVIDENCE_BUNDLES_TOTAL, &[("status", "error")]);
        CoreError::BundleFailure(message)
    }
}

struct StageInput {
    run_id: Uuid,
    archive: Bytes,
    evidence_root: PathBuf,
    metadata: serde_json::Value,
    env_snapshot: serde_json::Value,
    diff: Option<String>,
}

/// Blocking stage: extract, canonicalize, add metadata files, zip. The temp
/// directory under `<EVIDENCE_ROOT>/temp/<run_id>/` is removed on every exit
/// path.
fn stage_and_zip(input: StageInput) -> Result<PathBuf> {
    let temp_root = input.evidence_root.join("temp").join(input.run_id.to_string());
    let result = stage_and_zip_inner(&input, &temp_root);
    if let Err(err) = fs::remove_dir_all(&temp_root) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %temp_root.display(), error = %err, "removing staging directory failed");
        }
    }
    result
}

fn stage_and_zip_inner(input: &StageInput, temp_root: &Path) -> Result<PathBuf> {
    let extract_dir = temp_root.join("extract");
    fs::create_dir_all(&extract_dir).context("creating extraction directory")?;
    tar::Archive::new(Cursor::new(&input.archive))
        .unpack(&extract_dir)
        .context("unpacking evidence archive")?;

    // Canonical layout: one folder named after the run id, whatever shape
    // the tar had.
    let stage_dir = temp_root.join(input.run_id.to_string());
    fs::create_dir_all(&stage_dir).context("creating staging directory")?;
    let source_root = locate_archive_root(&extract_dir)?;
    copy_tree(&source_root, &stage_dir)?;

    for expected in EXPECTED_SANDBOX_FILES {
        if !stage_dir.join(expected).is_file() {
            warn!(run_id = %input.run_id, file = expected, "expected evidence file missing");
        }
    }

    fs::write(
        stage_dir.join("metadata.json"),
        serde_json::to_vec_pretty(&input.metadata)?,
    )
    .context("writing metadata.json")?;
    fs::write(
        stage_dir.join("env_snapshot.json"),
        serde_json::to_vec_pretty(&input.env_snapshot)?,
    )
    .context("writing env_snapshot.json")?;
    if let Some(diff) = input.diff.as_deref() {
        if !diff.is_empty() {
            fs::write(stage_dir.join("diff.patch"), diff).context("writing diff.patch")?;
        }
    }

    let zip_path = input.evidence_root.join(format!("{}.zip", input.run_id));
    write_zip(&stage_dir, &zip_path, &input.run_id.to_string())?;
    Ok(zip_path)
}

/// The tar usually contains a single top-level directory (the archived
/// folder itself); bundle its contents, not the wrapper.
fn locate_archive_root(extract_dir: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(extract_dir)
        .context("reading extraction directory")?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        return Ok(entries.remove(0).path());
    }
    Ok(extract_dir.to_path_buf())
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("computing relative staging path")?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

/// Zips `stage_dir` so every entry sits under a top-level `<run_id>/`
/// folder.
fn write_zip(stage_dir: &Path, zip_path: &Path, root_name: &str) -> Result<()> {
    if let Some(parent) = zip_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(zip_path)
        .with_context(|| format!("creating {}", zip_path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(stage_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(stage_dir)?;
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        writer.start_file(format!("{root_name}/{name}"), options)?;
        let mut source = File::open(entry.path())?;
        io::copy(&mut source, &mut writer)?;
    }

    writer.finish().context("finalizing zip archive")?;
    Ok(())
}

/// Polling worker draining pending bundle rows.
pub struct EvidenceWorker {
    builder: Arc<EvidenceBuilder>,
    db: Database,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl EvidenceWorker {
    /// Builds the worker and its scheduler handle.
    pub fn channel(
        db: Database,
        builder: Arc<EvidenceBuilder>,
        poll_interval: Duration,
    ) -> (Self, EvidenceScheduler) {
        let notify = Arc::new(Notify::new());
        let scheduler = EvidenceScheduler {
            db: db.clone(),
            notify: notify.clone(),
        };
        (
            Self {
                builder,
                db,
                notify,
                poll_interval,
            },
            scheduler,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                if let Err(err) = self.drain().await {
                    warn!(error = %err, "evidence worker drain failed");
                }
            }
        })
    }

    /// Processes every currently-pending bundle once. Build failures flip
    /// the row to `error`, so a bad run cannot wedge the queue.
    pub async fn drain(&self) -> Result<usize> {
        let pending = self.db.list_pending_bundles(16).await?;
        let drained = pending.len();
        for bundle in pending {
            if let Err(err) = self.builder.build(bundle.run_id).await {
                warn!(run_id = %bundle.run_id, error = %err, "evidence bundle build failed");
            }
        }
        Ok(drained)
    }
}

/// Convenience for tests and tools: true when a path looks like a bundle
/// produced by this builder.
pub fn is_bundle_path(path: &Path) -> bool {
    path.extension().map(|ext| ext == "zip").unwrap_or(false)
        && path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| Uuid::parse_str(stem).is_ok())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_path_detection() {
        let id = Uuid::new_v4();
        assert!(is_bundle_path(Path::new(&format!("/data/{id}.zip"))));
        assert!(!is_bundle_path(Path::new("/data/not-a-uuid.zip")));
        assert!(!is_bundle_path(Path::new(&format!("/data/{id}.tar"))));
    }

    #[test]
    fn locate_root_unwraps_single_directory() {
        let temp = tempfile::tempdir().unwrap();
        let inner = temp.path().join("abc");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join("events.jsonl"), b"{}\n").unwrap();
        assert_eq!(locate_archive_root(temp.path()).unwrap(), inner);
    }

    #[test]
    fn locate_root_keeps_flat_layout() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("events.jsonl"), b"{}\n").unwrap();
        fs::write(temp.path().join("outputs.json"), b"{}").unwrap();
        assert_eq!(locate_archive_root(temp.path()).unwrap(), temp.path());
    }
}
