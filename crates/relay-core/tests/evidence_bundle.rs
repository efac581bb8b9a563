mod common;

use std::io::Read;

use relay_core::testing::MockAgent;
use relay_core::CoreError;
use relay_db::{BundleStatus, WorkspaceState};
use tokio_util::sync::CancellationToken;

use common::{harness, harness_with, seed_project, seed_user};

async fn run_once(h: &common::Harness, prompt: &str) -> uuid::Uuid {
    let user = seed_user(&h.db).await;
    let project = seed_project(&h.db, &user, "p1").await;
    h.workspaces.open(user.id, project.id).await.unwrap();
    h.agent.push_reply(MockAgent::reply(
        "created hello.txt",
        "diff --git a/hello.txt b/hello.txt\n+hello\n",
        "thread-1",
    ));
    let cancel = CancellationToken::new();
    h.runs
        .run(&cancel, user.id, project.id, prompt)
        .await
        .unwrap()
        .run_id
}

#[tokio::test]
async fn bundle_contains_canonical_layout() {
    let h = harness().await;
    let run_id = run_once(&h, "create hello.txt").await;

    h.evidence_worker.drain().await.unwrap();
    let bundle = h.db.fetch_bundle_for_run(run_id).await.unwrap().unwrap();
    assert_eq!(bundle.status, BundleStatus::Ready);
    let bundle_path = bundle.bundle_path.unwrap();

    let file = std::fs::File::open(&bundle_path).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let names: Vec<String> = (0..zip.len())
        .map(|index| zip.by_index(index).unwrap().name().to_string())
        .collect();
    for expected in [
        "metadata.json",
        "env_snapshot.json",
        "events.jsonl",
        "command_log.jsonl",
        "outputs.json",
        "diff.patch",
    ] {
        let entry = format!("{run_id}/{expected}");
        assert!(names.contains(&entry), "missing zip entry {entry}; have {names:?}");
    }

    let mut events = String::new();
    zip.by_name(&format!("{run_id}/events.jsonl"))
        .unwrap()
        .read_to_string(&mut events)
        .unwrap();
    let first: serde_json::Value = serde_json::from_str(events.lines().next().unwrap()).unwrap();
    assert_eq!(first["type"], "run-start");
    assert_eq!(first["runId"], run_id.to_string());
    assert!(first["ts"].is_string());
    let last: serde_json::Value = serde_json::from_str(events.lines().last().unwrap()).unwrap();
    assert_eq!(last["type"], "run-complete");

    let mut metadata = String::new();
    zip.by_name(&format!("{run_id}/metadata.json"))
        .unwrap()
        .read_to_string(&mut metadata)
        .unwrap();
    let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
    assert_eq!(metadata["run"]["id"], run_id.to_string());
    assert!(metadata["workspace"]["id"].is_string());
    assert!(metadata["generated_at"].is_string());

    // Temp staging is cleaned on success.
    assert!(!h.config.evidence_root.join("temp").join(run_id.to_string()).exists());
}

#[tokio::test]
async fn cold_workspace_fails_the_bundle() {
    let h = harness().await;
    let run_id = run_once(&h, "create hello.txt").await;

    // Cool the workspace before the builder gets to it.
    let run = h.db.fetch_run(run_id).await.unwrap().unwrap();
    let workspace = h.db.fetch_workspace(run.workspace_id).await.unwrap().unwrap();
    h.workspaces.stop(workspace.id).await.unwrap();

    h.evidence_worker.drain().await.unwrap();
    let bundle = h.db.fetch_bundle_for_run(run_id).await.unwrap().unwrap();
    assert_eq!(bundle.status, BundleStatus::Error);
    assert_eq!(
        bundle.error_message.as_deref(),
        Some("workspace container not available")
    );

    // The run itself is untouched by bundle failure.
    let run = h.db.fetch_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, relay_db::RunStatus::Succeeded);
}

#[tokio::test]
async fn failed_runs_are_still_bundled() {
    let h = harness().await;
    let user = seed_user(&h.db).await;
    let project = seed_project(&h.db, &user, "p1").await;
    h.workspaces.open(user.id, project.id).await.unwrap();

    h.agent.fail_next();
    let cancel = CancellationToken::new();
    let err = h
        .runs
        .run(&cancel, user.id, project.id, "prompt")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AgentFailure(_)));

    let runs = h.db.list_recent_runs(project.id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run_id = runs[0].id;

    h.evidence_worker.drain().await.unwrap();
    let bundle = h.db.fetch_bundle_for_run(run_id).await.unwrap().unwrap();
    assert_eq!(bundle.status, BundleStatus::Ready);

    let file = std::fs::File::open(bundle.bundle_path.unwrap()).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let mut events = String::new();
    zip.by_name(&format!("{run_id}/events.jsonl"))
        .unwrap()
        .read_to_string(&mut events)
        .unwrap();
    let last: serde_json::Value = serde_json::from_str(events.lines().last().unwrap()).unwrap();
    assert_eq!(last["type"], "run-complete");
    assert_eq!(last["status"], "failed");
}

#[tokio::test]
async fn retention_sweeps_are_idempotent() {
    let h = harness_with(|config| {
        config.workspace_cold_ttl = chrono::Duration::zero();
        config.evidence_ttl = chrono::Duration::zero();
    })
    .await;
    let run_id = run_once(&h, "create hello.txt").await;
    h.evidence_worker.drain().await.unwrap();

    let bundle = h.db.fetch_bundle_for_run(run_id).await.unwrap().unwrap();
    let bundle_path = bundle.bundle_path.clone().unwrap();
    assert!(std::path::Path::new(&bundle_path).is_file());

    let run = h.db.fetch_run(run_id).await.unwrap().unwrap();
    h.workspaces.stop(run.workspace_id).await.unwrap();

    let summary = h.retention.sweep_all().await.unwrap();
    assert_eq!(summary.workspaces_deleted, 1);
    assert_eq!(summary.bundles_deleted, 1);

    let workspace = h.db.fetch_workspace(run.workspace_id).await.unwrap().unwrap();
    assert_eq!(workspace.state, WorkspaceState::Deleted);
    assert!(workspace.volume_name.is_none());
    assert!(!std::path::Path::new(&bundle_path).exists());

    let bundle = h.db.fetch_bundle_for_run(run_id).await.unwrap().unwrap();
    assert_eq!(bundle.status, BundleStatus::Deleted);
    assert!(bundle.bundle_path.is_none());

    // Second sweep finds nothing new.
    let summary = h.retention.sweep_all().await.unwrap();
    assert_eq!(summary.workspaces_deleted, 0);
    assert_eq!(summary.bundles_deleted, 0);

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.get("workspace_gc_total"), Some(&1));
    assert_eq!(snapshot.get("evidence_gc_total"), Some(&1));
}
