use std::sync::Arc;
use std::time::Duration;

use relay_core::agent::AgentClient;
use relay_core::evidence::{EvidenceBuilder, EvidenceWorker};
use relay_core::metrics::Metrics;
use relay_core::quota::QuotaChecker;
use relay_core::reaper::IdleReaper;
use relay_core::retention::RetentionCollector;
use relay_core::run::RunService;
use relay_core::sandbox::SandboxDriver;
use relay_core::testing::{InMemorySandbox, MockAgent};
use relay_core::workspace::WorkspaceService;
use relay_core::CoreConfig;
use relay_db::{Database, NewProject, NewUser, ProjectRecord, UserRecord};

pub struct Harness {
    pub db: Database,
    pub sandbox: InMemorySandbox,
    pub agent: MockAgent,
    pub workspaces: WorkspaceService,
    pub runs: RunService,
    pub reaper: IdleReaper,
    pub retention: RetentionCollector,
    pub evidence_worker: EvidenceWorker,
    pub metrics: Metrics,
    pub config: Arc<CoreConfig>,
    _evidence_dir: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut CoreConfig)) -> Harness {
    let db = Database::connect("sqlite::memory:").await.expect("db");
    let evidence_dir = tempfile::tempdir().expect("tempdir");
    let mut config = CoreConfig {
        evidence_root: evidence_dir.path().to_path_buf(),
        run_timeout: Duration::from_secs(5),
        stream_token_delay: None,
        ..CoreConfig::default()
    };
    tweak(&mut config);
    let config = Arc::new(config);

    let metrics = Metrics::new();
    let sandbox = InMemorySandbox::new();
    let agent = MockAgent::new().with_sandbox(sandbox.clone());
    let driver: Arc<dyn SandboxDriver> = Arc::new(sandbox.clone());
    let agent_client: Arc<dyn AgentClient> = Arc::new(agent.clone());

    let workspaces = WorkspaceService::new(
        db.clone(),
        driver.clone(),
        config.clone(),
        metrics.clone(),
    );
    let builder = Arc::new(EvidenceBuilder::new(
        db.clone(),
        driver.clone(),
        config.evidence_root.clone(),
        metrics.clone(),
    ));
    let (evidence_worker, scheduler) =
        EvidenceWorker::channel(db.clone(), builder, Duration::from_secs(3600));
    let quota = QuotaChecker::new(db.clone(), config.max_runs_per_day);
    let runs = RunService::new(
        db.clone(),
        driver.clone(),
        agent_client,
        quota,
        scheduler,
        metrics.clone(),
        config.clone(),
    );
    let reaper = IdleReaper::new(db.clone(), driver.clone(), metrics.clone());
    let retention = RetentionCollector::new(db.clone(), driver, metrics.clone(), &config);

    Harness {
        db,
        sandbox,
        agent,
        workspaces,
        runs,
        reaper,
        retention,
        evidence_worker,
        metrics,
        config,
        _evidence_dir: evidence_dir,
    }
}

pub async fn seed_user(db: &Database) -> UserRecord {
    db.create_user(NewUser {
        email: Some("dev@example.com"),
        display_name: Some("Dev"),
        is_admin: false,
    })
    .await
    .expect("user")
}

pub async fn seed_project(db: &Database, user: &UserRecord, name: &str) -> ProjectRecord {
    db.create_project(NewProject {
        user_id: user.id,
        name,
        repo_url: "https://github.com/octocat/Hello-World.git",
    })
    .await
    .expect("project")
}
