use std::{collections::BTreeMap, convert::Infallible, env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use relay_core::agent::{AgentClient, HttpAgentClient};
use relay_core::evidence::{EvidenceBuilder, EvidenceWorker};
use relay_core::metrics::Metrics;
use relay_core::quota::QuotaChecker;
use relay_core::reaper::IdleReaper;
use relay_core::retention::RetentionCollector;
use relay_core::run::RunService;
use relay_core::sandbox::{DockerDriver, SandboxDriver};
use relay_core::workspace::WorkspaceService;
use relay_core::{CoreConfig, CoreError};
use relay_db::{Database, ProjectRecord, RunRecord, UserRecord, WorkerRegistry};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use utoipa::{Modify, OpenApi, ToSchema};
use uuid::Uuid;

use crate::auth::{AuthError, AuthService};
use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.database_url)
        .await
        .context("failed to open database")?;
    let driver: Arc<dyn SandboxDriver> =
        Arc::new(DockerDriver::connect().context("connecting to the docker daemon")?);
    let agent: Arc<dyn AgentClient> =
        Arc::new(HttpAgentClient::new().context("building agent HTTP client")?);

    let core_config = Arc::new(config.core.clone());
    let services = build_services(db, driver, agent, core_config);

    let workers = WorkerRegistry::default();
    workers.register(services.reaper.spawn());
    workers.register(services.state.retention.clone().spawn());
    workers.register(services.evidence_worker.spawn());

    let app = build_router(services.state.clone())
        .layer(rate_limit_layer(config.rate_limit.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "relay-daemon listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    drop(workers);
    Ok(())
}

pub(crate) struct Services {
    pub state: Arc<AppState>,
    pub evidence_worker: EvidenceWorker,
    pub reaper: Arc<IdleReaper>,
}

pub(crate) fn build_services(
    db: Database,
    driver: Arc<dyn SandboxDriver>,
    agent: Arc<dyn AgentClient>,
    config: Arc<CoreConfig>,
) -> Services {
    let metrics = Metrics::new();
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
    let (evidence_worker, scheduler) = EvidenceWorker::channel(
        db.clone(),
        builder,
        relay_core::evidence::DEFAULT_POLL_INTERVAL,
    );
    let quota = QuotaChecker::new(db.clone(), config.max_runs_per_day);
    let runs = Arc::new(RunService::new(
        db.clone(),
        driver.clone(),
        agent,
        quota,
        scheduler,
        metrics.clone(),
        config.clone(),
    ));
    let reaper = Arc::new(IdleReaper::new(db.clone(), driver.clone(), metrics.clone()));
    let retention = Arc::new(RetentionCollector::new(
        db.clone(),
        driver,
        metrics.clone(),
        &config,
    ));
    let auth = AuthService::new(db.clone());

    Services {
        state: Arc::new(AppState {
            db,
            auth,
            workspaces,
            runs,
            retention,
            metrics,
        }),
        evidence_worker,
        reaper,
    }
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/:id/open", post(open_project))
        .route("/projects/:id/message", post(post_message))
        .route("/projects/:id/message/stream", post(post_message_stream))
        .route("/projects/:id/runs", get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/evidence", get(get_run_evidence))
        .route("/metrics", get(get_metrics))
        .route("/ops/gc", post(trigger_gc))
        .with_state(state)
}

pub(crate) struct AppState {
    db: Database,
    auth: AuthService,
    workspaces: WorkspaceService,
    runs: Arc<RunService>,
    retention: Arc<RetentionCollector>,
    metrics: Metrics,
}

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    listen_addr: SocketAddr,
    database_url: String,
    rate_limit: RateLimitConfig,
    core: CoreConfig,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("RELAY_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid RELAY_API_ADDR")?;

        let database_url = env::var("POSTGRES_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("POSTGRES_URL or DATABASE_URL must be configured")?;

        let mut core = CoreConfig::default();
        if let Ok(image) = env::var("WORKSPACE_IMAGE") {
            if !image.trim().is_empty() {
                core.workspace_image = image.trim().to_string();
            }
        }
        if let Some(minutes) = u64_env("WARM_IDLE_MINUTES") {
            core.warm_idle = chrono::Duration::minutes(minutes as i64);
        }
        if let Some(limit) = u64_env("MAX_RUNS_PER_DAY") {
            core.max_runs_per_day = limit as u32;
        }
        if let Some(days) = u64_env("WORKSPACE_COLD_TTL_DAYS") {
            core.workspace_cold_ttl = chrono::Duration::days(days as i64);
        }
        if let Some(days) = u64_env("EVIDENCE_TTL_DAYS") {
            core.evidence_ttl = chrono::Duration::days(days as i64);
        }
        if let Ok(root) = env::var("EVIDENCE_ROOT") {
            if !root.trim().is_empty() {
                core.evidence_root = PathBuf::from(root.trim());
            }
        }
        if let Some(seconds) = u64_env("RELAY_RUN_TIMEOUT_SECONDS") {
            core.run_timeout = Duration::from_secs(seconds);
        }
        if let Some(port) = u64_env("RELAY_AGENT_PORT") {
            core.agent_port = port as u16;
        }
        core.openai_api_key = env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty());
        core.force_mock_codex = env::var("FORCE_MOCK_CODEX").ok().filter(|v| !v.is_empty());

        let mut rate_limit = RateLimitConfig::default();
        if let Some(per_minute) = u64_env("RELAY_RATE_LIMIT_PER_MINUTE") {
            rate_limit.requests_per_window = per_minute;
        }

        Ok(Self {
            listen_addr,
            database_url,
            rate_limit,
            core,
        })
    }
}

fn u64_env(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

// ----- handlers --------------------------------------------------------

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

#[utoipa::path(
    get,
    path = "/projects",
    responses(
        (status = 200, description = "Projects of the calling user", body = ProjectsResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_projects(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ProjectsResponse>, ApiError> {
    let user = authorize(&state, &headers).await?;
    let projects = state
        .db
        .list_projects(user.id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(ProjectsResponse {
        projects: projects.into_iter().map(ProjectResponse::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/projects",
    request_body = CreateProjectBody,
    responses(
        (status = 200, description = "Project registered", body = CreateProjectResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateProjectBody>,
) -> Result<Json<CreateProjectResponse>, ApiError> {
    let user = authorize(&state, &headers).await?;

    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("project name cannot be empty"));
    }
    let repo_url = payload.repo_url.trim();
    if repo_url.is_empty() {
        return Err(ApiError::bad_request("repoUrl cannot be empty"));
    }

    let project = state
        .db
        .create_project(relay_db::NewProject {
            user_id: user.id,
            name,
            repo_url,
        })
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(CreateProjectResponse {
        project_id: project.id,
    }))
}

#[utoipa::path(
    post,
    path = "/projects/{id}/open",
    params(("id" = Uuid, Path, description = "Project identifier")),
    responses(
        (status = 200, description = "Workspace warm", body = OpenResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Project not visible to caller", body = ErrorBody),
        (status = 409, description = "Sandbox driver failure", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn open_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> Result<Json<OpenResponse>, ApiError> {
    let user = authorize(&state, &headers).await?;
    let workspace = state
        .workspaces
        .open(user.id, project_id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(OpenResponse {
        workspace_id: workspace.id,
        state: workspace.state.as_str().to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/projects/{id}/message",
    params(("id" = Uuid, Path, description = "Project identifier")),
    request_body = MessageBody,
    responses(
        (status = 200, description = "Run completed", body = MessageResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 409, description = "Workspace not warm", body = ErrorBody),
        (status = 429, description = "Daily run quota exceeded", body = ErrorBody),
        (status = 500, description = "Run failed", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(payload): Json<MessageBody>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = authorize(&state, &headers).await?;
    let text = payload.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::bad_request("text cannot be empty"));
    }

    // The run is spawned so client disconnect cancels it via the drop guard
    // instead of tearing the future down mid-transaction.
    let cancel = CancellationToken::new();
    let _disconnect_guard = cancel.clone().drop_guard();
    let runs = state.runs.clone();
    let user_id = user.id;
    let handle =
        tokio::spawn(async move { runs.run(&cancel, user_id, project_id, &text).await });

    let output = handle
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)?;
    Ok(Json(MessageResponse {
        run_id: output.run_id,
        final_text: output.final_text,
        diff: output.diff,
    }))
}

#[utoipa::path(
    post,
    path = "/projects/{id}/message/stream",
    params(("id" = Uuid, Path, description = "Project identifier")),
    request_body = MessageBody,
    responses(
        (status = 200, description = "SSE event stream"),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn post_message_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(payload): Json<MessageBody>,
) -> Result<Response, ApiError> {
    let user = authorize(&state, &headers).await?;
    let text = payload.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::bad_request("text cannot be empty"));
    }

    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let runs = state.runs.clone();
    let user_id = user.id;
    // No disconnect guard here: a streaming run finishes its event log and
    // row updates even when the client goes away; the sink just stops
    // writing to the transport.
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        if let Err(err) = runs.stream(&cancel, user_id, project_id, &text, tx).await {
            debug!(error = %err, "streaming run ended with error");
        }
    });

    let stream = sse_event_stream(rx);
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        axum::http::HeaderValue::from_static("keep-alive"),
    );
    Ok(response)
}

fn sse_event_stream(
    rx: tokio::sync::mpsc::Receiver<relay_core::events::RunEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    ReceiverStream::new(rx).map(|event| {
        let kind = event.payload.kind();
        match Event::default().event(kind).json_data(&event) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                warn!(error = %err, "serializing SSE event failed");
                Ok(Event::default().event(kind).data("{}"))
            }
        }
    })
}

#[utoipa::path(
    get,
    path = "/projects/{id}/runs",
    params(("id" = Uuid, Path, description = "Project identifier")),
    responses(
        (status = 200, description = "Recent runs, newest first", body = RunsResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Project not visible to caller", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
) -> Result<Json<RunsResponse>, ApiError> {
    let user = authorize(&state, &headers).await?;
    let project = state
        .db
        .fetch_project(project_id)
        .await
        .map_err(ApiError::internal)?
        .filter(|project| project.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("project not found"))?;

    let runs = state
        .db
        .list_recent_runs(project.id, 50)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(RunsResponse {
        runs: runs.into_iter().map(RunSummaryResponse::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/runs/{id}",
    params(("id" = Uuid, Path, description = "Run identifier")),
    responses(
        (status = 200, description = "Full run row", body = RunDetailResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Run not visible to caller", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDetailResponse>, ApiError> {
    let user = authorize(&state, &headers).await?;
    let run = state
        .db
        .fetch_run(run_id)
        .await
        .map_err(ApiError::internal)?
        .filter(|run| run.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("run not found"))?;
    Ok(Json(RunDetailResponse {
        run: RunResponse::from(run),
    }))
}

#[utoipa::path(
    get,
    path = "/runs/{id}/evidence",
    params(("id" = Uuid, Path, description = "Run identifier")),
    responses(
        (status = 200, description = "Evidence bundle zip", content_type = "application/zip"),
        (status = 202, description = "Bundle still pending", body = BundleStatusResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Run or bundle not visible to caller", body = ErrorBody),
        (status = 500, description = "Bundle assembly failed", body = BundleStatusResponse)
    ),
    security(("bearerAuth" = []))
)]
async fn get_run_evidence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let user = authorize(&state, &headers).await?;
    let run = state
        .db
        .fetch_run(run_id)
        .await
        .map_err(ApiError::internal)?
        .filter(|run| run.user_id == user.id)
        .ok_or_else(|| ApiError::not_found("run not found"))?;

    let bundle = state
        .db
        .fetch_bundle_for_run(run.id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("no evidence bundle for run"))?;

    match bundle.status {
        relay_db::BundleStatus::Pending => Ok((
            StatusCode::ACCEPTED,
            Json(BundleStatusResponse {
                status: "pending".to_string(),
                message: None,
            }),
        )
            .into_response()),
        relay_db::BundleStatus::Error => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(BundleStatusResponse {
                status: "error".to_string(),
                message: bundle.error_message,
            }),
        )
            .into_response()),
        relay_db::BundleStatus::Deleted => Err(ApiError::not_found("evidence bundle deleted")),
        relay_db::BundleStatus::Ready => {
            let bundle_path = bundle
                .bundle_path
                .ok_or_else(|| ApiError::internal("ready bundle has no path"))?;
            let file = tokio::fs::File::open(&bundle_path).await.map_err(|err| {
                error!(run_id = %run.id, path = bundle_path, error = %err, "bundle file missing");
                ApiError::internal("bundle file unavailable")
            })?;
            let body = Body::from_stream(ReaderStream::new(file));
            Response::builder()
                .header(header::CONTENT_TYPE, "application/zip")
                .header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}.zip\"", run.id),
                )
                .body(body)
                .map_err(ApiError::internal)
        }
    }
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Counter snapshot keyed by name and labels"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, u64>>, ApiError> {
    authorize(&state, &headers).await?;
    Ok(Json(state.metrics.snapshot()))
}

#[utoipa::path(
    post,
    path = "/ops/gc",
    responses(
        (status = 200, description = "Both retention sweeps executed", body = GcResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 403, description = "Admin scope required", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn trigger_gc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<GcResponse>, ApiError> {
    let user = authorize(&state, &headers).await?;
    if !user.is_admin {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "admin scope required for retention sweeps",
        ));
    }
    let summary = state
        .retention
        .sweep_all()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(GcResponse {
        workspaces_deleted: summary.workspaces_deleted,
        bundles_deleted: summary.bundles_deleted,
    }))
}

// ----- auth helpers ----------------------------------------------------

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<UserRecord, ApiError> {
    let token = require_bearer(headers)?;
    state.auth.resolve(token).await.map_err(ApiError::from)
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing Authorization bearer token"))?;
    let header_value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthorized("Authorization header must be a Bearer token"))
}

// ----- response types --------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CreateProjectBody {
    name: String,
    repo_url: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CreateProjectResponse {
    project_id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    id: Uuid,
    name: String,
    repo_url: String,
    created_at: String,
}

impl From<ProjectRecord> for ProjectResponse {
    fn from(record: ProjectRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            repo_url: record.repo_url,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ProjectsResponse {
    projects: Vec<ProjectResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct OpenResponse {
    workspace_id: Uuid,
    state: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct MessageBody {
    text: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    run_id: Uuid,
    final_text: String,
    diff: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct RunSummaryResponse {
    id: Uuid,
    status: String,
    prompt: String,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
}

impl From<RunRecord> for RunSummaryResponse {
    fn from(record: RunRecord) -> Self {
        Self {
            id: record.id,
            status: record.status.as_str().to_string(),
            prompt: record.prompt,
            started_at: record.started_at.to_rfc3339(),
            finished_at: record.finished_at.map(|ts| ts.to_rfc3339()),
            duration_ms: record.duration_ms,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct RunsResponse {
    runs: Vec<RunSummaryResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    id: Uuid,
    user_id: Uuid,
    project_id: Uuid,
    workspace_id: Uuid,
    status: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    final_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    git_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env_snapshot: Option<serde_json::Value>,
}

impl From<RunRecord> for RunResponse {
    fn from(record: RunRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            project_id: record.project_id,
            workspace_id: record.workspace_id,
            status: record.status.as_str().to_string(),
            prompt: record.prompt,
            final_text: record.final_text,
            diff: record.diff,
            test_output: record.test_output,
            error_message: record.error_message,
            started_at: record.started_at.to_rfc3339(),
            finished_at: record.finished_at.map(|ts| ts.to_rfc3339()),
            duration_ms: record.duration_ms,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            git_commit: record.git_commit,
            image_name: record.image_name,
            image_digest: record.image_digest,
            env_snapshot: record.env_snapshot,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct RunDetailResponse {
    run: RunResponse,
}

#[derive(Debug, Serialize, ToSchema)]
struct BundleStatusResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct GcResponse {
    workspaces_deleted: usize,
    bundles_deleted: usize,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

// ----- error mapping ---------------------------------------------------

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::ProjectNotFound(_)
            | CoreError::WorkspaceNotFound(_)
            | CoreError::RunNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            CoreError::NoWarmWorkspace(_) => StatusCode::CONFLICT,
            CoreError::SandboxFailure(_) | CoreError::CloneFailure(_) => StatusCode::CONFLICT,
            CoreError::AgentTimeout(_)
            | CoreError::AgentFailure(_)
            | CoreError::BundleFailure(_)
            | CoreError::Canceled
            | CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken => ApiError::unauthorized("invalid API key"),
            AuthError::Internal(message) => ApiError::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityRequirement, SecurityScheme};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Relay Control Plane API", version = "0.1.0"),
        paths(
            healthz,
            list_projects,
            create_project,
            open_project,
            post_message,
            post_message_stream,
            list_runs,
            get_run,
            get_run_evidence,
            get_metrics,
            trigger_gc
        ),
        components(schemas(
            HealthResponse,
            CreateProjectBody,
            CreateProjectResponse,
            ProjectResponse,
            ProjectsResponse,
            OpenResponse,
            MessageBody,
            MessageResponse,
            RunSummaryResponse,
            RunsResponse,
            RunResponse,
            RunDetailResponse,
            BundleStatusResponse,
            GcResponse,
            ErrorBody
        )),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let components = openapi.components.get_or_insert_with(Default::default);
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
            openapi
                .security
                .get_or_insert_with(Default::default)
                .push(SecurityRequirement::new("bearerAuth", Vec::<String>::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use relay_core::testing::{InMemorySandbox, MockAgent};
    use relay_db::NewUser;
    use serde_json::{json, Value};
    use std::io::Read;
    use tempfile::TempDir;
    use tower::Service;

    struct TestApp {
        state: Arc<AppState>,
        router: Router,
        sandbox: InMemorySandbox,
        agent: MockAgent,
        evidence_worker: EvidenceWorker,
        token: String,
        user: UserRecord,
        _temp: TempDir,
    }

    async fn setup_test_app() -> TestApp {
        setup_test_app_with(|_| {}).await
    }

    async fn setup_test_app_with(tweak: impl FnOnce(&mut CoreConfig)) -> TestApp {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join(format!("db-{}.sqlite", Uuid::new_v4()));
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let db = Database::connect(&db_url).await.expect("db");

        let mut config = CoreConfig {
            evidence_root: temp.path().join("evidence"),
            run_timeout: Duration::from_secs(5),
            stream_token_delay: None,
            ..CoreConfig::default()
        };
        tweak(&mut config);

        let sandbox = InMemorySandbox::new();
        let agent = MockAgent::new().with_sandbox(sandbox.clone());
        let services = build_services(
            db.clone(),
            Arc::new(sandbox.clone()),
            Arc::new(agent.clone()),
            Arc::new(config),
        );

        let user = db
            .create_user(NewUser {
                email: Some("dev@example.com"),
                display_name: Some("Dev"),
                is_admin: false,
            })
            .await
            .expect("user");
        let issued = services
            .state
            .auth
            .issue_key(user.id, Some("tests"))
            .await
            .expect("api key");

        let router = build_router(services.state.clone());
        TestApp {
            state: services.state,
            router,
            sandbox,
            agent,
            evidence_worker: services.evidence_worker,
            token: issued.token,
            user,
            _temp: temp,
        }
    }

    fn authed_request(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", app.token));
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        builder.body(body).expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let mut app = setup_test_app().await;
        let response = app
            .router
            .call(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["ok"], true);
    }

    #[tokio::test]
    async fn requests_without_bearer_are_unauthorized() {
        let mut app = setup_test_app().await;
        let response = app
            .router
            .call(Request::builder().uri("/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn project_open_message_and_evidence_flow() {
        let mut app = setup_test_app().await;

        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                "/projects",
                Some(json!({
                    "name": "hello",
                    "repoUrl": "https://github.com/octocat/Hello-World.git"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let project_id = json_body(response).await["projectId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/open"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let opened = json_body(response).await;
        assert_eq!(opened["state"], "warm");
        assert_eq!(app.sandbox.running_containers(), 1);

        app.agent.push_reply(MockAgent::reply(
            "created hello.txt",
            "diff --git a/hello.txt b/hello.txt\n+hello\n",
            "thread-1",
        ));
        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/message"),
                Some(json!({ "text": "create hello.txt" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let message = json_body(response).await;
        let run_id = message["runId"].as_str().unwrap().to_string();
        assert_eq!(message["finalText"], "created hello.txt");
        assert!(message["diff"].as_str().unwrap().contains("hello.txt"));

        let response = app
            .router
            .call(authed_request(
                &app,
                "GET",
                &format!("/projects/{project_id}/runs"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let runs = json_body(response).await;
        assert_eq!(runs["runs"].as_array().unwrap().len(), 1);
        assert_eq!(runs["runs"][0]["status"], "succeeded");

        let response = app
            .router
            .call(authed_request(&app, "GET", &format!("/runs/{run_id}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let run = json_body(response).await;
        assert_eq!(run["run"]["prompt"], "create hello.txt");
        assert_eq!(run["run"]["envSnapshot"]["hasCommandLog"], true);

        // Bundle is pending until the worker drains the queue.
        let response = app
            .router
            .call(authed_request(
                &app,
                "GET",
                &format!("/runs/{run_id}/evidence"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        app.evidence_worker.drain().await.unwrap();
        let response = app
            .router
            .call(authed_request(
                &app,
                "GET",
                &format!("/runs/{run_id}/evidence"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/zip"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        let mut events = String::new();
        zip.by_name(&format!("{run_id}/events.jsonl"))
            .unwrap()
            .read_to_string(&mut events)
            .unwrap();
        let first: Value = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "run-start");
        assert_eq!(first["runId"], run_id);

        let response = app
            .router
            .call(authed_request(&app, "GET", "/metrics", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let metrics = json_body(response).await;
        assert_eq!(metrics["runs_total{status=\"succeeded\"}"], 1);
    }

    #[tokio::test]
    async fn message_without_warm_workspace_is_conflict() {
        let mut app = setup_test_app().await;
        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                "/projects",
                Some(json!({
                    "name": "p",
                    "repoUrl": "https://github.com/octocat/Hello-World.git"
                })),
            ))
            .await
            .unwrap();
        let project_id = json_body(response).await["projectId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/message"),
                Some(json!({ "text": "hi" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn quota_exhaustion_returns_429_without_a_row() {
        let mut app = setup_test_app_with(|config| config.max_runs_per_day = 1).await;
        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                "/projects",
                Some(json!({
                    "name": "p",
                    "repoUrl": "https://github.com/octocat/Hello-World.git"
                })),
            ))
            .await
            .unwrap();
        let project_id = json_body(response).await["projectId"]
            .as_str()
            .unwrap()
            .to_string();
        app.router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/open"),
                None,
            ))
            .await
            .unwrap();

        let first = app
            .router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/message"),
                Some(json!({ "text": "one" })),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/message"),
                Some(json!({ "text": "two" })),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let project_uuid = Uuid::parse_str(&project_id).unwrap();
        assert_eq!(
            app.state
                .db
                .list_recent_runs(project_uuid, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn runs_are_invisible_to_other_users() {
        let mut app = setup_test_app().await;
        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                "/projects",
                Some(json!({
                    "name": "p",
                    "repoUrl": "https://github.com/octocat/Hello-World.git"
                })),
            ))
            .await
            .unwrap();
        let project_id = json_body(response).await["projectId"]
            .as_str()
            .unwrap()
            .to_string();
        app.router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/open"),
                None,
            ))
            .await
            .unwrap();
        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/message"),
                Some(json!({ "text": "hi" })),
            ))
            .await
            .unwrap();
        let run_id = json_body(response).await["runId"].as_str().unwrap().to_string();
        let run = app
            .state
            .db
            .fetch_run(Uuid::parse_str(&run_id).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.user_id, app.user.id);

        let other = app
            .state
            .db
            .create_user(NewUser {
                email: Some("other@example.com"),
                display_name: None,
                is_admin: false,
            })
            .await
            .unwrap();
        let other_key = app.state.auth.issue_key(other.id, None).await.unwrap();

        let request = Request::builder()
            .method("GET")
            .uri(format!("/runs/{run_id}"))
            .header("authorization", format!("Bearer {}", other_key.token))
            .body(Body::empty())
            .unwrap();
        let response = app.router.call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gc_endpoint_requires_admin() {
        let mut app = setup_test_app().await;
        let response = app
            .router
            .call(authed_request(&app, "POST", "/ops/gc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = app
            .state
            .db
            .create_user(NewUser {
                email: Some("admin@example.com"),
                display_name: None,
                is_admin: true,
            })
            .await
            .unwrap();
        let admin_key = app.state.auth.issue_key(admin.id, None).await.unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/ops/gc")
            .header("authorization", format!("Bearer {}", admin_key.token))
            .body(Body::empty())
            .unwrap();
        let response = app.router.call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary = json_body(response).await;
        assert_eq!(summary["workspacesDeleted"], 0);
        assert_eq!(summary["bundlesDeleted"], 0);
    }

    #[tokio::test]
    async fn stream_endpoint_emits_sse_frames() {
        let mut app = setup_test_app().await;
        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                "/projects",
                Some(json!({
                    "name": "p",
                    "repoUrl": "https://github.com/octocat/Hello-World.git"
                })),
            ))
            .await
            .unwrap();
        let project_id = json_body(response).await["projectId"]
            .as_str()
            .unwrap()
            .to_string();
        app.router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/open"),
                None,
            ))
            .await
            .unwrap();

        app.agent.push_reply(MockAgent::reply(
            "two tokens",
            "diff --git a/x b/x\n",
            "thread-1",
        ));
        let response = app
            .router
            .call(authed_request(
                &app,
                "POST",
                &format!("/projects/{project_id}/message/stream"),
                Some(json!({ "text": "go" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: run-start"));
        assert!(text.contains("event: token"));
        assert!(text.contains("event: diff"));
        assert!(text.contains("event: run-complete"));
        // Frames are `event:` + single-line `data:` JSON.
        let first_data = text
            .lines()
            .find(|line| line.starts_with("data: "))
            .unwrap();
        let parsed: Value = serde_json::from_str(first_data.trim_start_matches("data: ")).unwrap();
        assert_eq!(parsed["type"], "run-start");
    }
}
