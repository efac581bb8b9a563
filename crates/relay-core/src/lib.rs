//! Relay orchestration core.
//!
//! Everything between the HTTP front door and the sandbox lives here: the
//! workspace lifecycle state machine with the per-user single-warm policy,
//! the per-workspace run serialization, the canonical event stream, the idle
//! reaper, the evidence bundle builder and the retention collectors. The
//! sandbox runtime and the in-sandbox agent are reached exclusively through
//! the [`sandbox::SandboxDriver`] and [`agent::AgentClient`] seams so tests
//! (and alternative schedulers) can swap them out.

pub mod agent;
pub mod error;
pub mod events;
pub mod evidence;
pub mod keyed_mutex;
pub mod metrics;
pub mod quota;
pub mod reaper;
pub mod retention;
pub mod run;
pub mod sandbox;
#[cfg(feature = "test-util")]
pub mod testing;
pub mod workspace;

use std::path::PathBuf;
use std::time::Duration;

pub use error::CoreError;

/// Tunables shared across the core services. Populated from the environment
/// by the daemon; tests construct it directly.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Image used for every workspace container.
    pub workspace_image: String,
    /// How long a warm workspace survives without runs before the reaper
    /// cools it.
    pub warm_idle: chrono::Duration,
    /// Daily run quota per user, counted per UTC day.
    pub max_runs_per_day: u32,
    /// Cold workspaces older than this lose their volume.
    pub workspace_cold_ttl: chrono::Duration,
    /// Ready bundles older than this lose their zip.
    pub evidence_ttl: chrono::Duration,
    /// Host directory receiving `<run_id>.zip` bundles and temp staging.
    pub evidence_root: PathBuf,
    /// Hard ceiling on a single agent invocation.
    pub run_timeout: Duration,
    /// Port the agent worker listens on inside the container.
    pub agent_port: u16,
    /// Injected into the sandbox environment when set.
    pub openai_api_key: Option<String>,
    /// Propagated into the sandbox environment when set.
    pub force_mock_codex: Option<String>,
    /// Pause between synthesized token events on the streaming path only.
    pub stream_token_delay: Option<Duration>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workspace_image: "relay-workspace:latest".to_string(),
            warm_idle: chrono::Duration::minutes(20),
            max_runs_per_day: 500,
            workspace_cold_ttl: chrono::Duration::days(30),
            evidence_ttl: chrono::Duration::days(180),
            evidence_root: PathBuf::from("./evidence"),
            run_timeout: Duration::from_secs(60),
            agent_port: 7000,
            openai_api_key: None,
            force_mock_codex: None,
            stream_token_delay: Some(Duration::from_millis(20)),
        }
    }
}
