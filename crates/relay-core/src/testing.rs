//! In-memory sandbox driver and agent client for tests.
//!
//! `InMemorySandbox` models just enough of a container runtime for the
//! lifecycle services: named volumes, containers with env and a published
//! agent port, a fake exec interpreter for the handful of commands the core
//! issues, and a file store backing `put_file`/`get_archive`. `MockAgent`
//! returns scripted replies and can write agent-side evidence files into the
//! container it was called through, mirroring the real worker.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::agent::{AgentClient, AgentEndpoint, AgentError, AgentReply};
use crate::sandbox::{ContainerInspect, ContainerSpec, ExecOutput, SandboxDriver, SandboxError};

#[derive(Debug)]
struct FakeContainer {
    image: String,
    env: Vec<(String, String)>,
    volume: String,
    host_port: u16,
    agent_port: u16,
    running: bool,
    cloned: bool,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct SandboxState {
    volumes: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    next_container: u64,
    fail_next_start: bool,
    fail_next_clone: bool,
}

#[derive(Clone, Default)]
pub struct InMemorySandbox {
    inner: Arc<Mutex<SandboxState>>,
}

impl InMemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `start_container` call fails (non-transient).
    pub fn fail_next_start(&self) {
        self.inner.lock().fail_next_start = true;
    }

    /// The next `git clone` exec exits non-zero.
    pub fn fail_next_clone(&self) {
        self.inner.lock().fail_next_clone = true;
    }

    pub fn running_containers(&self) -> usize {
        self.inner
            .lock()
            .containers
            .values()
            .filter(|container| container.running)
            .count()
    }

    pub fn volume_exists(&self, name: &str) -> bool {
        self.inner.lock().volumes.contains(name)
    }

    pub fn container_env(&self, container_id: &str) -> Option<Vec<(String, String)>> {
        self.inner
            .lock()
            .containers
            .get(container_id)
            .map(|container| container.env.clone())
    }

    pub fn file(&self, container_id: &str, path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .containers
            .get(container_id)
            .and_then(|container| container.files.get(path).cloned())
    }

    pub fn write_file(&self, container_id: &str, path: &str, contents: &[u8]) {
        if let Some(container) = self.inner.lock().containers.get_mut(container_id) {
            container.files.insert(path.to_string(), contents.to_vec());
        }
    }

    /// Reverse lookup used by [`MockAgent`] to find the container behind an
    /// endpoint.
    pub fn container_for_host_port(&self, host_port: u16) -> Option<String> {
        self.inner
            .lock()
            .containers
            .iter()
            .find(|(_, container)| container.host_port == host_port)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl SandboxDriver for InMemorySandbox {
    async fn ensure_volume(&self, name: &str) -> Result<(), SandboxError> {
        self.inner.lock().volumes.insert(name.to_string());
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), SandboxError> {
        if self.inner.lock().volumes.remove(name) {
            Ok(())
        } else {
            Err(SandboxError::NotFound(format!("volume {name}")))
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let mut state = self.inner.lock();
        if !state.volumes.contains(&spec.volume_name) {
            return Err(SandboxError::NotFound(format!(
                "volume {}",
                spec.volume_name
            )));
        }
        state.next_container += 1;
        let id = format!("ctr-{}", state.next_container);
        let host_port = 32800 + state.next_container as u16;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                image: spec.image.clone(),
                env: spec.env.clone(),
                volume: spec.volume_name.clone(),
                host_port,
                agent_port: spec.exposed_port,
                running: false,
                cloned: false,
                files: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), SandboxError> {
        let mut state = self.inner.lock();
        if std::mem::take(&mut state.fail_next_start) {
            return Err(SandboxError::Other("injected start failure".to_string()));
        }
        match state.containers.get_mut(container_id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(SandboxError::NotFound(format!("container {container_id}"))),
        }
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), SandboxError> {
        if self.inner.lock().containers.remove(container_id).is_some() {
            Ok(())
        } else {
            Err(SandboxError::NotFound(format!("container {container_id}")))
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspect, SandboxError> {
        let state = self.inner.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| SandboxError::NotFound(format!("container {container_id}")))?;
        Ok(ContainerInspect {
            image_name: container.image.clone(),
            image_digest: Some("sha256:0000000000000000000000000000000000000000".to_string()),
            ip_address: Some("172.17.0.2".to_string()),
            ports: HashMap::from([(container.agent_port, container.host_port)]),
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[&str],
        _workdir: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let mut state = self.inner.lock();
        let fail_clone = if matches!(argv, ["git", "clone", ..]) {
            std::mem::take(&mut state.fail_next_clone)
        } else {
            false
        };
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| SandboxError::NotFound(format!("container {container_id}")))?;

        let exit_code = match argv {
            ["test", "-d", path] if path.ends_with(".git") => {
                if container.cloned {
                    0
                } else {
                    1
                }
            }
            ["test", "-f", path] => {
                if container.files.contains_key(*path) {
                    0
                } else {
                    1
                }
            }
            ["mkdir", "-p", _] => 0,
            ["git", "clone", ..] => {
                if fail_clone {
                    return Ok(ExecOutput {
                        exit_code: 128,
                        stdout: String::new(),
                        stderr: "fatal: unable to access repository".to_string(),
                    });
                }
                container.cloned = true;
                0
            }
            _ => 0,
        };
        Ok(ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Bytes, SandboxError> {
        let state = self.inner.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| SandboxError::NotFound(format!("container {container_id}")))?;

        let dir = path.trim_end_matches('/');
        let root_name = dir
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| SandboxError::Other(format!("invalid archive path {path}")))?;
        let prefix = format!("{dir}/");

        let mut builder = tar::Builder::new(Vec::new());
        let mut found = false;
        for (file_path, contents) in &container.files {
            let Some(relative) = file_path.strip_prefix(&prefix) else {
                continue;
            };
            found = true;
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{root_name}/{relative}"), contents.as_slice())
                .map_err(|err| SandboxError::Other(err.to_string()))?;
        }
        if !found {
            return Err(SandboxError::NotFound(format!("path {path}")));
        }
        let archive = builder
            .into_inner()
            .map_err(|err| SandboxError::Other(err.to_string()))?;
        Ok(Bytes::from(archive))
    }

    async fn put_file(
        &self,
        container_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError> {
        let mut state = self.inner.lock();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| SandboxError::NotFound(format!("container {container_id}")))?;
        container.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct MockAgentState {
    scripted: VecDeque<AgentReply>,
    delay: Option<Duration>,
    fail_next: bool,
    calls: u64,
    sandbox: Option<InMemorySandbox>,
}

/// Scripted agent client. Unscripted calls get a generic reply that carries
/// a stable thread id and an empty diff.
#[derive(Clone, Default)]
pub struct MockAgent {
    inner: Arc<Mutex<MockAgentState>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// When attached, every successful call writes `command_log.jsonl` and
    /// `outputs.json` into the called container, like the real worker does.
    pub fn with_sandbox(self, sandbox: InMemorySandbox) -> Self {
        self.inner.lock().sandbox = Some(sandbox);
        self
    }

    pub fn push_reply(&self, reply: AgentReply) {
        self.inner.lock().scripted.push_back(reply);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().delay = Some(delay);
    }

    pub fn fail_next(&self) {
        self.inner.lock().fail_next = true;
    }

    pub fn calls(&self) -> u64 {
        self.inner.lock().calls
    }

    pub fn reply(final_text: &str, diff: &str, thread_id: &str) -> AgentReply {
        AgentReply {
            final_text: final_text.to_string(),
            diff: diff.to_string(),
            thread_id: Some(thread_id.to_string()),
            git_commit: Some("0123abcd".to_string()),
        }
    }
}

#[async_trait]
impl AgentClient for MockAgent {
    async fn execute(
        &self,
        endpoint: &AgentEndpoint,
        prompt: &str,
        run_id: Uuid,
    ) -> Result<AgentReply, AgentError> {
        let (delay, reply, sandbox) = {
            let mut state = self.inner.lock();
            state.calls += 1;
            if std::mem::take(&mut state.fail_next) {
                return Err(AgentError::Status(500, "injected agent failure".to_string()));
            }
            let reply = state.scripted.pop_front().unwrap_or_else(|| AgentReply {
                final_text: format!("Acknowledged: {prompt}"),
                diff: String::new(),
                thread_id: Some("thread-mock-1".to_string()),
                git_commit: None,
            });
            (state.delay, reply, state.sandbox.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(sandbox) = sandbox {
            if let Some(container_id) = endpoint
                .base_url
                .rsplit(':')
                .next()
                .and_then(|raw| raw.parse::<u16>().ok())
                .and_then(|port| sandbox.container_for_host_port(port))
            {
                let evidence_dir = format!("/workspace/evidence/{run_id}");
                sandbox.write_file(
                    &container_id,
                    &format!("{evidence_dir}/command_log.jsonl"),
                    format!("{{\"command\":\"echo run\",\"runId\":\"{run_id}\"}}\n").as_bytes(),
                );
                sandbox.write_file(
                    &container_id,
                    &format!("{evidence_dir}/outputs.json"),
                    b"{\"outputs\":[]}",
                );
            }
        }

        Ok(reply)
    }
}
