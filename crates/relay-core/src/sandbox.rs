//! Sandbox driver abstraction and the Docker implementation.
//!
//! The core never talks to a container runtime directly; everything flows
//! through [`SandboxDriver`] so a cluster scheduler (or the in-memory fake in
//! [`crate::testing`]) can stand in for the local Docker daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding, VolumeCreateOptions};
use bollard::query_parameters::{
    CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, RemoveVolumeOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures_util::stream::TryStreamExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Default CPU share handed to workspace containers.
pub const DEFAULT_CPU_LIMIT: f64 = 0.5;
/// Default memory ceiling handed to workspace containers.
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;
/// Mount point of the workspace volume inside the container.
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox runtime connection failed: {0}")]
    Connection(String),
    #[error("sandbox resource not found: {0}")]
    NotFound(String),
    #[error("sandbox operation timed out: {0}")]
    Timeout(String),
    #[error("sandbox runtime error: {0}")]
    Other(String),
}

impl SandboxError {
    /// Transient failures are worth one retry; everything else is surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, SandboxError::Connection(_) | SandboxError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }
}

/// Everything needed to create a workspace container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub volume_name: String,
    pub env: Vec<(String, String)>,
    pub exposed_port: u16,
    pub cpu_limit: f64,
    pub memory_limit_bytes: u64,
}

impl ContainerSpec {
    pub fn new(name: String, image: String, volume_name: String) -> Self {
        Self {
            name,
            image,
            volume_name,
            env: Vec::new(),
            exposed_port: 7000,
            cpu_limit: DEFAULT_CPU_LIMIT,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
        }
    }
}

/// Snapshot of a running container as the control plane sees it.
#[derive(Debug, Clone)]
pub struct ContainerInspect {
    pub image_name: String,
    pub image_digest: Option<String>,
    pub ip_address: Option<String>,
    /// Internal port → published host port.
    pub ports: HashMap<u16, u16>,
}

impl ContainerInspect {
    /// Host port published for the given internal port, when the runtime
    /// publishes one. When control plane and sandbox share a network the
    /// caller falls back to `ip_address` and the internal port.
    pub fn host_port_for_internal(&self, port: u16) -> Option<u16> {
        self.ports.get(&port).copied()
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over container and volume operations.
#[async_trait]
pub trait SandboxDriver: Send + Sync + 'static {
    async fn ensure_volume(&self, name: &str) -> Result<(), SandboxError>;
    async fn delete_volume(&self, name: &str) -> Result<(), SandboxError>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;
    async fn start_container(&self, container_id: &str) -> Result<(), SandboxError>;
    async fn stop_and_remove(&self, container_id: &str) -> Result<(), SandboxError>;
    async fn inspect(&self, container_id: &str) -> Result<ContainerInspect, SandboxError>;
    async fn exec(
        &self,
        container_id: &str,
        argv: &[&str],
        workdir: &str,
    ) -> Result<ExecOutput, SandboxError>;
    /// Tar archive of the given path inside the container.
    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Bytes, SandboxError>;
    /// Writes a single file into the container, creating parent directories.
    async fn put_file(
        &self,
        container_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError>;
}

/// Driver for a local Docker daemon.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| SandboxError::Connection(err.to_string()))?;
        Ok(Self { docker })
    }

    /// Resolves the repo digest for an image, falling back to the content id.
    async fn image_digest(&self, image_name: &str) -> Option<String> {
        let inspect = match self.docker.inspect_image(image_name).await {
            Ok(inspect) => inspect,
            Err(err) => {
                debug!(image = image_name, error = %err, "image inspect failed");
                return None;
            }
        };
        if let Some(repo_digests) = inspect.repo_digests {
            if let Some(first) = repo_digests.first() {
                if let Some(sha) = first.split('@').nth(1) {
                    return Some(sha.to_string());
                }
            }
        }
        inspect.id
    }
}

fn map_docker_err(err: bollard::errors::Error) -> SandboxError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => SandboxError::NotFound(message),
        bollard::errors::Error::RequestTimeoutError => {
            SandboxError::Timeout("docker request timed out".to_string())
        }
        bollard::errors::Error::IOError { err } => SandboxError::Connection(err.to_string()),
        other => SandboxError::Other(other.to_string()),
    }
}

#[async_trait]
impl SandboxDriver for DockerDriver {
    async fn ensure_volume(&self, name: &str) -> Result<(), SandboxError> {
        // Volume creation is idempotent in the engine API: creating an
        // existing name returns the existing volume.
        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(map_docker_err)
    }

    async fn delete_volume(&self, name: &str) -> Result<(), SandboxError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(map_docker_err)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let port_key = format!("{}/tcp", spec.exposed_port);
        let mut port_bindings = HashMap::new();
        // A null host port asks the daemon to pick an ephemeral one; inspect
        // reports the assignment.
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                spec.volume_name, WORKSPACE_MOUNT_PATH
            )]),
            memory: Some(spec.memory_limit_bytes as i64),
            nano_cpus: Some((spec.cpu_limit * 1_000_000_000.0) as i64),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(map_docker_err)?;
        debug!(container_id = %created.id, image = %spec.image, "container created");
        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .map_err(map_docker_err)
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), SandboxError> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: Some(10),
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(err) => {
                let mapped = map_docker_err(err);
                if !mapped.is_not_found() {
                    warn!(container_id, error = %mapped, "container stop failed; removing anyway");
                }
            }
        }

        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_docker_err)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspect, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(map_docker_err)?;

        let image_name = inspect
            .config
            .as_ref()
            .and_then(|config| config.image.clone())
            .unwrap_or_default();
        let image_digest = if image_name.is_empty() {
            inspect.image.clone()
        } else {
            self.image_digest(&image_name).await.or(inspect.image.clone())
        };

        let mut ports = HashMap::new();
        let mut ip_address = None;
        if let Some(settings) = inspect.network_settings {
            ip_address = settings.ip_address.filter(|ip| !ip.is_empty());
            if let Some(port_map) = settings.ports {
                for (key, bindings) in port_map {
                    let Some(internal) = key
                        .split('/')
                        .next()
                        .and_then(|raw| raw.parse::<u16>().ok())
                    else {
                        continue;
                    };
                    let Some(bindings) = bindings else { continue };
                    for binding in bindings {
                        if let Some(host_port) =
                            binding.host_port.as_deref().and_then(|raw| raw.parse().ok())
                        {
                            ports.insert(internal, host_port);
                            break;
                        }
                    }
                }
            }
        }

        Ok(ContainerInspect {
            image_name,
            image_digest,
            ip_address,
            ports,
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[&str],
        workdir: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(argv.iter().map(|arg| arg.to_string()).collect()),
                    working_dir: Some(workdir.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_docker_err)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_docker_err)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.try_next().await.map_err(map_docker_err)? {
                    match chunk {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(map_docker_err)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Bytes, SandboxError> {
        let mut stream = self.docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.try_next().await.map_err(map_docker_err)? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    async fn put_file(
        &self,
        container_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError> {
        let (dir, file_name) = match path.rsplit_once('/') {
            Some((dir, file_name)) if !dir.is_empty() => (dir, file_name),
            _ => return Err(SandboxError::Other(format!("invalid file path: {path}"))),
        };

        let mkdir = self.exec(container_id, &["mkdir", "-p", dir], "/").await?;
        if !mkdir.succeeded() {
            return Err(SandboxError::Other(format!(
                "mkdir -p {dir} failed: {}",
                mkdir.stderr
            )));
        }

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, file_name, contents)
            .map_err(|err| SandboxError::Other(err.to_string()))?;
        let archive = builder
            .into_inner()
            .map_err(|err| SandboxError::Other(err.to_string()))?;

        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                bollard::body_full(Bytes::from(archive)),
            )
            .await
            .map_err(map_docker_err)
    }
}
