//! Docker Provider (C4, SPEC_FULL.md §4.4).
//!
//! Adapted from the teacher's `docker.rs` (`spawn_server_task`,
//! `monitor_server_task`, `stream_logs_task`): one container per session
//! instead of one per "MCP server", a uniform [`CreateOptions`] instead of
//! server-type-keyed image selection, and the exact environment contract
//! from §6 instead of ad hoc `CFG_*`/service-integration variables.

use super::{
    AttachOptions, CreateOptions, ExecOptions, ExecResult, ExecStream, ExecStreamChunk, Pty,
    RemoveOptions, Sandbox, SandboxHttpClient, SandboxProvider, SandboxStatus, StateEvent,
};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::system::EventsOptions;
use bollard::Docker;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use uuid::Uuid;

const SANDBOX_PORT: &str = "8080/tcp";

fn container_name(session_id: Uuid) -> String {
    format!("octobot-session-{session_id}")
}

/// Connects to a Docker daemon via an injected dialer: a bare Unix socket
/// for a standalone provider, or a project VM's Docker socket when wrapped
/// by the VM+Docker composite (§4.6). `connect` is called once at
/// construction; reconnection on daemon restart is out of scope.
pub trait DockerConnector: Send + Sync {
    fn connect(&self) -> AppResult<Docker>;
}

pub struct LocalDockerConnector {
    pub host: Option<String>,
}

impl DockerConnector for LocalDockerConnector {
    fn connect(&self) -> AppResult<Docker> {
        let docker = match &self.host {
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(docker)
    }
}

/// Tracks the host port published for each session's sandbox so
/// `get`/`http_client` don't need to re-inspect the container every call.
struct SessionPorts {
    host_port: u16,
    shared_secret: String,
}

pub struct DockerProvider {
    docker: Docker,
    image: String,
    ports: DashMap<Uuid, SessionPorts>,
}

impl DockerProvider {
    pub fn new(connector: &dyn DockerConnector, image: String) -> AppResult<Self> {
        Ok(Self {
            docker: connector.connect()?,
            image,
            ports: DashMap::new(),
        })
    }

    fn sandbox_status_from_docker(state: Option<bollard::models::ContainerState>) -> SandboxStatus {
        match state.and_then(|s| s.status) {
            Some(bollard::models::ContainerStateStatusEnum::RUNNING) => SandboxStatus::Running,
            Some(bollard::models::ContainerStateStatusEnum::CREATED) => SandboxStatus::Created,
            Some(bollard::models::ContainerStateStatusEnum::EXITED) => SandboxStatus::Stopped,
            Some(bollard::models::ContainerStateStatusEnum::DEAD) => SandboxStatus::Failed,
            _ => SandboxStatus::Stopped,
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn image_exists(&self) -> AppResult<bool> {
        Ok(self.docker.inspect_image(&self.image).await.is_ok())
    }

    fn image(&self) -> String {
        self.image.clone()
    }

    async fn create(&self, session_id: Uuid, options: CreateOptions) -> AppResult<Sandbox> {
        if !self.image_exists().await.unwrap_or(false) {
            let mut stream = self.docker.create_image(
                Some(CreateImageOptions {
                    from_image: self.image.as_str(),
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(progress) = stream.next().await {
                if let Err(e) = progress {
                    return Err(AppError::ImagePullFailed(e.to_string()));
                }
            }
        }

        let name = container_name(session_id);
        // idempotent on redeploy / retried create
        let _ = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let mut env = vec![
            format!("SESSION_ID={session_id}"),
            format!("WORKSPACE_PATH={}", options.workspace_path),
            format!("WORKSPACE_SOURCE={}", options.workspace_source),
            format!("OCTOBOT_SECRET={}", options.shared_secret),
        ];
        if let Some(commit) = &options.workspace_commit {
            env.push(format!("WORKSPACE_COMMIT={commit}"));
        }
        for (key, value) in &options.credential_env {
            env.push(format!("{key}={value}"));
        }

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            SANDBOX_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None, // let Docker pick a random free host port
            }]),
        );

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:/workspace",
                options.workspace_path
            )]),
            port_bindings: Some(port_bindings),
            publish_all_ports: Some(true),
            nano_cpus: options
                .resources
                .cpu_cores
                .map(|c| (c * 1_000_000_000.0) as i64),
            memory: options
                .resources
                .memory_mb
                .map(|m| (m * 1024 * 1024) as i64),
            ..Default::default()
        };

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(SANDBOX_PORT.to_string(), HashMap::new());

        let labels: HashMap<String, String> = options.labels.clone();

        let container_config = ContainerConfig::<String> {
            image: Some(self.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(labels),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| AppError::SandboxCreateFailed(e.to_string()))?;

        self.ports.insert(
            session_id,
            SessionPorts {
                host_port: 0,
                shared_secret: options.shared_secret.clone(),
            },
        );

        Ok(Sandbox {
            id: created.id,
            session_id,
            status: SandboxStatus::Created,
            image: self.image.clone(),
            ports: vec![],
            env: HashMap::new(),
        })
    }

    async fn start(&self, session_id: Uuid) -> AppResult<()> {
        let name = container_name(session_id);
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| AppError::SandboxStartFailed(e.to_string()))?;

        if let Ok(info) = self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            if let Some(host_port) = info
                .network_settings
                .and_then(|n| n.ports)
                .and_then(|p| p.get(SANDBOX_PORT).cloned().flatten())
                .and_then(|bindings| bindings.into_iter().next())
                .and_then(|b| b.host_port)
                .and_then(|p| p.parse::<u16>().ok())
            {
                if let Some(mut entry) = self.ports.get_mut(&session_id) {
                    entry.host_port = host_port;
                }
            }
        }
        Ok(())
    }

    async fn stop(&self, session_id: Uuid, timeout_secs: u64) -> AppResult<()> {
        let name = container_name(session_id);
        match self
            .docker
            .stop_container(
                &name,
                Some(StopContainerOptions {
                    t: timeout_secs as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()), // already stopped
            Err(e) => Err(AppError::Docker(e)),
        }
    }

    async fn remove(&self, session_id: Uuid, options: RemoveOptions) -> AppResult<()> {
        let name = container_name(session_id);
        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: options.remove_volumes,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => {
                self.ports.remove(&session_id);
                Ok(())
            }
            Err(e) => Err(AppError::Docker(e)),
        }
    }

    async fn get(&self, session_id: Uuid) -> AppResult<Sandbox> {
        let name = container_name(session_id);
        let info = self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
            .map_err(|_| AppError::NotFound)?;
        let status = Self::sandbox_status_from_docker(info.state);
        let ports = self
            .ports
            .get(&session_id)
            .map(|p| if p.host_port != 0 { vec![p.host_port] } else { vec![] })
            .unwrap_or_default();
        Ok(Sandbox {
            id: info.id.unwrap_or_default(),
            session_id,
            status,
            image: self.image.clone(),
            ports,
            env: HashMap::new(),
        })
    }

    async fn get_secret(&self, session_id: Uuid) -> AppResult<String> {
        self.ports
            .get(&session_id)
            .map(|p| p.shared_secret.clone())
            .ok_or(AppError::NotFound)
    }

    async fn list(&self) -> AppResult<Vec<Sandbox>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec!["octobot-session-".to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c.names?.into_iter().next()?;
                let session_id = name
                    .trim_start_matches('/')
                    .strip_prefix("octobot-session-")?
                    .parse()
                    .ok()?;
                Some(Sandbox {
                    id: c.id.unwrap_or_default(),
                    session_id,
                    status: match c.state.as_deref() {
                        Some("running") => SandboxStatus::Running,
                        Some("created") => SandboxStatus::Created,
                        Some("exited") | Some("dead") => SandboxStatus::Stopped,
                        _ => SandboxStatus::Failed,
                    },
                    image: self.image.clone(),
                    ports: vec![],
                    env: HashMap::new(),
                })
            })
            .collect())
    }

    async fn exec(
        &self,
        session_id: Uuid,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> AppResult<ExecResult> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let name = container_name(session_id);
        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions {
                    cmd: Some(argv),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: options.working_dir,
                    env: Some(
                        options
                            .env
                            .into_iter()
                            .map(|(k, v)| format!("{k}={v}"))
                            .collect(),
                    ),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(Ok(msg)) = output.next().await {
                match msg {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.extend_from_slice(&message)
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.extend_from_slice(&message)
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecResult {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn attach(&self, session_id: Uuid, options: AttachOptions) -> AppResult<Box<dyn Pty>> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let name = container_name(session_id);
        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/bash".to_string()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, input } => {
                let mut pty = DockerPty {
                    docker: self.docker.clone(),
                    exec_id: exec.id.clone(),
                    output,
                    input,
                };
                pty.resize(options.cols, options.rows).await?;
                Ok(Box::new(pty))
            }
            StartExecResults::Detached => {
                Err(AppError::Message("attach exec unexpectedly detached".into()))
            }
        }
    }

    async fn exec_stream(
        &self,
        session_id: Uuid,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> AppResult<Box<dyn ExecStream>> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let name = container_name(session_id);
        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions {
                    cmd: Some(argv),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: options.working_dir,
                    env: Some(
                        options
                            .env
                            .into_iter()
                            .map(|(k, v)| format!("{k}={v}"))
                            .collect(),
                    ),
                    ..Default::default()
                },
            )
            .await?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, input } => Ok(Box::new(DockerExecStream {
                docker: self.docker.clone(),
                exec_id: exec.id,
                output,
                input,
            })),
            StartExecResults::Detached => Err(AppError::Message(
                "exec stream unexpectedly detached".into(),
            )),
        }
    }

    async fn http_client(&self, session_id: Uuid) -> AppResult<SandboxHttpClient> {
        let host_port = self
            .ports
            .get(&session_id)
            .map(|p| p.host_port)
            .filter(|p| *p != 0)
            .ok_or(AppError::NotRunning)?;
        Ok(SandboxHttpClient {
            client: reqwest::Client::new(),
            base_url: format!("http://127.0.0.1:{host_port}"),
        })
    }

    fn watch(&self) -> BoxStream<'static, StateEvent> {
        let docker = self.docker.clone();
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "label".to_string(),
            vec!["octobot.session_id".to_string()],
        );

        // Replay current containers first, then tail live events -- the
        // Watch-as-replay-then-stream contract from §4.3.
        let replay = stream::once(async move {
            let docker = docker.clone();
            let containers = docker
                .list_containers(Some(ListContainersOptions::<String> {
                    all: true,
                    ..Default::default()
                }))
                .await
                .unwrap_or_default();
            stream::iter(containers.into_iter().filter_map(|c| {
                let name = c.names?.into_iter().next()?;
                let session_id: Uuid = name
                    .trim_start_matches('/')
                    .strip_prefix("octobot-session-")?
                    .parse()
                    .ok()?;
                Some(StateEvent::Status {
                    sandbox_id: c.id.unwrap_or_default(),
                    session_id,
                    status: match c.state.as_deref() {
                        Some("running") => SandboxStatus::Running,
                        Some("created") => SandboxStatus::Created,
                        _ => SandboxStatus::Stopped,
                    },
                })
            }))
        })
        .flatten();

        let live = self
            .docker
            .events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }))
            .filter_map(|evt| async move {
                let evt = evt.ok()?;
                let actor = evt.actor?;
                let name = actor.attributes?.get("name")?.clone();
                let session_id: Uuid = name.strip_prefix("octobot-session-")?.parse().ok()?;
                let status = match evt.action.as_deref() {
                    Some("start") => SandboxStatus::Running,
                    Some("create") => SandboxStatus::Created,
                    Some("die") | Some("stop") => SandboxStatus::Stopped,
                    Some("destroy") => SandboxStatus::Removed,
                    Some("oom") => SandboxStatus::Failed,
                    _ => return None,
                };
                Some(StateEvent::Status {
                    sandbox_id: actor.id.unwrap_or_default(),
                    session_id,
                    status,
                })
            });

        Box::pin(replay.chain(live))
    }
}

/// Non-PTY exec stream backed by a Docker exec's attached stdout/stderr/stdin
/// (bollard keeps these boxed already, so no extra pinning is needed here).
struct DockerExecStream {
    docker: Docker,
    exec_id: String,
    output: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = Result<bollard::container::LogOutput, bollard::errors::Error>> + Send>,
    >,
    input: std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
}

#[async_trait]
impl ExecStream for DockerExecStream {
    async fn next_chunk(&mut self) -> AppResult<Option<ExecStreamChunk>> {
        loop {
            match self.output.next().await {
                Some(Ok(bollard::container::LogOutput::StdOut { message })) => {
                    return Ok(Some(ExecStreamChunk::Stdout(message.to_vec())))
                }
                Some(Ok(bollard::container::LogOutput::StdErr { message })) => {
                    return Ok(Some(ExecStreamChunk::Stderr(message.to_vec())))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AppError::Docker(e)),
                None => return Ok(None),
            }
        }
    }

    async fn write_stdin(&mut self, data: &[u8]) -> AppResult<()> {
        use tokio::io::AsyncWriteExt;
        self.input
            .write_all(data)
            .await
            .map_err(|e| AppError::Message(e.to_string()))
    }

    async fn close_write(&mut self) -> AppResult<()> {
        use tokio::io::AsyncWriteExt;
        self.input
            .shutdown()
            .await
            .map_err(|e| AppError::Message(e.to_string()))
    }

    async fn wait(&mut self) -> AppResult<i64> {
        let inspect = self.docker.inspect_exec(&self.exec_id).await?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }
}

/// A real TTY-allocated exec attach, mirroring [`DockerExecStream`] but with
/// stdout/stderr merged into one console stream the way a PTY does, and a
/// `resize` that actually reaches the daemon.
struct DockerPty {
    docker: Docker,
    exec_id: String,
    output: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = Result<bollard::container::LogOutput, bollard::errors::Error>> + Send>,
    >,
    input: std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
}

#[async_trait]
impl Pty for DockerPty {
    async fn read(&mut self) -> AppResult<Vec<u8>> {
        match self.output.next().await {
            Some(Ok(chunk)) => Ok(chunk.into_bytes().to_vec()),
            Some(Err(e)) => Err(AppError::Docker(e)),
            None => Ok(Vec::new()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        use tokio::io::AsyncWriteExt;
        self.input
            .write_all(data)
            .await
            .map_err(|e| AppError::Message(e.to_string()))
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> AppResult<()> {
        use bollard::exec::ResizeExecOptions;
        self.docker
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        use tokio::io::AsyncWriteExt;
        self.input
            .shutdown()
            .await
            .map_err(|e| AppError::Message(e.to_string()))
    }

    async fn wait(&mut self) -> AppResult<i64> {
        let inspect = self.docker.inspect_exec(&self.exec_id).await?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_naming_is_stable_per_session() {
        let id = Uuid::new_v4();
        assert_eq!(container_name(id), format!("octobot-session-{id}"));
    }
}

pub use LocalDockerConnector as DefaultDockerConnector;
