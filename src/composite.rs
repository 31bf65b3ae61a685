//! VM+Docker Composite (C6, SPEC_FULL.md §4.6).
//!
//! Loosely informed by the teacher's `runtime/vm.rs` `VirtualMachineExecutor`
//! orchestration flow (status transitions around provisioning), with the
//! attestation branch removed entirely -- this composite's job is narrower:
//! lazily materialise a per-project VM, wrap a Docker Provider over its
//! Docker dialer, and reap idle VMs.

use crate::config::DOCKER_HOST;
use crate::error::{AppError, AppResult};
use crate::sandbox::docker::{DockerConnector, DockerProvider, LocalDockerConnector};
use crate::sandbox::{
    AttachOptions, CreateOptions, ExecOptions, ExecResult, ExecStream, Pty, RemoveOptions,
    Sandbox, SandboxHttpClient, SandboxProvider, StateEvent,
};
use crate::vm::VmManager;
use async_trait::async_trait;
use bollard::Docker;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Connects to the Docker daemon reachable inside a project's VM via its
/// `docker_dialer`. `bollard` needs an async transport; the blocking
/// `TcpStream` the VM Manager returns is wrapped with `tokio::net` via
/// `from_std`, matching how one would bridge a synchronous dial API into an
/// async HTTP client without inventing a new transport abstraction.
struct VmDockerConnector {
    vm: Arc<crate::vm::ProjectVm>,
}

impl DockerConnector for VmDockerConnector {
    fn connect(&self) -> AppResult<Docker> {
        let stream: TcpStream = self
            .vm
            .docker_dialer()
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        // bollard only knows how to connect by address/socket, so we hand
        // it the VM's forwarded host-side address rather than the raw
        // stream; the dial above is solely a readiness probe.
        let addr = stream
            .peer_addr()
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        Docker::connect_with_http(&format!("http://{addr}"), 120, bollard::API_DEFAULT_VERSION)
            .map_err(AppError::Docker)
    }
}

struct ProjectEntry {
    provider: Arc<DockerProvider>,
    idle_since: Mutex<Option<std::time::Instant>>,
}

pub struct VmDockerComposite {
    vm_manager: Arc<VmManager>,
    image: String,
    providers: DashMap<Uuid, Arc<ProjectEntry>>,
    creation_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    resolver: Arc<dyn Fn(Uuid) -> Uuid + Send + Sync>,
    idle_timeout: Duration,
}

impl VmDockerComposite {
    pub fn new(
        vm_manager: Arc<VmManager>,
        image: String,
        resolver: Arc<dyn Fn(Uuid) -> Uuid + Send + Sync>,
        idle_timeout_secs: u64,
    ) -> Self {
        Self {
            vm_manager,
            image,
            providers: DashMap::new(),
            creation_locks: DashMap::new(),
            resolver,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
        }
    }

    async fn provider_for_project(&self, project_id: Uuid) -> AppResult<Arc<ProjectEntry>> {
        if let Some(entry) = self.providers.get(&project_id) {
            return Ok(entry.clone());
        }

        let lock = self
            .creation_locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if let Some(entry) = self.providers.get(&project_id) {
            return Ok(entry.clone());
        }

        let vm = self.vm_manager.get_or_create_vm(project_id).await?;
        let connector = VmDockerConnector { vm };
        let provider = Arc::new(DockerProvider::new(&connector, self.image.clone())?);
        let entry = Arc::new(ProjectEntry {
            provider,
            idle_since: Mutex::new(None),
        });
        self.providers.insert(project_id, entry.clone());
        Ok(entry)
    }

    async fn provider_for_session(&self, session_id: Uuid) -> AppResult<Arc<ProjectEntry>> {
        let project_id = (self.resolver)(session_id);
        self.provider_for_project(project_id).await
    }

    /// Background loop: every poll interval, polls each project's Docker
    /// provider for its actual running-sandbox count (§4.6: "a background
    /// loop polls running sandbox counts per project") rather than tracking
    /// a counter through `start`/`stop` -- nothing in the lifecycle engine
    /// ever calls `stop` (sessions go straight from running to removed, or
    /// die externally), so a counter fed only by `start` would never come
    /// back down. A project whose count has been zero for `idle_timeout`
    /// has its VM torn down. Volumes are never removed here (open-question
    /// resolution, DESIGN.md) -- only an explicit session-level
    /// `remove(remove_volumes: true)` deletes data.
    pub fn spawn_idle_reaper(self: &Arc<Self>, poll_interval: Duration) {
        if self.idle_timeout.is_zero() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                let project_ids: Vec<Uuid> = this.providers.iter().map(|e| *e.key()).collect();
                for project_id in project_ids {
                    let Some(entry) = this.providers.get(&project_id).map(|e| e.clone()) else {
                        continue;
                    };
                    let running = match entry.provider.list().await {
                        Ok(sandboxes) => sandboxes
                            .iter()
                            .filter(|s| s.status == crate::sandbox::SandboxStatus::Running)
                            .count(),
                        Err(e) => {
                            tracing::warn!(%project_id, error = %e, "idle reaper list failed");
                            continue;
                        }
                    };
                    let mut idle_since = entry.idle_since.lock().await;
                    if running == 0 {
                        let now = std::time::Instant::now();
                        let since = idle_since.get_or_insert(now);
                        if since.elapsed() >= this.idle_timeout {
                            drop(idle_since);
                            tracing::info!(%project_id, "reaping idle project VM");
                            this.providers.remove(&project_id);
                            if let Err(e) = this.vm_manager.remove_vm(project_id).await {
                                tracing::warn!(%project_id, error = %e, "failed to remove idle VM");
                            }
                        }
                    } else {
                        *idle_since = None;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl SandboxProvider for VmDockerComposite {
    async fn image_exists(&self) -> AppResult<bool> {
        Ok(true) // checked lazily per-project at create time (§4.4)
    }

    fn image(&self) -> String {
        self.image.clone()
    }

    async fn create(&self, session_id: Uuid, options: CreateOptions) -> AppResult<Sandbox> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.create(session_id, options).await
    }

    async fn start(&self, session_id: Uuid) -> AppResult<()> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.start(session_id).await
    }

    async fn stop(&self, session_id: Uuid, timeout_secs: u64) -> AppResult<()> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.stop(session_id, timeout_secs).await
    }

    async fn remove(&self, session_id: Uuid, options: RemoveOptions) -> AppResult<()> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.remove(session_id, options).await
    }

    async fn get(&self, session_id: Uuid) -> AppResult<Sandbox> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.get(session_id).await
    }

    async fn get_secret(&self, session_id: Uuid) -> AppResult<String> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.get_secret(session_id).await
    }

    async fn list(&self) -> AppResult<Vec<Sandbox>> {
        let mut all = Vec::new();
        for entry in self.providers.iter() {
            if let Ok(mut items) = entry.value().provider.list().await {
                all.append(&mut items);
            }
        }
        Ok(all)
    }

    async fn exec(
        &self,
        session_id: Uuid,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> AppResult<ExecResult> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.exec(session_id, argv, options).await
    }

    async fn attach(&self, session_id: Uuid, options: AttachOptions) -> AppResult<Box<dyn Pty>> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.attach(session_id, options).await
    }

    async fn exec_stream(
        &self,
        session_id: Uuid,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> AppResult<Box<dyn ExecStream>> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.exec_stream(session_id, argv, options).await
    }

    async fn http_client(&self, session_id: Uuid) -> AppResult<SandboxHttpClient> {
        let entry = self.provider_for_session(session_id).await?;
        entry.provider.http_client(session_id).await
    }

    fn watch(&self) -> BoxStream<'static, StateEvent> {
        let streams: Vec<_> = self
            .providers
            .iter()
            .map(|entry| entry.value().provider.watch())
            .collect();
        Box::pin(stream::select_all(streams))
    }
}

/// Picks a standalone Docker connector (no VM layer) honouring `DOCKER_HOST`,
/// used when `CONTAINER_RUNTIME=docker` (§6).
pub fn local_connector() -> LocalDockerConnector {
    LocalDockerConnector {
        host: DOCKER_HOST.clone(),
    }
}
