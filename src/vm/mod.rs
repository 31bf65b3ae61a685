//! VM Manager (C5, SPEC_FULL.md §4.5).
//!
//! Generalised from the teacher's `runtime/vm/libvirt.rs` `LibvirtDriver`/
//! `LibvirtVmProvisioner` split: one VM per project instead of one per
//! "MCP server", with a `DockerDialer`/`PortDialer` pair exposed instead of
//! a provisioning result carrying attestation metadata (Octobot has no
//! attestation concept -- see DESIGN.md's open-question log for why that
//! part of the teacher's model is dropped rather than adapted).

pub mod libvirt;

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::TcpStream;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A running project VM's guest-dialing surface. The manager is free to
/// realise `dial_guest_port` over any transport (hypervisor socket, nested
/// TCP, named pipe); callers only depend on getting back a connected
/// `TcpStream`.
pub struct ProjectVm {
    pub project_id: Uuid,
    pub docker_port: u16,
    driver: Arc<dyn Hypervisor>,
    pub domain_id: String,
}

impl ProjectVm {
    /// Opens a connection to the Docker daemon running inside this VM.
    pub fn docker_dialer(&self) -> AppResult<TcpStream> {
        self.driver.dial_guest_port(&self.domain_id, self.docker_port)
    }

    /// Opens a connection to an arbitrary published guest port (used by the
    /// Docker Provider wrapped over this VM to reach a sandbox's exposed
    /// HTTP port, §4.6).
    pub fn port_dialer(&self, host_port: u16) -> AppResult<TcpStream> {
        self.driver.dial_guest_port(&self.domain_id, host_port)
    }
}

/// Hypervisor operations a concrete VM Manager backend must provide. The
/// real implementation (`libvirt::LibvirtHypervisor`) is feature-gated
/// behind `libvirt-executor`, matching the teacher's pattern of shipping a
/// build without the real driver compiled in by default.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn provision(&self, project_id: Uuid) -> AppResult<(String, u16)>; // (domain_id, docker_port)
    async fn start(&self, domain_id: &str) -> AppResult<()>;
    async fn shutdown(&self, domain_id: &str) -> AppResult<()>;
    async fn destroy(&self, domain_id: &str) -> AppResult<()>;
    fn dial_guest_port(&self, domain_id: &str, port: u16) -> AppResult<TcpStream>;
}

/// Maintains exactly one [`ProjectVm`] per project, materialised on first
/// demand (§4.5 invariant i).
pub struct VmManager {
    driver: Arc<dyn Hypervisor>,
    vms: DashMap<Uuid, Arc<ProjectVm>>,
    /// Serialises concurrent `get_or_create_vm` calls for the same project
    /// so only one provisioning attempt happens.
    creation_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl VmManager {
    pub fn new(driver: Arc<dyn Hypervisor>) -> Self {
        Self {
            driver,
            vms: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    pub async fn get_or_create_vm(&self, project_id: Uuid) -> AppResult<Arc<ProjectVm>> {
        if let Some(vm) = self.vms.get(&project_id) {
            return Ok(vm.clone());
        }

        let lock = self
            .creation_locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(vm) = self.vms.get(&project_id) {
            return Ok(vm.clone());
        }

        let (domain_id, docker_port) = self.driver.provision(project_id).await?;
        self.driver.start(&domain_id).await?;

        let vm = Arc::new(ProjectVm {
            project_id,
            docker_port,
            driver: self.driver.clone(),
            domain_id,
        });
        self.vms.insert(project_id, vm.clone());
        Ok(vm)
    }

    pub fn get(&self, project_id: Uuid) -> Option<Arc<ProjectVm>> {
        self.vms.get(&project_id).map(|v| v.clone())
    }

    pub async fn remove_vm(&self, project_id: Uuid) -> AppResult<()> {
        let Some((_, vm)) = self.vms.remove(&project_id) else {
            return Ok(());
        };
        self.driver.shutdown(&vm.domain_id).await?;
        self.driver.destroy(&vm.domain_id).await?;
        Ok(())
    }

    pub fn list_project_ids(&self) -> Vec<Uuid> {
        self.vms.iter().map(|e| *e.key()).collect()
    }
}

pub fn provider_not_ready(reason: impl Into<String>) -> AppError {
    AppError::ProviderNotReady(reason.into())
}
