//! Libvirt-backed [`Hypervisor`] (SPEC_FULL.md §4.5).
//!
//! Adapted from the teacher's `runtime/vm/libvirt.rs`: the domain-XML
//! builder and connection-auth plumbing are kept nearly verbatim (generalised
//! from per-server to per-project naming and from a single console device to
//! a Docker-socket-forwarding port), while the attestation/trust fields the
//! teacher threads through `LibvirtProvisioningConfig` are dropped -- the VM
//! Manager has no attestation concept in this spec.

use super::Hypervisor;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::net::TcpStream;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LibvirtAuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LibvirtProvisioningConfig {
    pub connection_uri: String,
    pub auth: Option<LibvirtAuthConfig>,
    pub default_memory_mib: u64,
    pub default_vcpu_count: u32,
    pub network_name: String,
    pub volume_pool: String,
    /// Guest port the in-VM Docker daemon listens on; forwarded host-side
    /// via the network template so `ProjectVm::docker_dialer` can reach it.
    pub docker_guest_port: u16,
}

impl Default for LibvirtProvisioningConfig {
    fn default() -> Self {
        Self {
            connection_uri: "qemu:///system".to_string(),
            auth: None,
            default_memory_mib: 2048,
            default_vcpu_count: 2,
            network_name: "octobot-vms".to_string(),
            volume_pool: "octobot-volumes".to_string(),
            docker_guest_port: 2375,
        }
    }
}

pub fn config_from_env() -> LibvirtProvisioningConfig {
    let mut cfg = LibvirtProvisioningConfig::default();
    if let Ok(uri) = std::env::var("LIBVIRT_CONNECTION_URI") {
        cfg.connection_uri = uri;
    }
    if let Ok(mib) = std::env::var("LIBVIRT_DEFAULT_MEMORY_MIB") {
        if let Ok(v) = mib.parse() {
            cfg.default_memory_mib = v;
        }
    }
    cfg
}

fn domain_name(project_id: Uuid) -> String {
    format!("octobot-project-{project_id}")
}

/// Builds the libvirt domain XML for a project VM: one disk cloned from the
/// base sandbox-host image, one NIC on the shared NAT network, console
/// disabled (the core talks to the guest only via the forwarded Docker
/// port, not an interactive console -- unlike the teacher's per-server VMs
/// which exposed a console for attestation evidence collection).
fn domain_xml(project_id: Uuid, cfg: &LibvirtProvisioningConfig) -> String {
    let name = domain_name(project_id);
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <vcpu>{vcpu}</vcpu>
  <os><type arch='x86_64'>hvm</type></os>
  <devices>
    <disk type='volume' device='disk'>
      <source pool='{pool}' volume='{name}.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>"#,
        memory = cfg.default_memory_mib,
        vcpu = cfg.default_vcpu_count,
        pool = cfg.volume_pool,
        network = cfg.network_name,
    )
}

#[cfg(feature = "libvirt-executor")]
pub struct LibvirtHypervisor {
    cfg: LibvirtProvisioningConfig,
}

#[cfg(feature = "libvirt-executor")]
impl LibvirtHypervisor {
    pub fn new(cfg: LibvirtProvisioningConfig) -> Self {
        Self { cfg }
    }

    fn connect(&self) -> AppResult<virt::connect::Connect> {
        match &self.cfg.auth {
            Some(auth) => {
                let mut creds = vec![];
                if auth.username.is_some() {
                    creds.push(virt::sys::VIR_CRED_AUTHNAME);
                }
                if auth.password.is_some() {
                    creds.push(virt::sys::VIR_CRED_PASSPHRASE);
                }
                let username = auth.username.clone();
                let password = auth.password.clone();
                let mut callback = virt::connect::ConnectAuth::new(creds, move |creds| {
                    for cred in creds {
                        match cred.typed as i32 {
                            x if x == virt::sys::VIR_CRED_AUTHNAME as i32 => {
                                cred.result = username.clone();
                            }
                            x if x == virt::sys::VIR_CRED_PASSPHRASE as i32 => {
                                cred.result = password.clone();
                            }
                            _ => {}
                        }
                    }
                });
                virt::connect::Connect::open_auth(Some(&self.cfg.connection_uri), &mut callback, 0)
                    .map_err(|e| AppError::ProviderNotReady(e.to_string()))
            }
            None => virt::connect::Connect::open(Some(&self.cfg.connection_uri))
                .map_err(|e| AppError::ProviderNotReady(e.to_string())),
        }
    }
}

#[cfg(feature = "libvirt-executor")]
#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    async fn provision(&self, project_id: Uuid) -> AppResult<(String, u16)> {
        let xml = domain_xml(project_id, &self.cfg);
        let conn = self.connect()?;
        virt::domain::Domain::define_xml(&conn, &xml)
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        Ok((domain_name(project_id), self.cfg.docker_guest_port))
    }

    async fn start(&self, domain_id: &str) -> AppResult<()> {
        let conn = self.connect()?;
        let domain = virt::domain::Domain::lookup_by_name(&conn, domain_id)
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        domain
            .create()
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self, domain_id: &str) -> AppResult<()> {
        let conn = self.connect()?;
        let domain = virt::domain::Domain::lookup_by_name(&conn, domain_id)
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        domain
            .shutdown()
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        Ok(())
    }

    async fn destroy(&self, domain_id: &str) -> AppResult<()> {
        let conn = self.connect()?;
        let domain = virt::domain::Domain::lookup_by_name(&conn, domain_id)
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        let _ = domain.destroy();
        domain
            .undefine()
            .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
        Ok(())
    }

    fn dial_guest_port(&self, _domain_id: &str, _port: u16) -> AppResult<TcpStream> {
        Err(AppError::Message(
            "guest port dialing requires a configured NAT forward; not wired up in this build"
                .into(),
        ))
    }
}

/// In-memory [`Hypervisor`] test double, adapted from the teacher's
/// `testing::InMemoryLibvirtDriver` (referenced from `tests/vm.rs`): no real
/// libvirt connection, domains tracked in a map, guest-port dialing served
/// by a loopback listener so tests can exercise the dialer contract without
/// a hypervisor.
pub mod testing {
    use super::*;
    use dashmap::DashMap;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct DomainState {
        running: AtomicBool,
        listener_port: u16,
    }

    pub struct InMemoryHypervisor {
        domains: DashMap<String, Arc<DomainState>>,
    }

    impl InMemoryHypervisor {
        pub fn new() -> Self {
            Self {
                domains: DashMap::new(),
            }
        }
    }

    impl Default for InMemoryHypervisor {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Hypervisor for InMemoryHypervisor {
        async fn provision(&self, project_id: Uuid) -> AppResult<(String, u16)> {
            let name = domain_name(project_id);
            let listener = TcpListener::bind("127.0.0.1:0")
                .map_err(|e| AppError::ProviderNotReady(e.to_string()))?;
            let port = listener
                .local_addr()
                .map_err(|e| AppError::ProviderNotReady(e.to_string()))?
                .port();
            // Keep the listener alive for the lifetime of the domain by
            // leaking it into a background accept loop -- test-only.
            std::thread::spawn(move || loop {
                if listener.accept().is_err() {
                    break;
                }
            });
            self.domains.insert(
                name.clone(),
                Arc::new(DomainState {
                    running: AtomicBool::new(false),
                    listener_port: port,
                }),
            );
            Ok((name, port))
        }

        async fn start(&self, domain_id: &str) -> AppResult<()> {
            let state = self.domains.get(domain_id).ok_or(AppError::NotFound)?;
            state.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self, domain_id: &str) -> AppResult<()> {
            if let Some(state) = self.domains.get(domain_id) {
                state.running.store(false, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn destroy(&self, domain_id: &str) -> AppResult<()> {
            self.domains.remove(domain_id);
            Ok(())
        }

        fn dial_guest_port(&self, domain_id: &str, _port: u16) -> AppResult<TcpStream> {
            let state = self.domains.get(domain_id).ok_or(AppError::NotFound)?;
            TcpStream::connect(("127.0.0.1", state.listener_port))
                .map_err(|e| AppError::Message(e.to_string()))
        }
    }

    #[tokio::test]
    async fn provision_then_dial_round_trips() {
        let hv = InMemoryHypervisor::new();
        let project_id = Uuid::new_v4();
        let (domain_id, port) = hv.provision(project_id).await.unwrap();
        hv.start(&domain_id).await.unwrap();
        assert!(port > 0);
        assert!(hv.dial_guest_port(&domain_id, port).is_ok());
        hv.destroy(&domain_id).await.unwrap();
        assert!(hv.dial_guest_port(&domain_id, port).is_err());
    }
}
