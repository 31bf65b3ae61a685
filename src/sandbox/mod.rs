//! Sandbox Provider Interface (C3, SPEC_FULL.md §4.3).
//!
//! One object-safe trait implemented by [`docker::DockerProvider`],
//! `crate::composite::VmDockerComposite` and `crate::provider_manager::ProviderManager`,
//! so the lifecycle engine and completion dispatcher hold a single
//! `Arc<dyn SandboxProvider>` regardless of which concrete backend is
//! active -- mirroring the teacher's `ContainerRuntime`/`RuntimeExecutor`
//! split in `runtime.rs`.

pub mod docker;

use crate::error::AppResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    Created,
    Running,
    Stopped,
    Failed,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub session_id: Uuid,
    pub status: SandboxStatus,
    pub image: String,
    pub ports: Vec<u16>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub memory_mb: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub disk_mb: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub labels: HashMap<String, String>,
    pub project_id: Uuid,
    pub shared_secret: String,
    pub workspace_path: String,
    pub workspace_source: String,
    pub workspace_commit: Option<String>,
    pub resources: ResourceLimits,
    /// Decrypted credential secrets to expose as environment variables,
    /// already named per the project's stored `provider` (§3, §4.11).
    /// Decryption happens once, here, at create time -- a sandbox's
    /// environment is the only place a secret is ever materialised in
    /// plaintext.
    pub credential_env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    pub remove_volumes: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A chunk from a running [`SandboxProvider::exec_stream`], tagged by which
/// descriptor it came from so callers don't need a PTY to tell stdout from
/// stderr apart.
#[derive(Debug, Clone)]
pub enum ExecStreamChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// A non-PTY exec stream: separate stdout/stderr, a half-close for stdin,
/// and a final exit code -- the `ExecStream` op from §4.3, distinct from
/// `Attach` in that no terminal is allocated and no data is mutated (no
/// line-ending translation, no echo).
#[async_trait]
pub trait ExecStream: Send {
    async fn next_chunk(&mut self) -> AppResult<Option<ExecStreamChunk>>;
    async fn write_stdin(&mut self, data: &[u8]) -> AppResult<()>;
    async fn close_write(&mut self) -> AppResult<()>;
    async fn wait(&mut self) -> AppResult<i64>;
}

#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub cols: u16,
    pub rows: u16,
}

/// A bidirectional pseudo-terminal into a running sandbox. Closed when the
/// sandbox stops.
#[async_trait]
pub trait Pty: Send {
    async fn read(&mut self) -> AppResult<Vec<u8>>;
    async fn write(&mut self, data: &[u8]) -> AppResult<()>;
    async fn resize(&mut self, cols: u16, rows: u16) -> AppResult<()>;
    async fn close(&mut self) -> AppResult<()>;
    async fn wait(&mut self) -> AppResult<i64>;
}

/// An HTTP client already pointed at a session's sandbox, returned by
/// `SandboxProvider::http_client`. Kept as a small wrapper rather than a
/// bare `reqwest::Client` so callers (the completion dispatcher, §4.9) don't
/// need to separately track the sandbox's base URL.
#[derive(Debug, Clone)]
pub struct SandboxHttpClient {
    pub client: reqwest::Client,
    pub base_url: String,
}

impl SandboxHttpClient {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Debug, Clone)]
pub enum StateEvent {
    Status {
        sandbox_id: String,
        session_id: Uuid,
        status: SandboxStatus,
    },
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn image_exists(&self) -> AppResult<bool>;
    fn image(&self) -> String;

    async fn create(&self, session_id: Uuid, options: CreateOptions) -> AppResult<Sandbox>;
    async fn start(&self, session_id: Uuid) -> AppResult<()>;
    async fn stop(&self, session_id: Uuid, timeout_secs: u64) -> AppResult<()>;
    async fn remove(&self, session_id: Uuid, options: RemoveOptions) -> AppResult<()>;
    async fn get(&self, session_id: Uuid) -> AppResult<Sandbox>;
    async fn get_secret(&self, session_id: Uuid) -> AppResult<String>;
    async fn list(&self) -> AppResult<Vec<Sandbox>>;

    async fn exec(
        &self,
        session_id: Uuid,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> AppResult<ExecResult>;
    async fn attach(
        &self,
        session_id: Uuid,
        options: AttachOptions,
    ) -> AppResult<Box<dyn Pty>>;
    async fn exec_stream(
        &self,
        session_id: Uuid,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> AppResult<Box<dyn ExecStream>>;
    async fn http_client(&self, session_id: Uuid) -> AppResult<SandboxHttpClient>;

    fn watch(&self) -> BoxStream<'static, StateEvent>;
}
