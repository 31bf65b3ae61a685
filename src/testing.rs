//! Test fixtures (A7, SPEC_FULL.md §8).
//!
//! An in-memory [`Store`] and [`FakeSandboxProvider`] so the lifecycle
//! engine, completion dispatcher and broker can be exercised without a real
//! Postgres or Docker daemon, in the spirit of the teacher's
//! `tests/vm.rs::testing::InMemoryLibvirtDriver` fixture.

use crate::error::{AppError, AppResult};
use crate::sandbox::{
    AttachOptions, CreateOptions, ExecOptions, ExecResult, ExecStream, ExecStreamChunk, Pty,
    RemoveOptions, Sandbox, SandboxHttpClient, SandboxProvider, SandboxStatus, StateEvent,
};
use crate::store::models::{Agent, Credential, Message, Project, Session, SessionStatus, Workspace};
use crate::store::Store;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    projects: HashMap<Uuid, Project>,
    workspaces: HashMap<Uuid, Workspace>,
    sessions: HashMap<Uuid, Session>,
    agents: HashMap<Uuid, Agent>,
    credentials: HashMap<Uuid, Credential>,
    messages: HashMap<Uuid, Vec<Message>>,
}

pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_project(&self, name: &str) -> AppResult<Project> {
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: chrono::Utc::now(),
        };
        self.tables.lock().projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> AppResult<Project> {
        self.tables.lock().projects.get(&id).cloned().ok_or(AppError::NotFound)
    }

    async fn create_workspace(&self, w: &Workspace) -> AppResult<Workspace> {
        self.tables.lock().workspaces.insert(w.id, w.clone());
        Ok(w.clone())
    }

    async fn get_workspace(&self, id: Uuid) -> AppResult<Workspace> {
        self.tables.lock().workspaces.get(&id).cloned().ok_or(AppError::NotFound)
    }

    async fn list_workspaces(&self, project_id: Uuid) -> AppResult<Vec<Workspace>> {
        Ok(self
            .tables
            .lock()
            .workspaces
            .values()
            .filter(|w| w.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn update_workspace(&self, w: &Workspace) -> AppResult<()> {
        self.tables.lock().workspaces.insert(w.id, w.clone());
        Ok(())
    }

    async fn create_session(&self, s: &Session) -> AppResult<Session> {
        self.tables.lock().sessions.insert(s.id, s.clone());
        Ok(s.clone())
    }

    async fn get_session(&self, id: Uuid) -> AppResult<Session> {
        self.tables.lock().sessions.get(&id).cloned().ok_or(AppError::NotFound)
    }

    async fn list_sessions(&self, workspace_id: Uuid) -> AppResult<Vec<Session>> {
        Ok(self
            .tables
            .lock()
            .sessions
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn list_sessions_by_status(&self, status: SessionStatus) -> AppResult<Vec<Session>> {
        Ok(self
            .tables
            .lock()
            .sessions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn set_session_status(
        &self,
        id: Uuid,
        expected_updated_at: chrono::DateTime<chrono::Utc>,
        status: SessionStatus,
        last_error: Option<&str>,
    ) -> AppResult<Session> {
        let mut tables = self.tables.lock();
        let session = tables.sessions.get_mut(&id).ok_or(AppError::NotFound)?;
        if session.updated_at != expected_updated_at {
            return Err(AppError::StoreConflict);
        }
        session.status = status;
        session.last_error = last_error.map(str::to_string);
        session.updated_at = chrono::Utc::now();
        Ok(session.clone())
    }

    async fn cas_session_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> AppResult<bool> {
        let mut tables = self.tables.lock();
        let Some(session) = tables.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if session.status == from {
            session.status = to;
            session.updated_at = chrono::Utc::now();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn set_session_sandbox_id(&self, id: Uuid, sandbox_id: Option<&str>) -> AppResult<()> {
        let mut tables = self.tables.lock();
        let session = tables.sessions.get_mut(&id).ok_or(AppError::NotFound)?;
        session.sandbox_id = sandbox_id.map(str::to_string);
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> AppResult<()> {
        self.tables.lock().sessions.remove(&id);
        Ok(())
    }

    async fn create_agent(&self, a: &Agent) -> AppResult<Agent> {
        self.tables.lock().agents.insert(a.id, a.clone());
        Ok(a.clone())
    }

    async fn get_agent(&self, id: Uuid) -> AppResult<Agent> {
        self.tables.lock().agents.get(&id).cloned().ok_or(AppError::NotFound)
    }

    async fn create_credential(&self, c: &Credential) -> AppResult<Credential> {
        self.tables.lock().credentials.insert(c.id, c.clone());
        Ok(c.clone())
    }

    async fn get_credential(&self, id: Uuid) -> AppResult<Credential> {
        self.tables.lock().credentials.get(&id).cloned().ok_or(AppError::NotFound)
    }

    async fn list_credentials(&self, project_id: Uuid) -> AppResult<Vec<Credential>> {
        Ok(self
            .tables
            .lock()
            .credentials
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn append_message(&self, m: &Message) -> AppResult<Message> {
        self.tables
            .lock()
            .messages
            .entry(m.session_id)
            .or_default()
            .push(m.clone());
        Ok(m.clone())
    }

    async fn update_message_parts(&self, id: Uuid, parts: &serde_json::Value) -> AppResult<()> {
        let mut tables = self.tables.lock();
        for messages in tables.messages.values_mut() {
            if let Some(m) = messages.iter_mut().find(|m| m.id == id) {
                m.parts = parts.clone();
                return Ok(());
            }
        }
        Err(AppError::NotFound)
    }

    async fn list_messages(&self, session_id: Uuid) -> AppResult<Vec<Message>> {
        Ok(self
            .tables
            .lock()
            .messages
            .get(&session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_messages(&self, session_id: Uuid) -> AppResult<()> {
        self.tables.lock().messages.remove(&session_id);
        Ok(())
    }
}

/// In-memory [`SandboxProvider`], grounded on the teacher's
/// `testing::InMemoryLibvirtDriver` pattern. Every operation is
/// instantaneous and deterministic so lifecycle/completion tests don't need
/// a real daemon.
pub struct FakeSandboxProvider {
    image: String,
    sandboxes: Mutex<HashMap<Uuid, Sandbox>>,
    events: broadcast::Sender<StateEvent>,
    pub fail_create: Mutex<bool>,
    pub fail_image_exists: Mutex<bool>,
}

impl FakeSandboxProvider {
    pub fn new(image: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            image: image.into(),
            sandboxes: Mutex::new(HashMap::new()),
            events,
            fail_create: Mutex::new(false),
            fail_image_exists: Mutex::new(false),
        }
    }

    /// Test hook simulating an external sandbox death (§8 scenario S6): the
    /// watch loop only reacts to `Failed`/`Removed`, so this reports
    /// `Failed` rather than `Stopped` (a provider never reports an orderly
    /// shutdown as a `StateEvent`, only an unexpected one).
    pub fn simulate_removed(&self, session_id: Uuid) {
        let mut sandboxes = self.sandboxes.lock();
        if let Some(sandbox) = sandboxes.get_mut(&session_id) {
            sandbox.status = SandboxStatus::Failed;
            let _ = self.events.send(StateEvent::Status {
                sandbox_id: sandbox.id.clone(),
                session_id,
                status: SandboxStatus::Failed,
            });
        } else {
            sandboxes.remove(&session_id);
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeSandboxProvider {
    async fn image_exists(&self) -> AppResult<bool> {
        Ok(!*self.fail_image_exists.lock())
    }

    fn image(&self) -> String {
        self.image.clone()
    }

    async fn create(&self, session_id: Uuid, options: CreateOptions) -> AppResult<Sandbox> {
        if *self.fail_create.lock() {
            return Err(AppError::SandboxCreateFailed("fake failure".into()));
        }
        let sandbox = Sandbox {
            id: format!("fake-{session_id}"),
            session_id,
            status: SandboxStatus::Created,
            image: self.image.clone(),
            ports: vec![18080],
            env: [("OCTOBOT_SECRET".to_string(), options.shared_secret)]
                .into_iter()
                .collect(),
        };
        self.sandboxes.lock().insert(session_id, sandbox.clone());
        let _ = self.events.send(StateEvent::Status {
            sandbox_id: sandbox.id.clone(),
            session_id,
            status: SandboxStatus::Created,
        });
        Ok(sandbox)
    }

    async fn start(&self, session_id: Uuid) -> AppResult<()> {
        let mut sandboxes = self.sandboxes.lock();
        let sandbox = sandboxes.get_mut(&session_id).ok_or(AppError::NotFound)?;
        sandbox.status = SandboxStatus::Running;
        let _ = self.events.send(StateEvent::Status {
            sandbox_id: sandbox.id.clone(),
            session_id,
            status: SandboxStatus::Running,
        });
        Ok(())
    }

    async fn stop(&self, session_id: Uuid, _timeout_secs: u64) -> AppResult<()> {
        let mut sandboxes = self.sandboxes.lock();
        if let Some(sandbox) = sandboxes.get_mut(&session_id) {
            sandbox.status = SandboxStatus::Stopped;
        }
        Ok(())
    }

    async fn remove(&self, session_id: Uuid, _options: RemoveOptions) -> AppResult<()> {
        self.sandboxes.lock().remove(&session_id);
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> AppResult<Sandbox> {
        self.sandboxes
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn get_secret(&self, session_id: Uuid) -> AppResult<String> {
        self.sandboxes
            .lock()
            .get(&session_id)
            .and_then(|s| s.env.get("OCTOBOT_SECRET").cloned())
            .ok_or(AppError::NotFound)
    }

    async fn list(&self) -> AppResult<Vec<Sandbox>> {
        Ok(self.sandboxes.lock().values().cloned().collect())
    }

    async fn exec(
        &self,
        _session_id: Uuid,
        _argv: Vec<String>,
        _options: ExecOptions,
    ) -> AppResult<ExecResult> {
        Ok(ExecResult {
            exit_code: 0,
            stdout: vec![],
            stderr: vec![],
        })
    }

    async fn attach(&self, _session_id: Uuid, _options: AttachOptions) -> AppResult<Box<dyn Pty>> {
        Err(AppError::Message("attach not supported by fake provider".into()))
    }

    async fn exec_stream(
        &self,
        _session_id: Uuid,
        _argv: Vec<String>,
        _options: ExecOptions,
    ) -> AppResult<Box<dyn ExecStream>> {
        Ok(Box::new(FakeExecStream { done: false }))
    }

    async fn http_client(&self, session_id: Uuid) -> AppResult<SandboxHttpClient> {
        if !self.sandboxes.lock().contains_key(&session_id) {
            return Err(AppError::NotRunning);
        }
        Ok(SandboxHttpClient {
            client: reqwest::Client::new(),
            base_url: "http://127.0.0.1:0".to_string(),
        })
    }

    fn watch(&self) -> BoxStream<'static, StateEvent> {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt;
        let rx = self.events.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|r| r.ok()))
    }
}

/// Immediately-exhausted [`ExecStream`] double: enough for dispatcher/routing
/// tests that only need the op to exist, not to carry real bytes.
struct FakeExecStream {
    done: bool,
}

#[async_trait]
impl ExecStream for FakeExecStream {
    async fn next_chunk(&mut self) -> AppResult<Option<ExecStreamChunk>> {
        if self.done {
            Ok(None)
        } else {
            self.done = true;
            Ok(Some(ExecStreamChunk::Stdout(vec![])))
        }
    }

    async fn write_stdin(&mut self, _data: &[u8]) -> AppResult<()> {
        Ok(())
    }

    async fn close_write(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn wait(&mut self) -> AppResult<i64> {
        Ok(0)
    }
}
