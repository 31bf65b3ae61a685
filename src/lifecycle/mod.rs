//! Session Lifecycle Engine (C8, SPEC_FULL.md §4.8).
//!
//! Generalised from claude-in-a-box's `SessionLifecycleManager` dispatch
//! loop and the teacher's `job_queue.rs` single-flight-per-key idiom: one
//! `tokio::sync::Mutex` per session coalesces concurrent start requests into
//! a single pipeline run, and a `CancellationToken` per in-flight run lets
//! `remove_session` or process shutdown interrupt it cooperatively rather
//! than abandoning it mid-step.

use crate::auth::salted_hash;
use crate::broker::EventBroker;
use crate::completion::CompletionDispatcher;
use crate::credentials::CredentialCipher;
use crate::error::{AppError, AppResult};
use crate::sandbox::{CreateOptions, RemoveOptions, ResourceLimits, SandboxProvider, StateEvent};
use crate::store::models::{Session, SessionStatus, WorkspaceSourceType};
use crate::store::Store;
use crate::workspace::WorkspaceProvider;
use dashmap::DashMap;
use futures_util::StreamExt;
use once_cell::sync::OnceCell;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Drives sessions through the startup state machine (§3) and owns the
/// compensation logic for partially-created sandboxes. Holds a forward
/// reference to the [`CompletionDispatcher`] rather than taking one at
/// construction, since the dispatcher itself needs an `Arc<SessionLifecycleEngine>`
/// to call back into on external sandbox death -- wiring both through
/// `OnceCell` breaks the cycle without an `Option` the rest of the engine
/// would have to unwrap everywhere.
pub struct SessionLifecycleEngine {
    store: Arc<dyn Store>,
    provider: Arc<dyn SandboxProvider>,
    workspace: Arc<WorkspaceProvider>,
    broker: Arc<EventBroker>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    cancels: DashMap<Uuid, CancellationToken>,
    completion: OnceCell<Arc<CompletionDispatcher>>,
    credential_cipher: OnceCell<Arc<CredentialCipher>>,
    shutdown: CancellationToken,
}

impl SessionLifecycleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn SandboxProvider>,
        workspace: Arc<WorkspaceProvider>,
        broker: Arc<EventBroker>,
    ) -> Self {
        Self {
            store,
            provider,
            workspace,
            broker,
            locks: DashMap::new(),
            cancels: DashMap::new(),
            completion: OnceCell::new(),
            credential_cipher: OnceCell::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Completes the circular wiring with the completion dispatcher. Called
    /// exactly once during startup, before either engine handles traffic.
    pub fn set_completion_dispatcher(&self, dispatcher: Arc<CompletionDispatcher>) {
        let _ = self.completion.set(dispatcher);
    }

    /// Supplies the cipher used to decrypt stored credentials into sandbox
    /// env at create time. Left unset when `ENCRYPTION_KEY` isn't configured,
    /// in which case sessions simply start with no credential env (§4.11).
    pub fn set_credential_cipher(&self, cipher: Arc<CredentialCipher>) {
        let _ = self.credential_cipher.set(cipher);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lock_for(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn generate_shared_secret() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Fetches and decrypts the project's stored credentials, naming each
    /// `{PROVIDER}_API_KEY` in the resulting env map. A credential that fails
    /// to decrypt (e.g. `ENCRYPTION_KEY` rotated since it was sealed) is
    /// logged and skipped rather than failing the whole pipeline -- one bad
    /// secret shouldn't block a session that doesn't need it.
    async fn credential_env_for_project(&self, project_id: Uuid) -> HashMap<String, String> {
        let mut env = HashMap::new();
        let Some(cipher) = self.credential_cipher.get() else {
            return env;
        };
        let credentials = match self.store.list_credentials(project_id).await {
            Ok(creds) => creds,
            Err(e) => {
                tracing::warn!(%project_id, error = %e, "failed to list credentials");
                return env;
            }
        };
        for credential in credentials {
            match cipher.open(&credential.secret_ciphertext) {
                Ok(plaintext) => match String::from_utf8(plaintext) {
                    Ok(secret) => {
                        let key = format!("{}_API_KEY", credential.provider.to_uppercase());
                        env.insert(key, secret);
                    }
                    Err(_) => tracing::warn!(
                        %project_id,
                        credential_id = %credential.id,
                        "credential secret is not valid utf-8"
                    ),
                },
                Err(e) => tracing::warn!(
                    %project_id,
                    credential_id = %credential.id,
                    error = %e,
                    "failed to decrypt credential"
                ),
            }
        }
        env
    }

    /// Races `fut` against both the per-session cancel token and the
    /// process-wide shutdown token, returning [`AppError::Cancelled`] if
    /// either fires first.
    async fn cancellable<T>(
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
        fut: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            _ = shutdown.cancelled() => Err(AppError::Cancelled),
            res = fut => res,
        }
    }

    async fn publish_status(&self, session: &Session) {
        self.broker
            .publish(
                session.project_id,
                "session.status",
                serde_json::json!({
                    "sessionId": session.id,
                    "status": session.status,
                    "lastError": session.last_error,
                }),
            )
            .await;
    }

    /// Writes a new status with optimistic concurrency, retrying once on a
    /// lost race (§5) before giving up and surfacing the conflict.
    async fn transition(
        &self,
        session: &Session,
        status: SessionStatus,
        last_error: Option<&str>,
    ) -> AppResult<Session> {
        match self
            .store
            .set_session_status(session.id, session.updated_at, status, last_error)
            .await
        {
            Ok(updated) => {
                self.publish_status(&updated).await;
                Ok(updated)
            }
            Err(AppError::StoreConflict) => {
                let fresh = self.store.get_session(session.id).await?;
                let updated = self
                    .store
                    .set_session_status(fresh.id, fresh.updated_at, status, last_error)
                    .await?;
                self.publish_status(&updated).await;
                Ok(updated)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the cloning -> pullingImage -> creatingSandbox -> ready pipeline
    /// for a session already sitting at `entry_status`. Compensates by
    /// removing the sandbox if `start` fails or is cancelled after `create`
    /// has already succeeded -- a session never holds a sandbox id pointing
    /// at a container nobody will ever start (§8 property 3).
    async fn run_pipeline(
        &self,
        session_id: Uuid,
        cancel: &CancellationToken,
    ) -> AppResult<Session> {
        let session = self.store.get_session(session_id).await?;
        let workspace = self.store.get_workspace(session.workspace_id).await?;

        let session = self
            .transition(&session, SessionStatus::Cloning, None)
            .await?;
        let workspace_ref = workspace.clone();
        Self::cancellable(cancel, &self.shutdown, async {
            self.workspace.ensure(&workspace_ref).await.map(|_| ())
        })
        .await
        .map_err(|e| match e {
            AppError::Cancelled => e,
            other => AppError::WorkspaceCloneFailed(other.to_string()),
        })?;

        let session = self
            .transition(&session, SessionStatus::PullingImage, None)
            .await?;
        let ready = Self::cancellable(cancel, &self.shutdown, async {
            self.provider.image_exists().await
        })
        .await?;
        if !ready {
            return Err(AppError::ImagePullFailed(
                "configured sandbox image is not available".into(),
            ));
        }

        let session = self
            .transition(&session, SessionStatus::CreatingSandbox, None)
            .await?;

        let shared_secret = Self::generate_shared_secret();
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let secret_hash = salted_hash(&salt, &shared_secret);

        let mut labels = HashMap::new();
        labels.insert("octobot.session_id".to_string(), session.id.to_string());
        labels.insert("octobot.project_id".to_string(), session.project_id.to_string());

        let credential_env = self.credential_env_for_project(session.project_id).await;

        let create_options = CreateOptions {
            labels,
            project_id: session.project_id,
            shared_secret: secret_hash,
            workspace_path: workspace.path.clone(),
            workspace_source: match workspace.source_type {
                WorkspaceSourceType::Local => "local".to_string(),
                WorkspaceSourceType::Git => "git".to_string(),
            },
            workspace_commit: workspace.current_commit.clone(),
            resources: ResourceLimits::default(),
            credential_env,
        };

        let sandbox = Self::cancellable(cancel, &self.shutdown, async {
            self.provider.create(session.id, create_options).await
        })
        .await
        .map_err(|e| match e {
            AppError::Cancelled => e,
            other => AppError::SandboxCreateFailed(other.to_string()),
        })?;
        self.store
            .set_session_sandbox_id(session.id, Some(&sandbox.id))
            .await?;

        let start_result = Self::cancellable(cancel, &self.shutdown, async {
            self.provider.start(session.id).await
        })
        .await;

        if let Err(e) = start_result {
            tracing::warn!(session_id = %session.id, error = %e, "compensating: removing sandbox after failed start");
            if let Err(remove_err) = self
                .provider
                .remove(session.id, RemoveOptions::default())
                .await
            {
                tracing::warn!(session_id = %session.id, error = %remove_err, "compensation removal also failed");
            }
            self.store.set_session_sandbox_id(session.id, None).await?;
            return Err(match e {
                AppError::Cancelled => e,
                other => AppError::SandboxStartFailed(other.to_string()),
            });
        }

        self.transition(&session, SessionStatus::Ready, None).await
    }

    /// Coalesces concurrent callers for the same session into a single
    /// pipeline run: the second caller to arrive while a run is already in
    /// flight blocks on the same lock and observes its outcome rather than
    /// racing a second create against the provider (§8 property 1 analogue
    /// for startup).
    async fn run_named(
        self: &Arc<Self>,
        session_id: Uuid,
        entry_status: SessionStatus,
    ) -> AppResult<Session> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let session = self.store.get_session(session_id).await?;
        if matches!(session.status, SessionStatus::Removing | SessionStatus::Removed) {
            return Err(AppError::BadRequest(
                "session is being removed".into(),
            ));
        }
        if session.status.startup_rank() == Some(4) {
            // Already ready/running: idempotent coalesce outcome, no rerun.
            return Ok(session);
        }

        let session = if session.status != entry_status {
            self.transition(&session, entry_status, None).await?
        } else {
            session
        };

        let cancel = CancellationToken::new();
        self.cancels.insert(session_id, cancel.clone());
        let result = self.run_pipeline(session_id, &cancel).await;
        self.cancels.remove(&session_id);

        match result {
            Ok(session) => Ok(session),
            Err(AppError::Cancelled) => {
                // `remove_session` owns the terminal transition when the
                // cancellation was remove-triggered; only mark `error` when
                // it was shutdown-triggered and removal isn't already
                // underway.
                let fresh = self.store.get_session(session_id).await?;
                if matches!(fresh.status, SessionStatus::Removing | SessionStatus::Removed) {
                    Err(AppError::Cancelled)
                } else {
                    let updated = self
                        .transition(&fresh, SessionStatus::Error, Some("startup cancelled"))
                        .await?;
                    let _ = updated;
                    Err(AppError::Cancelled)
                }
            }
            Err(e) => {
                let fresh = self.store.get_session(session_id).await?;
                self.transition(&fresh, SessionStatus::Error, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn start_session(self: &Arc<Self>, session_id: Uuid) -> AppResult<Session> {
        self.run_named(session_id, SessionStatus::Initializing).await
    }

    /// Discards prior conversation history before rerunning the pipeline --
    /// the open-question resolution recorded in DESIGN.md: a
    /// `Reinitialize` throws away messages rather than trying to replay
    /// them into a fresh sandbox.
    pub async fn reinit_session(self: &Arc<Self>, session_id: Uuid) -> AppResult<Session> {
        self.store.clear_messages(session_id).await?;
        self.run_named(session_id, SessionStatus::Reinitializing).await
    }

    pub fn spawn_start(self: &Arc<Self>, session_id: Uuid) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.start_session(session_id).await {
                tracing::warn!(%session_id, error = %e, "session start failed");
            }
        });
    }

    pub fn spawn_reinit(self: &Arc<Self>, session_id: Uuid) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.reinit_session(session_id).await {
                tracing::warn!(%session_id, error = %e, "session reinit failed");
            }
        });
    }

    pub fn spawn_remove(self: &Arc<Self>, session_id: Uuid, remove_volumes: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.remove_session(session_id, remove_volumes).await {
                tracing::warn!(%session_id, error = %e, "session removal failed");
            }
        });
    }

    /// Removal takes priority over any in-flight startup pipeline: cancel
    /// it, wait for it to unwind via the same per-session lock, cancel any
    /// in-flight completion, then tear down the sandbox. Idempotent --
    /// repeated calls against an already-removed session are a no-op.
    pub async fn remove_session(
        self: &Arc<Self>,
        session_id: Uuid,
        remove_volumes: bool,
    ) -> AppResult<()> {
        if let Some(cancel) = self.cancels.get(&session_id) {
            cancel.cancel();
        }

        let session = self.store.get_session(session_id).await?;
        if session.status == SessionStatus::Removed {
            return Ok(());
        }
        if session.status != SessionStatus::Removing {
            self.transition(&session, SessionStatus::Removing, None)
                .await?;
        }

        // Blocks until any in-flight pipeline run has observed the cancel
        // and released the lock.
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        if let Some(dispatcher) = self.completion.get() {
            dispatcher.cancel_for_session(session_id).await;
        }

        match self
            .provider
            .remove(session_id, RemoveOptions { remove_volumes })
            .await
        {
            Ok(()) | Err(AppError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let session = self.store.get_session(session_id).await?;
        self.transition(&session, SessionStatus::Removed, None)
            .await?;
        self.locks.remove(&session_id);
        Ok(())
    }

    /// Checks every session this process believes is `ready`/`running`
    /// against the provider's actual view on startup, demoting any whose
    /// sandbox has disappeared underneath it (§8 property 7, scenario S5).
    pub async fn reconcile_on_boot(self: &Arc<Self>) -> AppResult<()> {
        let mut sessions = self.store.list_sessions_by_status(SessionStatus::Ready).await?;
        sessions.extend(
            self.store
                .list_sessions_by_status(SessionStatus::Running)
                .await?,
        );

        for session in sessions {
            let missing = match self.provider.get(session.id).await {
                Ok(sandbox) => !matches!(
                    sandbox.status,
                    crate::sandbox::SandboxStatus::Running | crate::sandbox::SandboxStatus::Created
                ),
                Err(AppError::NotFound) => true,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "boot reconciliation check failed");
                    continue;
                }
            };
            if missing {
                if let Some(dispatcher) = self.completion.get() {
                    dispatcher.cancel_for_session(session.id).await;
                }
                if let Err(e) = self
                    .transition(&session, SessionStatus::Stopped, Some("sandbox_missing"))
                    .await
                {
                    tracing::warn!(session_id = %session.id, error = %e, "failed to mark session stopped during boot reconciliation");
                }
            }
        }
        Ok(())
    }

    /// Watches the provider's external status stream for sandboxes that die
    /// or vanish outside of any lifecycle-owned operation (e.g. an operator
    /// running `docker rm` by hand), transitioning the owning session to
    /// `stopped` and cancelling any in-flight completion (§8 property 7,
    /// scenario S6).
    pub fn spawn_watch_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut events = this.provider.watch();
            while let Some(event) = events.next().await {
                let StateEvent::Status { session_id, status, .. } = event;
                if !matches!(
                    status,
                    crate::sandbox::SandboxStatus::Removed | crate::sandbox::SandboxStatus::Failed
                ) {
                    continue;
                }
                let Ok(session) = this.store.get_session(session_id).await else {
                    continue;
                };
                if !matches!(session.status, SessionStatus::Ready | SessionStatus::Running) {
                    continue;
                }
                if let Some(dispatcher) = this.completion.get() {
                    dispatcher.cancel_for_session(session_id).await;
                }
                let reason = if status == crate::sandbox::SandboxStatus::Failed {
                    "sandbox_failed_externally"
                } else {
                    "sandbox_removed_externally"
                };
                if let Err(e) = this.transition(&session, SessionStatus::Stopped, Some(reason)).await {
                    tracing::warn!(%session_id, error = %e, "failed to mark session stopped after external sandbox event");
                }
            }
        });
    }
}
