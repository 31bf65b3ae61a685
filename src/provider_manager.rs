//! Provider Manager (C7, SPEC_FULL.md §4.7).
//!
//! Generalised from the teacher's `RuntimeOrchestrator`/`RuntimePolicyEngine`
//! pair in `runtime.rs`: a name-keyed registry of providers plus a resolver
//! function picking which one a given session belongs to. Octobot runs
//! exactly one provider topology per deployment, so the resolver is supplied
//! once at construction (the lifecycle engine's session→project lookup
//! composed with a fixed provider name) rather than read from a persisted
//! per-session backend column as the teacher does.

use crate::error::{AppError, AppResult};
use crate::sandbox::{
    AttachOptions, CreateOptions, ExecOptions, ExecResult, ExecStream, Pty, RemoveOptions,
    Sandbox, SandboxHttpClient, SandboxProvider, StateEvent,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

pub type ProviderResolver = Arc<dyn Fn(Uuid) -> String + Send + Sync>;

pub struct ProviderManager {
    providers: DashMap<String, Arc<dyn SandboxProvider>>,
    default_provider: String,
    resolver: ProviderResolver,
}

impl ProviderManager {
    pub fn new(default_provider: impl Into<String>, resolver: ProviderResolver) -> Self {
        Self {
            providers: DashMap::new(),
            default_provider: default_provider.into(),
            resolver,
        }
    }

    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn SandboxProvider>) {
        self.providers.insert(name.into(), provider);
    }

    fn provider_for(&self, session_id: Uuid) -> AppResult<Arc<dyn SandboxProvider>> {
        let name = (self.resolver)(session_id);
        self.providers
            .get(&name)
            .map(|p| p.clone())
            .or_else(|| self.providers.get(&self.default_provider).map(|p| p.clone()))
            .ok_or_else(|| AppError::ProviderNotReady(format!("no provider registered as {name}")))
    }
}

#[async_trait]
impl SandboxProvider for ProviderManager {
    async fn image_exists(&self) -> AppResult<bool> {
        self.providers
            .get(&self.default_provider)
            .ok_or(AppError::ProviderNotReady("no default provider".into()))?
            .image_exists()
            .await
    }

    fn image(&self) -> String {
        self.providers
            .get(&self.default_provider)
            .map(|p| p.image())
            .unwrap_or_default()
    }

    async fn create(&self, session_id: Uuid, options: CreateOptions) -> AppResult<Sandbox> {
        self.provider_for(session_id)?.create(session_id, options).await
    }

    async fn start(&self, session_id: Uuid) -> AppResult<()> {
        self.provider_for(session_id)?.start(session_id).await
    }

    async fn stop(&self, session_id: Uuid, timeout_secs: u64) -> AppResult<()> {
        self.provider_for(session_id)?.stop(session_id, timeout_secs).await
    }

    async fn remove(&self, session_id: Uuid, options: RemoveOptions) -> AppResult<()> {
        self.provider_for(session_id)?.remove(session_id, options).await
    }

    async fn get(&self, session_id: Uuid) -> AppResult<Sandbox> {
        self.provider_for(session_id)?.get(session_id).await
    }

    async fn get_secret(&self, session_id: Uuid) -> AppResult<String> {
        self.provider_for(session_id)?.get_secret(session_id).await
    }

    async fn list(&self) -> AppResult<Vec<Sandbox>> {
        let mut all = Vec::new();
        for entry in self.providers.iter() {
            match entry.value().list().await {
                Ok(mut items) => all.append(&mut items),
                Err(e) => tracing::warn!(provider = %entry.key(), error = %e, "provider list failed"),
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
        self.provider_for(session_id)?.exec(session_id, argv, options).await
    }

    async fn attach(&self, session_id: Uuid, options: AttachOptions) -> AppResult<Box<dyn Pty>> {
        self.provider_for(session_id)?.attach(session_id, options).await
    }

    async fn exec_stream(
        &self,
        session_id: Uuid,
        argv: Vec<String>,
        options: ExecOptions,
    ) -> AppResult<Box<dyn ExecStream>> {
        self.provider_for(session_id)?
            .exec_stream(session_id, argv, options)
            .await
    }

    async fn http_client(&self, session_id: Uuid) -> AppResult<SandboxHttpClient> {
        self.provider_for(session_id)?.http_client(session_id).await
    }

    fn watch(&self) -> BoxStream<'static, StateEvent> {
        let streams: Vec<_> = self
            .providers
            .iter()
            .map(|entry| entry.value().watch())
            .collect();
        Box::pin(stream::select_all(streams))
    }
}
