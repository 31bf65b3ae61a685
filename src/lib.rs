pub mod auth;
pub mod broker;
pub mod completion;
pub mod composite;
pub mod config;
pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod provider_manager;
pub mod routes;
pub mod sandbox;
pub mod store;
pub mod vm;
pub mod workspace;

pub mod testing;

use std::sync::Arc;

use crate::broker::EventBroker;
use crate::completion::CompletionDispatcher;
use crate::lifecycle::SessionLifecycleEngine;
use crate::sandbox::SandboxProvider;
use crate::store::Store;
use crate::workspace::WorkspaceProvider;

/// Everything an HTTP handler needs, wired once in `main` and shared via
/// `axum::extract::State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn SandboxProvider>,
    pub workspace: Arc<WorkspaceProvider>,
    pub broker: Arc<EventBroker>,
    pub lifecycle: Arc<SessionLifecycleEngine>,
    pub completion: Arc<CompletionDispatcher>,
}
