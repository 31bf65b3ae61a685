//! Exercises the startup state machine (C8) and completion mutual exclusion
//! (C9) against the in-memory fixtures, the way the teacher's `tests/vm.rs`
//! exercises `LibvirtVmProvisioner` against `InMemoryLibvirtDriver` rather
//! than a real hypervisor.

use chrono::Utc;
use octobot::broker::EventBroker;
use octobot::completion::{CompletionDispatcher, UiMessage};
use octobot::error::AppError;
use octobot::lifecycle::SessionLifecycleEngine;
use octobot::sandbox::SandboxProvider;
use octobot::store::models::{CommitStatus, Session, SessionStatus, Workspace, WorkspaceSourceType, WorkspaceStatus};
use octobot::store::Store;
use octobot::testing::{FakeSandboxProvider, InMemoryStore};
use octobot::workspace::WorkspaceProvider;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn local_workspace(project_id: Uuid, path: &std::path::Path) -> Workspace {
    let now = Utc::now();
    Workspace {
        id: Uuid::new_v4(),
        project_id,
        source_type: WorkspaceSourceType::Local,
        path: path.display().to_string(),
        status: WorkspaceStatus::Initializing,
        current_commit: None,
        created_at: now,
        updated_at: now,
    }
}

fn new_session(project_id: Uuid, workspace_id: Uuid, status: SessionStatus) -> Session {
    let now = Utc::now();
    Session {
        id: Uuid::new_v4(),
        project_id,
        workspace_id,
        agent_id: Uuid::new_v4(),
        name: "session".to_string(),
        status,
        commit_status: CommitStatus::None,
        last_error: None,
        sandbox_id: None,
        created_at: now,
        updated_at: now,
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    provider: Arc<FakeSandboxProvider>,
    engine: Arc<SessionLifecycleEngine>,
    completion: Arc<CompletionDispatcher>,
    #[allow(dead_code)]
    workdir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeSandboxProvider::new("octobot/sandbox:test"));
    let workdir = tempfile::tempdir().unwrap();
    let workspace_root = Arc::new(WorkspaceProvider::new(workdir.path().join("sessions")));
    let broker = Arc::new(EventBroker::new(256, 3600));

    let store_dyn: Arc<dyn Store> = store.clone();
    let provider_dyn: Arc<dyn SandboxProvider> = provider.clone();
    let engine = Arc::new(SessionLifecycleEngine::new(
        store_dyn.clone(),
        provider_dyn.clone(),
        workspace_root,
        broker.clone(),
    ));
    let completion = Arc::new(CompletionDispatcher::new(store_dyn, provider_dyn, broker));
    engine.set_completion_dispatcher(completion.clone());

    Harness {
        store,
        provider,
        engine,
        completion,
        workdir,
    }
}

#[tokio::test]
async fn startup_pipeline_reaches_ready_and_creates_a_sandbox() {
    let h = harness().await;
    let project_id = Uuid::new_v4();
    let workspace = local_workspace(project_id, h.workdir.path());
    let workspace = h.store.create_workspace(&workspace).await.unwrap();
    let session = new_session(project_id, workspace.id, SessionStatus::Initializing);
    let session = h.store.create_session(&session).await.unwrap();

    let ready = h.engine.start_session(session.id).await.unwrap();
    assert_eq!(ready.status, SessionStatus::Ready);
    assert!(ready.sandbox_id.is_some());

    let sandbox = h.provider.get(session.id).await.unwrap();
    assert_eq!(sandbox.status, octobot::sandbox::SandboxStatus::Running);
}

#[tokio::test]
async fn repeated_start_on_a_ready_session_is_idempotent() {
    let h = harness().await;
    let project_id = Uuid::new_v4();
    let workspace = local_workspace(project_id, h.workdir.path());
    let workspace = h.store.create_workspace(&workspace).await.unwrap();
    let session = new_session(project_id, workspace.id, SessionStatus::Initializing);
    let session = h.store.create_session(&session).await.unwrap();

    let first = h.engine.start_session(session.id).await.unwrap();
    let second = h.engine.start_session(session.id).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.status, SessionStatus::Ready);
}

#[tokio::test]
async fn failed_sandbox_create_leaves_session_in_error_with_no_sandbox_id() {
    let h = harness().await;
    *h.provider.fail_create.lock() = true;

    let project_id = Uuid::new_v4();
    let workspace = local_workspace(project_id, h.workdir.path());
    let workspace = h.store.create_workspace(&workspace).await.unwrap();
    let session = new_session(project_id, workspace.id, SessionStatus::Initializing);
    let session = h.store.create_session(&session).await.unwrap();

    let err = h.engine.start_session(session.id).await.unwrap_err();
    assert!(matches!(err, AppError::SandboxCreateFailed(_)));

    let stored = h.store.get_session(session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Error);
    assert!(stored.sandbox_id.is_none());
}

#[tokio::test]
async fn remove_session_tears_down_the_sandbox_and_marks_removed() {
    let h = harness().await;
    let project_id = Uuid::new_v4();
    let workspace = local_workspace(project_id, h.workdir.path());
    let workspace = h.store.create_workspace(&workspace).await.unwrap();
    let session = new_session(project_id, workspace.id, SessionStatus::Initializing);
    let session = h.store.create_session(&session).await.unwrap();
    h.engine.start_session(session.id).await.unwrap();

    h.engine.remove_session(session.id, true).await.unwrap();

    let stored = h.store.get_session(session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Removed);
    assert!(h.provider.get(session.id).await.is_err());

    // Idempotent: removing an already-removed session is a no-op, not an error.
    h.engine.remove_session(session.id, true).await.unwrap();
}

#[tokio::test]
async fn boot_reconciliation_demotes_sessions_whose_sandbox_vanished() {
    let h = harness().await;
    let project_id = Uuid::new_v4();
    let workspace = local_workspace(project_id, h.workdir.path());
    let workspace = h.store.create_workspace(&workspace).await.unwrap();

    let tracked = new_session(project_id, workspace.id, SessionStatus::Initializing);
    let tracked = h.store.create_session(&tracked).await.unwrap();
    h.engine.start_session(tracked.id).await.unwrap();

    // Simulates a session the process believes is ready but whose sandbox
    // was never actually created in the provider (e.g. a crash mid-pipeline
    // in a prior process).
    let mut orphan = new_session(project_id, workspace.id, SessionStatus::Ready);
    orphan.sandbox_id = Some("gone".to_string());
    let orphan = h.store.create_session(&orphan).await.unwrap();

    h.engine.reconcile_on_boot().await.unwrap();

    let tracked_after = h.store.get_session(tracked.id).await.unwrap();
    assert_eq!(tracked_after.status, SessionStatus::Ready);

    let orphan_after = h.store.get_session(orphan.id).await.unwrap();
    assert_eq!(orphan_after.status, SessionStatus::Stopped);
    assert_eq!(orphan_after.last_error.as_deref(), Some("sandbox_missing"));
}

#[tokio::test]
async fn external_sandbox_removal_is_observed_through_the_watch_loop() {
    let h = harness().await;
    let project_id = Uuid::new_v4();
    let workspace = local_workspace(project_id, h.workdir.path());
    let workspace = h.store.create_workspace(&workspace).await.unwrap();
    let session = new_session(project_id, workspace.id, SessionStatus::Initializing);
    let session = h.store.create_session(&session).await.unwrap();
    h.engine.start_session(session.id).await.unwrap();

    h.engine.spawn_watch_loop();
    h.provider.simulate_removed(session.id);

    for _ in 0..50 {
        let stored = h.store.get_session(session.id).await.unwrap();
        if stored.status == SessionStatus::Stopped {
            assert_eq!(stored.last_error.as_deref(), Some("sandbox_failed_externally"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session was never demoted to stopped after external removal");
}

#[tokio::test]
async fn completion_dispatcher_rejects_a_second_concurrent_start() {
    let h = harness().await;
    let project_id = Uuid::new_v4();
    let workspace = local_workspace(project_id, h.workdir.path());
    let workspace = h.store.create_workspace(&workspace).await.unwrap();
    let session = new_session(project_id, workspace.id, SessionStatus::Initializing);
    let session = h.store.create_session(&session).await.unwrap();
    h.engine.start_session(session.id).await.unwrap();

    let messages = vec![UiMessage {
        role: "user".to_string(),
        parts: serde_json::json!([{"type": "text", "text": "hi"}]),
    }];

    let first = h.completion.start(session.id, messages.clone()).await.unwrap();
    let second = h.completion.start(session.id, messages).await;
    match second {
        Err(AppError::CompletionInProgress { completion_id }) => assert_eq!(completion_id, first),
        other => panic!("expected CompletionInProgress, got {other:?}"),
    }

    assert!(h.completion.cancel(session.id).await);
}
