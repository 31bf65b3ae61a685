//! HTTP edge (A5, SPEC_FULL.md §6).
//!
//! Routes mirror the teacher's `Router::new().route().merge()` layering in
//! `routes.rs`/`main.rs`, with `Extension<AppState>` taking the place of the
//! teacher's many individual `Extension<T>` layers (pool, job sender,
//! runtime, policy engine) since this crate's handlers all need the same
//! bundle together.

use crate::auth::Authenticated;
use crate::broker::Delivered;
use crate::completion::UiMessage;
use crate::error::{AppError, AppResult};
use crate::store::models::{Session, SessionStatus, Workspace, WorkspaceSourceType, WorkspaceStatus};
use crate::AppState;
use axum::extract::{Extension, Path, Query};
use axum::response::sse::{Event, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::convert::Infallible;
use uuid::Uuid;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/projects/:project_id/workspaces", get(list_workspaces).post(create_workspace))
        .route(
            "/api/projects/:project_id/workspaces/:workspace_id/sessions",
            get(list_sessions).post(create_session),
        )
        .route("/api/projects/:project_id/sessions/:session_id", delete(remove_session))
        .route("/api/projects/:project_id/sessions/:session_id/chat", get(get_chat).post(post_chat))
        .route("/api/projects/:project_id/sessions/:session_id/chat/cancel", post(cancel_chat))
        .route("/api/projects/:project_id/events", get(stream_events))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkspaceBody {
    path: String,
    source_type: WorkspaceSourceType,
}

async fn list_workspaces(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path(project_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let workspaces = state.store.list_workspaces(project_id).await?;
    Ok(Json(json!({"workspaces": workspaces})))
}

async fn create_workspace(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CreateWorkspaceBody>,
) -> AppResult<Json<Workspace>> {
    let now = Utc::now();
    let workspace = Workspace {
        id: Uuid::new_v4(),
        project_id,
        source_type: body.source_type,
        path: body.path,
        status: WorkspaceStatus::Initializing,
        current_commit: None,
        created_at: now,
        updated_at: now,
    };
    let workspace = state.store.create_workspace(&workspace).await?;

    let store = state.store.clone();
    let provider = state.workspace.clone();
    let ws = workspace.clone();
    tokio::spawn(async move {
        let mut updated = ws.clone();
        match provider.ensure(&ws).await {
            Ok(_) => {
                updated.status = WorkspaceStatus::Ready;
            }
            Err(e) => {
                tracing::warn!(workspace_id = %ws.id, error = %e, "workspace ensure failed");
                updated.status = WorkspaceStatus::Error;
            }
        }
        if let Err(e) = store.update_workspace(&updated).await {
            tracing::warn!(workspace_id = %ws.id, error = %e, "failed to persist workspace status");
        }
    });

    Ok(Json(workspace))
}

async fn list_sessions(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path((_project_id, workspace_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<serde_json::Value>> {
    let sessions = state.store.list_sessions(workspace_id).await?;
    Ok(Json(json!({"sessions": sessions})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    agent_id: Uuid,
    name: Option<String>,
}

async fn create_session(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path((project_id, workspace_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<CreateSessionBody>,
) -> AppResult<Json<Session>> {
    let now = Utc::now();
    let session = Session {
        id: Uuid::new_v4(),
        project_id,
        workspace_id,
        agent_id: body.agent_id,
        name: body.name.unwrap_or_else(|| "session".to_string()),
        status: SessionStatus::Initializing,
        commit_status: crate::store::models::CommitStatus::None,
        last_error: None,
        sandbox_id: None,
        created_at: now,
        updated_at: now,
    };
    let session = state.store.create_session(&session).await?;
    state.lifecycle.spawn_start(session.id);
    Ok(Json(session))
}

async fn remove_session(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path((_project_id, session_id)): Path<(Uuid, Uuid)>,
) -> AppResult<axum::http::StatusCode> {
    // Touches the session first so a caller removing an unknown id still
    // gets a 404 rather than a silently-accepted 202.
    state.store.get_session(session_id).await?;
    state.lifecycle.spawn_remove(session_id, true);
    Ok(axum::http::StatusCode::ACCEPTED)
}

async fn get_chat(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path((_project_id, session_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<serde_json::Value>> {
    let messages = state.store.list_messages(session_id).await?;
    Ok(Json(json!({"messages": messages})))
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    messages: Vec<UiMessage>,
}

async fn post_chat(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path((_project_id, session_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<ChatBody>,
) -> AppResult<(axum::http::StatusCode, Json<serde_json::Value>)> {
    match state.completion.start(session_id, body.messages).await {
        Ok(completion_id) => Ok((
            axum::http::StatusCode::ACCEPTED,
            Json(json!({"completionId": completion_id, "status": "started"})),
        )),
        Err(AppError::CompletionInProgress { completion_id }) => Ok((
            axum::http::StatusCode::CONFLICT,
            Json(json!({"error": "completion_in_progress", "completionId": completion_id})),
        )),
        Err(e) => Err(e),
    }
}

async fn cancel_chat(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path((_project_id, session_id)): Path<(Uuid, Uuid)>,
) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    if state.completion.cancel(session_id).await {
        (
            axum::http::StatusCode::OK,
            Json(json!({"success": true, "status": "cancelled"})),
        )
    } else {
        (
            axum::http::StatusCode::CONFLICT,
            Json(json!({"error": "not_running"})),
        )
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    since: Option<DateTime<Utc>>,
    after: Option<u64>,
}

/// Subscribes before fetching history, then deduplicates by `eventId`
/// (§4.10 "Composition with SSE") so no event can fall in the gap between
/// the historical slice and the first live message.
async fn stream_events(
    _auth: Authenticated,
    Extension(state): Extension<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let live = state.broker.subscribe(project_id).await;

    let history = if let Some(after) = query.after {
        state.broker.events_after_id(project_id, after).await
    } else {
        let since = query.since.unwrap_or_else(|| Utc::now() - chrono::Duration::hours(1));
        state.broker.events_since(project_id, since).await
    };
    let mut seen: HashSet<u64> = history.iter().map(|e| e.id).collect();

    let connected = futures_util::stream::once(async { Ok(Event::default().event("connected").data("{}")) });
    let history_stream = futures_util::stream::iter(history.into_iter().map(|e| {
        Ok(Event::default()
            .event(e.event_type.clone())
            .data(serde_json::to_string(&e).unwrap_or_default()))
    }));
    let live_stream = live.filter_map(move |item| {
        let already_seen = match &item {
            Delivered::Event(e) => !seen.insert(e.id),
            Delivered::Lagged(_) => false,
        };
        async move {
            if already_seen {
                return None;
            }
            match item {
                Delivered::Event(e) => Some(Ok(Event::default()
                    .event(e.event_type.clone())
                    .data(serde_json::to_string(&e).unwrap_or_default()))),
                Delivered::Lagged(l) => Some(Ok(Event::default()
                    .event("lagged")
                    .data(serde_json::to_string(&l).unwrap_or_default()))),
            }
        }
    });

    Sse::new(connected.chain(history_stream).chain(live_stream))
}
