//! Completion Dispatcher (C9, SPEC_FULL.md §4.9).
//!
//! Grounded on the teacher's `stream_logs` in `runtime/vm.rs`: buffer a
//! `bytes_stream()` and split on newlines, rather than pulling in a
//! dedicated SSE-client crate for a stream we only need to read forward
//! through once. Each line is assembled into `event:`/`data:` pairs, which
//! is the whole of the framing an SSE body in the `GET /chat?stream` shape
//! uses.

use crate::broker::EventBroker;
use crate::error::{AppError, AppResult};
use crate::sandbox::SandboxProvider;
use crate::store::models::{Message, SessionStatus};
use crate::store::Store;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiMessage {
    pub role: String,
    #[serde(default)]
    pub parts: Value,
}

struct InFlight {
    completion_id: Uuid,
    cancel: CancellationToken,
}

/// Enforces "at most one completion in flight per session" and relays the
/// sandbox's own chat stream into persisted message parts.
pub struct CompletionDispatcher {
    store: Arc<dyn Store>,
    provider: Arc<dyn SandboxProvider>,
    broker: Arc<EventBroker>,
    inflight: DashMap<Uuid, Arc<InFlight>>,
}

impl CompletionDispatcher {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn SandboxProvider>, broker: Arc<EventBroker>) -> Self {
        Self {
            store,
            provider,
            broker,
            inflight: DashMap::new(),
        }
    }

    /// CASes the session `ready -> running` and spawns the relay task.
    /// Returns the new completion's id, or [`AppError::CompletionInProgress`]
    /// carrying the id already running (§8 property 1).
    pub async fn start(
        self: &Arc<Self>,
        session_id: Uuid,
        messages: Vec<UiMessage>,
    ) -> AppResult<Uuid> {
        let completion_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        // Claim the in-flight slot before the CAS rather than after: a
        // `DashMap::entry` call locks the shard for the match below, so a
        // concurrent second caller either observes our marker here (and
        // reports our `completion_id`) or wins the race itself -- there is
        // no window where the CAS has succeeded but no marker is visible
        // yet (§8 property 1, scenario S2).
        match self.inflight.entry(session_id) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return Err(AppError::CompletionInProgress {
                    completion_id: existing.get().completion_id,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(InFlight {
                    completion_id,
                    cancel: cancel.clone(),
                }));
            }
        }

        let swapped = match self
            .store
            .cas_session_status(session_id, SessionStatus::Ready, SessionStatus::Running)
            .await
        {
            Ok(swapped) => swapped,
            Err(e) => {
                self.inflight.remove(&session_id);
                return Err(e);
            }
        };
        if !swapped {
            // Session wasn't actually `ready` (e.g. still starting up, or
            // already stopped) -- release the marker we optimistically
            // claimed above.
            self.inflight.remove(&session_id);
            return Err(AppError::NotRunning);
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(session_id, completion_id, messages, cancel).await;
        });

        Ok(completion_id)
    }

    /// Cancels the in-flight completion for `session_id`, if any, and waits
    /// for the relay task to acknowledge by removing its own entry. Used
    /// both by the public `/chat/cancel` route and by the lifecycle engine
    /// when a sandbox dies out from under a running completion.
    pub async fn cancel_for_session(&self, session_id: Uuid) {
        if let Some(entry) = self.inflight.get(&session_id) {
            entry.cancel.cancel();
        }
    }

    /// Public cancel entry point: returns whether a completion was actually
    /// cancelled (for the 200 vs 409 distinction in the HTTP route).
    pub async fn cancel(&self, session_id: Uuid) -> bool {
        let cancel = match self.inflight.get(&session_id) {
            Some(entry) => entry.cancel.clone(),
            None => return false,
        };
        cancel.cancel();
        true
    }

    pub fn is_running(&self, session_id: Uuid) -> Option<Uuid> {
        self.inflight.get(&session_id).map(|e| e.completion_id)
    }

    async fn drive(
        self: Arc<Self>,
        session_id: Uuid,
        completion_id: Uuid,
        messages: Vec<UiMessage>,
        cancel: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            res = self.run_completion(session_id, completion_id, &messages) => res,
        };

        let project_id = match self.store.get_session(session_id).await {
            Ok(s) => s.project_id,
            Err(_) => {
                self.inflight.remove(&session_id);
                return;
            }
        };

        match result {
            Ok(()) => {
                let _ = self
                    .store
                    .cas_session_status(session_id, SessionStatus::Running, SessionStatus::Ready)
                    .await;
                self.broker
                    .publish(
                        project_id,
                        "completion.finished",
                        json!({"sessionId": session_id, "completionId": completion_id}),
                    )
                    .await;
            }
            Err(AppError::Cancelled) => {
                self.best_effort_cancel_sandbox(session_id).await;
                let _ = self
                    .store
                    .cas_session_status(session_id, SessionStatus::Running, SessionStatus::Ready)
                    .await;
                self.broker
                    .publish(
                        project_id,
                        "completion.finished",
                        json!({"sessionId": session_id, "completionId": completion_id, "cancelled": true}),
                    )
                    .await;
            }
            Err(e) => {
                self.best_effort_cancel_sandbox(session_id).await;
                let _ = self
                    .store
                    .cas_session_status(session_id, SessionStatus::Running, SessionStatus::Ready)
                    .await;
                self.broker
                    .publish(
                        project_id,
                        "completion.error",
                        json!({"sessionId": session_id, "completionId": completion_id, "error": e.to_string()}),
                    )
                    .await;
            }
        }

        self.inflight.remove(&session_id);
    }

    async fn best_effort_cancel_sandbox(&self, session_id: Uuid) {
        if let Ok(http) = self.provider.http_client(session_id).await {
            let _ = http
                .client
                .post(http.url("/chat/cancel"))
                .send()
                .await;
        }
    }

    async fn run_completion(
        &self,
        session_id: Uuid,
        completion_id: Uuid,
        messages: &[UiMessage],
    ) -> AppResult<()> {
        let http = self.provider.http_client(session_id).await?;

        let started: Value = http
            .client
            .post(http.url("/chat"))
            .json(&json!({"messages": messages}))
            .send()
            .await
            .map_err(|e| AppError::Message(e.to_string()))?
            .json()
            .await
            .map_err(|e| AppError::Message(e.to_string()))?;
        tracing::debug!(%session_id, %completion_id, response = %started, "sandbox accepted chat request");

        let response = http
            .client
            .get(http.url("/chat?stream=true"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| AppError::Message(e.to_string()))?
            .error_for_status()
            .map_err(|e| AppError::Message(e.to_string()))?;

        let message = self
            .store
            .append_message(&Message {
                id: Uuid::new_v4(),
                session_id,
                ordinal: next_ordinal(&self.store, session_id).await?,
                role: "assistant".to_string(),
                parts: json!([]),
                created_at: chrono::Utc::now(),
            })
            .await?;

        let mut parts: Vec<Value> = Vec::new();
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut event_name = String::new();
        let mut data_lines: Vec<String> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AppError::Message(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line_bytes = buffer.drain(..=pos).collect::<Vec<u8>>();
                let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len().saturating_sub(1)])
                    .trim_end_matches('\r')
                    .to_string();

                if line.is_empty() {
                    if !data_lines.is_empty() || !event_name.is_empty() {
                        let data = data_lines.join("\n");
                        if apply_sse_event(&event_name, &data, &mut parts) {
                            self.store
                                .update_message_parts(message.id, &json!(parts))
                                .await?;
                        }
                        if event_name == "finish" {
                            return Ok(());
                        }
                    }
                    event_name.clear();
                    data_lines.clear();
                    continue;
                }

                if let Some(rest) = line.strip_prefix("event:") {
                    event_name = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim_start().to_string());
                }
            }
        }

        Ok(())
    }
}

async fn next_ordinal(store: &Arc<dyn Store>, session_id: Uuid) -> AppResult<i64> {
    Ok(store.list_messages(session_id).await?.len() as i64)
}

/// Applies one parsed SSE event to the in-progress `parts` array following
/// the block-id discipline from §4.9: a tool call closes any open
/// text/reasoning block before opening its own, and any subsequent text
/// opens a fresh block rather than reusing the closed one. Returns whether
/// `parts` changed and should be persisted.
fn apply_sse_event(event: &str, data: &str, parts: &mut Vec<Value>) -> bool {
    let payload: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return false,
    };

    match event {
        "text-start" | "reasoning-start" => {
            let kind = if event == "text-start" { "text" } else { "reasoning" };
            parts.push(json!({"type": kind, "id": payload.get("id"), "text": ""}));
            true
        }
        "text-delta" | "reasoning-delta" => {
            let delta = payload.get("delta").and_then(Value::as_str).unwrap_or("");
            if let Some(last) = parts.last_mut() {
                if let Some(text) = last.get_mut("text").and_then(Value::as_str) {
                    let joined = format!("{text}{delta}");
                    last["text"] = Value::String(joined);
                    return true;
                }
            }
            false
        }
        "text-end" | "reasoning-end" => true,
        "tool-input-start" => {
            parts.push(json!({
                "type": "tool-call",
                "id": payload.get("id"),
                "name": payload.get("name"),
                "state": "input-streaming",
            }));
            true
        }
        "tool-input-available" => {
            if let Some(last) = parts.last_mut() {
                last["state"] = Value::String("input-available".into());
                last["input"] = payload.get("input").cloned().unwrap_or(Value::Null);
            }
            true
        }
        "tool-output-available" => {
            if let Some(last) = parts.last_mut() {
                last["state"] = Value::String("output-available".into());
                last["output"] = payload.get("output").cloned().unwrap_or(Value::Null);
            }
            true
        }
        "tool-output-error" => {
            if let Some(last) = parts.last_mut() {
                last["state"] = Value::String("output-error".into());
                last["error"] = payload.get("error").cloned().unwrap_or(Value::Null);
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_interrupts_open_text_block_with_fresh_ids() {
        let mut parts = Vec::new();
        apply_sse_event("text-start", r#"{"id":"t1"}"#, &mut parts);
        apply_sse_event("text-delta", r#"{"delta":"hi"}"#, &mut parts);
        apply_sse_event("tool-input-start", r#"{"id":"c1","name":"grep"}"#, &mut parts);
        apply_sse_event("text-start", r#"{"id":"t2"}"#, &mut parts);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["text"], "hi");
        assert_eq!(parts[1]["type"], "tool-call");
        assert_eq!(parts[2]["id"], "t2");
    }
}
