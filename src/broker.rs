//! Event Broker (C10, SPEC_FULL.md §4.10).
//!
//! Generalised from the teacher's `STATUS_CHANNELS`/`METRIC_CHANNELS`
//! `DashMap<_, broadcast::Sender<_>>` registries in `servers.rs` (and
//! `POLICY_EVENT_CHANNEL` in the now-removed `policy.rs`): instead of one
//! flat broadcast channel per id, each project gets a bounded ring buffer of
//! its own history plus a `broadcast::Sender` for live fan-out, so a new
//! subscriber can replay-then-stream without a gap.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub project_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Sent to a subscriber whose receive queue overflowed, in place of the
/// events it missed (§5 backpressure policy: drop, don't block).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lagged {
    pub project_id: Uuid,
}

#[derive(Debug, Clone)]
pub enum Delivered {
    Event(Event),
    Lagged(Lagged),
}

struct ProjectLog {
    next_id: u64,
    history: VecDeque<Event>,
    sender: broadcast::Sender<Event>,
}

impl ProjectLog {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            next_id: 1,
            history: VecDeque::new(),
            sender,
        }
    }
}

pub struct EventBroker {
    logs: DashMap<Uuid, Arc<RwLock<ProjectLog>>>,
    retention_entries: usize,
    retention: chrono::Duration,
}

impl EventBroker {
    pub fn new(retention_entries: usize, retention_seconds: u64) -> Self {
        Self {
            logs: DashMap::new(),
            retention_entries,
            retention: chrono::Duration::seconds(retention_seconds as i64),
        }
    }

    fn log_for(&self, project_id: Uuid) -> Arc<RwLock<ProjectLog>> {
        self.logs
            .entry(project_id)
            .or_insert_with(|| Arc::new(RwLock::new(ProjectLog::new())))
            .clone()
    }

    pub async fn publish(&self, project_id: Uuid, event_type: &str, payload: Value) -> Event {
        let log = self.log_for(project_id);
        let mut log = log.write().await;
        let event = Event {
            id: log.next_id,
            project_id,
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        log.next_id += 1;
        log.history.push_back(event.clone());
        self.trim(&mut log);
        // A publish with no subscribers is not an error -- `send` only
        // fails when the channel has zero receivers.
        let _ = log.sender.send(event.clone());
        event
    }

    fn trim(&self, log: &mut ProjectLog) {
        while log.history.len() > self.retention_entries {
            log.history.pop_front();
        }
        let cutoff = Utc::now() - self.retention;
        while log
            .history
            .front()
            .map(|e| e.timestamp < cutoff)
            .unwrap_or(false)
        {
            log.history.pop_front();
        }
    }

    pub async fn events_since(&self, project_id: Uuid, since: DateTime<Utc>) -> Vec<Event> {
        let log = self.log_for(project_id);
        let log = log.read().await;
        log.history
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub async fn events_after_id(&self, project_id: Uuid, after: u64) -> Vec<Event> {
        let log = self.log_for(project_id);
        let log = log.read().await;
        log.history
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }

    /// Subscribes to future events for a project. Non-blocking by
    /// construction: `tokio::sync::broadcast` drops the slowest receiver's
    /// backlog rather than stalling the publisher, surfaced here as a
    /// [`Delivered::Lagged`] marker instead of silently skipping.
    pub async fn subscribe(
        &self,
        project_id: Uuid,
    ) -> impl futures_util::Stream<Item = Delivered> {
        let log = self.log_for(project_id);
        let rx = log.read().await.sender.subscribe();
        BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) => Some(Delivered::Event(event)),
            Err(broadcast::error::RecvError::Lagged(_)) => {
                Some(Delivered::Lagged(Lagged { project_id }))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;

    #[tokio::test]
    async fn replay_then_live_sees_every_event_once() {
        let broker = EventBroker::new(100, 3600);
        let project = Uuid::new_v4();
        let t0 = Utc::now() - chrono::Duration::seconds(1);

        broker
            .publish(project, "session.status", serde_json::json!({"n": 1}))
            .await;

        let mut stream = Box::pin(broker.subscribe(project).await);
        let history = broker.events_since(project, t0).await;
        assert_eq!(history.len(), 1);

        broker
            .publish(project, "session.status", serde_json::json!({"n": 2}))
            .await;

        let mut seen = history.iter().map(|e| e.id).collect::<Vec<_>>();
        if let Some(Delivered::Event(e)) = stream.next().await {
            if !seen.contains(&e.id) {
                seen.push(e.id);
            }
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn retention_bounds_history_length() {
        let broker = EventBroker::new(2, 3600);
        let project = Uuid::new_v4();
        for i in 0..5 {
            broker
                .publish(project, "t", serde_json::json!({"i": i}))
                .await;
        }
        let history = broker.events_after_id(project, 0).await;
        assert_eq!(history.len(), 2);
    }
}
