use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum WorkspaceSourceType {
    Local,
    Git,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum WorkspaceStatus {
    Initializing,
    Cloning,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workspace {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_type: WorkspaceSourceType,
    pub path: String,
    pub status: WorkspaceStatus,
    pub current_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Session status. `Running` is a transient value occupying the same column
/// as `Ready` while a completion is in flight (§4.9) -- it is not a distinct
/// point in the startup state machine's monotonic ranking (§8 property 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Initializing,
    Reinitializing,
    Cloning,
    PullingImage,
    CreatingSandbox,
    Ready,
    Running,
    Stopped,
    Error,
    Removing,
    Removed,
}

impl SessionStatus {
    /// Rank used to check the monotonic-startup property; only meaningful
    /// for the forward-progress states, not the side states (error,
    /// removing, removed, reinitializing).
    pub fn startup_rank(self) -> Option<u8> {
        match self {
            SessionStatus::Initializing => Some(0),
            SessionStatus::Cloning => Some(1),
            SessionStatus::PullingImage => Some(2),
            SessionStatus::CreatingSandbox => Some(3),
            SessionStatus::Ready | SessionStatus::Running => Some(4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum CommitStatus {
    None,
    Pending,
    Committing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub project_id: Uuid,
    pub workspace_id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    pub commit_status: CommitStatus,
    pub last_error: Option<String>,
    pub sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub mcp_servers: Value,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credential {
    pub id: Uuid,
    pub project_id: Uuid,
    pub provider: String,
    pub secret_ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub ordinal: i64,
    pub role: String,
    pub parts: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
