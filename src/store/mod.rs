//! Durable entity storage (C1).
//!
//! One [`Store`] trait so the lifecycle engine, completion dispatcher and
//! broker never depend on `sqlx` directly -- tests swap in
//! [`crate::testing::InMemoryStore`]. The production implementation,
//! [`PgStore`], follows the teacher's `db/*.rs` convention of plain async
//! functions built on raw `sqlx::query`/`query_as` rather than compile-time
//! `query!` macros, since this crate has no reachable database at build
//! time in this environment.

pub mod models;

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::Utc;
use models::{Agent, Credential, Message, Project, Session, SessionStatus, Workspace};
use sqlx::PgPool;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_project(&self, name: &str) -> AppResult<Project>;
    async fn get_project(&self, id: Uuid) -> AppResult<Project>;

    async fn create_workspace(&self, w: &Workspace) -> AppResult<Workspace>;
    async fn get_workspace(&self, id: Uuid) -> AppResult<Workspace>;
    async fn list_workspaces(&self, project_id: Uuid) -> AppResult<Vec<Workspace>>;
    async fn update_workspace(&self, w: &Workspace) -> AppResult<()>;

    async fn create_session(&self, s: &Session) -> AppResult<Session>;
    async fn get_session(&self, id: Uuid) -> AppResult<Session>;
    async fn list_sessions(&self, workspace_id: Uuid) -> AppResult<Vec<Session>>;
    async fn list_sessions_by_status(&self, status: SessionStatus) -> AppResult<Vec<Session>>;
    /// Writes `status`/`last_error` with optimistic concurrency on
    /// `updated_at`; returns [`AppError::StoreConflict`] on a lost race so
    /// the caller can re-read and retry once (§4.1).
    async fn set_session_status(
        &self,
        id: Uuid,
        expected_updated_at: chrono::DateTime<Utc>,
        status: SessionStatus,
        last_error: Option<&str>,
    ) -> AppResult<Session>;
    /// Atomic compare-and-swap used by the completion dispatcher (§4.9):
    /// succeeds only if the session's current status equals `from`.
    async fn cas_session_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> AppResult<bool>;
    async fn set_session_sandbox_id(&self, id: Uuid, sandbox_id: Option<&str>) -> AppResult<()>;
    async fn delete_session(&self, id: Uuid) -> AppResult<()>;

    async fn create_agent(&self, a: &Agent) -> AppResult<Agent>;
    async fn get_agent(&self, id: Uuid) -> AppResult<Agent>;

    async fn create_credential(&self, c: &Credential) -> AppResult<Credential>;
    async fn get_credential(&self, id: Uuid) -> AppResult<Credential>;
    async fn list_credentials(&self, project_id: Uuid) -> AppResult<Vec<Credential>>;

    async fn append_message(&self, m: &Message) -> AppResult<Message>;
    /// Overwrites a message's `parts` array in place. Called repeatedly as a
    /// completion streams in new blocks (§4.9); each call carries the full
    /// current parts array, so replaying the same update is a no-op --
    /// satisfies the idempotent-on-`(messageId, partOrdinal)` persistence
    /// requirement without a separate parts table.
    async fn update_message_parts(&self, id: Uuid, parts: &serde_json::Value) -> AppResult<()>;
    async fn list_messages(&self, session_id: Uuid) -> AppResult<Vec<Message>>;
    async fn clear_messages(&self, session_id: Uuid) -> AppResult<()>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_project(&self, name: &str) -> AppResult<Project> {
        let row = sqlx::query_as::<_, Project>(
            "INSERT INTO projects (id, name, created_at) VALUES ($1, $2, now()) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_project(&self, id: Uuid) -> AppResult<Project> {
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn create_workspace(&self, w: &Workspace) -> AppResult<Workspace> {
        let row = sqlx::query_as::<_, Workspace>(
            "INSERT INTO workspaces (id, project_id, source_type, path, status, current_commit, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, now(), now()) RETURNING *",
        )
        .bind(w.id)
        .bind(w.project_id)
        .bind(w.source_type)
        .bind(&w.path)
        .bind(w.status)
        .bind(&w.current_commit)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_workspace(&self, id: Uuid) -> AppResult<Workspace> {
        sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn list_workspaces(&self, project_id: Uuid) -> AppResult<Vec<Workspace>> {
        Ok(
            sqlx::query_as::<_, Workspace>(
                "SELECT * FROM workspaces WHERE project_id = $1 ORDER BY created_at",
            )
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?,
        )
    }

    async fn update_workspace(&self, w: &Workspace) -> AppResult<()> {
        sqlx::query(
            "UPDATE workspaces SET status = $2, current_commit = $3, updated_at = now() WHERE id = $1",
        )
        .bind(w.id)
        .bind(w.status)
        .bind(&w.current_commit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_session(&self, s: &Session) -> AppResult<Session> {
        let row = sqlx::query_as::<_, Session>(
            "INSERT INTO sessions (id, project_id, workspace_id, agent_id, name, status, commit_status, last_error, sandbox_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), now()) RETURNING *",
        )
        .bind(s.id)
        .bind(s.project_id)
        .bind(s.workspace_id)
        .bind(s.agent_id)
        .bind(&s.name)
        .bind(s.status)
        .bind(s.commit_status)
        .bind(&s.last_error)
        .bind(&s.sandbox_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_session(&self, id: Uuid) -> AppResult<Session> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn list_sessions(&self, workspace_id: Uuid) -> AppResult<Vec<Session>> {
        Ok(sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE workspace_id = $1 ORDER BY created_at",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_sessions_by_status(&self, status: SessionStatus) -> AppResult<Vec<Session>> {
        Ok(
            sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE status = $1")
                .bind(status)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn set_session_status(
        &self,
        id: Uuid,
        expected_updated_at: chrono::DateTime<Utc>,
        status: SessionStatus,
        last_error: Option<&str>,
    ) -> AppResult<Session> {
        let row = sqlx::query_as::<_, Session>(
            "UPDATE sessions SET status = $3, last_error = $4, updated_at = now()
             WHERE id = $1 AND updated_at = $2 RETURNING *",
        )
        .bind(id)
        .bind(expected_updated_at)
        .bind(status)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(AppError::StoreConflict)
    }

    async fn cas_session_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_session_sandbox_id(&self, id: Uuid, sandbox_id: Option<&str>) -> AppResult<()> {
        sqlx::query("UPDATE sessions SET sandbox_id = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_agent(&self, a: &Agent) -> AppResult<Agent> {
        let row = sqlx::query_as::<_, Agent>(
            "INSERT INTO agents (id, project_id, name, system_prompt, model, mcp_servers, is_default, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, now()) RETURNING *",
        )
        .bind(a.id)
        .bind(a.project_id)
        .bind(&a.name)
        .bind(&a.system_prompt)
        .bind(&a.model)
        .bind(&a.mcp_servers)
        .bind(a.is_default)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_agent(&self, id: Uuid) -> AppResult<Agent> {
        sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn create_credential(&self, c: &Credential) -> AppResult<Credential> {
        let row = sqlx::query_as::<_, Credential>(
            "INSERT INTO credentials (id, project_id, provider, secret_ciphertext, created_at)
             VALUES ($1, $2, $3, $4, now()) RETURNING *",
        )
        .bind(c.id)
        .bind(c.project_id)
        .bind(&c.provider)
        .bind(&c.secret_ciphertext)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_credential(&self, id: Uuid) -> AppResult<Credential> {
        sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn list_credentials(&self, project_id: Uuid) -> AppResult<Vec<Credential>> {
        Ok(sqlx::query_as::<_, Credential>(
            "SELECT * FROM credentials WHERE project_id = $1 ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn append_message(&self, m: &Message) -> AppResult<Message> {
        let row = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (id, session_id, ordinal, role, parts, created_at)
             VALUES ($1, $2, $3, $4, $5, now()) RETURNING *",
        )
        .bind(m.id)
        .bind(m.session_id)
        .bind(m.ordinal)
        .bind(&m.role)
        .bind(&m.parts)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_message_parts(&self, id: Uuid, parts: &serde_json::Value) -> AppResult<()> {
        sqlx::query("UPDATE messages SET parts = $2 WHERE id = $1")
            .bind(id)
            .bind(parts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_messages(&self, session_id: Uuid) -> AppResult<Vec<Message>> {
        Ok(sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE session_id = $1 ORDER BY ordinal",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn clear_messages(&self, session_id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
