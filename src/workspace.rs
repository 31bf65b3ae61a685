//! Workspace Provider (C2, SPEC_FULL.md §4.2).
//!
//! Grounded on `git2` usage across the example pack (most directly
//! claude-in-a-box's `WorktreeManager`): clone into a staging directory,
//! then rename into place so a reader of the workspace's status never
//! observes a partially-cloned directory.

use crate::error::{AppError, AppResult};
use crate::store::models::{Workspace, WorkspaceSourceType, WorkspaceStatus};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct Diff {
    pub files: Vec<String>,
    pub patch: String,
}

pub struct WorkspaceProvider {
    base_dir: PathBuf,
    /// Serialises concurrent `Ensure` calls for the same workspace so the
    /// second caller observes the first's completed clone rather than
    /// racing a second `git2::clone` into the same staging directory
    /// (open question resolution, DESIGN.md).
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl WorkspaceProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, workspace_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(workspace_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn target_dir(&self, workspace_id: Uuid) -> PathBuf {
        self.base_dir.join(workspace_id.to_string())
    }

    /// Idempotently brings `workspace` to `ready` and returns its local
    /// directory.
    pub async fn ensure(&self, workspace: &Workspace) -> AppResult<PathBuf> {
        let guard = self.lock_for(workspace.id);
        let _permit = guard.lock().await;

        let target = self.target_dir(workspace.id);
        match workspace.source_type {
            WorkspaceSourceType::Local => {
                let path = Path::new(&workspace.path);
                if !path.is_dir() {
                    return Err(AppError::WorkspaceCloneFailed(format!(
                        "local workspace path {} is not a directory",
                        workspace.path
                    )));
                }
                Ok(path.to_path_buf())
            }
            WorkspaceSourceType::Git => {
                if target.is_dir() {
                    return Ok(target);
                }
                let staging = self.base_dir.join(format!("{}.staging", workspace.id));
                let _ = tokio::fs::remove_dir_all(&staging).await;
                tokio::fs::create_dir_all(&staging)
                    .await
                    .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;

                let url = workspace.path.clone();
                let staging_clone = staging.clone();
                tokio::task::spawn_blocking(move || {
                    let mut builder = git2::build::RepoBuilder::new();
                    builder.clone(&url, &staging_clone)
                })
                .await
                .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?
                .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;

                tokio::fs::rename(&staging, &target)
                    .await
                    .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;
                Ok(target)
            }
        }
    }

    /// Resolves `reference` (branch, tag, or sha) to a concrete commit sha
    /// for a workspace whose local directory already exists.
    pub fn resolve_commit(&self, workspace: &Workspace, reference: &str) -> AppResult<String> {
        let repo = self.open_repo(workspace)?;
        let Some(repo) = repo else {
            return Err(AppError::BadRequest("workspace has no git repository".into()));
        };
        let obj = repo
            .revparse_single(reference)
            .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;
        Ok(obj.id().to_string())
    }

    pub fn diff(&self, workspace: &Workspace, from_sha: Option<&str>) -> AppResult<Diff> {
        let Some(repo) = self.open_repo(workspace)? else {
            return Ok(Diff {
                files: vec![],
                patch: String::new(),
            });
        };
        let new_tree = repo
            .head()
            .and_then(|h| h.peel_to_tree())
            .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;
        let old_tree = match from_sha {
            Some(sha) => {
                let oid = git2::Oid::from_str(sha)
                    .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;
                Some(
                    repo.find_commit(oid)
                        .and_then(|c| c.tree())
                        .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?,
                )
            }
            None => None,
        };
        let diff = repo
            .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)
            .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;

        let mut files = Vec::new();
        diff.foreach(
            &mut |delta, _| {
                if let Some(path) = delta.new_file().path() {
                    files.push(path.display().to_string());
                }
                true
            },
            None,
            None,
            None,
        )
        .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;

        let mut patch = String::new();
        diff.print(git2::DiffFormat::Patch, |_, _, line| {
            patch.push_str(&String::from_utf8_lossy(line.content()));
            true
        })
        .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;

        Ok(Diff { files, patch })
    }

    /// Fast-forwards the workspace's repository to the commits produced
    /// inside a sandbox (an `ApplyCommits` bundle is, concretely, a set of
    /// commits already pushed to a local bare ref by the sandbox's git
    /// client; this integrates them into the working tree).
    pub fn apply_commits(&self, workspace: &Workspace, target_sha: &str) -> AppResult<String> {
        let Some(repo) = self.open_repo(workspace)? else {
            return Err(AppError::BadRequest("workspace has no git repository".into()));
        };
        let oid = git2::Oid::from_str(target_sha)
            .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;
        let commit = repo
            .find_commit(oid)
            .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;
        repo.checkout_tree(commit.as_object(), None)
            .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;
        repo.set_head_detached(oid)
            .map_err(|e| AppError::WorkspaceCloneFailed(e.to_string()))?;
        Ok(oid.to_string())
    }

    fn open_repo(&self, workspace: &Workspace) -> AppResult<Option<git2::Repository>> {
        let dir = match workspace.source_type {
            WorkspaceSourceType::Local => PathBuf::from(&workspace.path),
            WorkspaceSourceType::Git => self.target_dir(workspace.id),
        };
        match git2::Repository::open(&dir) {
            Ok(repo) => Ok(Some(repo)),
            Err(_) if workspace.source_type == WorkspaceSourceType::Local => Ok(None),
            Err(e) => Err(AppError::WorkspaceCloneFailed(e.to_string())),
        }
    }
}

impl WorkspaceStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, WorkspaceStatus::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_workspace(path: &Path) -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            source_type: WorkspaceSourceType::Local,
            path: path.display().to_string(),
            status: WorkspaceStatus::Initializing,
            current_commit: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn ensure_accepts_existing_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        let provider = WorkspaceProvider::new(dir.path().join("base"));
        let ws = local_workspace(dir.path());
        let resolved = provider.ensure(&ws).await.unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[tokio::test]
    async fn ensure_rejects_missing_local_directory() {
        let base = tempfile::tempdir().unwrap();
        let provider = WorkspaceProvider::new(base.path());
        let ws = local_workspace(&base.path().join("does-not-exist"));
        assert!(provider.ensure(&ws).await.is_err());
    }
}
