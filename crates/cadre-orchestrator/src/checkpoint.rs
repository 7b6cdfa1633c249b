//! Checkpoint capture, commit/rollback, and on-disk records
//!
//! A checkpoint captures recoverable VCS state (branch, commit, dirty flag)
//! before a risky multi-agent run. One JSON record per checkpoint id lives
//! in the checkpoint directory for audit; records transition to `committed`
//! on full success or `rolled_back` on failure and are pruned by age.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

use cadre_core::{CadreError, Result};

use crate::vcs::VcsExecutor;

/// Lifecycle status of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Active,
    Committed,
    RolledBack,
}

/// Recoverable VCS state captured at checkpoint time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedState {
    pub branch: String,
    pub commit: String,
    /// Whether uncommitted local changes existed at capture time
    pub dirty: bool,
}

/// A recoverable snapshot taken before a risky multi-agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// What the checkpoint protects, e.g. "orchestrated run"
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub captured: CapturedState,
    pub status: CheckpointStatus,
}

/// Manager for checkpoint records and the VCS state they capture
pub struct CheckpointStore<E: VcsExecutor> {
    executor: E,
    dir: PathBuf,
}

impl<E: VcsExecutor> CheckpointStore<E> {
    pub fn new(executor: E, dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Capture current state and persist a new active checkpoint
    pub async fn create(&self, operation: impl Into<String>) -> Result<Checkpoint> {
        let captured = self.capture().await?;
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().simple().to_string(),
            operation: operation.into(),
            timestamp: Utc::now(),
            captured,
            status: CheckpointStatus::Active,
        };

        self.write_record(&checkpoint).await?;
        info!(
            "Created checkpoint {} at {} ({})",
            checkpoint.id, checkpoint.captured.commit, checkpoint.operation
        );
        Ok(checkpoint)
    }

    /// Mark a checkpoint committed; the record is retained for audit
    pub async fn commit(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.status = CheckpointStatus::Committed;
        self.write_record(checkpoint).await?;
        info!("Committed checkpoint {}", checkpoint.id);
        Ok(())
    }

    /// Restore the captured state and mark the checkpoint rolled back
    pub async fn roll_back(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        info!(
            "Rolling back to checkpoint {} ({} @ {})",
            checkpoint.id, checkpoint.captured.branch, checkpoint.captured.commit
        );

        if checkpoint.captured.dirty {
            warn!(
                "Checkpoint {} captured uncommitted changes; they cannot be restored",
                checkpoint.id
            );
        }

        let checkout = self
            .executor
            .exec(&["checkout", &checkpoint.captured.branch])
            .await?;
        if !checkout.success {
            return Err(CadreError::Vcs(format!(
                "Failed to check out {}: {}",
                checkpoint.captured.branch, checkout.stderr
            )));
        }

        let reset = self
            .executor
            .exec(&["reset", "--hard", &checkpoint.captured.commit])
            .await?;
        if !reset.success {
            return Err(CadreError::Vcs(format!(
                "Failed to reset to {}: {}",
                checkpoint.captured.commit, reset.stderr
            )));
        }

        checkpoint.status = CheckpointStatus::RolledBack;
        self.write_record(checkpoint).await?;
        Ok(())
    }

    /// Load every persisted checkpoint record; a missing directory is empty
    pub async fn load_all(&self) -> Result<Vec<Checkpoint>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                let content = tokio::fs::read_to_string(entry.path()).await?;
                match serde_json::from_str(&content) {
                    Ok(checkpoint) => checkpoints.push(checkpoint),
                    Err(e) => warn!("Skipping unreadable checkpoint {:?}: {}", entry.path(), e),
                }
            }
        }

        checkpoints.sort_by_key(|c: &Checkpoint| c.timestamp);
        Ok(checkpoints)
    }

    /// Delete terminal checkpoint records older than the cutoff
    ///
    /// Active checkpoints are never pruned. Returns the number removed.
    pub async fn prune_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;

        for checkpoint in self.load_all().await? {
            if checkpoint.status != CheckpointStatus::Active && checkpoint.timestamp < cutoff {
                tokio::fs::remove_file(self.record_path(&checkpoint.id)).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Pruned {} checkpoint record(s)", removed);
        }
        Ok(removed)
    }

    /// Capture branch, commit, and dirty state through the executor
    async fn capture(&self) -> Result<CapturedState> {
        let branch = self
            .exec_expecting(&["rev-parse", "--abbrev-ref", "HEAD"], "resolve branch")
            .await?;
        let commit = self
            .exec_expecting(&["rev-parse", "HEAD"], "resolve commit")
            .await?;
        let status = self
            .exec_expecting(&["status", "--porcelain"], "read status")
            .await?;

        Ok(CapturedState {
            branch: branch.trim().to_string(),
            commit: commit.trim().to_string(),
            dirty: !status.trim().is_empty(),
        })
    }

    async fn exec_expecting(&self, args: &[&str], what: &str) -> Result<String> {
        let output = self.executor.exec(args).await?;
        if !output.success {
            return Err(CadreError::Vcs(format!(
                "Failed to {}: {}",
                what, output.stderr
            )));
        }
        Ok(output.stdout)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write_record(&self, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(self.record_path(&checkpoint.id), json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::{MockVcsExecutor, VcsOutput};
    use tempfile::TempDir;

    fn clean_capture_executor() -> MockVcsExecutor {
        MockVcsExecutor::new()
            .with_ok("rev-parse --abbrev-ref HEAD", "main\n")
            .with_ok("rev-parse HEAD", "abc123def\n")
            .with_ok("status --porcelain", "")
    }

    #[tokio::test]
    async fn test_create_captures_state() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(clean_capture_executor(), temp_dir.path());

        let checkpoint = store.create("orchestrated run").await.unwrap();
        assert_eq!(checkpoint.status, CheckpointStatus::Active);
        assert_eq!(checkpoint.captured.branch, "main");
        assert_eq!(checkpoint.captured.commit, "abc123def");
        assert!(!checkpoint.captured.dirty);

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, checkpoint.id);
    }

    #[tokio::test]
    async fn test_dirty_working_copy_detected() {
        let temp_dir = TempDir::new().unwrap();
        let executor = MockVcsExecutor::new()
            .with_ok("rev-parse --abbrev-ref HEAD", "main\n")
            .with_ok("rev-parse HEAD", "abc123def\n")
            .with_ok("status --porcelain", " M src/lib.rs\n");
        let store = CheckpointStore::new(executor, temp_dir.path());

        let checkpoint = store.create("run").await.unwrap();
        assert!(checkpoint.captured.dirty);
    }

    #[tokio::test]
    async fn test_commit_transition_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(clean_capture_executor(), temp_dir.path());

        let mut checkpoint = store.create("run").await.unwrap();
        store.commit(&mut checkpoint).await.unwrap();
        assert_eq!(checkpoint.status, CheckpointStatus::Committed);

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded[0].status, CheckpointStatus::Committed);
    }

    #[tokio::test]
    async fn test_rollback_restores_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let executor = clean_capture_executor()
            .with_ok("checkout main", "Switched to branch 'main'\n")
            .with_ok("reset --hard abc123def", "HEAD is now at abc123d\n");
        let store = CheckpointStore::new(executor, temp_dir.path());

        let mut checkpoint = store.create("run").await.unwrap();
        store.roll_back(&mut checkpoint).await.unwrap();
        assert_eq!(checkpoint.status, CheckpointStatus::RolledBack);

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded[0].status, CheckpointStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_failure_surfaces() {
        let temp_dir = TempDir::new().unwrap();
        let executor = clean_capture_executor().with_response(
            "checkout main",
            VcsOutput {
                stdout: String::new(),
                stderr: "pathspec 'main' did not match".to_string(),
                success: false,
            },
        );
        let store = CheckpointStore::new(executor, temp_dir.path());

        let mut checkpoint = store.create("run").await.unwrap();
        let result = store.roll_back(&mut checkpoint).await;
        assert!(matches!(result, Err(CadreError::Vcs(_))));
    }

    #[tokio::test]
    async fn test_load_all_missing_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(
            MockVcsExecutor::new(),
            temp_dir.path().join("does-not-exist"),
        );
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_active_and_recent() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(clean_capture_executor(), temp_dir.path());

        // One committed long ago, one committed now, one still active
        let mut old = store.create("old run").await.unwrap();
        old.status = CheckpointStatus::Committed;
        old.timestamp = Utc::now() - Duration::days(30);
        store.write_record(&old).await.unwrap();

        let mut recent = store.create("recent run").await.unwrap();
        store.commit(&mut recent).await.unwrap();

        let active = store.create("in flight").await.unwrap();

        let removed = store.prune_older_than(Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store.load_all().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|c| c.id == recent.id));
        assert!(remaining.iter().any(|c| c.id == active.id));
    }
}
