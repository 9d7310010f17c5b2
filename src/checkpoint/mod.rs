mod store;

pub use store::{FileDiff, ShadowSnapshotStore, SnapshotBackend};

use crate::store::{ConversationStore, TokenMetrics};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task;
use tracing::warn;

/// What a restore touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Task,
    Workspace,
    TaskAndWorkspace,
}

impl RestoreMode {
    pub fn includes_workspace(self) -> bool {
        matches!(self, RestoreMode::Workspace | RestoreMode::TaskAndWorkspace)
    }

    pub fn includes_task(self) -> bool {
        matches!(self, RestoreMode::Task | RestoreMode::TaskAndWorkspace)
    }
}

/// Handle for a background commit, resolved onto its message once the
/// commit lands. Replaces fire-and-forget commits racing later hash reads.
pub struct PendingCommit {
    pub message_ts: u64,
    rx: oneshot::Receiver<Option<String>>,
}

impl PendingCommit {
    /// Non-blocking poll: `None` while the commit is still running,
    /// `Some(hash)` once finished (`Some(None)` on failure).
    pub fn try_resolve(&mut self) -> Option<Option<String>> {
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(None),
        }
    }

    pub async fn resolve(self) -> Option<String> {
        self.rx.await.unwrap_or(None)
    }
}

/// Creates, diffs and restores workspace snapshots for one task lineage.
///
/// Ordinary-turn commits are asynchronous and best-effort; a failure is
/// logged, remembered, and not retried every turn. The completion-turn
/// commit is awaited because its hash must be attached before control
/// returns to the user. The backend mutex serializes commits per lineage.
pub struct CheckpointManager {
    backend: Arc<Mutex<Box<dyn SnapshotBackend>>>,
    failed: Arc<AtomicBool>,
    failure_notice: Arc<Mutex<Option<String>>>,
}

impl CheckpointManager {
    pub fn new(backend: Box<dyn SnapshotBackend>) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            failed: Arc::new(AtomicBool::new(false)),
            failure_notice: Arc::new(Mutex::new(None)),
        }
    }

    pub fn commit_background(&self, message_ts: u64) -> PendingCommit {
        let (tx, rx) = oneshot::channel();

        if self.failed.load(Ordering::Relaxed) {
            let _ = tx.send(None);
            return PendingCommit { message_ts, rx };
        }

        let backend = self.backend.clone();
        let failed = self.failed.clone();
        let failure_notice = self.failure_notice.clone();
        task::spawn_blocking(move || {
            let result = backend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .commit();
            match result {
                Ok(hash) => {
                    let _ = tx.send(Some(hash));
                }
                Err(error) => {
                    warn!(%error, "background checkpoint commit failed");
                    failed.store(true, Ordering::Relaxed);
                    *failure_notice.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(format!("Checkpoints are unavailable: {error}"));
                    let _ = tx.send(None);
                }
            }
        });

        PendingCommit { message_ts, rx }
    }

    pub async fn commit_awaited(&self) -> Result<String> {
        if self.failed.load(Ordering::Relaxed) {
            bail!("checkpointing disabled after an earlier failure");
        }
        let backend = self.backend.clone();
        task::spawn_blocking(move || {
            backend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .commit()
        })
        .await
        .context("checkpoint commit task failed")?
    }

    pub async fn diff(&self, from: String, to: Option<String>) -> Result<Vec<FileDiff>> {
        let backend = self.backend.clone();
        task::spawn_blocking(move || {
            backend
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .diff(&from, to.as_deref())
        })
        .await
        .context("checkpoint diff task failed")?
    }

    /// One-shot failure notice for the transcript; subsequent calls return
    /// `None` so the user is not nagged every turn.
    pub fn take_failure_notice(&self) -> Option<String> {
        self.failure_notice
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Rewind to the checkpoint associated with `target_ts`.
    ///
    /// Workspace-inclusive modes reset tracked files first; if that fails
    /// nothing is truncated. Task-inclusive modes then cut both logs back
    /// to the target message, returning the folded metrics of the removed
    /// requests.
    pub async fn restore(
        &self,
        store: &mut ConversationStore,
        target_ts: u64,
        mode: RestoreMode,
    ) -> Result<Option<TokenMetrics>> {
        let target_index = store
            .messages()
            .iter()
            .position(|m| m.ts == target_ts)
            .with_context(|| format!("restore target message {target_ts} not found"))?;

        // The target itself may lack a hash (not every message checkpoints);
        // fall back to the nearest earlier checkpointed message. With no
        // such message the restore fails explicitly rather than no-opping.
        let hash = store.messages()[..=target_index]
            .iter()
            .rev()
            .find_map(|m| m.checkpoint_hash.clone());
        let Some(hash) = hash else {
            bail!("no checkpoint available at or before message {target_ts}");
        };

        if mode.includes_workspace() {
            let backend = self.backend.clone();
            task::spawn_blocking(move || {
                backend
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .reset_head(&hash)
            })
            .await
            .context("checkpoint restore task failed")??;
        }

        if mode.includes_task() {
            let deleted = store.restore_truncate(target_ts)?;
            return Ok(Some(deleted));
        }

        Ok(None)
    }
}
