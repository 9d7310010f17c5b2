use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::task;

/// A proposed file change that has not touched disk yet. Staging captures
/// the pre-image so the change can be reverted after the fact (abort,
/// rejection after a speculative save, failed write).
#[derive(Debug, Clone)]
pub struct StagedEdit {
    pub path: PathBuf,
    pub pre_content: Option<String>,
    pub proposed: String,
}

/// Result of committing a staged edit. `user_edits` reports content the
/// user changed between staging and saving, which the engine relays to the
/// model as distinct from its own edit.
#[derive(Debug, Clone)]
pub struct SavedEdit {
    pub final_content: String,
    pub user_edits: bool,
}

/// The file/edit collaborator: open a proposed change, commit it, or roll
/// it back.
#[async_trait]
pub trait FileEditor: Send + Sync {
    async fn stage(&self, path: &Path, proposed: String) -> Result<StagedEdit>;
    async fn save(&self, edit: &StagedEdit) -> Result<SavedEdit>;
    async fn revert(&self, edit: &StagedEdit) -> Result<()>;
}

/// Editor that writes straight to the filesystem. An editor-integrated
/// implementation would surface a diff view instead; the contract is the
/// same.
pub struct DirectFileEditor;

#[async_trait]
impl FileEditor for DirectFileEditor {
    async fn stage(&self, path: &Path, proposed: String) -> Result<StagedEdit> {
        let path = path.to_path_buf();
        let read_path = path.clone();
        let pre_content = task::spawn_blocking(move || {
            if read_path.exists() {
                std::fs::read_to_string(&read_path).ok()
            } else {
                None
            }
        })
        .await
        .context("stage task failed")?;

        Ok(StagedEdit {
            path,
            pre_content,
            proposed,
        })
    }

    async fn save(&self, edit: &StagedEdit) -> Result<SavedEdit> {
        let edit = edit.clone();
        task::spawn_blocking(move || {
            // Anything on disk that differs from the captured pre-image was
            // changed by the user while the proposal was pending.
            let current = if edit.path.exists() {
                std::fs::read_to_string(&edit.path).ok()
            } else {
                None
            };
            let user_edits = current != edit.pre_content;

            if let Some(parent) = edit.path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(&edit.path, &edit.proposed)
                .with_context(|| format!("Failed to write {}", edit.path.display()))?;

            Ok(SavedEdit {
                final_content: edit.proposed,
                user_edits,
            })
        })
        .await
        .context("save task failed")?
    }

    async fn revert(&self, edit: &StagedEdit) -> Result<()> {
        let edit = edit.clone();
        task::spawn_blocking(move || match &edit.pre_content {
            Some(previous) => std::fs::write(&edit.path, previous)
                .with_context(|| format!("Failed to restore {}", edit.path.display())),
            None => {
                if edit.path.exists() {
                    std::fs::remove_file(&edit.path)
                        .with_context(|| format!("Failed to remove {}", edit.path.display()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .context("revert task failed")?
    }
}
