mod history;
mod message;
mod persist;

pub use history::{HistoryBlock, ModelHistoryEntry, Role};
pub use message::{AskKind, Message, MessageKind, SayKind, TokenMetrics};
pub use persist::TaskPersistence;

use crate::context_window::TruncationRange;
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Owns the ordered user-facing transcript and the separate model-facing
/// history for one task, and enforces the identity/ordering invariants:
/// `ts` strictly increasing and never reused, partial messages updated only
/// while they are the last entry, `partial` never reverting to true.
pub struct ConversationStore {
    task_id: String,
    messages: Vec<Message>,
    model_history: Vec<ModelHistoryEntry>,
    truncation: Option<TruncationRange>,
    persist: Option<TaskPersistence>,
    last_ts: u64,
}

impl ConversationStore {
    pub fn new(task_id: impl Into<String>, state_dir: Option<&Path>) -> Result<Self> {
        let task_id = task_id.into();
        let persist = match state_dir {
            Some(dir) => Some(TaskPersistence::new(dir, &task_id)?),
            None => None,
        };
        Ok(Self {
            task_id,
            messages: Vec::new(),
            model_history: Vec::new(),
            truncation: None,
            persist,
            last_ts: 0,
        })
    }

    /// Rebuild a store from its persisted logs, e.g. after a stream failure
    /// or process restart.
    pub fn resume(task_id: impl Into<String>, state_dir: &Path) -> Result<Self> {
        let task_id = task_id.into();
        let persist = TaskPersistence::new(state_dir, &task_id)?;
        let (messages, model_history, truncation) = persist.load()?;
        let last_ts = messages.last().map(|m| m.ts).unwrap_or(0);
        Ok(Self {
            task_id,
            messages,
            model_history,
            truncation,
            persist: Some(persist),
            last_ts,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn message_by_ts(&self, ts: u64) -> Option<&Message> {
        self.messages.iter().find(|m| m.ts == ts)
    }

    fn next_ts(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let ts = now.max(self.last_ts + 1);
        self.last_ts = ts;
        ts
    }

    pub fn append(&mut self, kind: MessageKind, text: Option<String>) -> Result<u64> {
        self.append_with(kind, text, Vec::new(), false)
    }

    pub fn append_partial(&mut self, kind: MessageKind, text: Option<String>) -> Result<u64> {
        self.append_with(kind, text, Vec::new(), true)
    }

    pub fn append_with(
        &mut self,
        kind: MessageKind,
        text: Option<String>,
        images: Vec<String>,
        partial: bool,
    ) -> Result<u64> {
        // A new message supersedes a trailing partial: close it first so it
        // can never be updated once it is no longer the last entry.
        if self.messages.last().is_some_and(|m| m.partial) {
            let ts = self.messages.last().map(|m| m.ts).unwrap_or(0);
            self.finalize(ts, None)?;
        }

        let ts = self.next_ts();
        let message = Message {
            ts,
            kind,
            text,
            images,
            partial,
            checkpoint_hash: None,
            history_index: self.model_history.len().checked_sub(1),
            metrics: None,
        };
        self.messages.push(message);
        self.save_messages_appended()?;
        Ok(ts)
    }

    /// Replace the text of a still-streaming message. Valid only while it
    /// is the last entry of the log.
    pub fn update_partial(&mut self, ts: u64, text: Option<String>) -> Result<()> {
        let Some(last) = self.messages.last_mut() else {
            bail!("cannot update message {ts}: log is empty");
        };
        if last.ts != ts {
            bail!("cannot update message {ts}: it is no longer the last entry");
        }
        if !last.partial {
            bail!("cannot update message {ts}: it is already final");
        }
        last.text = text;
        self.save_messages_rewrite()
    }

    /// `partial: true -> false`, once. Finalizing a final message is a no-op.
    pub fn finalize(&mut self, ts: u64, text: Option<String>) -> Result<()> {
        let Some(message) = self.messages.iter_mut().find(|m| m.ts == ts) else {
            bail!("cannot finalize unknown message {ts}");
        };
        if !message.partial {
            return Ok(());
        }
        message.partial = false;
        if text.is_some() {
            message.text = text;
        }
        self.save_messages_rewrite()
    }

    pub fn set_checkpoint_hash(&mut self, ts: u64, hash: String) -> Result<()> {
        let Some(message) = self.messages.iter_mut().find(|m| m.ts == ts) else {
            bail!("cannot attach checkpoint to unknown message {ts}");
        };
        message.checkpoint_hash = Some(hash);
        self.save_messages_rewrite()
    }

    pub fn set_metrics(&mut self, ts: u64, metrics: TokenMetrics) -> Result<()> {
        let Some(message) = self.messages.iter_mut().find(|m| m.ts == ts) else {
            bail!("cannot attach metrics to unknown message {ts}");
        };
        message.metrics = Some(metrics);
        self.save_messages_rewrite()
    }

    pub fn append_images(&mut self, ts: u64, images: Vec<String>) -> Result<()> {
        let Some(message) = self.messages.iter_mut().find(|m| m.ts == ts) else {
            bail!("cannot attach images to unknown message {ts}");
        };
        message.images.extend(images);
        self.save_messages_rewrite()
    }

    pub fn model_history(&self) -> &[ModelHistoryEntry] {
        &self.model_history
    }

    pub fn push_history(&mut self, entry: ModelHistoryEntry) -> Result<usize> {
        self.model_history.push(entry);
        if let Some(persist) = &self.persist {
            persist.append_history(self.model_history.last().expect("just pushed"))?;
        }
        Ok(self.model_history.len() - 1)
    }

    /// The history actually sent on a request: entry 0 always, with the
    /// current truncation range elided.
    pub fn request_history(&self) -> Vec<ModelHistoryEntry> {
        match self.truncation {
            None => self.model_history.clone(),
            Some(range) => self
                .model_history
                .iter()
                .enumerate()
                .filter(|(index, _)| *index < range.start || *index >= range.end)
                .map(|(_, entry)| entry.clone())
                .collect(),
        }
    }

    pub fn truncation_range(&self) -> Option<TruncationRange> {
        self.truncation
    }

    pub fn set_truncation_range(&mut self, range: Option<TruncationRange>) -> Result<()> {
        self.truncation = range;
        if let Some(persist) = &self.persist {
            persist.save_truncation_range(range)?;
        }
        Ok(())
    }

    /// Truncate both logs back to the message `target_ts`, leaving the
    /// transcript with exactly `index(target) + 1` entries and folding the
    /// accounting of every discarded request into one DeletedApiReqs
    /// summary message. Callers must have already reset the workspace if
    /// the restore mode asked for it.
    pub fn restore_truncate(&mut self, target_ts: u64) -> Result<TokenMetrics> {
        let target_index = self
            .messages
            .iter()
            .position(|m| m.ts == target_ts)
            .with_context(|| format!("restore target message {target_ts} not found"))?;

        let history_boundary = self.messages[..=target_index]
            .iter()
            .rev()
            .find_map(|m| m.history_index);

        let mut deleted = TokenMetrics::default();
        let mut deleted_requests = 0usize;
        for message in &self.messages[target_index + 1..] {
            if let Some(metrics) = &message.metrics {
                deleted.absorb(metrics);
                deleted_requests += 1;
            }
        }

        self.messages.truncate(target_index + 1);
        // The trailing survivor must not remain updatable as if streaming.
        if let Some(last) = self.messages.last_mut() {
            last.partial = false;
        }

        let new_history_len = history_boundary.map(|b| b + 1).unwrap_or(0);
        self.model_history.truncate(new_history_len);

        if let Some(range) = self.truncation {
            if range.end > self.model_history.len() {
                self.truncation = None;
            }
        }

        if deleted_requests > 0 {
            let ts = self.next_ts();
            self.messages.push(Message {
                ts,
                kind: MessageKind::Say(SayKind::DeletedApiReqs),
                text: Some(format!("{deleted_requests} requests deleted by restore")),
                images: Vec::new(),
                partial: false,
                checkpoint_hash: None,
                history_index: self.model_history.len().checked_sub(1),
                metrics: Some(deleted),
            });
        }

        if let Some(persist) = &self.persist {
            persist.rewrite_messages(&self.messages)?;
            persist.rewrite_history(&self.model_history)?;
            persist.save_truncation_range(self.truncation)?;
        }

        Ok(deleted)
    }

    fn save_messages_appended(&self) -> Result<()> {
        if let Some(persist) = &self.persist {
            persist.append_message(self.messages.last().expect("just appended"))?;
        }
        Ok(())
    }

    fn save_messages_rewrite(&self) -> Result<()> {
        if let Some(persist) = &self.persist {
            persist.rewrite_messages(&self.messages)?;
        }
        Ok(())
    }
}
