use super::history::ModelHistoryEntry;
use super::message::Message;
use crate::context_window::TruncationRange;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const MESSAGES_FILE: &str = "messages.jsonl";
const HISTORY_FILE: &str = "model_history.jsonl";
const TASK_STATE_FILE: &str = "task_state.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskState {
    truncation_range: Option<TruncationRange>,
}

/// On-disk layout for one task: two JSONL logs plus a small state record,
/// all under `<state_dir>/tasks/<task_id>/`. Appends go straight to the
/// end of the log; partial-message updates and restores rewrite the file.
pub struct TaskPersistence {
    dir: PathBuf,
}

impl TaskPersistence {
    pub fn new(state_dir: &Path, task_id: &str) -> Result<Self> {
        let dir = state_dir.join("tasks").join(task_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create task dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn append_message(&self, message: &Message) -> Result<()> {
        append_jsonl(&self.dir.join(MESSAGES_FILE), message)
    }

    pub fn rewrite_messages(&self, messages: &[Message]) -> Result<()> {
        rewrite_jsonl(&self.dir.join(MESSAGES_FILE), messages)
    }

    pub fn append_history(&self, entry: &ModelHistoryEntry) -> Result<()> {
        append_jsonl(&self.dir.join(HISTORY_FILE), entry)
    }

    pub fn rewrite_history(&self, entries: &[ModelHistoryEntry]) -> Result<()> {
        rewrite_jsonl(&self.dir.join(HISTORY_FILE), entries)
    }

    pub fn save_truncation_range(&self, range: Option<TruncationRange>) -> Result<()> {
        let state = TaskState {
            truncation_range: range,
        };
        let path = self.dir.join(TASK_STATE_FILE);
        let json = serde_json::to_string_pretty(&state)?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(
        &self,
    ) -> Result<(Vec<Message>, Vec<ModelHistoryEntry>, Option<TruncationRange>)> {
        let messages = read_jsonl(&self.dir.join(MESSAGES_FILE))?;
        let history = read_jsonl(&self.dir.join(HISTORY_FILE))?;
        let state_path = self.dir.join(TASK_STATE_FILE);
        let state = if state_path.exists() {
            let raw = fs::read_to_string(&state_path)
                .with_context(|| format!("Failed to read {}", state_path.display()))?;
            serde_json::from_str::<TaskState>(&raw)
                .with_context(|| format!("Corrupt task state at {}", state_path.display()))?
        } else {
            TaskState::default()
        };
        Ok((messages, history, state.truncation_range))
    }
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let line = serde_json::to_string(record)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("Failed to append {}", path.display()))
}

fn rewrite_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    fs::write(path, out).with_context(|| format!("Failed to rewrite {}", path.display()))
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut records = Vec::new();
    for (line_number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).with_context(|| {
            format!("Corrupt record at {}:{}", path.display(), line_number + 1)
        })?;
        records.push(record);
    }
    Ok(records)
}
