use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A content unit within a model turn. Serializes to the wire shape the
/// messages endpoint expects, so history entries go on requests verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryBlock {
    Text { text: String },
}

/// One turn of the model-facing conversation, persisted separately from
/// the user-facing transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHistoryEntry {
    pub role: Role,
    pub content: Vec<HistoryBlock>,
}

impl ModelHistoryEntry {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![HistoryBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![HistoryBlock::Text { text: text.into() }],
        }
    }

    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                HistoryBlock::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
