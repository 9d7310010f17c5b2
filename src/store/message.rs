use serde::{Deserialize, Serialize};

/// Prompts that block on a user response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    /// The model asked the user a question.
    Followup,
    /// Approval for a file-affecting tool.
    Tool,
    /// Approval for a shell command.
    Command,
    /// A request failed and the user decides whether to retry.
    ApiReqFailed,
    MistakeLimitReached,
    AutoApprovalMaxReached,
    /// Presented completion; any textual response is feedback that
    /// re-enters the loop.
    CompletionResult,
}

/// Fire-and-forget transcript entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Text,
    Reasoning,
    ApiReqStarted,
    Tool,
    Command,
    CommandOutput,
    CompletionResult,
    Error,
    CheckpointCreated,
    CondenseSummary,
    UserFeedback,
    /// Aggregated accounting for requests removed by a restore.
    DeletedApiReqs,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    Ask(AskKind),
    Say(SayKind),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    pub cost: Option<f64>,
}

impl TokenMetrics {
    pub fn absorb(&mut self, other: &TokenMetrics) {
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
        self.cache_writes += other.cache_writes;
        self.cache_reads += other.cache_reads;
        if let Some(cost) = other.cost {
            *self.cost.get_or_insert(0.0) += cost;
        }
    }
}

/// One entry of the user-facing transcript.
///
/// `ts` is the stable identity: strictly increasing, never reused, never
/// mutated after creation. A message is either appended to in place (same
/// `ts`, still partial) or a new message is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub ts: u64,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_hash: Option<String>,
    /// Index into the model-facing history at creation time, so any
    /// message can be mapped back to the model turn that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TokenMetrics>,
}

impl Message {
    pub fn is_ask(&self) -> bool {
        matches!(self.kind, MessageKind::Ask(_))
    }

    pub fn say_kind(&self) -> Option<SayKind> {
        match self.kind {
            MessageKind::Say(kind) => Some(kind),
            MessageKind::Ask(_) => None,
        }
    }
}
