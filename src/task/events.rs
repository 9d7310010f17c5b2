use crate::approval::AskResponse;
use crate::store::Message;
use tokio::sync::oneshot;

/// Engine-to-frontend traffic. `Say` and `Ask` mirror the Message log;
/// `Progress` is fire-and-forget output (command lines, still-running
/// ticks) that never becomes a transcript entry.
pub enum TaskEvent {
    Say(Message),
    Ask {
        message: Message,
        response_tx: oneshot::Sender<AskResponse>,
    },
    /// Re-emission of a partial ask while its invocation still streams;
    /// carries no responder because nothing can be answered yet.
    AskPreview(Message),
    Progress(String),
}

/// Outcome of a suspension point that the abort token can interrupt.
/// A tagged value instead of a control-flow exception.
#[derive(Debug)]
pub enum Step<T> {
    Value(T),
    Aborted,
}

impl<T> Step<T> {
    pub fn aborted(&self) -> bool {
        matches!(self, Step::Aborted)
    }
}
