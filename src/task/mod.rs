mod controller;
mod events;
mod presentation;

#[cfg(test)]
mod tests;

pub use controller::TaskLoop;
pub use events::{Step, TaskEvent};

/// Top-level state of the task driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Requesting,
    Streaming,
    Presenting,
    Completed,
    Abandoned,
}

/// How a task run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The model signaled completion and the user accepted it.
    Completed,
    /// Explicit abort, rejection of a blocking prompt, or cancellation.
    Abandoned,
    /// The configured cost ceiling was reached; no further requests made.
    BudgetExceeded,
}

/// How one turn ended, decided by the presenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TurnResult {
    /// Another model request is needed; this is its user content.
    Continue { next_user_content: String },
    Completed,
    Abandoned,
}
