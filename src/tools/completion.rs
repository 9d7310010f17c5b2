use super::{Tool, ToolContext, ToolKind};
use crate::approval::ToolCategory;
use crate::parser::ToolUseBlock;
use anyhow::Result;
use async_trait::async_trait;

/// Signals the turn loop that the task is done. The presenter routes this
/// specially: the result goes to the user, a checkpoint is awaited, and the
/// loop only continues if the user responds with feedback.
pub struct AttemptCompletionTool;

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> &'static str {
        "attempt_completion"
    }

    fn description(&self) -> &'static str {
        "Present the final result of the task to the user. Use only after previous tool results confirmed the work succeeded."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Completion
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["result"]
    }

    fn is_mutating(&self) -> bool {
        false
    }

    fn affected_path(&self, _call: &ToolUseBlock) -> Option<String> {
        None
    }

    fn preview(&self, call: &ToolUseBlock) -> String {
        format!("completion: {}", call.param("result").unwrap_or(""))
    }

    async fn execute(&self, _ctx: &ToolContext, call: &ToolUseBlock) -> Result<String> {
        Ok(call.param("result").unwrap_or("").to_string())
    }
}

/// Asks the user a clarifying question; the answer becomes the tool result.
pub struct AskFollowupQuestionTool;

#[async_trait]
impl Tool for AskFollowupQuestionTool {
    fn name(&self) -> &'static str {
        "ask_followup_question"
    }

    fn description(&self) -> &'static str {
        "Ask the user a clarifying question when the task cannot proceed without more information."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Followup
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["question"]
    }

    fn is_mutating(&self) -> bool {
        false
    }

    fn affected_path(&self, _call: &ToolUseBlock) -> Option<String> {
        None
    }

    fn preview(&self, call: &ToolUseBlock) -> String {
        format!("question: {}", call.param("question").unwrap_or("<missing>"))
    }

    async fn execute(&self, _ctx: &ToolContext, call: &ToolUseBlock) -> Result<String> {
        Ok(call.param("question").unwrap_or("").to_string())
    }
}

/// Asks the engine to condense the conversation. Requires the model to have
/// written the summary; the controller appends it to history before moving
/// the truncation range past the summarized turns.
pub struct CondenseTool;

#[async_trait]
impl Tool for CondenseTool {
    fn name(&self) -> &'static str {
        "condense"
    }

    fn description(&self) -> &'static str {
        "Condense the conversation so far into the provided summary to free context space. The summary must preserve every detail needed to finish the task."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Condense
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["summary"]
    }

    fn is_mutating(&self) -> bool {
        false
    }

    fn affected_path(&self, _call: &ToolUseBlock) -> Option<String> {
        None
    }

    fn preview(&self, call: &ToolUseBlock) -> String {
        let (chars, lines) = crate::util::text_stats(call.param("summary").unwrap_or(""));
        format!("condense context ({chars} chars, {lines} lines)")
    }

    async fn execute(&self, _ctx: &ToolContext, call: &ToolUseBlock) -> Result<String> {
        Ok(call.param("summary").unwrap_or("").to_string())
    }
}
