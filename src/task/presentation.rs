use super::controller::TaskLoop;
use super::events::Step;
use super::LoopState;
use crate::approval::{AskResponse, ToolCategory};
use crate::parser::cleanup::present_text;
use crate::parser::{ContentBlock, TextBlock, ToolUseBlock};
use crate::store::{AskKind, SayKind};
use crate::tools::{Tool, ToolKind};
use crate::util::parse_bool_str;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Per-turn presentation state. Blocks are handled strictly in order by the
/// single consumer in `drive_blocks`; the two flags implement the
/// one-tool-per-turn and rejection short-circuits.
pub(crate) struct TurnState {
    pub accumulated: String,
    pub reasoning: String,
    pub reasoning_ts: Option<u64>,
    pub text_message_ts: HashMap<usize, u64>,
    pub tool_progress: HashMap<usize, ToolProgress>,
    pub did_reject_tool: bool,
    pub did_already_used_tool: bool,
    pub tool_results: Vec<String>,
    pub completion: Option<CompletionResolution>,
    pub condense_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToolProgress {
    /// Streaming preview; the message is partial and, for non-auto tools,
    /// a provisional approval prompt.
    Previewing { ts: u64, is_ask: bool },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CompletionResolution {
    Accepted,
    Feedback { text: String, images: Vec<String> },
}

impl TurnState {
    pub fn new() -> Self {
        Self {
            accumulated: String::new(),
            reasoning: String::new(),
            reasoning_ts: None,
            text_message_ts: HashMap::new(),
            tool_progress: HashMap::new(),
            did_reject_tool: false,
            did_already_used_tool: false,
            tool_results: Vec::new(),
            completion: None,
            condense_summary: None,
        }
    }
}

impl TaskLoop {
    /// Present every block of the current parse snapshot, in order.
    /// Returns true if the task was aborted mid-presentation.
    pub(crate) async fn drive_blocks(&mut self, blocks: &[ContentBlock]) -> Result<bool> {
        for (index, block) in blocks.iter().enumerate() {
            if self.abort.is_cancelled() {
                return Ok(true);
            }
            match block {
                ContentBlock::Text(text) => self.present_text_block(index, text)?,
                ContentBlock::ToolUse(tool) => {
                    if matches!(self.turn.tool_progress.get(&index), Some(ToolProgress::Done)) {
                        continue;
                    }
                    if tool.partial {
                        self.present_tool_preview(index, tool)?;
                    } else if self.handle_tool(index, tool).await? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn present_text_block(&mut self, index: usize, text: &TextBlock) -> Result<()> {
        self.finish_reasoning()?;
        let cleaned = present_text(&text.content, text.partial);

        match self.turn.text_message_ts.get(&index).copied() {
            Some(ts) => {
                if text.partial {
                    if self.store.message_by_ts(ts).is_some_and(|m| m.partial) {
                        self.update_say(ts, Some(cleaned))?;
                    }
                } else {
                    self.finalize_say(ts, Some(cleaned))?;
                }
            }
            None => {
                if cleaned.is_empty() {
                    return Ok(());
                }
                let ts = if text.partial {
                    self.say_partial(SayKind::Text, Some(cleaned))?
                } else {
                    self.say(SayKind::Text, Some(cleaned))?
                };
                self.turn.text_message_ts.insert(index, ts);
            }
        }
        Ok(())
    }

    /// Streaming preview for a partial invocation. No side effects: tools
    /// that would auto-approve stream a preview message, others stream a
    /// provisional approval prompt.
    fn present_tool_preview(&mut self, index: usize, call: &ToolUseBlock) -> Result<()> {
        self.finish_reasoning()?;
        if self.turn.did_reject_tool || self.turn.did_already_used_tool {
            return Ok(());
        }
        let Some(tool) = self.registry.get(&call.name).cloned() else {
            return Ok(());
        };

        if tool.kind() == ToolKind::Completion {
            // Completion text streams straight to the user as it arrives.
            let partial_result = call.param("result").unwrap_or("");
            let cleaned = present_text(partial_result, true);
            match self.turn.tool_progress.get(&index).copied() {
                Some(ToolProgress::Previewing { ts, .. }) => {
                    if self.store.message_by_ts(ts).is_some_and(|m| m.partial) {
                        self.update_say(ts, Some(cleaned))?;
                    }
                }
                Some(ToolProgress::Done) => {}
                None => {
                    if !cleaned.is_empty() {
                        let ts = self.say_partial(SayKind::CompletionResult, Some(cleaned))?;
                        self.turn.tool_progress.insert(
                            index,
                            ToolProgress::Previewing { ts, is_ask: false },
                        );
                    }
                }
            }
            return Ok(());
        }

        if tool.kind() != ToolKind::Regular || !self.registry.can_preview_partial(call) {
            return Ok(());
        }

        let preview = tool.preview(call);
        let say_kind = preview_say_kind(&tool);
        let ask_kind = preview_ask_kind(&tool);

        match self.turn.tool_progress.get(&index).copied() {
            Some(ToolProgress::Previewing { ts, is_ask }) => {
                if self.store.message_by_ts(ts).is_some_and(|m| m.partial) {
                    if is_ask {
                        self.update_ask_preview(ts, Some(preview))?;
                    } else {
                        self.update_say(ts, Some(preview))?;
                    }
                }
            }
            Some(ToolProgress::Done) => {}
            None => {
                let auto = self.tool_auto_approved(&tool, call);
                let (ts, is_ask) = if auto {
                    (self.say_partial(say_kind, Some(preview))?, false)
                } else {
                    (self.ask_preview(ask_kind, Some(preview))?, true)
                };
                self.turn
                    .tool_progress
                    .insert(index, ToolProgress::Previewing { ts, is_ask });
            }
        }
        Ok(())
    }

    /// A complete tool invocation: validate, approve, execute, push exactly
    /// one result. Returns true if the task was aborted.
    pub(crate) async fn handle_tool(&mut self, index: usize, call: &ToolUseBlock) -> Result<bool> {
        self.finish_reasoning()?;
        let previous = self
            .turn
            .tool_progress
            .insert(index, ToolProgress::Done)
            .and_then(|progress| match progress {
                ToolProgress::Previewing { ts, is_ask } => Some((ts, is_ask)),
                ToolProgress::Done => None,
            });
        let name = call.name.clone();

        if self.turn.did_reject_tool {
            self.close_preview(previous, &name)?;
            self.turn.tool_results.push(format!(
                "Tool [{name}] was skipped because the user rejected a previous tool in this turn."
            ));
            return Ok(false);
        }

        if self.turn.did_already_used_tool {
            self.close_preview(previous, &name)?;
            self.turn.tool_results.push(format!(
                "Tool [{name}] was ignored: only one tool may be used per message. Only the first tool's result was processed."
            ));
            return Ok(false);
        }

        let Some(tool) = self.registry.get(&name).cloned() else {
            self.close_preview(previous, &name)?;
            self.consecutive_mistakes += 1;
            self.say(
                SayKind::Error,
                Some(format!("The model invoked an unknown tool '{name}'.")),
            )?;
            self.turn.tool_results.push(format!(
                "Unknown tool [{name}]. Use one of the tools listed in the system prompt."
            ));
            return Ok(false);
        };

        if let Err(missing) = tool.validate(call) {
            self.close_preview(previous, &name)?;
            self.consecutive_mistakes += 1;
            self.say(
                SayKind::Error,
                Some(format!(
                    "Missing required parameter '{missing}' for {name}."
                )),
            )?;
            self.turn.tool_results.push(format!(
                "Missing required parameter '{missing}' for [{name}]. Retry the invocation with every required parameter."
            ));
            return Ok(false);
        }

        match tool.kind() {
            ToolKind::Followup => self.handle_followup(call).await,
            ToolKind::Completion => self.handle_completion(previous, call).await,
            ToolKind::Condense => self.handle_condense(call),
            ToolKind::Regular => self.handle_regular(&tool, previous, call).await,
        }
    }

    async fn handle_followup(&mut self, call: &ToolUseBlock) -> Result<bool> {
        let question = call.param("question").unwrap_or("").to_string();
        match self.ask(AskKind::Followup, Some(question)).await? {
            Step::Aborted => Ok(true),
            Step::Value(response) => {
                let (text, images) = response_feedback(response);
                let answer = text.unwrap_or_default();
                if !answer.is_empty() {
                    self.say(SayKind::UserFeedback, Some(answer.clone()))?;
                }
                let mut result = format!("<answer>\n{answer}\n</answer>");
                if !images.is_empty() {
                    result.push_str(&format!("\n[{} image(s) attached]", images.len()));
                }
                self.turn.tool_results.push(result);
                self.turn.did_already_used_tool = true;
                self.consecutive_mistakes = 0;
                Ok(false)
            }
        }
    }

    async fn handle_completion(
        &mut self,
        previous: Option<(u64, bool)>,
        call: &ToolUseBlock,
    ) -> Result<bool> {
        let result_text = present_text(call.param("result").unwrap_or(""), false);

        let ts = match previous {
            Some((ts, false)) => {
                self.finalize_say(ts, Some(result_text.clone()))?;
                ts
            }
            _ => self.say(SayKind::CompletionResult, Some(result_text.clone()))?,
        };

        // The completion checkpoint is awaited: its hash must sit on the
        // completion message before control returns to the user.
        match self.checkpoints.commit_awaited().await {
            Ok(hash) => {
                self.store.set_checkpoint_hash(ts, hash)?;
                self.emit(ts);
            }
            Err(error) => debug!(%error, "completion checkpoint unavailable"),
        }

        self.turn.did_already_used_tool = true;
        self.consecutive_mistakes = 0;

        match self.ask(AskKind::CompletionResult, None).await? {
            Step::Aborted => Ok(true),
            Step::Value(response) => {
                let outcome = self.gate.interpret(response);
                match outcome.feedback_text {
                    Some(text) => {
                        self.say(SayKind::UserFeedback, Some(text.clone()))?;
                        self.turn.completion = Some(CompletionResolution::Feedback {
                            text,
                            images: outcome.feedback_images,
                        });
                    }
                    None => {
                        self.turn.completion = Some(CompletionResolution::Accepted);
                    }
                }
                Ok(false)
            }
        }
    }

    fn handle_condense(&mut self, call: &ToolUseBlock) -> Result<bool> {
        let summary = call.param("summary").unwrap_or("").to_string();
        self.say(SayKind::CondenseSummary, Some(summary.clone()))?;
        self.turn.condense_summary = Some(summary);
        self.turn.tool_results.push(
            "Earlier turns will be elided in favor of your summary. Continue the task."
                .to_string(),
        );
        self.turn.did_already_used_tool = true;
        self.consecutive_mistakes = 0;
        Ok(false)
    }

    async fn handle_regular(
        &mut self,
        tool: &Arc<dyn Tool>,
        previous: Option<(u64, bool)>,
        call: &ToolUseBlock,
    ) -> Result<bool> {
        let name = tool.name();
        let preview = tool.preview(call);
        let auto = self.tool_auto_approved(tool, call);
        let mut approved_feedback: Option<String> = None;

        let message_ts = if auto {
            self.consecutive_auto_approvals += 1;
            match previous {
                Some((ts, _)) => {
                    self.finalize_say(ts, Some(preview))?;
                    ts
                }
                None => self.say(preview_say_kind(tool), Some(preview))?,
            }
        } else {
            let response = match previous {
                Some((ts, true)) => self.ask_existing(ts, Some(preview)).await?,
                // A say-preview cannot become answerable; close it out and
                // raise a fresh prompt.
                Some((ts, false)) => {
                    self.finalize_say(ts, None)?;
                    self.ask(preview_ask_kind(tool), Some(preview)).await?
                }
                None => self.ask(preview_ask_kind(tool), Some(preview)).await?,
            };
            self.consecutive_auto_approvals = 0;

            let response = match response {
                Step::Aborted => return Ok(true),
                Step::Value(response) => response,
            };
            let outcome = self.gate.interpret(response);
            if let Some(text) = &outcome.feedback_text {
                self.say(SayKind::UserFeedback, Some(text.clone()))?;
            }

            if !outcome.approved {
                self.turn.did_reject_tool = true;
                let mut result = format!("The user denied permission to run [{name}].");
                if let Some(text) = outcome.feedback_text {
                    result.push_str(&format!(
                        "\nThe user provided feedback:\n<feedback>\n{text}\n</feedback>"
                    ));
                }
                self.turn.tool_results.push(result);
                return Ok(false);
            }
            approved_feedback = outcome.feedback_text;
            self.store
                .messages()
                .last()
                .map(|m| m.ts)
                .unwrap_or_default()
        };

        if self.abort.is_cancelled() {
            return Ok(true);
        }

        if tool.is_mutating() {
            self.flush_pending_commits().await?;
        }

        self.state = LoopState::Presenting;
        let execution = tool.execute(&self.tool_ctx, call).await;
        self.turn.did_already_used_tool = true;

        match execution {
            Ok(output) => {
                self.consecutive_mistakes = 0;
                if tool.category() == ToolCategory::Execute {
                    self.say(SayKind::CommandOutput, Some(output.clone()))?;
                }
                let mut result = format!("[{name}] result:\n{output}");
                if let Some(text) = approved_feedback {
                    result.push_str(&format!(
                        "\n\nThe user approved with feedback:\n<feedback>\n{text}\n</feedback>"
                    ));
                }
                self.turn.tool_results.push(result);

                if tool.is_mutating() {
                    let pending = self.checkpoints.commit_background(message_ts);
                    self.track_pending_commit(pending);
                }
            }
            Err(error) => {
                self.say(
                    SayKind::Error,
                    Some(format!("Error executing {name}: {error}")),
                )?;
                self.turn
                    .tool_results
                    .push(format!("[{name}] failed: {error}"));
            }
        }
        Ok(false)
    }

    /// A preview message whose tool never ran must still be closed.
    fn close_preview(&mut self, previous: Option<(u64, bool)>, name: &str) -> Result<()> {
        if let Some((ts, _)) = previous {
            self.finalize_say(ts, Some(format!("[{name}] skipped")))?;
        }
        Ok(())
    }

    pub(crate) fn present_reasoning(&mut self) -> Result<()> {
        let text = self.turn.reasoning.clone();
        match self.turn.reasoning_ts {
            Some(ts) => {
                if self.store.message_by_ts(ts).is_some_and(|m| m.partial) {
                    self.update_say(ts, Some(text))?;
                }
                Ok(())
            }
            None => {
                let ts = self.say_partial(SayKind::Reasoning, Some(text))?;
                self.turn.reasoning_ts = Some(ts);
                Ok(())
            }
        }
    }

    pub(crate) fn finish_reasoning(&mut self) -> Result<()> {
        if let Some(ts) = self.turn.reasoning_ts {
            if self.store.message_by_ts(ts).is_some_and(|m| m.partial) {
                self.store.finalize(ts, None)?;
                self.emit(ts);
            }
        }
        Ok(())
    }

    pub(crate) fn tool_auto_approved(&self, tool: &Arc<dyn Tool>, call: &ToolUseBlock) -> bool {
        // The model may flag a command as risky; that overrides the policy.
        if tool.category() == ToolCategory::Execute
            && call
                .param("requires_approval")
                .and_then(parse_bool_str)
                .unwrap_or(false)
        {
            return false;
        }

        let resolved = tool
            .affected_path(call)
            .and_then(|path| self.tool_ctx.workspace.resolve(&path).ok());
        self.gate.decide(
            tool.category(),
            resolved.as_ref().map(|r| r.absolute.as_path()),
            self.tool_ctx.workspace.root(),
        )
    }
}

fn preview_say_kind(tool: &Arc<dyn Tool>) -> SayKind {
    if tool.category() == ToolCategory::Execute {
        SayKind::Command
    } else {
        SayKind::Tool
    }
}

fn preview_ask_kind(tool: &Arc<dyn Tool>) -> AskKind {
    if tool.category() == ToolCategory::Execute {
        AskKind::Command
    } else {
        AskKind::Tool
    }
}

fn response_feedback(response: AskResponse) -> (Option<String>, Vec<String>) {
    match response {
        AskResponse::Approved { text, images }
        | AskResponse::Rejected { text, images } => (text, images),
        AskResponse::Message { text, images } => (Some(text), images),
    }
}
