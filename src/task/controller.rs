use super::events::{Step, TaskEvent};
use super::presentation::TurnState;
use super::{LoopState, TaskOutcome, TurnResult};
use crate::api::{ApiChunk, ApiError, ModelStreamProvider};
use crate::approval::{AskResponse, ToolApprovalGate};
use crate::checkpoint::{CheckpointManager, PendingCommit, ShadowSnapshotStore, SnapshotBackend};
use crate::config::Config;
use crate::context_window::{ContextWindowManager, TruncationStrategy};
use crate::parser::StreamingParser;
use crate::store::{
    AskKind, ConversationStore, MessageKind, ModelHistoryEntry, SayKind, TokenMetrics,
};
use crate::tools::{
    DirectFileEditor, ShellCommandRunner, ToolContext, ToolRegistry, WorkspaceOps,
};
use anyhow::{bail, Result};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The top-level driver: issues model requests, pumps the stream through
/// the parser into the presenter, and decides whether another turn runs.
pub struct TaskLoop {
    pub(crate) provider: Arc<dyn ModelStreamProvider>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) parser: StreamingParser,
    pub(crate) gate: ToolApprovalGate,
    pub(crate) store: ConversationStore,
    pub(crate) context_mgr: ContextWindowManager,
    pub(crate) checkpoints: CheckpointManager,
    pub(crate) tool_ctx: ToolContext,
    pub(crate) events_tx: mpsc::UnboundedSender<TaskEvent>,
    pub(crate) abort: CancellationToken,
    pub(crate) system_prompt: String,
    pub(crate) state: LoopState,
    pub(crate) consecutive_mistakes: usize,
    pub(crate) consecutive_auto_approvals: usize,
    pub(crate) mistake_limit: usize,
    pub(crate) budget_limit: Option<f64>,
    pub(crate) spent: TokenMetrics,
    pub(crate) last_request_tokens: usize,
    pub(crate) request_timeout: Duration,
    pub(crate) rate_limit_backoff: Duration,
    pub(crate) pending_commits: Vec<PendingCommit>,
    pub(crate) turn: TurnState,
    state_dir: Option<PathBuf>,
}

impl TaskLoop {
    /// Start a fresh task with the standard collaborators: direct file
    /// editor, shell command runner, shadow snapshot store.
    pub fn new(
        config: &Config,
        provider: Arc<dyn ModelStreamProvider>,
        events_tx: mpsc::UnboundedSender<TaskEvent>,
    ) -> Result<Self> {
        let task_id = generate_task_id();
        let backend = ShadowSnapshotStore::new(
            config.workspace_root.clone(),
            config.state_dir.join("snapshots").join(&task_id),
        )?;
        let store = ConversationStore::new(task_id.as_str(), Some(&config.state_dir))?;
        Self::assemble(config, provider, Box::new(backend), events_tx, store, true)
    }

    /// Reattach to a persisted task after a restart or stream failure.
    pub fn resume_from_history(
        config: &Config,
        provider: Arc<dyn ModelStreamProvider>,
        events_tx: mpsc::UnboundedSender<TaskEvent>,
        task_id: &str,
    ) -> Result<Self> {
        let backend = ShadowSnapshotStore::new(
            config.workspace_root.clone(),
            config.state_dir.join("snapshots").join(task_id),
        )?;
        let store = ConversationStore::resume(task_id, &config.state_dir)?;
        Self::assemble(config, provider, Box::new(backend), events_tx, store, true)
    }

    /// Shared assembly; tests inject their own backend and an ephemeral
    /// store through this path.
    pub(crate) fn assemble(
        config: &Config,
        provider: Arc<dyn ModelStreamProvider>,
        backend: Box<dyn SnapshotBackend>,
        events_tx: mpsc::UnboundedSender<TaskEvent>,
        store: ConversationStore,
        persist: bool,
    ) -> Result<Self> {
        let workspace = Arc::new(WorkspaceOps::new(config.workspace_root.clone()));
        let registry = Arc::new(ToolRegistry::builtin_with(workspace.clone()));
        let parser = StreamingParser::new(registry.vocabulary());
        let system_prompt = registry.render_system_prompt(&config.workspace_root);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();
        let forward_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = progress_rx.recv().await {
                if forward_events.send(TaskEvent::Progress(line)).is_err() {
                    break;
                }
            }
        });

        let tool_ctx = ToolContext {
            workspace,
            editor: Arc::new(DirectFileEditor),
            runner: Arc::new(ShellCommandRunner),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            progress_tx: Some(progress_tx),
            active_edit: Arc::new(Mutex::new(None)),
        };

        Ok(Self {
            provider,
            registry,
            parser,
            gate: ToolApprovalGate::new(config.auto_approval.clone()),
            store,
            context_mgr: ContextWindowManager::new(config.context_window_tokens),
            checkpoints: CheckpointManager::new(backend),
            tool_ctx,
            events_tx,
            abort: CancellationToken::new(),
            system_prompt,
            state: LoopState::Idle,
            consecutive_mistakes: 0,
            consecutive_auto_approvals: 0,
            mistake_limit: config.consecutive_mistake_limit,
            budget_limit: config.budget_limit,
            spent: TokenMetrics::default(),
            last_request_tokens: 0,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            rate_limit_backoff: Duration::from_secs(config.rate_limit_backoff_secs),
            pending_commits: Vec::new(),
            turn: TurnState::new(),
            state_dir: persist.then(|| config.state_dir.clone()),
        })
    }

    /// Clone of the task-scoped abort flag. Cancelling it abandons the
    /// stream, reverts any staged edit, and stops all further messages.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn total_spent(&self) -> TokenMetrics {
        self.spent
    }

    pub async fn run(&mut self, task_text: String) -> Result<TaskOutcome> {
        self.store
            .push_history(ModelHistoryEntry::user_text(format!("<task>\n{task_text}\n</task>")))?;
        let task_ts = self.say(SayKind::Task, Some(task_text))?;
        let pending = self.checkpoints.commit_background(task_ts);
        self.pending_commits.push(pending);
        self.drive_loop().await
    }

    pub async fn run_resumed(&mut self) -> Result<TaskOutcome> {
        if self.store.model_history().is_empty() {
            bail!("task {} has no persisted history to resume", self.store.task_id());
        }
        self.store.push_history(ModelHistoryEntry::user_text(
            "[TASK RESUMPTION] This task was interrupted. The workspace may have changed; \
             reassess its state before continuing."
                .to_string(),
        ))?;
        self.drive_loop().await
    }

    async fn drive_loop(&mut self) -> Result<TaskOutcome> {
        loop {
            if self.abort.is_cancelled() {
                return self.abandon().await;
            }

            match self.check_guards().await? {
                Some(TaskOutcome::Abandoned) => return self.abandon().await,
                Some(outcome) => return Ok(outcome),
                None => {}
            }

            let turn = self.run_turn().await?;

            self.resolve_pending_commits()?;
            if let Some(notice) = self.checkpoints.take_failure_notice() {
                self.say(SayKind::Error, Some(notice))?;
            }

            match turn {
                TurnResult::Continue { next_user_content } => {
                    self.store
                        .push_history(ModelHistoryEntry::user_text(next_user_content))?;
                }
                TurnResult::Completed => {
                    self.flush_pending_commits().await?;
                    self.state = LoopState::Completed;
                    return Ok(TaskOutcome::Completed);
                }
                TurnResult::Abandoned => return self.abandon().await,
            }
        }
    }

    /// Between-turn guards: budget ceiling, mistake limit, auto-approval
    /// cap. Returning `Some` ends the loop.
    async fn check_guards(&mut self) -> Result<Option<TaskOutcome>> {
        if let Some(limit) = self.budget_limit {
            let spent = self.spent.cost.unwrap_or(0.0);
            if spent >= limit {
                self.say(
                    SayKind::Error,
                    Some(format!(
                        "Cost budget of ${limit:.2} reached (spent ${spent:.2}); stopping before the next request."
                    )),
                )?;
                return Ok(Some(TaskOutcome::BudgetExceeded));
            }
        }

        if self.consecutive_mistakes >= self.mistake_limit {
            let prompt = format!(
                "The model made {} consecutive mistakes (missing tool invocations or invalid parameters). Continue the task?",
                self.consecutive_mistakes
            );
            match self.ask(AskKind::MistakeLimitReached, Some(prompt)).await? {
                Step::Aborted => return Ok(Some(TaskOutcome::Abandoned)),
                Step::Value(response) => {
                    let outcome = self.gate.interpret(response);
                    if !outcome.approved && outcome.feedback_text.is_none() {
                        return Ok(Some(TaskOutcome::Abandoned));
                    }
                    self.consecutive_mistakes = 0;
                    if let Some(text) = outcome.feedback_text {
                        self.say(SayKind::UserFeedback, Some(text.clone()))?;
                        self.store.push_history(ModelHistoryEntry::user_text(format!(
                            "The user provided guidance:\n<feedback>\n{text}\n</feedback>"
                        )))?;
                    }
                }
            }
        }

        if self.consecutive_auto_approvals >= self.gate.max_consecutive_requests() {
            let prompt = format!(
                "{} consecutive actions were auto-approved. Keep auto-approving?",
                self.consecutive_auto_approvals
            );
            match self.ask(AskKind::AutoApprovalMaxReached, Some(prompt)).await? {
                Step::Aborted => return Ok(Some(TaskOutcome::Abandoned)),
                Step::Value(response) => {
                    if !self.gate.interpret(response).approved {
                        return Ok(Some(TaskOutcome::Abandoned));
                    }
                    self.consecutive_auto_approvals = 0;
                }
            }
        }

        Ok(None)
    }

    /// One request/stream/present cycle.
    async fn run_turn(&mut self) -> Result<TurnResult> {
        self.turn = TurnState::new();
        self.state = LoopState::Requesting;

        // Proactive truncation when the previous request approached the
        // window; reactive truncation below handles the provider error.
        if self.context_mgr.should_truncate(self.last_request_tokens) {
            let range = self.context_mgr.next_range(
                self.store.truncation_range(),
                self.store.model_history().len(),
                TruncationStrategy::Quarter,
            );
            self.store.set_truncation_range(range)?;
        }

        let req_ts = self.say(SayKind::ApiReqStarted, None)?;

        let mut context_failures = 0usize;
        let mut rate_limit_retry_used = false;
        let stream = loop {
            if self.abort.is_cancelled() {
                return Ok(TurnResult::Abandoned);
            }

            let history = self.store.request_history();
            let request = self.provider.create_message(&self.system_prompt, &history);
            let result = match tokio::time::timeout(self.request_timeout, request).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Transport(format!(
                    "no response within {}s",
                    self.request_timeout.as_secs()
                ))),
            };

            match result {
                Ok(stream) => break stream,
                Err(error) if error.is_context_window() && context_failures == 0 => {
                    context_failures += 1;
                    debug!(%error, "context window exceeded; truncating and retrying once");
                    let range = self.context_mgr.next_range(
                        self.store.truncation_range(),
                        self.store.model_history().len(),
                        TruncationStrategy::Quarter,
                    );
                    self.store.set_truncation_range(range)?;
                }
                Err(error) if error.is_context_window() => {
                    let prompt = format!(
                        "The request still exceeds the context window after truncation: {error}. Retry keeping only the latest exchange?"
                    );
                    match self.ask(AskKind::ApiReqFailed, Some(prompt)).await? {
                        Step::Aborted => return Ok(TurnResult::Abandoned),
                        Step::Value(response) => {
                            if !self.gate.interpret(response).approved {
                                return Ok(TurnResult::Abandoned);
                            }
                            let range = self.context_mgr.next_range(
                                self.store.truncation_range(),
                                self.store.model_history().len(),
                                TruncationStrategy::LastTwo,
                            );
                            self.store.set_truncation_range(range)?;
                            context_failures = 0;
                        }
                    }
                }
                Err(error) if error.is_rate_limit() && !rate_limit_retry_used => {
                    rate_limit_retry_used = true;
                    warn!(%error, "rate limited; backing off once");
                    tokio::select! {
                        _ = self.abort.cancelled() => return Ok(TurnResult::Abandoned),
                        _ = tokio::time::sleep(self.rate_limit_backoff) => {}
                    }
                }
                Err(error) => {
                    match self.ask(AskKind::ApiReqFailed, Some(error.to_string())).await? {
                        Step::Aborted => return Ok(TurnResult::Abandoned),
                        Step::Value(response) => {
                            if !self.gate.interpret(response).approved {
                                return Ok(TurnResult::Abandoned);
                            }
                        }
                    }
                }
            }
        };

        self.state = LoopState::Streaming;

        // Dedicated reader keeps the stream draining while the presenter
        // awaits approvals; the channel is the single-consumer block queue.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let reader_abort = self.abort.clone();
        let reader = tokio::spawn(async move {
            let mut stream = stream;
            loop {
                tokio::select! {
                    _ = reader_abort.cancelled() => break,
                    item = stream.next() => match item {
                        Some(item) => {
                            if chunk_tx.send(item).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let mut usage = TokenMetrics::default();
        let mut stream_error: Option<ApiError> = None;

        while let Some(item) = chunk_rx.recv().await {
            if self.abort.is_cancelled() {
                reader.abort();
                return Ok(TurnResult::Abandoned);
            }
            match item {
                Ok(ApiChunk::Text(piece)) => {
                    self.turn.accumulated.push_str(&piece);
                }
                Ok(ApiChunk::Reasoning(piece)) => {
                    self.turn.reasoning.push_str(&piece);
                    self.present_reasoning()?;
                    continue;
                }
                Ok(ApiChunk::Usage(chunk)) => {
                    usage.absorb(&TokenMetrics {
                        tokens_in: chunk.tokens_in,
                        tokens_out: chunk.tokens_out,
                        cache_writes: chunk.cache_writes,
                        cache_reads: chunk.cache_reads,
                        cost: chunk.cost,
                    });
                    continue;
                }
                Err(error) => {
                    stream_error = Some(error);
                    break;
                }
            }

            self.state = LoopState::Presenting;
            let blocks = self.parser.parse(&self.turn.accumulated);
            if self.drive_blocks(&blocks).await? {
                reader.abort();
                return Ok(TurnResult::Abandoned);
            }
        }
        reader.abort();

        if usage != TokenMetrics::default() {
            self.store.set_metrics(req_ts, usage)?;
            self.emit(req_ts);
            self.spent.absorb(&usage);
            self.last_request_tokens =
                (usage.tokens_in + usage.cache_writes + usage.cache_reads + usage.tokens_out)
                    as usize;
        }

        if let Some(error) = stream_error {
            return self.handle_stream_interruption(error).await;
        }

        // Stream finished: the cumulative text is now authoritative, so
        // every block is final.
        let blocks: Vec<_> = self
            .parser
            .parse(&self.turn.accumulated)
            .into_iter()
            .map(crate::parser::ContentBlock::finalized)
            .collect();
        if self.drive_blocks(&blocks).await? {
            return Ok(TurnResult::Abandoned);
        }
        self.finish_reasoning()?;

        if self.turn.accumulated.trim().is_empty() && self.turn.reasoning.trim().is_empty() {
            self.consecutive_mistakes += 1;
            self.say(
                SayKind::Error,
                Some("The model returned an empty response.".to_string()),
            )?;
            self.store
                .push_history(ModelHistoryEntry::assistant_text("[empty response]"))?;
            return Ok(TurnResult::Continue {
                next_user_content:
                    "Your previous response was empty. Respond with your reasoning and exactly one tool invocation."
                        .to_string(),
            });
        }

        self.store.push_history(ModelHistoryEntry::assistant_text(
            self.turn.accumulated.clone(),
        ))?;

        self.assemble_turn_result()
    }

    /// Decide how the turn ends once the stream is done and every block was
    /// presented: completion, condense, tool results, or a corrective nudge
    /// when the model used no tool at all.
    fn assemble_turn_result(&mut self) -> Result<TurnResult> {
        if let Some(resolution) = self.turn.completion.take() {
            use super::presentation::CompletionResolution;
            match resolution {
                CompletionResolution::Accepted => return Ok(TurnResult::Completed),
                CompletionResolution::Feedback { text, .. } => {
                    return Ok(TurnResult::Continue {
                        next_user_content: format!(
                            "The user reviewed the completion and responded:\n<feedback>\n{text}\n</feedback>"
                        ),
                    });
                }
            }
        }

        // A turn is ready with results if a tool ran, a tool was rejected,
        // or an invalid invocation produced corrective feedback. Only a
        // turn with none of those is a no-tool mistake.
        if !self.turn.did_already_used_tool
            && !self.turn.did_reject_tool
            && self.turn.tool_results.is_empty()
        {
            self.consecutive_mistakes += 1;
            return Ok(TurnResult::Continue {
                next_user_content:
                    "You responded without invoking a tool. Every response must contain exactly one tool invocation; use attempt_completion when the task is done."
                        .to_string(),
            });
        }

        let next_user_content = self.turn.tool_results.join("\n\n");

        if let Some(summary) = self.turn.condense_summary.take() {
            self.store.push_history(ModelHistoryEntry::user_text(
                next_user_content.clone(),
            ))?;
            self.store.push_history(ModelHistoryEntry::user_text(format!(
                "Conversation summary (written by you, replacing the elided turns):\n{summary}"
            )))?;
            let range = self.context_mgr.next_range(
                self.store.truncation_range(),
                self.store.model_history().len(),
                TruncationStrategy::LastTwo,
            );
            self.store.set_truncation_range(range)?;
            return Ok(TurnResult::Continue {
                next_user_content: "Context condensed. Continue the task from the summary."
                    .to_string(),
            });
        }

        Ok(TurnResult::Continue { next_user_content })
    }

    /// Transport failure mid-stream: persist the interruption marker, fall
    /// back to the persisted state, and let the user decide on a retry.
    async fn handle_stream_interruption(&mut self, error: ApiError) -> Result<TurnResult> {
        self.finish_reasoning()?;
        let marker = if self.turn.accumulated.trim().is_empty() {
            "[Response interrupted by API error]".to_string()
        } else {
            format!(
                "{}\n\n[Response interrupted by API error]",
                self.turn.accumulated
            )
        };
        self.store
            .push_history(ModelHistoryEntry::assistant_text(marker))?;
        self.say(
            SayKind::Error,
            Some(format!("The response stream failed: {error}")),
        )?;

        // Persisted state is the source of truth after a half-delivered
        // turn; reload it instead of trusting in-memory leftovers.
        self.reinitialize_from_disk()?;

        match self
            .ask(
                AskKind::ApiReqFailed,
                Some("The response was interrupted. Retry the request?".to_string()),
            )
            .await?
        {
            Step::Aborted => Ok(TurnResult::Abandoned),
            Step::Value(response) => {
                if self.gate.interpret(response).approved {
                    Ok(TurnResult::Continue {
                        next_user_content:
                            "[The previous response was interrupted by a transport failure. Reassess and continue the task.]"
                                .to_string(),
                    })
                } else {
                    Ok(TurnResult::Abandoned)
                }
            }
        }
    }

    fn reinitialize_from_disk(&mut self) -> Result<()> {
        let Some(state_dir) = self.state_dir.clone() else {
            return Ok(());
        };
        let task_id = self.store.task_id().to_string();
        self.store = ConversationStore::resume(&task_id, &state_dir)?;
        Ok(())
    }

    async fn abandon(&mut self) -> Result<TaskOutcome> {
        if let Some(edit) = self.tool_ctx.take_active_edit() {
            if let Err(error) = self.tool_ctx.editor.revert(&edit).await {
                warn!(%error, path = %edit.path.display(), "failed to revert staged edit on abort");
            }
        }
        self.state = LoopState::Abandoned;
        Ok(TaskOutcome::Abandoned)
    }

    /// Await every outstanding background commit. Runs at completion so
    /// each hash lands on its message before control returns to the user,
    /// and before any mutating tool so a pending snapshot never captures
    /// the next turn's changes.
    pub(crate) async fn flush_pending_commits(&mut self) -> Result<()> {
        for pending in std::mem::take(&mut self.pending_commits) {
            let ts = pending.message_ts;
            if let Some(hash) = pending.resolve().await {
                self.store.set_checkpoint_hash(ts, hash)?;
                self.emit(ts);
            }
        }
        Ok(())
    }

    /// Attach finished background commits to their messages.
    fn resolve_pending_commits(&mut self) -> Result<()> {
        let mut remaining = Vec::new();
        for mut pending in std::mem::take(&mut self.pending_commits) {
            match pending.try_resolve() {
                Some(Some(hash)) => {
                    self.store.set_checkpoint_hash(pending.message_ts, hash)?;
                    self.emit(pending.message_ts);
                }
                Some(None) => {}
                None => remaining.push(pending),
            }
        }
        self.pending_commits = remaining;
        Ok(())
    }

    // ---- transcript plumbing -------------------------------------------

    pub(crate) fn say(&mut self, kind: SayKind, text: Option<String>) -> Result<u64> {
        let ts = self.store.append(MessageKind::Say(kind), text)?;
        self.emit(ts);
        Ok(ts)
    }

    pub(crate) fn say_partial(&mut self, kind: SayKind, text: Option<String>) -> Result<u64> {
        let ts = self.store.append_partial(MessageKind::Say(kind), text)?;
        self.emit(ts);
        Ok(ts)
    }

    pub(crate) fn update_say(&mut self, ts: u64, text: Option<String>) -> Result<()> {
        self.store.update_partial(ts, text)?;
        self.emit(ts);
        Ok(())
    }

    pub(crate) fn finalize_say(&mut self, ts: u64, text: Option<String>) -> Result<()> {
        self.store.finalize(ts, text)?;
        self.emit(ts);
        Ok(())
    }

    pub(crate) fn emit(&self, ts: u64) {
        if let Some(message) = self.store.message_by_ts(ts) {
            let _ = self.events_tx.send(TaskEvent::Say(message.clone()));
        }
    }

    /// Append a blocking ask and await the user's answer, or observe abort.
    pub(crate) async fn ask(
        &mut self,
        kind: AskKind,
        text: Option<String>,
    ) -> Result<Step<AskResponse>> {
        let ts = self.store.append(MessageKind::Ask(kind), text)?;
        self.await_ask_response(ts).await
    }

    /// Provisional approval prompt for a still-streaming invocation: shown,
    /// not answerable.
    pub(crate) fn ask_preview(&mut self, kind: AskKind, text: Option<String>) -> Result<u64> {
        let ts = self.store.append_partial(MessageKind::Ask(kind), text)?;
        if let Some(message) = self.store.message_by_ts(ts) {
            let _ = self.events_tx.send(TaskEvent::AskPreview(message.clone()));
        }
        Ok(ts)
    }

    pub(crate) fn update_ask_preview(&mut self, ts: u64, text: Option<String>) -> Result<()> {
        self.store.update_partial(ts, text)?;
        if let Some(message) = self.store.message_by_ts(ts) {
            let _ = self.events_tx.send(TaskEvent::AskPreview(message.clone()));
        }
        Ok(())
    }

    /// Finalize an existing (possibly previewed) ask message and block on
    /// its response.
    pub(crate) async fn ask_existing(
        &mut self,
        ts: u64,
        text: Option<String>,
    ) -> Result<Step<AskResponse>> {
        self.store.finalize(ts, text)?;
        self.await_ask_response(ts).await
    }

    async fn await_ask_response(&mut self, ts: u64) -> Result<Step<AskResponse>> {
        let Some(message) = self.store.message_by_ts(ts).cloned() else {
            bail!("ask message {ts} disappeared");
        };
        let (response_tx, response_rx) = oneshot::channel();
        let _ = self.events_tx.send(TaskEvent::Ask {
            message,
            response_tx,
        });

        tokio::select! {
            _ = self.abort.cancelled() => Ok(Step::Aborted),
            response = response_rx => Ok(Step::Value(response.unwrap_or(AskResponse::Rejected {
                text: None,
                images: Vec::new(),
            }))),
        }
    }

    pub(crate) fn track_pending_commit(&mut self, pending: PendingCommit) {
        self.pending_commits.push(pending);
    }
}

fn generate_task_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("task-{millis}")
}
