use super::{TaskEvent, TaskLoop, TaskOutcome};
use crate::api::mock_client::{MockProvider, MockTurn};
use crate::api::ApiError;
use crate::approval::{AskResponse, AutoApprovalSettings};
use crate::checkpoint::{RestoreMode, ShadowSnapshotStore};
use crate::config::Config;
use crate::store::{AskKind, ConversationStore, MessageKind, ModelHistoryEntry, SayKind};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn test_config(workspace: &Path, auto_approval: AutoApprovalSettings) -> Config {
    Config {
        api_key: None,
        model: "mock-model".to_string(),
        api_url: "http://localhost:9/v1/messages".to_string(),
        anthropic_version: "2023-06-01".to_string(),
        workspace_root: workspace.to_path_buf(),
        state_dir: workspace.join(".tiller"),
        context_window_tokens: 200_000,
        request_timeout_secs: 10,
        command_timeout_secs: 10,
        consecutive_mistake_limit: 3,
        rate_limit_backoff_secs: 1,
        budget_limit: None,
        auto_approval,
    }
}

fn auto_edits() -> AutoApprovalSettings {
    AutoApprovalSettings {
        edit_files: true,
        ..AutoApprovalSettings::default()
    }
}

fn spawn_responder(
    mut events_rx: mpsc::UnboundedReceiver<TaskEvent>,
    script: Vec<AskResponse>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut script: VecDeque<AskResponse> = script.into();
        while let Some(event) = events_rx.recv().await {
            if let TaskEvent::Ask { response_tx, .. } = event {
                let response = script.pop_front().unwrap_or(AskResponse::Approved {
                    text: None,
                    images: Vec::new(),
                });
                let _ = response_tx.send(response);
            }
        }
    })
}

fn build_task(
    temp: &TempDir,
    mut config: Config,
    provider: MockProvider,
    ask_script: Vec<AskResponse>,
) -> (TaskLoop, tokio::task::JoinHandle<()>) {
    std::fs::create_dir_all(&config.workspace_root).expect("workspace dir");
    config.state_dir = temp.path().join("state");
    let backend = ShadowSnapshotStore::new(
        config.workspace_root.clone(),
        temp.path().join("state/snapshots/test-task"),
    )
    .expect("backend");
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let store = ConversationStore::new("test-task", None).expect("store");
    let task = TaskLoop::assemble(
        &config,
        Arc::new(provider),
        Box::new(backend),
        events_tx,
        store,
        false,
    )
    .expect("task");
    let responder = spawn_responder(events_rx, ask_script);
    (task, responder)
}

fn workspace(temp: &TempDir) -> std::path::PathBuf {
    temp.path().join("ws")
}

fn write_turn(path: &str, content: &str) -> MockTurn {
    MockProvider::text_turn(&format!(
        "Writing the file now.\n<write_to_file>\n<path>{path}</path>\n<content>\n{content}\n</content>\n</write_to_file>"
    ))
}

fn completion_turn(result: &str) -> MockTurn {
    MockProvider::text_turn(&format!(
        "<attempt_completion>\n<result>\n{result}\n</result>\n</attempt_completion>"
    ))
}

fn say_messages(task: &TaskLoop, kind: SayKind) -> Vec<String> {
    task.store()
        .messages()
        .iter()
        .filter(|m| m.say_kind() == Some(kind))
        .map(|m| m.text.clone().unwrap_or_default())
        .collect()
}

fn ask_kinds(task: &TaskLoop) -> Vec<AskKind> {
    task.store()
        .messages()
        .iter()
        .filter_map(|m| match m.kind {
            MessageKind::Ask(kind) => Some(kind),
            MessageKind::Say(_) => None,
        })
        .collect()
}

fn user_history_text(task: &TaskLoop, index: usize) -> String {
    task.store().model_history()[index].joined_text()
}

#[tokio::test]
async fn test_simple_write_and_complete() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        write_turn("a.txt", "hello"),
        completion_turn("Created a.txt."),
    ]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider.clone(), Vec::new());

    let outcome = task.run("create a.txt".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(
        std::fs::read_to_string(workspace(&temp).join("a.txt")).expect("file written"),
        "hello"
    );

    // assistant turn, then tool results as the next user content
    assert!(user_history_text(&task, 2).contains("[write_to_file] result:"));
    assert_eq!(provider.request_history_lens.lock().unwrap().len(), 2);

    let completions = say_messages(&task, SayKind::CompletionResult);
    assert_eq!(completions.len(), 1);
    assert!(completions[0].contains("Created a.txt."));
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_message_ts_strictly_increasing() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        write_turn("a.txt", "one"),
        write_turn("b.txt", "two"),
        completion_turn("Done."),
    ]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider, Vec::new());

    task.run("write files".to_string()).await.expect("run");

    let mut previous = 0;
    for message in task.store().messages() {
        assert!(message.ts > previous, "ts {} not increasing", message.ts);
        previous = message.ts;
    }
    drop(task);
    responder.abort();
}

// Scenario A: a missing required parameter produces exactly one error-class
// message, reports back to the model, and performs no side effect.
#[tokio::test]
async fn test_missing_parameter_is_recoverable() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        MockProvider::text_turn(
            "<write_to_file>\n<content>\nx\n</content>\n</write_to_file>",
        ),
        completion_turn("Recovered."),
    ]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider, Vec::new());

    let outcome = task.run("write something".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);

    let errors = say_messages(&task, SayKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Missing required parameter 'path'"));

    // The corrective feedback reached the model...
    assert!(user_history_text(&task, 2).contains("Missing required parameter 'path'"));
    // ...and no file was created anywhere in the workspace.
    let entries: Vec<_> = std::fs::read_dir(workspace(&temp))
        .expect("read workspace")
        .collect();
    assert!(entries.is_empty(), "no side effect expected: {entries:?}");
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_mistake_limit_pauses_with_ask() {
    let temp = TempDir::new().expect("temp dir");
    let missing =
        || MockProvider::text_turn("<write_to_file>\n<content>\nx\n</content>\n</write_to_file>");
    let provider = MockProvider::new(vec![missing(), missing(), missing()]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(
        &temp,
        config,
        provider,
        vec![AskResponse::Rejected {
            text: None,
            images: Vec::new(),
        }],
    );

    let outcome = task.run("write something".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Abandoned);
    assert_eq!(say_messages(&task, SayKind::Error).len(), 3);
    assert!(ask_kinds(&task).contains(&AskKind::MistakeLimitReached));
    drop(task);
    responder.abort();
}

// Scenario B: a rejected write leaves the file byte-identical, pushes a
// denied result, and records the feedback as its own message.
#[tokio::test]
async fn test_rejected_write_leaves_file_untouched() {
    let temp = TempDir::new().expect("temp dir");
    let ws = workspace(&temp);
    std::fs::create_dir_all(&ws).expect("ws");
    std::fs::write(ws.join("a.txt"), "original contents").expect("seed file");

    let provider = MockProvider::new(vec![
        write_turn("a.txt", "overwritten"),
        completion_turn("Stopping as asked."),
    ]);
    // Writes are not auto-approved here.
    let config = test_config(&ws, AutoApprovalSettings::default());
    let (mut task, responder) = build_task(
        &temp,
        config,
        provider,
        vec![AskResponse::Message {
            text: "leave that file alone".to_string(),
            images: Vec::new(),
        }],
    );

    let outcome = task.run("rewrite a.txt".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);

    assert_eq!(
        std::fs::read_to_string(ws.join("a.txt")).expect("file"),
        "original contents"
    );
    let results = user_history_text(&task, 2);
    assert!(results.contains("denied permission"));
    assert!(results.contains("leave that file alone"));
    let feedback = say_messages(&task, SayKind::UserFeedback);
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0], "leave that file alone");
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_rejection_short_circuits_later_tools() {
    let temp = TempDir::new().expect("temp dir");
    let turn = MockProvider::text_turn(concat!(
        "<write_to_file>\n<path>a.txt</path>\n<content>\nx\n</content>\n</write_to_file>\n",
        "<read_file>\n<path>a.txt</path>\n</read_file>",
    ));
    let provider = MockProvider::new(vec![turn, completion_turn("ok")]);
    let config = test_config(&workspace(&temp), AutoApprovalSettings::default());
    let (mut task, responder) = build_task(
        &temp,
        config,
        provider,
        vec![AskResponse::Rejected {
            text: None,
            images: Vec::new(),
        }],
    );

    task.run("do things".to_string()).await.expect("run");

    let results = user_history_text(&task, 2);
    assert!(results.contains("denied permission to run [write_to_file]"));
    assert!(results.contains("[read_file] was skipped because the user rejected"));
    drop(task);
    responder.abort();
}

// One executed tool per turn: extra invocations in the same assistant turn
// are documented but never run.
#[tokio::test]
async fn test_single_tool_per_turn() {
    let temp = TempDir::new().expect("temp dir");
    let turn = MockProvider::text_turn(concat!(
        "<write_to_file>\n<path>a.txt</path>\n<content>\nfirst\n</content>\n</write_to_file>\n",
        "<write_to_file>\n<path>b.txt</path>\n<content>\nsecond\n</content>\n</write_to_file>",
    ));
    let provider = MockProvider::new(vec![turn, completion_turn("done")]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider, Vec::new());

    task.run("write both".to_string()).await.expect("run");

    let ws = workspace(&temp);
    assert_eq!(std::fs::read_to_string(ws.join("a.txt")).expect("a"), "first");
    assert!(!ws.join("b.txt").exists(), "second tool must not execute");

    let results = user_history_text(&task, 2);
    let result_count = results.matches("[write_to_file] result:").count();
    assert_eq!(result_count, 1);
    assert!(results.contains("only one tool may be used per message"));
    drop(task);
    responder.abort();
}

// Scenario C: three mutating turns produce three distinct checkpoints, each
// diffable against its predecessor to exactly that turn's changes.
#[tokio::test]
async fn test_checkpoint_chain_across_turns() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        write_turn("a.txt", "alpha"),
        write_turn("b.txt", "beta"),
        write_turn("c.txt", "gamma"),
        completion_turn("All written."),
    ]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider, Vec::new());

    let outcome = task.run("write three files".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);

    let mut hashes: Vec<String> = task
        .store()
        .messages()
        .iter()
        .filter_map(|m| m.checkpoint_hash.clone())
        .collect();
    hashes.dedup();
    // task start + three writes + completion
    assert!(hashes.len() >= 4, "expected a chain of checkpoints: {hashes:?}");
    let unique: std::collections::BTreeSet<&String> = hashes.iter().collect();
    assert_eq!(unique.len(), hashes.len(), "hashes must be distinct");

    let expected_files = ["a.txt", "b.txt", "c.txt"];
    for (i, pair) in hashes.windows(2).take(3).enumerate() {
        let diffs = task
            .checkpoints
            .diff(pair[0].clone(), Some(pair[1].clone()))
            .await
            .expect("diff");
        let changed: Vec<&str> = diffs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(changed, vec![expected_files[i]], "turn {i} diff");
    }
    drop(task);
    responder.abort();
}

// Scenario D: a context-window error on the first chunk triggers exactly one
// automatic truncate-and-retry; a second consecutive failure asks the user.
#[tokio::test]
async fn test_context_window_truncate_and_retry_once() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        MockTurn::FirstChunkError(ApiError::ContextWindowExceeded("too long".to_string())),
        completion_turn("Fits now."),
    ]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider.clone(), Vec::new());

    // Seed enough history that truncation has something to drop.
    for i in 0..12 {
        task.store
            .push_history(ModelHistoryEntry::user_text(format!("seed {i}")))
            .expect("seed");
    }

    let outcome = task.run("finish up".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);

    // Exactly two requests: the failed one and the truncated retry, with no
    // user prompt in between.
    assert_eq!(*provider.request_history_lens.lock().unwrap(), vec![13, 11]);
    assert!(task.store().truncation_range().is_some());
    assert!(!ask_kinds(&task).contains(&AskKind::ApiReqFailed));
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_second_context_failure_escalates_to_user() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        MockTurn::FirstChunkError(ApiError::ContextWindowExceeded("too long".to_string())),
        MockTurn::FirstChunkError(ApiError::ContextWindowExceeded("still too long".to_string())),
    ]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(
        &temp,
        config,
        provider.clone(),
        vec![AskResponse::Rejected {
            text: None,
            images: Vec::new(),
        }],
    );

    let outcome = task.run("finish up".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Abandoned);
    assert_eq!(provider.request_history_lens.lock().unwrap().len(), 2);
    assert!(ask_kinds(&task).contains(&AskKind::ApiReqFailed));
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_rate_limit_backs_off_and_retries_once() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        MockTurn::FirstChunkError(ApiError::RateLimited("429".to_string())),
        completion_turn("Through."),
    ]);
    let mut config = test_config(&workspace(&temp), auto_edits());
    config.rate_limit_backoff_secs = 1;
    let (mut task, responder) = build_task(&temp, config, provider.clone(), Vec::new());

    let outcome = task.run("quick task".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(provider.request_history_lens.lock().unwrap().len(), 2);
    // Automatic: no retry prompt surfaced.
    assert!(!ask_kinds(&task).contains(&AskKind::ApiReqFailed));
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_mid_stream_failure_marks_interruption() {
    let temp = TempDir::new().expect("temp dir");
    let first = match MockProvider::text_turn("Partial thoughts about the task") {
        MockTurn::Chunks(chunks) => {
            MockTurn::ChunksThenError(chunks, ApiError::Transport("connection reset".to_string()))
        }
        _ => unreachable!(),
    };
    let provider = MockProvider::new(vec![first, completion_turn("Recovered.")]);
    let config = test_config(&workspace(&temp), auto_edits());
    // Approve the retry prompt.
    let (mut task, responder) = build_task(&temp, config, provider, Vec::new());

    let outcome = task.run("think".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);

    let interrupted = task
        .store()
        .model_history()
        .iter()
        .any(|entry| entry.joined_text().contains("[Response interrupted by API error]"));
    assert!(interrupted, "history must carry the interruption marker");
    assert!(ask_kinds(&task).contains(&AskKind::ApiReqFailed));
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_budget_ceiling_halts_loop() {
    let temp = TempDir::new().expect("temp dir");
    // Each mock turn reports $0.01 of cost.
    let provider = MockProvider::new(vec![
        MockProvider::text_turn("Just talking, no tool."),
        completion_turn("never reached"),
    ]);
    let mut config = test_config(&workspace(&temp), auto_edits());
    config.budget_limit = Some(0.005);
    let (mut task, responder) = build_task(&temp, config, provider.clone(), Vec::new());

    let outcome = task.run("chat".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::BudgetExceeded);
    assert_eq!(provider.request_history_lens.lock().unwrap().len(), 1);
    let errors = say_messages(&task, SayKind::Error);
    assert!(errors.iter().any(|e| e.contains("budget")));
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_auto_approval_cap_asks_before_resuming() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        write_turn("a.txt", "one"),
        write_turn("b.txt", "two"),
        write_turn("c.txt", "three"),
    ]);
    let mut auto = auto_edits();
    auto.max_consecutive_requests = 2;
    let config = test_config(&workspace(&temp), auto);
    let (mut task, responder) = build_task(
        &temp,
        config,
        provider.clone(),
        vec![AskResponse::Rejected {
            text: None,
            images: Vec::new(),
        }],
    );

    let outcome = task.run("write files".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Abandoned);
    assert_eq!(provider.request_history_lens.lock().unwrap().len(), 2);
    assert!(ask_kinds(&task).contains(&AskKind::AutoApprovalMaxReached));
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_no_tool_use_counts_as_mistake_and_nudges() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        MockProvider::text_turn("I think the answer is 42."),
        completion_turn("42."),
    ]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider, Vec::new());

    let outcome = task.run("answer".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);
    assert!(user_history_text(&task, 2).contains("without invoking a tool"));
    drop(task);
    responder.abort();
}

#[tokio::test]
async fn test_condense_appends_summary_then_truncates() {
    let temp = TempDir::new().expect("temp dir");
    let ws = workspace(&temp);
    std::fs::create_dir_all(&ws).expect("ws");
    std::fs::write(ws.join("notes.txt"), "some notes").expect("seed");

    let provider = MockProvider::new(vec![
        MockProvider::text_turn("<read_file>\n<path>notes.txt</path>\n</read_file>"),
        MockProvider::text_turn(
            "<condense>\n<summary>\nRead notes.txt; it contains some notes.\n</summary>\n</condense>",
        ),
        completion_turn("Done."),
    ]);
    let config = test_config(&ws, auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider.clone(), Vec::new());

    let outcome = task.run("summarize notes".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);

    let summaries = say_messages(&task, SayKind::CondenseSummary);
    assert_eq!(summaries.len(), 1);

    let range = task.store().truncation_range().expect("range set");
    assert_eq!(range.start, 1);
    assert!(range.end > range.start);

    // The summary entry itself must be outside the elided span.
    let summary_index = task
        .store()
        .model_history()
        .iter()
        .position(|entry| entry.joined_text().contains("Conversation summary"))
        .expect("summary entry");
    assert!(summary_index >= range.end);
    drop(task);
    responder.abort();
}

// Scenario E: restoring to an earlier message truncates both logs to the
// boundary and folds deleted request accounting into one summary message.
#[tokio::test]
async fn test_restore_truncates_logs_and_aggregates_metrics() {
    let temp = TempDir::new().expect("temp dir");
    let provider = MockProvider::new(vec![
        write_turn("a.txt", "alpha"),
        completion_turn("Wrote it."),
    ]);
    let config = test_config(&workspace(&temp), auto_edits());
    let (mut task, responder) = build_task(&temp, config, provider, Vec::new());

    let outcome = task.run("write a file".to_string()).await.expect("run");
    assert_eq!(outcome, TaskOutcome::Completed);
    assert!(workspace(&temp).join("a.txt").exists());

    // Restore to the task message (the first checkpointed point).
    let target = task.store().messages()[0].clone();
    let target_index = 0usize;
    let deleted = task
        .checkpoints
        .restore(&mut task.store, target.ts, RestoreMode::TaskAndWorkspace)
        .await
        .expect("restore")
        .expect("task mode returns metrics");

    // Both requests' accounting was folded into the summary.
    assert_eq!(deleted.tokens_in, 200);
    assert!(deleted.cost.is_some());

    let messages = task.store().messages();
    // target survives at its index, plus exactly one summary message
    assert_eq!(messages.len(), target_index + 2);
    assert_eq!(messages[0].ts, target.ts);
    assert_eq!(
        messages[1].say_kind(),
        Some(SayKind::DeletedApiReqs),
        "summary message expected: {messages:?}"
    );

    // History cut back to the matching boundary (just the task message).
    assert_eq!(task.store().model_history().len(), 1);

    // The workspace was reset to the pre-write snapshot.
    assert!(!workspace(&temp).join("a.txt").exists());
    drop(task);
    responder.abort();
}
