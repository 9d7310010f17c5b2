pub mod command;
pub mod completion;
pub mod edits;
pub mod fs_tools;
pub mod workspace;

pub use command::{CommandEvent, CommandOutcome, CommandRunner, ShellCommandRunner};
pub use edits::{DirectFileEditor, FileEditor, StagedEdit};
pub use workspace::{ResolvedPath, WorkspaceOps};

use crate::approval::ToolCategory;
use crate::parser::{ToolUseBlock, ToolVocabulary};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How the engine routes a tool besides plain execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Execute and feed the result back to the model.
    Regular,
    /// Ends the turn loop; the result is presented to the user.
    Completion,
    /// Needs a user answer; the answer becomes the result.
    Followup,
    /// Requests a context condense; handled by the controller.
    Condense,
}

/// Shared collaborators handed to every tool execution.
pub struct ToolContext {
    pub workspace: Arc<WorkspaceOps>,
    pub editor: Arc<dyn FileEditor>,
    pub runner: Arc<dyn CommandRunner>,
    pub command_timeout: Duration,
    /// Fire-and-forget progress lines for the frontend (command output,
    /// still-running ticks). Never part of the message log.
    pub progress_tx: Option<mpsc::UnboundedSender<String>>,
    /// The staged edit currently in flight, reverted on task abort.
    pub active_edit: Arc<Mutex<Option<StagedEdit>>>,
}

impl ToolContext {
    pub fn notify(&self, line: impl Into<String>) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(line.into());
        }
    }

    pub fn set_active_edit(&self, edit: Option<StagedEdit>) {
        *self.active_edit.lock().unwrap_or_else(|e| e.into_inner()) = edit;
    }

    pub fn take_active_edit(&self) -> Option<StagedEdit> {
        self.active_edit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// A registered tool: a small interface the executor drives instead of one
/// giant per-name branch. New tools register independently.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn category(&self) -> ToolCategory;
    fn kind(&self) -> ToolKind {
        ToolKind::Regular
    }
    fn required_params(&self) -> &'static [&'static str];
    fn optional_params(&self) -> &'static [&'static str] {
        &[]
    }
    /// True when the trailing parameter arrives incrementally (file bodies)
    /// so a preview can stream before the invocation is complete.
    fn streams_last_param(&self) -> bool {
        false
    }
    fn is_mutating(&self) -> bool {
        matches!(self.category(), ToolCategory::Write | ToolCategory::Execute)
    }
    /// The path the action affects, for the approval gate's workspace axis.
    fn affected_path(&self, call: &ToolUseBlock) -> Option<String> {
        call.param("path").map(str::to_string)
    }

    /// Missing-parameter check; the default covers the common case.
    fn validate(&self, call: &ToolUseBlock) -> std::result::Result<(), String> {
        for param in self.required_params() {
            match call.param(param) {
                Some(value) if !value.trim().is_empty() => {}
                _ => return Err((*param).to_string()),
            }
        }
        Ok(())
    }

    /// One-line human preview for approval prompts and streamed updates.
    fn preview(&self, call: &ToolUseBlock) -> String;

    async fn execute(&self, ctx: &ToolContext, call: &ToolUseBlock) -> Result<String>;
}

/// Dispatch table mapping tool names to implementations, and the source of
/// the parser's markup vocabulary.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        let index = self.tools.len();
        self.tools.push(tool);
        self.by_name.insert(name, index);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|index| &self.tools[*index])
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn vocabulary(&self) -> ToolVocabulary {
        let names = self
            .tools
            .iter()
            .map(|tool| tool.name().to_string())
            .collect();
        let mut params = BTreeSet::new();
        for tool in &self.tools {
            for param in tool.required_params() {
                params.insert((*param).to_string());
            }
            for param in tool.optional_params() {
                params.insert((*param).to_string());
            }
        }
        ToolVocabulary::new(names, params.into_iter().collect())
    }

    /// A partial invocation can stream a preview once everything except a
    /// streaming trailing parameter is present.
    pub fn can_preview_partial(&self, call: &ToolUseBlock) -> bool {
        let Some(tool) = self.get(&call.name) else {
            return false;
        };
        if !tool.streams_last_param() {
            return false;
        }
        let Some((_, head)) = tool.required_params().split_last() else {
            return false;
        };
        head.iter().all(|param| {
            call.param(param)
                .is_some_and(|value| !value.trim().is_empty())
        })
    }

    /// Standard tool set wired to the given workspace root.
    pub fn builtin(workspace_root: PathBuf) -> Self {
        Self::builtin_with(Arc::new(WorkspaceOps::new(workspace_root)))
    }

    /// Variant sharing one `WorkspaceOps` with the caller's `ToolContext`.
    pub fn builtin_with(workspace: Arc<WorkspaceOps>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(fs_tools::ReadFileTool::new(workspace.clone())));
        registry.register(Arc::new(fs_tools::WriteToFileTool::new(workspace.clone())));
        registry.register(Arc::new(fs_tools::ReplaceInFileTool::new(
            workspace.clone(),
        )));
        registry.register(Arc::new(fs_tools::ListFilesTool::new(workspace.clone())));
        registry.register(Arc::new(fs_tools::SearchFilesTool::new(workspace)));
        registry.register(Arc::new(command::ExecuteCommandTool));
        registry.register(Arc::new(completion::AskFollowupQuestionTool));
        registry.register(Arc::new(completion::AttemptCompletionTool));
        registry.register(Arc::new(completion::CondenseTool));
        registry
    }

    /// System-prompt section teaching the model the markup protocol.
    pub fn render_system_prompt(&self, workspace_root: &std::path::Path) -> String {
        let mut out = String::new();
        out.push_str(
            "You are a coding agent operating on the user's workspace.\n\
             Work in turns: in each response, think briefly, then invoke exactly one tool.\n\
             Invoke tools with XML-style markup, one tool per message:\n\
             <tool_name>\n<param>value</param>\n</tool_name>\n\
             Wait for the tool result before continuing. Never invoke more than one tool per message.\n\
             When the task is complete, use attempt_completion to present the result.\n",
        );
        out.push_str(&format!(
            "The workspace root is {}.\n\nAvailable tools:\n",
            workspace_root.display()
        ));
        for tool in &self.tools {
            out.push_str(&format!("\n## {}\n{}\n", tool.name(), tool.description()));
            out.push_str("Parameters:");
            for param in tool.required_params() {
                out.push_str(&format!(" <{param}> (required)"));
            }
            for param in tool.optional_params() {
                out.push_str(&format!(" <{param}>"));
            }
            out.push('\n');
        }
        out
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn call(name: &str, params: &[(&str, &str)]) -> ToolUseBlock {
        ToolUseBlock {
            name: name.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            partial: false,
        }
    }

    #[test]
    fn test_builtin_registry_covers_expected_tools() {
        let registry = ToolRegistry::builtin(PathBuf::from("/tmp"));
        let expected = [
            "read_file",
            "write_to_file",
            "replace_in_file",
            "list_files",
            "search_files",
            "execute_command",
            "ask_followup_question",
            "attempt_completion",
            "condense",
        ];
        for name in expected {
            assert!(registry.get(name).is_some(), "missing tool {name}");
        }
    }

    #[test]
    fn test_vocabulary_contains_tool_and_param_names() {
        let registry = ToolRegistry::builtin(PathBuf::from("/tmp"));
        let vocab = registry.vocabulary();
        assert!(vocab.tool_names().iter().any(|n| n == "read_file"));
    }

    #[test]
    fn test_validate_reports_first_missing_param() {
        let registry = ToolRegistry::builtin(PathBuf::from("/tmp"));
        let tool = registry.get("write_to_file").expect("tool");
        let missing = tool
            .validate(&call("write_to_file", &[("content", "x")]))
            .expect_err("path missing");
        assert_eq!(missing, "path");
    }

    #[test]
    fn test_can_preview_partial_requires_leading_params() {
        let registry = ToolRegistry::builtin(PathBuf::from("/tmp"));

        let with_path = call("write_to_file", &[("path", "a.txt")]);
        assert!(registry.can_preview_partial(&with_path));

        let without_path = call("write_to_file", &[]);
        assert!(!registry.can_preview_partial(&without_path));

        // read_file has no streaming trailing param
        let read = call("read_file", &[("path", "a.txt")]);
        assert!(!registry.can_preview_partial(&read));
    }
}
