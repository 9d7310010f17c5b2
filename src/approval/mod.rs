use crate::util::parse_bool_flag;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Coarse classification every tool declares; each category is an
/// independently configurable approval axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Write,
    Execute,
    Browse,
    Mcp,
}

/// Per-category auto-approval policy. File-affecting categories carry a
/// second axis for paths outside the workspace root; an out-of-workspace
/// action auto-approves only when both axes allow it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApprovalSettings {
    pub enabled: bool,
    pub read_files: bool,
    pub read_files_outside_workspace: bool,
    pub edit_files: bool,
    pub edit_files_outside_workspace: bool,
    pub execute_commands: bool,
    pub use_browser: bool,
    pub use_mcp: bool,
    /// Pause for confirmation after this many uninterrupted auto-approvals.
    pub max_consecutive_requests: usize,
}

impl Default for AutoApprovalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            read_files: true,
            read_files_outside_workspace: false,
            edit_files: false,
            edit_files_outside_workspace: false,
            execute_commands: false,
            use_browser: false,
            use_mcp: false,
            max_consecutive_requests: 20,
        }
    }
}

impl AutoApprovalSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            std::env::var(key)
                .ok()
                .and_then(parse_bool_flag)
                .unwrap_or(default)
        };
        Self {
            enabled: flag("TILLER_AUTO_APPROVE", defaults.enabled),
            read_files: flag("TILLER_AUTO_APPROVE_READS", defaults.read_files),
            read_files_outside_workspace: flag(
                "TILLER_AUTO_APPROVE_READS_OUTSIDE",
                defaults.read_files_outside_workspace,
            ),
            edit_files: flag("TILLER_AUTO_APPROVE_EDITS", defaults.edit_files),
            edit_files_outside_workspace: flag(
                "TILLER_AUTO_APPROVE_EDITS_OUTSIDE",
                defaults.edit_files_outside_workspace,
            ),
            execute_commands: flag("TILLER_AUTO_APPROVE_COMMANDS", defaults.execute_commands),
            use_browser: flag("TILLER_AUTO_APPROVE_BROWSER", defaults.use_browser),
            use_mcp: flag("TILLER_AUTO_APPROVE_MCP", defaults.use_mcp),
            max_consecutive_requests: crate::util::env_override_usize(
                "TILLER_AUTO_APPROVE_MAX_REQUESTS",
                defaults.max_consecutive_requests,
                1,
                1_000,
            ),
        }
    }
}

/// How the user answered an approval prompt. Free text is an implicit
/// rejection that carries feedback; both approve and reject may carry
/// feedback which is appended to the pending tool result.
#[derive(Debug, Clone, PartialEq)]
pub enum AskResponse {
    Approved {
        text: Option<String>,
        images: Vec<String>,
    },
    Rejected {
        text: Option<String>,
        images: Vec<String>,
    },
    Message {
        text: String,
        images: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub feedback_text: Option<String>,
    pub feedback_images: Vec<String>,
}

/// Decides whether a tool action may run without interactive confirmation.
#[derive(Debug, Clone)]
pub struct ToolApprovalGate {
    settings: AutoApprovalSettings,
}

impl ToolApprovalGate {
    pub fn new(settings: AutoApprovalSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AutoApprovalSettings {
        &self.settings
    }

    pub fn max_consecutive_requests(&self) -> usize {
        self.settings.max_consecutive_requests
    }

    /// `target` is the affected path for file categories, used to pick the
    /// in/out-of-workspace axis. Non-file categories ignore it.
    pub fn decide(
        &self,
        category: ToolCategory,
        target: Option<&Path>,
        workspace_root: &Path,
    ) -> bool {
        if !self.settings.enabled {
            return false;
        }

        let outside = target.is_some_and(|path| !path_within(path, workspace_root));

        match category {
            ToolCategory::Read => {
                self.settings.read_files
                    && (!outside || self.settings.read_files_outside_workspace)
            }
            ToolCategory::Write => {
                self.settings.edit_files
                    && (!outside || self.settings.edit_files_outside_workspace)
            }
            ToolCategory::Execute => self.settings.execute_commands,
            ToolCategory::Browse => self.settings.use_browser,
            ToolCategory::Mcp => self.settings.use_mcp,
        }
    }

    /// Interpret a raw ask response into the approval outcome the executor
    /// acts on.
    pub fn interpret(&self, response: AskResponse) -> ApprovalOutcome {
        match response {
            AskResponse::Approved { text, images } => ApprovalOutcome {
                approved: true,
                feedback_text: text.filter(|t| !t.trim().is_empty()),
                feedback_images: images,
            },
            AskResponse::Rejected { text, images } => ApprovalOutcome {
                approved: false,
                feedback_text: text.filter(|t| !t.trim().is_empty()),
                feedback_images: images,
            },
            AskResponse::Message { text, images } => ApprovalOutcome {
                approved: false,
                feedback_text: Some(text),
                feedback_images: images,
            },
        }
    }
}

fn path_within(path: &Path, root: &Path) -> bool {
    let canonical_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let canonical_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    canonical_path.starts_with(&canonical_root)
}
