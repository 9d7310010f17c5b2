use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::approval::AutoApprovalSettings;
use crate::util::{env_override_u64, env_override_usize, is_local_endpoint_url};

const DEFAULT_STATE_DIR: &str = ".tiller";
const DEFAULT_CONTEXT_WINDOW_TOKENS: usize = 200_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CONSECUTIVE_MISTAKE_LIMIT: usize = 3;
const DEFAULT_RATE_LIMIT_BACKOFF_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
    pub anthropic_version: String,
    /// Root every relative tool path resolves against. Threaded explicitly
    /// into each component; there is no process-global fallback.
    pub workspace_root: PathBuf,
    /// Where task transcripts and snapshot objects live.
    pub state_dir: PathBuf,
    pub context_window_tokens: usize,
    pub request_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub consecutive_mistake_limit: usize,
    pub rate_limit_backoff_secs: u64,
    /// Hard cost ceiling in dollars; `None` disables the budget guard.
    pub budget_limit: Option<f64>,
    pub auto_approval: AutoApprovalSettings,
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_url = std::env::var("ANTHROPIC_API_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string());
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok().and_then(|v| {
            if v.trim().is_empty() {
                None
            } else {
                Some(v)
            }
        });
        let model = std::env::var("ANTHROPIC_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-5-20250929".to_string());
        let anthropic_version =
            std::env::var("ANTHROPIC_VERSION").unwrap_or_else(|_| "2023-06-01".to_string());

        let workspace_root = match std::env::var("TILLER_WORKSPACE") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => std::env::current_dir()?,
        };
        let state_dir = match std::env::var("TILLER_STATE_DIR") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => workspace_root.join(DEFAULT_STATE_DIR),
        };

        let budget_limit = std::env::var("TILLER_BUDGET_LIMIT")
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| *v > 0.0);

        Ok(Self {
            api_key,
            model,
            api_url,
            anthropic_version,
            workspace_root,
            state_dir,
            context_window_tokens: env_override_usize(
                "TILLER_CONTEXT_WINDOW_TOKENS",
                DEFAULT_CONTEXT_WINDOW_TOKENS,
                8_192,
                2_000_000,
            ),
            request_timeout_secs: env_override_u64(
                "TILLER_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
                10,
                600,
            ),
            command_timeout_secs: env_override_u64(
                "TILLER_COMMAND_TIMEOUT_SECS",
                DEFAULT_COMMAND_TIMEOUT_SECS,
                2,
                1_800,
            ),
            consecutive_mistake_limit: env_override_usize(
                "TILLER_MISTAKE_LIMIT",
                DEFAULT_CONSECUTIVE_MISTAKE_LIMIT,
                1,
                20,
            ),
            rate_limit_backoff_secs: env_override_u64(
                "TILLER_RATE_LIMIT_BACKOFF_SECS",
                DEFAULT_RATE_LIMIT_BACKOFF_SECS,
                1,
                120,
            ),
            budget_limit,
            auto_approval: AutoApprovalSettings::from_env(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!(
                "Invalid ANTHROPIC_API_URL '{}': expected http:// or https:// URL",
                self.api_url
            );
        }

        let local_endpoint = self.is_local_endpoint();
        if !local_endpoint && self.api_key.is_none() {
            bail!(
                "ANTHROPIC_API_KEY must be set for non-local endpoints (url: '{}')",
                self.api_url
            );
        }

        if !self.workspace_root.is_dir() {
            bail!(
                "Workspace root '{}' is not a directory",
                self.workspace_root.display()
            );
        }

        Ok(())
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }
}
