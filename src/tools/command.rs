use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Progress the runner reports while a command executes.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    Line(String),
    /// Emitted on a fixed interval so long-running commands stay visible.
    StillRunning { elapsed_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

/// The command-execution collaborator: run a shell command, stream
/// line-oriented output, kill on timeout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        events_tx: mpsc::UnboundedSender<CommandEvent>,
    ) -> Result<CommandOutcome>;
}

const STILL_RUNNING_INTERVAL: Duration = Duration::from_secs(10);
const MAX_CAPTURED_OUTPUT_BYTES: usize = 200_000;

pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        events_tx: mpsc::UnboundedSender<CommandEvent>,
    ) -> Result<CommandOutcome> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn command: {command}"))?;

        let stdout = child.stdout.take().context("child stdout missing")?;
        let stderr = child.stderr.take().context("child stderr missing")?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut output = String::new();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + STILL_RUNNING_INTERVAL,
            STILL_RUNNING_INTERVAL,
        );
        let started = tokio::time::Instant::now();

        let push_line = |line: String, output: &mut String| {
            if output.len() < MAX_CAPTURED_OUTPUT_BYTES {
                output.push_str(&line);
                output.push('\n');
            }
            let _ = events_tx.send(CommandEvent::Line(line));
        };

        loop {
            if stdout_done && stderr_done {
                break;
            }
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => match line {
                    Ok(Some(line)) => push_line(line, &mut output),
                    _ => stdout_done = true,
                },
                line = stderr_lines.next_line(), if !stderr_done => match line {
                    Ok(Some(line)) => push_line(line, &mut output),
                    _ => stderr_done = true,
                },
                _ = ticker.tick() => {
                    let _ = events_tx.send(CommandEvent::StillRunning {
                        elapsed_secs: started.elapsed().as_secs(),
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return Ok(CommandOutcome {
                        exit_code: None,
                        output,
                        timed_out: true,
                    });
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for command")?,
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                return Ok(CommandOutcome {
                    exit_code: None,
                    output,
                    timed_out: true,
                });
            }
        };

        Ok(CommandOutcome {
            exit_code: status.code(),
            output,
            timed_out: false,
        })
    }
}

/// Runs a shell command through the command-runner collaborator, streaming
/// its lines to the frontend and returning the aggregated output as the
/// single tool result.
pub struct ExecuteCommandTool;

#[async_trait]
impl super::Tool for ExecuteCommandTool {
    fn name(&self) -> &'static str {
        "execute_command"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the workspace. Set <requires_approval>true</requires_approval> for commands with side effects beyond the workspace."
    }

    fn category(&self) -> crate::approval::ToolCategory {
        crate::approval::ToolCategory::Execute
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["command"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["requires_approval"]
    }

    fn affected_path(&self, _call: &crate::parser::ToolUseBlock) -> Option<String> {
        None
    }

    fn preview(&self, call: &crate::parser::ToolUseBlock) -> String {
        format!("run command: {}", call.param("command").unwrap_or("<missing>"))
    }

    async fn execute(
        &self,
        ctx: &super::ToolContext,
        call: &crate::parser::ToolUseBlock,
    ) -> Result<String> {
        let command = call
            .param("command")
            .filter(|c| !c.trim().is_empty())
            .context("missing required parameter 'command'")?
            .to_string();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let progress = ctx.progress_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let line = match event {
                    CommandEvent::Line(line) => line,
                    CommandEvent::StillRunning { elapsed_secs } => {
                        format!("[command still running after {elapsed_secs}s]")
                    }
                };
                if let Some(tx) = &progress {
                    let _ = tx.send(line);
                }
            }
        });

        let outcome = ctx.runner.run(&command, ctx.command_timeout, events_tx).await;
        let _ = forwarder.await;
        let outcome = outcome?;

        if outcome.timed_out {
            return Ok(format!(
                "Command timed out after {}s. Partial output:\n{}",
                ctx.command_timeout.as_secs(),
                outcome.output
            ));
        }

        let exit_note = match outcome.exit_code {
            Some(0) => "Command executed successfully.".to_string(),
            Some(code) => format!("Command exited with status {code}."),
            None => "Command terminated without an exit status.".to_string(),
        };
        if outcome.output.trim().is_empty() {
            Ok(format!("{exit_note} (no output)"))
        } else {
            Ok(format!("{exit_note}\nOutput:\n{}", outcome.output))
        }
    }
}
