use anyhow::Result;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tiller::api::AnthropicClient;
use tiller::approval::AskResponse;
use tiller::config::Config;
use tiller::store::MessageKind;
use tiller::task::{TaskEvent, TaskLoop, TaskOutcome};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    config.validate()?;

    let task_text = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let task_text = if task_text.trim().is_empty() {
        prompt_line("task> ")?
    } else {
        task_text
    };

    let provider = Arc::new(AnthropicClient::new(&config));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut task = TaskLoop::new(&config, provider, events_tx)?;

    let frontend = tokio::spawn(run_frontend(events_rx));
    let outcome = task.run(task_text).await?;
    drop(task);
    let _ = frontend.await;

    match outcome {
        TaskOutcome::Completed => println!("\n[task completed]"),
        TaskOutcome::Abandoned => println!("\n[task abandoned]"),
        TaskOutcome::BudgetExceeded => println!("\n[task stopped: budget exceeded]"),
    }
    Ok(())
}

/// Minimal line-oriented frontend: prints says, answers asks on stdin.
/// `y` approves, `n` rejects, anything else is feedback text.
async fn run_frontend(mut events_rx: mpsc::UnboundedReceiver<TaskEvent>) {
    while let Some(event) = events_rx.recv().await {
        match event {
            TaskEvent::Say(message) => {
                if message.partial {
                    continue;
                }
                if let Some(text) = &message.text {
                    match message.kind {
                        MessageKind::Say(kind) => println!("[{kind:?}] {text}"),
                        MessageKind::Ask(_) => {}
                    }
                }
            }
            TaskEvent::AskPreview(message) => {
                if let Some(text) = &message.text {
                    println!("[pending approval] {text}");
                }
            }
            TaskEvent::Progress(line) => println!("  | {line}"),
            TaskEvent::Ask {
                message,
                response_tx,
            } => {
                let prompt = message.text.as_deref().unwrap_or("Approve?");
                println!("\n[approval needed] {prompt}");
                let answer = tokio::task::spawn_blocking(|| prompt_line("approve? [y/n/text] "))
                    .await
                    .unwrap_or_else(|_| Ok(String::new()))
                    .unwrap_or_default();
                let response = match answer.trim() {
                    "y" | "yes" => AskResponse::Approved {
                        text: None,
                        images: Vec::new(),
                    },
                    "n" | "no" => AskResponse::Rejected {
                        text: None,
                        images: Vec::new(),
                    },
                    "" => AskResponse::Approved {
                        text: None,
                        images: Vec::new(),
                    },
                    other => AskResponse::Message {
                        text: other.to_string(),
                        images: Vec::new(),
                    },
                };
                let _ = response_tx.send(response);
            }
        }
    }
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}
