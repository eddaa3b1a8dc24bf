//! # assess
//!
//! Terminal client for a coding-assessment session. Connects the session
//! channel, prints questions, evaluations and status changes, and turns
//! stdin lines into code updates and responses.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use assess_channel::{ChannelConfig, SessionChannel, SessionEvent, SessionHandle, WsConnector};
use assess_core::SessionId;
use assess_settings::AssessSettings;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Coding-assessment session client.
#[derive(Parser, Debug)]
#[command(name = "assess", about = "Coding-assessment session client")]
struct Cli {
    /// Session to join.
    #[arg(long)]
    session: String,

    /// WebSocket base URL (overrides settings).
    #[arg(long)]
    ws_base: Option<String>,

    /// Log level filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Settings file (defaults to `~/.assess/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Cli {
    fn load_settings(&self) -> Result<AssessSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(assess_settings::settings_path);
        let mut settings = assess_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(ref url) = self.ws_base {
            settings.channel.ws_base_url.clone_from(url);
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        settings.validate().context("Invalid command-line override")?;
        Ok(settings)
    }
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    /// Append to the editor buffer.
    Code(String),
    /// Answer the pending question.
    Respond(String),
    /// End the session.
    End,
    /// Open a fresh connection.
    Reconnect,
    /// Leave without ending the session.
    Quit,
}

impl Input {
    fn parse(line: &str) -> Self {
        match line.trim_end() {
            ":end" => Self::End,
            ":quit" => Self::Quit,
            ":reconnect" => Self::Reconnect,
            other => match other.strip_prefix(":respond") {
                Some(rest) if rest.is_empty() || rest.starts_with(' ') => {
                    Self::Respond(rest.trim_start().to_owned())
                }
                _ => Self::Code(line.to_owned()),
            },
        }
    }
}

/// Terminal rendering of a session event. `None` for events with no output.
fn render(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::StatusChanged(status) if status.is_terminal() => Some(format!(
            "[status] {status}\n  (`:reconnect` to connect again)"
        )),
        SessionEvent::StatusChanged(status) => Some(format!("[status] {status}")),
        SessionEvent::Question(q) => Some(format!(
            "[question {}] {}\n  (answer with `:respond <text>`)",
            q.interaction_id, q.question
        )),
        SessionEvent::Evaluation(e) => Some(match e.score_percent() {
            Some(score) => format!("[evaluation {score}] {}", e.feedback),
            None => format!("[evaluation] {}", e.feedback),
        }),
        SessionEvent::Error(text) => Some(format!("[!] {text}")),
        SessionEvent::InteractionCleared
        | SessionEvent::EvaluationCleared
        | SessionEvent::ErrorCleared => None,
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = render(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_input(handle: &SessionHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer = String::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match Input::parse(&line) {
            Input::Code(text) => {
                buffer.push_str(&text);
                buffer.push('\n');
                if let Err(e) = handle.update_code(buffer.clone()) {
                    println!("[!] {e}");
                }
            }
            Input::Respond(text) => {
                let view = handle.view();
                if !view.status.is_interactive() {
                    println!("[!] Not connected ({}). Response not sent.", view.status);
                    continue;
                }
                let Some(interaction) = view.interaction else {
                    println!("[!] No question is waiting for a response.");
                    continue;
                };
                if let Err(e) = handle.submit_response(interaction.interaction_id, text).await {
                    println!("[!] {e}");
                }
            }
            Input::Reconnect => {
                if let Err(e) = handle.reconnect().await {
                    println!("[!] {e}");
                }
            }
            Input::End => {
                handle.end_session().await.context("Failed to end session")?;
                break;
            }
            Input::Quit => break,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;
    assess_core::logging::init_subscriber(&settings.logging.level);

    let session_id = SessionId::parse(args.session.as_str()).context("Invalid --session")?;
    let config = ChannelConfig::from(&settings.channel);
    info!(
        session_id = %session_id,
        endpoint = %config.endpoint(&session_id),
        "starting session"
    );

    let connector = Arc::new(WsConnector::from(&config));
    let handle = SessionChannel::spawn(&config, session_id, connector);
    let printer = tokio::spawn(print_events(handle.subscribe()));

    let outcome = run_input(&handle).await;
    info!(session_id = %handle.session_id(), "leaving session");
    handle.shutdown().await;
    printer.abort();
    outcome
}
