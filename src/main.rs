use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use phone_pilot::agent_engine::interaction::{
    interaction_channel, InteractionKind, InteractionReply, InteractionRequest,
};
use phone_pilot::agent_engine::state::AgentState;
use phone_pilot::config::{load_config, BackendKind};
use phone_pilot::perception::overlay::NoOverlay;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Shell,
    InProcess,
}

impl From<BackendArg> for BackendKind {
    fn from(b: BackendArg) -> Self {
        match b {
            BackendArg::Shell => BackendKind::Shell,
            BackendArg::InProcess => BackendKind::InProcess,
        }
    }
}

/// Drive an Android device with a vision model until TASK is done.
#[derive(Debug, Parser)]
#[command(name = "phone-pilot", version, about)]
struct Cli {
    /// Path to config.toml (default: next to the binary, then the working directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command backend, overriding `[device] backend`.
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// adb device serial, overriding `[device] serial`.
    #[arg(long)]
    serial: Option<String>,

    /// What to do on the device.
    #[arg(required = true, num_args = 1..)]
    task: Vec<String>,
}

/// Answer interaction requests from the terminal.
async fn answer_on_stdin(mut rx: mpsc::Receiver<InteractionRequest>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stderr = tokio::io::stderr();

    while let Some(req) = rx.recv().await {
        let prompt = match req.kind {
            InteractionKind::Confirm => format!("\n[confirm] {} [y/N] ", req.message),
            InteractionKind::TakeOver => {
                format!("\n[take over] {}\nPress Enter when done, or type 'q' to give up: ", req.message)
            }
            InteractionKind::Interact => format!("\n[question] {}\n> ", req.message),
        };
        let _ = stderr.write_all(prompt.as_bytes()).await;
        let _ = stderr.flush().await;

        let line = match lines.next_line().await {
            Ok(Some(l)) => l.trim().to_string(),
            Ok(None) | Err(_) => {
                req.respond(InteractionReply::Rejected);
                continue;
            }
        };
        let reply = match req.kind {
            InteractionKind::Confirm if matches!(line.to_lowercase().as_str(), "y" | "yes") => {
                InteractionReply::Approved
            }
            InteractionKind::Confirm => InteractionReply::Rejected,
            InteractionKind::TakeOver if line.eq_ignore_ascii_case("q") => InteractionReply::Rejected,
            InteractionKind::TakeOver => InteractionReply::Done,
            InteractionKind::Interact => InteractionReply::Answer(line),
        };
        req.respond(reply);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();
    phone_pilot::init_tracing();

    let cli = Cli::parse();

    let mut cfg = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    if let Some(b) = cli.backend {
        cfg.device.backend = b.into();
    }
    if cli.serial.is_some() {
        cfg.device.serial = cli.serial;
    }

    let (tx, rx) = interaction_channel(4);
    let mut agent = match phone_pilot::build_agent(&cfg, Arc::new(NoOverlay), Some(tx)) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, "failed to start agent");
            return ExitCode::FAILURE;
        }
    };

    tokio::spawn(answer_on_stdin(rx));

    let handle = agent.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            handle.cancel();
        }
    });

    let task = cli.task.join(" ");
    let outcome = agent.run(&task).await;

    match &outcome.state {
        AgentState::Finished { message } => {
            println!("{message}");
            ExitCode::SUCCESS
        }
        AgentState::Failed { kind, message } => {
            eprintln!("task failed ({kind:?}): {message}");
            ExitCode::FAILURE
        }
        other => {
            eprintln!("task stopped: {other:?}");
            ExitCode::FAILURE
        }
    }
}
