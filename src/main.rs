// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use scribe_core::{Orchestrator, Session, StreamEvent};

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("scribe: {e:#}");
            std::process::exit(EXIT_FATAL);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = scribe_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        if model == "mock" {
            config.model.provider = "mock".into();
        }
        config.model.name = model.clone();
    }
    let config = Arc::new(config);

    let model: Arc<dyn scribe_model::ModelProvider> =
        Arc::from(scribe_model::from_config(&config.model)?);
    let orchestrator = Orchestrator::new(Arc::clone(&config), model)?;

    let session = match &cli.resume {
        Some(id) => orchestrator
            .resume(id)
            .with_context(|| format!("resuming project '{id}'"))?,
        None => orchestrator.create_session()?,
    };

    // Ctrl-C sets the session's cancel flag; the turn unwinds gracefully
    // and we report the conventional 130.
    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let session = Arc::clone(&session);
        let cancelled = Arc::clone(&cancelled);
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                cancelled.store(true, Ordering::SeqCst);
                session.cancel();
            }
        });
    }

    if let Some(prompt) = &cli.prompt {
        stream_turn_to_stdout(&session, prompt.clone()).await;
        return Ok(if cancelled.load(Ordering::SeqCst) {
            EXIT_CANCELLED
        } else {
            EXIT_OK
        });
    }

    // Interactive loop.
    println!("scribe — project {} (exit with ctrl-d)", session.id);
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let prompt = line.trim().to_string();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "exit" || prompt == "quit" {
            break;
        }
        stream_turn_to_stdout(&session, prompt).await;
        if cancelled.swap(false, Ordering::SeqCst) {
            println!("\n[cancelled]");
        }
    }

    Ok(EXIT_OK)
}

/// Render a streamed turn: text deltas inline, tool activity and errors as
/// bracketed status lines.
async fn stream_turn_to_stdout(session: &Arc<Session>, prompt: String) {
    let mut stream = Box::pin(session.stream_turn(prompt));
    while let Some(envelope) = stream.next().await {
        match &envelope.event {
            StreamEvent::TextDelta { text } => {
                print!("{text}");
                std::io::stdout().flush().ok();
            }
            StreamEvent::ToolCall { name, .. } => {
                println!("\n[tool: {name}]");
            }
            StreamEvent::ToolProgress { message, .. } => {
                println!("[progress: {message}]");
            }
            StreamEvent::ToolResult { is_error, .. } if *is_error => {
                println!("[tool error]");
            }
            StreamEvent::UsageUpdate { cost_usd, .. } => {
                tracing::debug!(cost_usd, "usage update");
            }
            StreamEvent::Error { message } => {
                eprintln!("\n[error] {message}");
            }
            StreamEvent::Done { .. } => {
                println!();
            }
            _ => {}
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
