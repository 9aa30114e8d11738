// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Tether CLI.
//!
//! Supervises an analysis server in the foreground (`run`), fires one-shot
//! requests (`send`), and lists or follows supervised sessions from other
//! terminals (`list`, `monitor`).

#![allow(clippy::print_stdout, reason = "CLI tool needs to output to stdout")]
#![allow(clippy::print_stderr, reason = "CLI tool needs to output to stderr")]

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tether::analyzer::AnalyzerController;
use tether::cli::{ColorConfig, ColumnWidths, terminal_width, truncate};
use tether::config::Config;
use tether::session::{self, EventBroadcaster, EventKind, Session, SessionEvent};

/// Command-line arguments for Tether.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Supervisor for out-of-process language-analysis servers")]
#[command(version = env!("TETHER_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server executable. Overrides the config file.
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Argument passed to the server executable (repeatable).
    #[arg(long = "arg", global = true, allow_hyphen_values = true)]
    server_args: Vec<String>,
}

/// Subcommands supported by Tether.
#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the configured server in the foreground until Ctrl-C.
    Run {
        /// Server event names to subscribe to and echo (repeatable).
        #[arg(long = "subscribe")]
        subscriptions: Vec<String>,

        /// Do not record a discoverable session.
        #[arg(long)]
        no_session: bool,
    },

    /// Start the server, send one request, print the response, stop.
    Send {
        /// The command to send.
        request: String,

        /// JSON object with the request arguments.
        #[arg(long, default_value = "{}")]
        arguments: String,

        /// Per-request timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List active Tether sessions.
    List,

    /// Follow events from a session.
    Monitor {
        /// Session ID or row number (use 'tether list' to see sessions).
        id: String,

        /// Show raw JSON output.
        #[arg(long)]
        raw: bool,

        /// Disable colored output.
        #[arg(long)]
        nocolor: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.clone())?;
    if let Some(server) = &args.server {
        config.server.command.clone_from(server);
        config.server.args.clone_from(&args.server_args);
    } else if !args.server_args.is_empty() {
        config.server.args.clone_from(&args.server_args);
    }

    match args.command {
        Command::Run {
            subscriptions,
            no_session,
        } => cmd_run(config, &subscriptions, no_session).await,
        Command::Send {
            request,
            arguments,
            timeout_ms,
        } => cmd_send(config, &request, &arguments, timeout_ms).await,
        Command::List => cmd_list(),
        Command::Monitor { id, raw, nocolor } => cmd_monitor(&id, raw, nocolor),
    }
}

fn require_command(config: &Config) -> Result<()> {
    if config.server.command.is_empty() {
        bail!(
            "no server command configured; pass --server or set server.command in the config file"
        );
    }
    Ok(())
}

async fn cmd_run(config: Config, subscriptions: &[String], no_session: bool) -> Result<()> {
    require_command(&config)?;

    let command_line = std::iter::once(config.server.command.clone())
        .chain(config.server.args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");

    let (broadcaster, session) = if no_session {
        (EventBroadcaster::noop()?, None)
    } else {
        let session = Session::create(&command_line)?;
        println!("session {} (monitor with 'tether monitor')", session.info.id);
        (session.broadcaster(), Some(session))
    };

    let controller = AnalyzerController::new(config.server, broadcaster);

    for name in subscriptions {
        let event_name = name.clone();
        controller.subscribe(name, move |event| {
            let body = event
                .body
                .as_ref()
                .map_or_else(String::new, ToString::to_string);
            println!("[event] {event_name} {body}");
        });
    }

    // Mirror lifecycle transitions to the terminal.
    let mut states = controller.state_changes();
    let state_echo = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            println!("[state] {state}");
        }
    });

    controller.start().await?;
    println!("supervising '{command_line}' (Ctrl-C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    println!("stopping...");

    if let Err(e) = controller.stop().await {
        eprintln!("stop failed: {e}");
    }
    state_echo.abort();
    drop(session);
    Ok(())
}

async fn cmd_send(
    config: Config,
    request: &str,
    arguments: &str,
    timeout_ms: Option<u64>,
) -> Result<()> {
    require_command(&config)?;

    let arguments: serde_json::Value =
        serde_json::from_str(arguments).context("parsing --arguments as JSON")?;
    if !arguments.is_object() {
        bail!("--arguments must be a JSON object");
    }

    let controller = AnalyzerController::new(config.server, EventBroadcaster::noop()?);
    controller.start().await?;

    let result = controller
        .send_request(request, arguments, timeout_ms.map(Duration::from_millis))
        .await;

    // Always try to stop cleanly, then report.
    let stop_result = controller.stop().await;

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    stop_result?;

    if !response.success {
        bail!(
            "server rejected '{request}': {}",
            response.message.unwrap_or_else(|| "no reason given".to_string())
        );
    }
    Ok(())
}

fn cmd_list() -> Result<()> {
    let sessions = session::list_sessions()?;

    if sessions.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }

    let widths = ColumnWidths::calculate(terminal_width());
    println!(
        "{:<rn$} {:<id$} {:<pid$} {:<cmd$} {:<st$}",
        "#",
        "ID",
        "PID",
        "COMMAND",
        "STARTED",
        rn = widths.row_num,
        id = widths.id,
        pid = widths.pid,
        cmd = widths.command,
        st = widths.started,
    );

    for (index, info) in sessions.iter().enumerate() {
        let started = info
            .started_at
            .with_timezone(&Local)
            .format("%H:%M:%S")
            .to_string();
        println!(
            "{:<rn$} {:<id$} {:<pid$} {:<cmd$} {:<st$}",
            index + 1,
            truncate(&info.id, widths.id),
            info.pid,
            truncate(&info.command, widths.command),
            started,
            rn = widths.row_num,
            id = widths.id,
            pid = widths.pid,
            cmd = widths.command,
            st = widths.started,
        );
    }
    Ok(())
}

/// Resolve a session argument that may be a row number from `tether list`.
fn resolve_session_id(id: &str) -> Result<String> {
    if let Ok(row) = id.parse::<usize>() {
        let sessions = session::list_sessions()?;
        if row >= 1 && row <= sessions.len() {
            return Ok(sessions[row - 1].id.clone());
        }
        bail!("no session at row {row} (see 'tether list')");
    }
    Ok(id.to_string())
}

fn cmd_monitor(id: &str, raw: bool, nocolor: bool) -> Result<()> {
    let id = resolve_session_id(id)?;
    if session::get_session(&id)?.is_none() {
        bail!("Session not found: {id}");
    }

    let colors = ColorConfig::new(nocolor);
    let path = session::events_path(&id);
    let file = std::fs::File::open(&path)
        .with_context(|| format!("opening event log {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);

    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line)?;
        if bytes == 0 {
            // Caught up; stop once the supervising process is gone.
            if session::get_session(&id)?.is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(200));
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if raw {
            println!("{trimmed}");
            continue;
        }
        if let Ok(event) = serde_json::from_str::<SessionEvent>(trimmed) {
            print_event(&colors, &event);
        }
    }
    Ok(())
}

fn print_event(colors: &ColorConfig, event: &SessionEvent) {
    let time = event
        .timestamp
        .with_timezone(&Local)
        .format("%H:%M:%S")
        .to_string();
    let line = match &event.kind {
        EventKind::Started => colors.dim("session started"),
        EventKind::StateChange { from, to } => {
            let to_colored = match to.as_str() {
                "running" => colors.green(to),
                "error" => colors.red(to),
                _ => colors.yellow(to),
            };
            format!("state {} -> {to_colored}", colors.dim(from))
        }
        EventKind::Handshake { elapsed_ms } => {
            colors.green(&format!("handshake confirmed in {elapsed_ms}ms"))
        }
        EventKind::ProcessExit { code } => colors.red(&format!("process exited (code {code:?})")),
        EventKind::RestartScheduled { attempt, delay_ms } => {
            colors.yellow(&format!("restart #{attempt} scheduled in {delay_ms}ms"))
        }
        EventKind::Shutdown => colors.dim("session ended"),
    };
    println!("{} {line}", colors.dim(&time));
}
