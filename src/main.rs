use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    sync::mpsc::Receiver,
    thread,
};

use anyhow::{bail, Context};
use clap::Parser;
use filetrail::{Agent, Config, Record, StatusBoard, DEFAULT_FIELD_NAME};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Follow log files across rotation and print every line as a JSON record
#[derive(Parser, Debug)]
#[command(name = "filetrail", version)]
struct Cli {
    /// TOML configuration listing the files to follow
    #[arg(short, long, conflicts_with_all = ["tag", "files"])]
    config: Option<PathBuf>,

    /// Field holding the raw line when no format applies
    #[arg(short, long, default_value = DEFAULT_FIELD_NAME)]
    field_name: String,

    /// Tag attached to records of the given files
    tag: Option<String>,

    /// Files to follow
    files: Vec<PathBuf>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        if let Some(path) = self.config {
            return Config::load(&path).with_context(|| format!("loading {}", path.display()));
        }
        match self.tag {
            Some(tag) if !self.files.is_empty() => Ok(Config::from_args(&tag, &self.files, &self.field_name)),
            _ => bail!("either --config or a tag followed by at least one file is required"),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FILETRAIL_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "filetrail=debug,info"
        } else {
            "filetrail=info,warn"
        })
    });

    let format = env::var("FILETRAIL_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    // stdout carries records, logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry.with(fmt::layer().compact().with_writer(io::stderr)).init();
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Forwarded {
    /// every trailing thread stopped
    Drained,
    OutputClosed,
}

/// Write records as JSON lines until the queue ends or `out` fails
fn forward(records: Receiver<Record>, mut out: impl Write) -> anyhow::Result<Forwarded> {
    for record in records {
        let line = serde_json::to_string(&record)?;
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            debug!(error = %e, "writing record failed");
            return Ok(Forwarded::OutputClosed);
        }
    }
    Ok(Forwarded::Drained)
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Cli::parse().into_config()?;
    config.validate()?;

    let (agent, records, status) = Agent::start(&config)?;
    info!(files = agent.len(), "agent started");

    let monitor = thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || {
            let mut board = StatusBoard::new();
            board.follow(&status);
            board
        })
        .context("spawning monitor thread")?;

    if forward(records, io::stdout().lock())? == Forwarded::OutputClosed {
        // trailing threads only notice the dropped queue on their next line, a quiet file would block a join
        info!("output closed, exiting without waiting for trailing threads");
        return Ok(());
    }

    agent.join();
    if let Ok(board) = monitor.join() {
        for (path, tag, position) in board.iter() {
            debug!(path = %path.display(), tag, position, "final position");
        }
    }
    Ok(())
}
