//! Command-line front end for the Inline realtime sync engine.

pub mod ws;

use anyhow::{Context, Result};
use clap::Parser;
use inline_sync::{
    BucketReport, ConnectionSnapshot, RealtimeConfig, RealtimeHandle, SqliteBucketStore,
    SyncResult, TokenCell,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

/// File name of the cursor database inside the data directory.
pub const STORE_FILE: &str = "sync.db";

#[derive(Parser, Debug, Clone)]
#[command(name = "inline-sync")]
#[command(about = "Keeps an Inline account in sync over the realtime API")]
pub struct Args {
    /// Realtime endpoint. It must speak the JSON envelope this client sends;
    /// the protobuf production endpoint does not.
    #[arg(long, env = "INLINE_REALTIME_URL")]
    pub url: Url,

    /// Session token. Without one the client waits for `token <value>` on stdin.
    #[arg(long, env = "INLINE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Directory holding the cursor database
    #[arg(long, env = "INLINE_DATA_DIR", default_value = ".inline")]
    pub data_dir: PathBuf,

    /// JSON file overriding engine defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<RealtimeConfig> {
        match &self.config {
            Some(path) => RealtimeConfig::from_json_file(path)
                .with_context(|| format!("loading config from {}", path.display())),
            None => Ok(RealtimeConfig::default()),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE)
    }
}

/// Opens the cursor database, creating the data directory if needed.
pub fn open_store(data_dir: &Path) -> Result<SqliteBucketStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let path = data_dir.join(STORE_FILE);
    SqliteBucketStore::open(&path).with_context(|| format!("opening {}", path.display()))
}

/// A line typed on stdin while the client runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Token(String),
    Logout,
    Background,
    Foreground,
    Offline,
    Online,
    Probe,
    Status,
}

/// Parses one stdin line. Blank lines and unknown words yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "token" => Command::Token(words.next()?.to_string()),
        "logout" => Command::Logout,
        "bg" | "background" => Command::Background,
        "fg" | "foreground" => Command::Foreground,
        "offline" => Command::Offline,
        "online" => Command::Online,
        "probe" => Command::Probe,
        "status" => Command::Status,
        _ => return None,
    };
    if words.next().is_some() {
        return None;
    }
    Some(command)
}

/// Feeds a command into the running engine.
pub fn execute(command: Command, realtime: &RealtimeHandle, credentials: &TokenCell) -> SyncResult<()> {
    match command {
        Command::Token(token) => {
            info!("token updated");
            credentials.set(token);
        }
        Command::Logout => {
            info!("token cleared");
            credentials.clear();
        }
        Command::Background => realtime.app_backgrounded()?,
        Command::Foreground => realtime.app_foregrounded()?,
        Command::Offline => realtime.set_network_reachable(false)?,
        Command::Online => realtime.set_network_reachable(true)?,
        Command::Probe => realtime.probe_now()?,
        Command::Status => {
            info!("{}", describe_snapshot(&realtime.snapshot()));
            for transition in realtime.transitions().iter().rev().take(5).rev() {
                info!(
                    "  {} {} -> {} (attempt {})",
                    transition.at.format("%H:%M:%S"),
                    transition.from,
                    transition.to,
                    transition.attempt_number
                );
            }
        }
    }
    Ok(())
}

/// One-line summary of a connection snapshot.
pub fn describe_snapshot(snapshot: &ConnectionSnapshot) -> String {
    let mut line = format!("connection {}", snapshot.state);
    if snapshot.attempt_number > 0 {
        line.push_str(&format!(" attempt={}", snapshot.attempt_number));
    }
    if let Some(error) = &snapshot.last_error {
        line.push_str(&format!(" last_error=\"{error}\""));
    }
    line
}

pub fn log_report(report: &BucketReport) {
    match report {
        BucketReport::Applied { bucket, max_date } => {
            debug!("[SYNC] {bucket} applied updates up to {max_date}");
        }
        BucketReport::Synced { bucket, cursor } => {
            info!("[SYNC] {bucket} in sync at seq {}", cursor.seq);
        }
    }
}

pub fn log_snapshot(snapshot: &ConnectionSnapshot) {
    if snapshot.last_error.is_some() && !snapshot.state.is_active() {
        warn!("{}", describe_snapshot(snapshot));
    } else {
        info!("{}", describe_snapshot(snapshot));
    }
}
