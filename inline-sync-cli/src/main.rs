//! Inline realtime sync client
//!
//! Connects to the realtime API, catches up every chat and space bucket the
//! server announces and keeps applying live updates until interrupted.
//!
//! Usage:
//!   INLINE_TOKEN=... inline-sync --url ws://localhost:8000/realtime --data-dir ~/.inline
//!
//! Lines on stdin drive the engine: `token <value>`, `logout`, `bg`, `fg`,
//! `offline`, `online`, `probe`, `status`.

use anyhow::{Context, Result};
use clap::Parser;
use inline_sync::{MemoryMessageStore, TokenCell, create_realtime};
use inline_sync_cli::ws::WebSocketTransport;
use inline_sync_cli::{Args, execute, log_report, log_snapshot, open_store, parse_command};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose {
        "inline_sync=debug,inline_sync_cli=debug"
    } else {
        "info"
    };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = args.load_config()?;
    let store = open_store(&args.data_dir)?;
    info!("cursor store at {}", args.store_path().display());

    let credentials = Arc::new(TokenCell::new(args.token.clone()));
    if args.token.is_none() {
        warn!("no token given; waiting for `token <value>` on stdin");
    }
    let messages = MemoryMessageStore::new();
    let mut realtime = create_realtime(
        config,
        Arc::new(WebSocketTransport::new(args.url.clone())),
        credentials.clone(),
        Arc::new(store),
        Arc::new(messages.clone()),
    );
    let mut reports = realtime
        .take_bucket_reports()
        .context("bucket reports already taken")?;
    let mut snapshots = realtime.subscribe();
    realtime.start()?;
    info!("syncing with {}", args.url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted, shutting down");
                break;
            }
            Some(snapshot) = snapshots.recv() => log_snapshot(&snapshot),
            Some(report) = reports.recv() => log_report(&report),
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match parse_command(&line) {
                    Some(command) => execute(command, &realtime, &credentials)?,
                    None => warn!("unknown command: {}", line.trim()),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin closed: {e}");
                    stdin_open = false;
                }
            },
        }
    }

    let applied = messages.applied().len();
    realtime.shutdown().await?;
    info!("applied {applied} updates this run");
    Ok(())
}
