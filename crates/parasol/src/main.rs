// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

use anyhow::Context;
use base64::prelude::*;
use clap::Parser;
use parasol::checkpoint::LogId;
use parasol::fetch::Fetcher;
use parasol::index;
use parasol::listener::TimeoutListener;
use parasol::server::{self, AppState};
use parasol::store::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "parasol",
    about = "RFC 6962 compatibility proxy for a tile-based static CT log"
)]
struct Args {
    /// Path to the database file (created if necessary)
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    /// Socket address to listen on (repeatable)
    #[arg(long, value_name = "ADDR", required = true)]
    listen: Vec<SocketAddr>,

    /// Submission prefix URL of the upstream log
    #[arg(long, value_name = "URL")]
    submission: String,

    /// Monitoring prefix URL of the upstream log
    #[arg(long, value_name = "URL")]
    monitoring: String,

    /// Log ID (base64-encoded, 32 bytes)
    #[arg(long, value_name = "BASE64", value_parser = parse_log_id)]
    id: LogId,

    /// Disable leaf indexing (the get-proof-by-hash endpoint won't work)
    #[arg(long)]
    no_leaf_index: bool,

    /// Disable database fsync (unsafe; only appropriate during initial indexing)
    #[arg(long)]
    unsafe_nofsync: bool,
}

fn parse_log_id(arg: &str) -> Result<LogId, String> {
    let bytes = BASE64_STANDARD.decode(arg).map_err(|err| err.to_string())?;
    bytes
        .try_into()
        .map_err(|_| "wrong length for log ID".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let store = Store::open(&args.db, args.unsafe_nofsync)
        .await
        .context("error opening database")?;
    store
        .init_state(&args.id)
        .await
        .context("error initializing database state")?;
    let initial_sth = store
        .load_sth()
        .await
        .context("error loading STH from database")?;

    let state = Arc::new(AppState::new(
        store,
        Fetcher::default_client(),
        &args.submission,
        &args.monitoring,
        args.id,
        !args.no_leaf_index,
        initial_sth,
    ));

    let app = server::router(state.clone());
    for addr in &args.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("error binding {addr}"))?;
        info!(%addr, "listening");
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(TimeoutListener::new(listener), app).await {
                error!(error = %err, "server error");
            }
        });
    }

    index::run(state).await.context("indexer failed")?;
    Ok(())
}
