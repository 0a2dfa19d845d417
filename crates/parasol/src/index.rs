// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The indexer: a one-minute driver that pulls the upstream checkpoint,
//! downloads whatever leaf tiles the persisted position does not yet cover,
//! and promotes the checkpoint once the reconstructed root matches.
//!
//! Within a cycle, a bounded pool of downloader tasks fetches tiles and a
//! single applier consumes their leaf batches in completion order. The
//! position is a fragmented collapsed tree, so out-of-order batches never
//! block progress; the applier commits leaf rows and the serialized
//! position together every few batches, and a crash mid-cycle loses at most
//! the uncommitted tail. Upstream trouble is logged and retried at the next
//! tick; a root hash mismatch is fatal, because it means the log lied or
//! the tiles were corrupted.

use crate::checkpoint::{parse_checkpoint, CheckpointError, SignedTreeHead};
use crate::fetch::FetchError;
use crate::server::AppState;
use crate::store::{Store, StoreError};
use merkle_tiles::{FragmentedTree, Hash, FULL_WIDTH, HASH_SIZE};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on concurrent tile downloads per cycle.
const MAX_DOWNLOADERS: usize = 500;

/// Batches applied per database commit.
const BATCHES_PER_COMMIT: usize = 10;

/// Depth of the downloader-to-applier channel.
const APPLY_QUEUE_DEPTH: usize = 64;

/// Errors that stop the driver. Upstream contact problems never end up
/// here; they are logged and retried on the next tick.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("root hash computed from leaves ({computed}) doesn't match checkpoint root hash ({expected})")]
    RootMismatch { computed: Hash, expected: Hash },
    #[error("indexing left uncovered ranges below tree size {0}")]
    Incomplete(u64),
    #[error("indexing task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
enum ContactError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

// One downloader work item: `count` hashes of leaf tile `tile`, starting
// `skip` entries in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileJob {
    tile: u64,
    skip: u32,
    count: u32,
}

// A slice of contiguous leaf hashes produced by a downloader.
struct LeafBatch {
    start_index: u64,
    hashes: Vec<Hash>,
}

/// Runs the indexer driver until a fatal error.
pub async fn run(state: Arc<AppState>) -> Result<(), IndexError> {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        tick(&state).await?;
    }
}

/// Runs one indexing cycle.
pub async fn tick(state: &Arc<AppState>) -> Result<(), IndexError> {
    let cancel = CancellationToken::new();

    let sth = match download_checkpoint(state, &cancel).await {
        Ok(sth) => sth,
        Err(err) => {
            warn!(error = %err, "error downloading checkpoint (will try again later)");
            return Ok(());
        }
    };

    // With leaf indexing disabled, the fetched checkpoint is promoted as-is
    // and proofs by hash are off the table.
    if !state.leaf_index_enabled {
        state.promote(&sth).await?;
        info!(
            tree_size = sth.tree_size,
            "promoted checkpoint (leaf indexing disabled)"
        );
        return Ok(());
    }

    let position = state.store.load_position().await?.unwrap_or_default();
    info!(
        position = position.covered_prefix(),
        checkpoint = sth.tree_size,
        "indexer tick"
    );

    let gaps = position.gaps(sth.tree_size);
    if gaps.is_empty() {
        // Nothing to download. Promote if a crash interrupted a previous
        // cycle between the final commit and promotion.
        if position.is_complete(sth.tree_size) {
            verify_and_promote(state, &position, &sth).await?;
        } else {
            warn!(
                covered = position.covered_prefix(),
                checkpoint = sth.tree_size,
                "position extends beyond the checkpoint; upstream tree shrank?"
            );
        }
        return Ok(());
    }

    let jobs = tile_jobs(&gaps);
    let (batch_tx, batch_rx) = mpsc::channel(APPLY_QUEUE_DEPTH);
    let applier = tokio::spawn(apply_batches(state.clone(), position, batch_rx));

    let semaphore = Arc::new(Semaphore::new(MAX_DOWNLOADERS));
    let mut downloaders = Vec::with_capacity(jobs.len());
    for job in jobs {
        let state = state.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        let batch_tx = batch_tx.clone();
        let tree_size = sth.tree_size;
        downloaders.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            download_tile(&state, tree_size, job, &batch_tx, &cancel).await
        }));
    }
    drop(batch_tx);

    let mut first_err = None;
    for downloader in downloaders {
        if let Err(err) = downloader.await? {
            cancel.cancel();
            first_err.get_or_insert(err);
        }
    }
    let position = applier.await??;

    if let Some(err) = first_err {
        warn!(error = %err, "indexing cycle aborted (will try again later)");
        return Ok(());
    }

    verify_and_promote(state, &position, &sth).await
}

async fn download_checkpoint(
    state: &AppState,
    cancel: &CancellationToken,
) -> Result<SignedTreeHead, ContactError> {
    let body = state.fetcher.checkpoint(cancel).await?;
    Ok(parse_checkpoint(&body, &state.log_id)?)
}

// Splits uncovered leaf ranges into per-tile download jobs.
fn tile_jobs(gaps: &[Range<u64>]) -> Vec<TileJob> {
    let full = u64::from(FULL_WIDTH);
    let mut jobs = Vec::new();
    for gap in gaps {
        let mut begin = gap.start;
        while begin < gap.end {
            let tile = begin / full;
            let tile_end = gap.end.min((tile + 1) * full);
            jobs.push(TileJob {
                tile,
                skip: u32::try_from(begin % full).expect("tile offset fits in u32"),
                count: u32::try_from(tile_end - begin).expect("tile count fits in u32"),
            });
            begin = tile_end;
        }
    }
    jobs
}

async fn download_tile(
    state: &AppState,
    tree_size: u64,
    job: TileJob,
    batch_tx: &mpsc::Sender<LeafBatch>,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let data = state.fetcher.tile("0", job.tile, tree_size, cancel).await?;

    let want = (job.skip + job.count) as usize * HASH_SIZE;
    if data.len() < want {
        return Err(FetchError::ShortTile {
            tile: job.tile,
            got: data.len(),
            want,
        });
    }

    let hashes = data[job.skip as usize * HASH_SIZE..want]
        .chunks_exact(HASH_SIZE)
        .map(|chunk| Hash(chunk.try_into().expect("chunks are 32 bytes")))
        .collect();
    let batch = LeafBatch {
        start_index: job.tile * u64::from(FULL_WIDTH) + u64::from(job.skip),
        hashes,
    };

    tokio::select! {
        () = cancel.cancelled() => {}
        // A closed channel means the applier died; its error surfaces from
        // the driver, so just stop.
        _ = batch_tx.send(batch) => {}
    }
    Ok(())
}

// Consumes leaf batches in arrival order, feeding the position accumulator
// and the leaf table. Commits both, atomically, every BATCHES_PER_COMMIT
// batches and at the end of the stream.
async fn apply_batches(
    state: Arc<AppState>,
    mut position: FragmentedTree,
    mut batch_rx: mpsc::Receiver<LeafBatch>,
) -> Result<FragmentedTree, StoreError> {
    let mut tx = None;
    let mut pending = 0;
    while let Some(batch) = batch_rx.recv().await {
        if tx.is_none() {
            tx = Some(state.store.begin().await?);
        }
        let conn = tx.as_mut().expect("transaction just opened");
        for (i, &hash) in batch.hashes.iter().enumerate() {
            let index = batch.start_index + i as u64;
            position.add_hash(index, hash);
            Store::upsert_leaf(conn, &hash, index).await?;
        }
        pending += 1;
        if pending == BATCHES_PER_COMMIT {
            Store::save_position(conn, &position).await?;
            tx.take().expect("transaction open").commit().await?;
            pending = 0;
            info!(
                position = position.covered_prefix(),
                fragments = position.fragment_count(),
                "committed indexing progress"
            );
        }
    }
    if let Some(mut tx) = tx.take() {
        Store::save_position(&mut tx, &position).await?;
        tx.commit().await?;
        info!(
            position = position.covered_prefix(),
            fragments = position.fragment_count(),
            "committed indexing progress"
        );
    }
    Ok(position)
}

// Compares the reconstructed root against the checkpoint and, on match,
// makes the checkpoint visible to read endpoints.
async fn verify_and_promote(
    state: &AppState,
    position: &FragmentedTree,
    sth: &SignedTreeHead,
) -> Result<(), IndexError> {
    if state.promoted().is_some_and(|cur| cur.tree_size >= sth.tree_size) {
        return Ok(());
    }
    let Some(computed) = position.root() else {
        return Err(IndexError::Incomplete(sth.tree_size));
    };
    if computed != sth.sha256_root_hash {
        return Err(IndexError::RootMismatch {
            computed,
            expected: sth.sha256_root_hash,
        });
    }
    state.promote(sth).await?;
    info!(tree_size = sth.tree_size, "updated STH");
    Ok(())
}
