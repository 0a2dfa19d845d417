// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Inclusion and consistency proof construction over on-demand tile
//! fetches.
//!
//! A proof request is answered in three steps: compute the stored hash
//! indexes the proof needs, fetch and authenticate the tiles holding them
//! (concurrently, against the promoted checkpoint's root), then run the
//! proof arithmetic over the preloaded hashes. Proofs may be requested for
//! any tree size up to the promoted one; tiles are always authenticated
//! against the promoted tree. Nothing is written back: tile reads here have
//! no side effects.

use crate::checkpoint::SignedTreeHead;
use crate::fetch::FetchError;
use crate::server::AppState;
use merkle_tiles::{Hash, PreloadedHashes, Proof, TilePlan, TlogError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Upper bound on in-flight tile fetches per proof.
const MAX_CONCURRENT_TILE_FETCHES: usize = 100;

#[derive(Error, Debug)]
pub enum ProofError {
    #[error(transparent)]
    Tlog(#[from] TlogError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("tile fetch task failed: {0}")]
    Join(#[from] JoinError),
}

// Fetches and authenticates the hashes at `indexes` within the promoted
// tree.
async fn read_tree_hashes(
    state: &Arc<AppState>,
    sth: &SignedTreeHead,
    indexes: &[u64],
    cancel: &CancellationToken,
) -> Result<Vec<Hash>, ProofError> {
    let plan = TilePlan::new(sth.tree_size, indexes)?;

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_TILE_FETCHES));
    let mut tasks = Vec::with_capacity(plan.tiles().len());
    for &tile in plan.tiles() {
        let state = state.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            state.fetcher.hash_tile(&tile, &cancel).await
        }));
    }

    let mut data = Vec::with_capacity(tasks.len());
    let mut first_err = None;
    for task in tasks {
        match task.await? {
            Ok(tile_data) => data.push(tile_data),
            Err(err) => {
                cancel.cancel();
                first_err.get_or_insert(err);
                data.push(Vec::new());
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err.into());
    }

    Ok(plan.verify_and_read(&sth.sha256_root_hash, &data, indexes)?)
}

/// Builds the inclusion proof for `leaf_index` within the tree of
/// `tree_size` records, which must not exceed the promoted tree size.
pub async fn inclusion(
    state: &Arc<AppState>,
    sth: &SignedTreeHead,
    tree_size: u64,
    leaf_index: u64,
    cancel: &CancellationToken,
) -> Result<Proof, ProofError> {
    let indexes = merkle_tiles::inclusion_proof_indexes(tree_size, leaf_index)?;
    if indexes.is_empty() {
        return Ok(Proof::new());
    }
    let hashes = read_tree_hashes(state, sth, &indexes, cancel).await?;
    let reader = PreloadedHashes::new(&indexes, &hashes);
    Ok(merkle_tiles::inclusion_proof(tree_size, leaf_index, &reader)?)
}

/// Builds the consistency proof between the trees of `old_size` and
/// `tree_size` records; `tree_size` must not exceed the promoted tree size.
pub async fn consistency(
    state: &Arc<AppState>,
    sth: &SignedTreeHead,
    tree_size: u64,
    old_size: u64,
    cancel: &CancellationToken,
) -> Result<Proof, ProofError> {
    let indexes = merkle_tiles::consistency_proof_indexes(tree_size, old_size)?;
    if indexes.is_empty() {
        return Ok(Proof::new());
    }
    let hashes = read_tree_hashes(state, sth, &indexes, cancel).await?;
    let reader = PreloadedHashes::new(&indexes, &hashes);
    Ok(merkle_tiles::consistency_proof(tree_size, old_size, &reader)?)
}
