// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Fingerprint-addressed issuer certificate resolution.
//!
//! The database is the cache: lookups hit the `issuer` table first and fall
//! back to `GET <monitoring>/issuer/<hex>` with retry. A fetched
//! certificate is only cached after its SHA-256 matches the requested
//! fingerprint, so the table can never hold bytes that do not hash to their
//! key. Concurrent duplicate fetches are benign: the insert is
//! insert-if-absent.

use crate::fetch::FetchError;
use crate::server::AppState;
use crate::store::StoreError;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Upper bound on in-flight issuer fetches per request.
const MAX_CONCURRENT_FETCHES: usize = 100;

#[derive(Error, Debug)]
pub enum IssuerError {
    #[error("issuer {0} response does not match its fingerprint")]
    FingerprintMismatch(String),
    #[error("error getting issuer {fingerprint}: {source}")]
    Fetch {
        fingerprint: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("issuer fetch task failed: {0}")]
    Join(#[from] JoinError),
}

/// Resolves every fingerprint to its DER certificate. Any single failure
/// fails the whole resolution, and with it the enclosing `get-entries`.
pub async fn resolve(
    state: &Arc<AppState>,
    fingerprints: HashSet<[u8; 32]>,
    cancel: &CancellationToken,
) -> Result<HashMap<[u8; 32], Vec<u8>>, IssuerError> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES));
    let mut tasks = Vec::with_capacity(fingerprints.len());
    for fingerprint in fingerprints {
        let state = state.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let data = fetch_issuer(&state, fingerprint, &cancel).await?;
            Ok::<_, IssuerError>((fingerprint, data))
        }));
    }

    let mut issuers = HashMap::new();
    let mut first_err = None;
    for task in tasks {
        match task.await? {
            Ok((fingerprint, data)) => {
                issuers.insert(fingerprint, data);
            }
            Err(err) => {
                cancel.cancel();
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(issuers),
    }
}

async fn fetch_issuer(
    state: &AppState,
    fingerprint: [u8; 32],
    cancel: &CancellationToken,
) -> Result<Vec<u8>, IssuerError> {
    if let Some(data) = state.store.load_issuer(&fingerprint).await? {
        return Ok(data);
    }
    let data = state
        .fetcher
        .issuer(&fingerprint, cancel)
        .await
        .map_err(|source| IssuerError::Fetch {
            fingerprint: hex::encode(fingerprint),
            source,
        })?;
    if <[u8; 32]>::from(Sha256::digest(&data)) != fingerprint {
        return Err(IssuerError::FingerprintMismatch(hex::encode(fingerprint)));
    }
    state.store.store_issuer(&fingerprint, &data).await?;
    Ok(data)
}
