// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! HTTP fetching from the upstream monitoring prefix, with retries.
//!
//! Retry policy lives here rather than in callers: every fetch of a
//! checkpoint, tile, or issuer goes through [`Fetcher::get_with_retry`].
//! Transport errors and 5xx/429 responses are retried with capped
//! exponential backoff and jitter; 400 is retried as well because some
//! deployments answer 400 for a partial tile that is not yet available.

use merkle_tiles::{tile_path, Tile, FULL_WIDTH};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Overall deadline for a single upstream request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 5;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{status} from {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("tile {tile} is {got} bytes, expected at least {want}")]
    ShortTile { tile: u64, got: usize, want: usize },
    #[error("request cancelled")]
    Cancelled,
    #[error("{source} (retried {retries} times)")]
    Exhausted {
        retries: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    fn retryable(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => {
                *status / 100 == 5 || *status == 429 || *status == 400
            }
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// Exponential backoff delay before retry number `retries + 1`, capped.
fn backoff(retries: u32) -> Duration {
    MAX_RETRY_DELAY.min(BASE_RETRY_DELAY * 2u32.saturating_pow(retries))
}

/// Runs `op` with up to [`MAX_RETRIES`] retries for retryable failures,
/// sleeping between attempts and honoring any upstream `Retry-After` that
/// exceeds the planned delay. Cancellation aborts a planned sleep
/// immediately.
pub(crate) async fn with_retry<F, Fut>(
    mut op: F,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, FetchError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>, FetchError>>,
{
    let mut retries = 0;
    loop {
        let err = match op().await {
            Ok(body) => return Ok(body),
            Err(err) => err,
        };
        if !err.retryable() {
            return Err(err);
        }
        if retries == MAX_RETRIES {
            return Err(FetchError::Exhausted {
                retries,
                source: Box::new(err),
            });
        }
        let base = backoff(retries);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        let mut delay = base + Duration::from_millis(jitter);
        if let Some(retry_after) = err.retry_after() {
            if retry_after > delay {
                delay = retry_after;
            }
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(err),
            () = tokio::time::sleep(delay) => {}
        }
        retries += 1;
    }
}

/// Width of the trailing partial tile at `tile` in a tree with `tree_size`
/// records, or `None` if that tile is full.
pub fn partial_width(tile: u64, tree_size: u64) -> Option<u32> {
    let remaining = tree_size.saturating_sub(tile * u64::from(FULL_WIDTH));
    if remaining < u64::from(FULL_WIDTH) {
        Some(u32::try_from(remaining).expect("partial width fits in u32"))
    } else {
        None
    }
}

/// Client for the upstream monitoring prefix.
pub struct Fetcher {
    client: reqwest::Client,
    monitoring: String,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, monitoring: &str) -> Self {
        Self {
            client,
            monitoring: monitoring.trim_end_matches('/').to_string(),
        }
    }

    /// Builds a [`reqwest::Client`] with the fetch layer's request timeout.
    ///
    /// # Panics
    ///
    /// Panics if the client cannot be constructed.
    pub fn default_client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("HTTP client build")
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.monitoring, path)
    }

    /// A single GET. Non-200 responses become [`FetchError::Status`] with
    /// any `Retry-After` (integer seconds) attached.
    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        let request = async {
            let resp = self.client.get(url).send().await.map_err(|source| {
                FetchError::Transport {
                    url: url.to_string(),
                    source,
                }
            })?;
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u16>().ok())
                .map(|secs| Duration::from_secs(u64::from(secs)));
            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Transport {
                    url: url.to_string(),
                    source,
                })?;
            if status != 200 {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status,
                    body: String::from_utf8_lossy(&body).trim().to_string(),
                    retry_after,
                });
            }
            Ok(body.to_vec())
        };
        tokio::select! {
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            result = request => result,
        }
    }

    pub async fn get_with_retry(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        with_retry(|| self.get(url, cancel), cancel).await
    }

    /// Fetches the signed checkpoint.
    pub async fn checkpoint(&self, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        self.get_with_retry(&self.url("checkpoint"), cancel).await
    }

    /// Fetches the issuer certificate with the given SHA-256 fingerprint.
    pub async fn issuer(
        &self,
        fingerprint: &[u8; 32],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        self.get_with_retry(&self.url(&format!("issuer/{}", hex::encode(fingerprint))), cancel)
            .await
    }

    /// Fetches the tile at `tile` on the given level (`"0"` for leaf
    /// hashes, `"data"` for entries) of a tree with `tree_size` records.
    ///
    /// If the tile is the trailing partial one, the partial path is tried
    /// first with a fallback to the full path, and the partial attempt's
    /// error is the one surfaced if both fail.
    pub async fn tile(
        &self,
        level: &str,
        tile: u64,
        tree_size: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        let full = self.url(&tile_path(level, tile, FULL_WIDTH));
        let Some(width) = partial_width(tile, tree_size) else {
            return self.get_with_retry(&full, cancel).await;
        };
        let partial = self.url(&tile_path(level, tile, width));
        match self.get_with_retry(&partial, cancel).await {
            Ok(data) => Ok(data),
            Err(partial_err) => match self.get_with_retry(&full, cancel).await {
                Ok(data) => Ok(data),
                Err(_) => Err(partial_err),
            },
        }
    }

    /// Fetches an internal hash tile at its exact coordinates.
    pub async fn hash_tile(
        &self,
        tile: &Tile,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        self.get_with_retry(&self.url(&tile.path()), cancel).await
    }
}
