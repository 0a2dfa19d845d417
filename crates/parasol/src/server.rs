// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Server state and routing.
//!
//! Read endpoints observe only the promoted STH (a lock-free swap pointer)
//! plus persisted indexes; the indexer is the only writer. Submission
//! endpoints are tunneled to the upstream submission prefix unchanged.

use crate::checkpoint::{LogId, SignedTreeHead};
use crate::error::ApiError;
use crate::fetch::Fetcher;
use crate::handlers;
use crate::store::{Store, StoreError};
use arc_swap::ArcSwapOption;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

/// Largest request body accepted on submission endpoints.
const MAX_REQUEST_BODY: usize = 128 * 1024;

/// Bound on handler execution, covering proof and entry materialization
/// fetches. Matches the connection write deadline; expiry maps to a 500
/// through [`ApiError`] so no status outside the documented set is
/// emitted. The read/write/idle deadlines themselves are enforced per
/// connection by [`crate::listener::TimeoutListener`].
const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AppState {
    pub store: Store,
    pub fetcher: Fetcher,
    pub log_id: LogId,
    pub leaf_index_enabled: bool,
    // Promoted STH; read endpoints return 503 while this is unset.
    sth: ArcSwapOption<SignedTreeHead>,
    submission: String,
    client: reqwest::Client,
}

impl AppState {
    pub fn new(
        store: Store,
        client: reqwest::Client,
        submission: &str,
        monitoring: &str,
        log_id: LogId,
        leaf_index_enabled: bool,
        initial_sth: Option<SignedTreeHead>,
    ) -> Self {
        Self {
            store,
            fetcher: Fetcher::new(client.clone(), monitoring),
            log_id,
            leaf_index_enabled,
            sth: ArcSwapOption::from(initial_sth.map(Arc::new)),
            submission: submission.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// The promoted STH, if any. Lock-free; in-flight requests keep their
    /// snapshot across a promotion.
    pub fn promoted(&self) -> Option<Arc<SignedTreeHead>> {
        self.sth.load_full()
    }

    /// Persists and then publishes a new STH.
    pub async fn promote(&self, sth: &SignedTreeHead) -> Result<(), StoreError> {
        self.store.store_sth(sth).await?;
        self.sth.store(Some(Arc::new(sth.clone())));
        Ok(())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ct/v1/add-chain", post(proxy_submission))
        .route("/ct/v1/add-pre-chain", post(proxy_submission))
        .route("/ct/v1/get-roots", get(proxy_submission))
        .route("/ct/v1/get-sth", get(handlers::get_sth))
        .route("/ct/v1/get-sth-consistency", get(handlers::get_sth_consistency))
        .route("/ct/v1/get-proof-by-hash", get(handlers::get_proof_by_hash))
        .route("/ct/v1/get-entries", get(handlers::get_entries))
        .route("/ct/v1/get-entry-and-proof", get(handlers::get_entry_and_proof))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
        .layer(middleware::from_fn(handler_deadline))
        .with_state(state)
}

async fn handler_deadline(request: Request, next: Next) -> Response {
    match tokio::time::timeout(HANDLER_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::Internal("request processing timed out".into()).into_response(),
    }
}

// Tunnels a submission request (add-chain, add-pre-chain, get-roots) to the
// upstream submission prefix and relays the response.
async fn proxy_submission(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiError> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());
    let url = format!("{}{}", state.submission, path_and_query);
    let method = request.method().clone();
    let content_type = request.headers().get(header::CONTENT_TYPE).cloned();

    let body = axum::body::to_bytes(request.into_body(), MAX_REQUEST_BODY)
        .await
        .map_err(|err| ApiError::BadRequest(format!("error reading request body: {err}")))?;

    let mut upstream = if method == Method::POST {
        state.client.post(&url).body(body)
    } else {
        state.client.get(&url)
    };
    if let Some(content_type) = content_type {
        if let Ok(value) = content_type.to_str() {
            upstream = upstream.header(header::CONTENT_TYPE, value);
        }
    }

    let response = upstream
        .send()
        .await
        .map_err(|err| ApiError::Internal(format!("error contacting submission prefix: {err}")))?;
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ApiError::Internal(format!("error reading submission response: {err}")))?;

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|err| ApiError::Internal(err.to_string()))
}
