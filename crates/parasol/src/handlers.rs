// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! RFC 6962 read endpoints.
//!
//! Each handler validates its query against the promoted STH, drives the
//! proof builder or entry materializer, and encodes the response as JSON
//! with `X-Content-Type-Options: nosniff`.

use crate::checkpoint::SignedTreeHead;
use crate::entries::{self, GetEntriesItem};
use crate::error::ApiError;
use crate::proofs;
use crate::server::AppState;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use base64::prelude::*;
use merkle_tiles::{Proof, HASH_SIZE};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Params = Query<HashMap<String, String>>;

fn json_ok<T: Serialize>(value: &T) -> Response {
    let body = serde_json::to_vec(value).expect("response serialization");
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body,
    )
        .into_response()
}

fn require_u64(params: &HashMap<String, String>, name: &str) -> Result<u64, ApiError> {
    let value = params
        .get(name)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {name} parameter")))?;
    value
        .parse()
        .map_err(|err| ApiError::BadRequest(format!("invalid {name} parameter: {err}")))
}

fn promoted(state: &AppState) -> Result<Arc<SignedTreeHead>, ApiError> {
    state.promoted().ok_or(ApiError::NotSynchronized)
}

pub async fn get_sth(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let sth = promoted(&state)?;
    Ok(json_ok(&*sth))
}

#[derive(Serialize)]
struct ConsistencyResponse {
    consistency: Proof,
}

pub async fn get_sth_consistency(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let first = require_u64(&params, "first")?;
    let second = require_u64(&params, "second")?;
    if first == 0 {
        return Err(ApiError::BadRequest("first must be greater than zero".into()));
    }
    if second <= first {
        return Err(ApiError::BadRequest("second is not after first".into()));
    }
    let sth = promoted(&state)?;
    if second > sth.tree_size {
        return Err(ApiError::BadRequest(format!(
            "second is beyond the current tree size ({})",
            sth.tree_size
        )));
    }

    let cancel = CancellationToken::new();
    let proof = proofs::consistency(&state, &sth, second, first, &cancel).await?;
    Ok(json_ok(&ConsistencyResponse { consistency: proof }))
}

#[derive(Serialize)]
struct ProofByHashResponse {
    leaf_index: u64,
    audit_path: Proof,
}

pub async fn get_proof_by_hash(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let encoded = params
        .get("hash")
        .ok_or_else(|| ApiError::BadRequest("missing hash parameter".into()))?;
    let hash = BASE64_STANDARD
        .decode(encoded)
        .map_err(|err| ApiError::BadRequest(format!("invalid hash parameter: {err}")))?;
    let hash: [u8; HASH_SIZE] = hash.try_into().map_err(|hash: Vec<u8>| {
        ApiError::BadRequest(format!(
            "invalid hash parameter: wrong length (should be {HASH_SIZE} bytes long, not {})",
            hash.len()
        ))
    })?;
    let tree_size = require_u64(&params, "tree_size")?;

    if !state.leaf_index_enabled {
        return Err(ApiError::BadRequest("leaf indexing is disabled".into()));
    }
    let leaf_index = state
        .store
        .lookup_leaf(&hash)
        .await?
        .ok_or_else(|| ApiError::BadRequest("hash not found".into()))?;
    if leaf_index >= tree_size {
        return Err(ApiError::BadRequest("hash is not within tree_size".into()));
    }
    let sth = promoted(&state)?;
    if tree_size > sth.tree_size {
        return Err(ApiError::BadRequest(format!(
            "tree_size is beyond the current tree size ({})",
            sth.tree_size
        )));
    }

    let cancel = CancellationToken::new();
    let audit_path = proofs::inclusion(&state, &sth, tree_size, leaf_index, &cancel).await?;
    Ok(json_ok(&ProofByHashResponse {
        leaf_index,
        audit_path,
    }))
}

#[derive(Serialize)]
struct EntriesResponse {
    entries: Vec<GetEntriesItem>,
}

pub async fn get_entries(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let start = require_u64(&params, "start")?;
    let end = require_u64(&params, "end")?;
    if end < start {
        return Err(ApiError::BadRequest("end is before start".into()));
    }
    let sth = promoted(&state)?;
    if start >= sth.tree_size {
        return Err(ApiError::BadRequest(format!(
            "start is beyond the current tree size ({})",
            sth.tree_size
        )));
    }
    if end >= sth.tree_size {
        return Err(ApiError::BadRequest(format!(
            "end is beyond the current tree size ({})",
            sth.tree_size
        )));
    }

    let cancel = CancellationToken::new();
    let entries = entries::download_entries(&state, &sth, start, end + 1, &cancel).await?;
    Ok(json_ok(&EntriesResponse { entries }))
}

#[derive(Serialize)]
struct EntryAndProofResponse {
    #[serde(with = "crate::base64_bytes")]
    leaf_input: Vec<u8>,
    #[serde(with = "crate::base64_bytes")]
    extra_data: Vec<u8>,
    audit_path: Proof,
}

pub async fn get_entry_and_proof(
    State(state): State<Arc<AppState>>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let leaf_index = require_u64(&params, "leaf_index")?;
    let tree_size = require_u64(&params, "tree_size")?;
    if leaf_index >= tree_size {
        return Err(ApiError::BadRequest("leaf_index is not within tree_size".into()));
    }
    let sth = promoted(&state)?;
    if tree_size > sth.tree_size {
        return Err(ApiError::BadRequest(format!(
            "tree_size is beyond the current tree size ({})",
            sth.tree_size
        )));
    }

    let cancel = CancellationToken::new();
    let mut items =
        entries::download_entries(&state, &sth, leaf_index, leaf_index + 1, &cancel).await?;
    let item = items
        .pop()
        .ok_or_else(|| ApiError::Internal("upstream returned no entries".into()))?;
    let audit_path = proofs::inclusion(&state, &sth, tree_size, leaf_index, &cancel).await?;
    Ok(json_ok(&EntryAndProofResponse {
        leaf_input: item.leaf_input,
        extra_data: item.extra_data,
        audit_path,
    }))
}
