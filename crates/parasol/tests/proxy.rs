// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! End-to-end tests against an in-process mock of the upstream static log:
//! checkpoint and tiles are served from a path-keyed map, the indexer runs
//! real ticks over HTTP, and the read endpoints are driven through the
//! handlers (and, for the submission tunnel, through a bound router).

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::prelude::*;
use byteorder::{BigEndian, WriteBytesExt};
use merkle_tiles::{record_hash, stored_hashes, tree_hash, Hash, HashReader, TlogError};
use parasol::checkpoint::{LogId, SignedTreeHead};
use parasol::entries::GetEntriesItem;
use parasol::fetch::Fetcher;
use parasol::handlers;
use parasol::index::{self, IndexError};
use parasol::listener::TimeoutListener;
use parasol::server::{self, AppState};
use parasol::store::Store;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;

const LOG_ID: LogId = [7u8; 32];
const ORIGIN: &str = "example.com/test";

type Files = Arc<RwLock<HashMap<String, Vec<u8>>>>;

async fn serve_file(State(files): State<Files>, uri: Uri) -> Response {
    match files.read().unwrap().get(uri.path()) {
        Some(bytes) => bytes.clone().into_response(),
        None => (StatusCode::NOT_FOUND, "no such file").into_response(),
    }
}

struct Upstream {
    files: Files,
    addr: SocketAddr,
}

impl Upstream {
    async fn start() -> Self {
        let files: Files = Arc::new(RwLock::new(HashMap::new()));
        let app = Router::new().fallback(serve_file).with_state(files.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { files, addr }
    }

    fn put(&self, path: &str, bytes: Vec<u8>) {
        self.files.write().unwrap().insert(path.to_string(), bytes);
    }

    fn monitoring(&self) -> String {
        format!("http://{}/mon", self.addr)
    }

    fn submission(&self) -> String {
        format!("http://{}/submit", self.addr)
    }
}

async fn proxy_state(upstream: &Upstream) -> Arc<AppState> {
    let store = Store::open_memory().await.unwrap();
    store.init_state(&LOG_ID).await.unwrap();
    Arc::new(AppState::new(
        store,
        Fetcher::default_client(),
        &upstream.submission(),
        &upstream.monitoring(),
        LOG_ID,
        true,
        None,
    ))
}

fn build_checkpoint(size: u64, root: &Hash, timestamp: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(ORIGIN.as_bytes());
    hasher.update([b'\n', 0x05]);
    hasher.update(LOG_ID);
    let key_id = &hasher.finalize()[..4];

    let mut payload = key_id.to_vec();
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(b"unverified signature");
    format!(
        "{ORIGIN}\n{size}\n{}\n\n\u{2014} {ORIGIN} {}\n",
        BASE64_STANDARD.encode(root.0),
        BASE64_STANDARD.encode(&payload),
    )
    .into_bytes()
}

// Encodes an upstream x509 tile leaf; returns the full encoding and the
// embedded TimestampedEntry bytes.
fn encode_x509_entry(
    timestamp: u64,
    certificate: &[u8],
    leaf_index: u64,
    chain: &[[u8; 32]],
) -> (Vec<u8>, Vec<u8>) {
    let mut extensions = Vec::new();
    extensions.write_u8(0).unwrap();
    extensions.write_u16::<BigEndian>(5).unwrap();
    extensions.write_uint::<BigEndian>(leaf_index, 5).unwrap();

    let mut te = Vec::new();
    te.write_u64::<BigEndian>(timestamp).unwrap();
    te.write_u16::<BigEndian>(0).unwrap();
    te.write_uint::<BigEndian>(certificate.len() as u64, 3).unwrap();
    te.extend_from_slice(certificate);
    te.write_u16::<BigEndian>(extensions.len() as u16).unwrap();
    te.extend_from_slice(&extensions);

    let mut leaf = te.clone();
    let fingerprints = chain.concat();
    leaf.write_u16::<BigEndian>(fingerprints.len() as u16).unwrap();
    leaf.extend_from_slice(&fingerprints);
    (leaf, te)
}

// Hash storage addressed directly by stored hash index.
#[derive(Default)]
struct IndexedHashes(Vec<Hash>);

impl std::ops::Deref for IndexedHashes {
    type Target = Vec<Hash>;
    fn deref(&self) -> &Vec<Hash> {
        &self.0
    }
}

impl std::ops::DerefMut for IndexedHashes {
    fn deref_mut(&mut self) -> &mut Vec<Hash> {
        &mut self.0
    }
}

impl HashReader for IndexedHashes {
    fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError> {
        indexes
            .iter()
            .map(|&x| {
                self.0
                    .get(usize::try_from(x).unwrap())
                    .copied()
                    .ok_or(TlogError::IndexesNotInTree)
            })
            .collect()
    }
}

struct TinyLog {
    leaf_inputs: Vec<Vec<u8>>,
    leaf_hashes: Vec<Hash>,
    storage: IndexedHashes,
    root: Hash,
    issuer_der: Vec<u8>,
    fingerprint: [u8; 32],
}

// Publishes a three-entry log (checkpoint, leaf tile, data tile, issuer)
// to the mock upstream.
fn publish_tiny_log(upstream: &Upstream, corrupt_issuer: bool) -> TinyLog {
    let issuer_der = b"issuer certificate der".to_vec();
    let fingerprint: [u8; 32] = Sha256::digest(&issuer_der).into();

    let mut leaf_inputs = Vec::new();
    let mut leaf_hashes = Vec::new();
    let mut storage = IndexedHashes::default();
    let mut data_tile = Vec::new();
    for i in 0..3u64 {
        let (leaf, te) = encode_x509_entry(1000 + i, format!("cert {i}").as_bytes(), i, &[fingerprint]);
        data_tile.extend_from_slice(&leaf);
        let mut leaf_input = vec![0, 0];
        leaf_input.extend_from_slice(&te);
        let hash = record_hash(&leaf_input);
        let new = stored_hashes(i, hash, &storage).unwrap();
        storage.extend(new);
        leaf_inputs.push(leaf_input);
        leaf_hashes.push(hash);
    }
    let root = tree_hash(3, &storage).unwrap();

    let mut leaf_tile = Vec::new();
    for hash in &leaf_hashes {
        leaf_tile.extend_from_slice(&hash.0);
    }

    upstream.put("/mon/checkpoint", build_checkpoint(3, &root, 1234));
    upstream.put("/mon/tile/8/0/000.p/3", leaf_tile);
    upstream.put("/mon/tile/8/data/000.p/3", data_tile);
    upstream.put(
        &format!("/mon/issuer/{}", hex::encode(fingerprint)),
        if corrupt_issuer {
            b"not the issuer".to_vec()
        } else {
            issuer_der.clone()
        },
    );

    TinyLog {
        leaf_inputs,
        leaf_hashes,
        storage,
        root,
        issuer_der,
        fingerprint,
    }
}

fn params(pairs: &[(&str, &str)]) -> axum::extract::Query<HashMap<String, String>> {
    axum::extract::Query(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

async fn body_json<T: for<'de> Deserialize<'de>>(response: Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[derive(Deserialize)]
struct EntriesBody {
    entries: Vec<GetEntriesItem>,
}

#[derive(Deserialize)]
struct ProofByHashBody {
    leaf_index: u64,
    audit_path: Vec<Hash>,
}

#[derive(Deserialize)]
struct ConsistencyBody {
    consistency: Vec<Hash>,
}

#[tokio::test]
async fn test_cold_start_tiny_log() {
    let upstream = Upstream::start().await;
    let log = publish_tiny_log(&upstream, false);
    let state = proxy_state(&upstream).await;

    // Before the first tick nothing is promoted.
    assert!(state.promoted().is_none());

    index::tick(&state).await.unwrap();

    // The checkpoint is promoted and get-sth serves it.
    let response = handlers::get_sth(State(state.clone())).await.unwrap();
    let sth: SignedTreeHead = body_json(response).await;
    assert_eq!(sth.tree_size, 3);
    assert_eq!(sth.timestamp, 1234);
    assert_eq!(sth.sha256_root_hash, log.root);
    assert_eq!(sth.tree_head_signature, b"unverified signature");

    // All three leaves are indexed, and the cached issuer is intact.
    for (i, hash) in log.leaf_hashes.iter().enumerate() {
        assert_eq!(
            state.store.lookup_leaf(&hash.0).await.unwrap(),
            Some(i as u64)
        );
    }

    // get-entries round-trips the leaf inputs.
    let response = handlers::get_entries(
        State(state.clone()),
        params(&[("start", "0"), ("end", "2")]),
    )
    .await
    .unwrap();
    let body: EntriesBody = body_json(response).await;
    assert_eq!(body.entries.len(), 3);
    for (i, item) in body.entries.iter().enumerate() {
        assert_eq!(item.leaf_input, log.leaf_inputs[i]);
        // extra_data: empty precert section, one-issuer chain.
        let mut expected = Vec::new();
        let mut chain = Vec::new();
        chain
            .write_uint::<BigEndian>(log.issuer_der.len() as u64, 3)
            .unwrap();
        chain.extend_from_slice(&log.issuer_der);
        expected
            .write_uint::<BigEndian>(chain.len() as u64, 3)
            .unwrap();
        expected.extend_from_slice(&chain);
        assert_eq!(item.extra_data, expected);
    }
    assert_eq!(
        state.store.load_issuer(&log.fingerprint).await.unwrap(),
        Some(log.issuer_der.clone())
    );

    // get-proof-by-hash for leaf 1 verifies against the promoted root.
    let encoded = BASE64_STANDARD.encode(log.leaf_hashes[1].0);
    let response = handlers::get_proof_by_hash(
        State(state.clone()),
        params(&[("hash", &encoded), ("tree_size", "3")]),
    )
    .await
    .unwrap();
    let body: ProofByHashBody = body_json(response).await;
    assert_eq!(body.leaf_index, 1);
    merkle_tiles::verify_inclusion_proof(&body.audit_path, 3, log.root, 1, log.leaf_hashes[1])
        .unwrap();

    // get-sth-consistency between sizes 1 and 3.
    let response = handlers::get_sth_consistency(
        State(state.clone()),
        params(&[("first", "1"), ("second", "3")]),
    )
    .await
    .unwrap();
    let body: ConsistencyBody = body_json(response).await;
    let old_root = tree_hash(1, &log.storage).unwrap();
    merkle_tiles::verify_consistency_proof(&body.consistency, 3, log.root, 1, old_root).unwrap();

    // get-entry-and-proof agrees with both of the above.
    let response = handlers::get_entry_and_proof(
        State(state.clone()),
        params(&[("leaf_index", "1"), ("tree_size", "3")]),
    )
    .await
    .unwrap();
    let body: serde_json::Value = body_json(response).await;
    let leaf_input = BASE64_STANDARD
        .decode(body["leaf_input"].as_str().unwrap())
        .unwrap();
    assert_eq!(leaf_input, log.leaf_inputs[1]);
    assert!(body["extra_data"].is_string());
    assert_eq!(body["audit_path"].as_array().unwrap().len(), 2);

    // A second tick is a no-op: already synchronized.
    index::tick(&state).await.unwrap();
    assert_eq!(state.promoted().unwrap().tree_size, 3);
}

// Publishes only the leaf tiles of a 300-leaf tree whose leaves are
// synthetic hashes; entries are not needed for indexing.
fn publish_large_log(upstream: &Upstream, with_partial_tile: bool) -> (Vec<Hash>, Hash) {
    let mut storage = IndexedHashes::default();
    let mut leaves = Vec::new();
    for i in 0..300u64 {
        let hash = record_hash(format!("large leaf {i}").as_bytes());
        let new = stored_hashes(i, hash, &storage).unwrap();
        storage.extend(new);
        leaves.push(hash);
    }
    let root = tree_hash(300, &storage).unwrap();

    let tile0: Vec<u8> = leaves[..256].iter().flat_map(|h| h.0).collect();
    upstream.put("/mon/tile/8/0/000", tile0);
    if with_partial_tile {
        let tile1: Vec<u8> = leaves[256..].iter().flat_map(|h| h.0).collect();
        upstream.put("/mon/tile/8/0/001.p/44", tile1);
    }
    upstream.put("/mon/checkpoint", build_checkpoint(300, &root, 99));
    (leaves, root)
}

#[tokio::test]
async fn test_partial_last_tile_with_interrupted_cycle() {
    let upstream = Upstream::start().await;
    // Tile 1 is missing at first: the cycle fails but keeps tile 0.
    let (leaves, _root) = publish_large_log(&upstream, false);
    let state = proxy_state(&upstream).await;

    index::tick(&state).await.unwrap();
    assert!(state.promoted().is_none());
    let position = state.store.load_position().await.unwrap().unwrap();
    assert_eq!(position.covered_prefix(), 256);
    assert_eq!(position.gaps(300), vec![256..300]);

    // The partial tile appears; the next tick fills the gap and promotes.
    let tile1: Vec<u8> = leaves[256..].iter().flat_map(|h| h.0).collect();
    upstream.put("/mon/tile/8/0/001.p/44", tile1);
    index::tick(&state).await.unwrap();

    let sth = state.promoted().expect("promoted after second tick");
    assert_eq!(sth.tree_size, 300);
    assert_eq!(state.store.lookup_leaf(&leaves[0].0).await.unwrap(), Some(0));
    assert_eq!(
        state.store.lookup_leaf(&leaves[299].0).await.unwrap(),
        Some(299)
    );
}

#[tokio::test]
async fn test_root_mismatch_is_fatal() {
    let upstream = Upstream::start().await;
    let (_leaves, root) = publish_large_log(&upstream, true);
    let mut wrong_root = root;
    wrong_root.0[0] ^= 1;
    upstream.put("/mon/checkpoint", build_checkpoint(300, &wrong_root, 99));

    let state = proxy_state(&upstream).await;
    let err = index::tick(&state).await.unwrap_err();
    assert!(matches!(err, IndexError::RootMismatch { .. }));
    assert!(state.promoted().is_none());
}

#[tokio::test]
async fn test_corrupt_issuer_fails_entries_and_stays_uncached() {
    let upstream = Upstream::start().await;
    let log = publish_tiny_log(&upstream, true);
    let state = proxy_state(&upstream).await;
    index::tick(&state).await.unwrap();

    let err = handlers::get_entries(
        State(state.clone()),
        params(&[("start", "0"), ("end", "2")]),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(state.store.load_issuer(&log.fingerprint).await.unwrap().is_none());
}

#[tokio::test]
async fn test_submission_tunnel_and_unsynchronized_reads() {
    let upstream = Upstream::start().await;
    upstream.put("/submit/ct/v1/add-chain", b"{\"sct_version\":0}".to_vec());
    upstream.put("/submit/ct/v1/get-roots", b"{\"certificates\":[]}".to_vec());

    // No checkpoint published: the proxy stays unsynchronized.
    let state = proxy_state(&upstream).await;
    let app = server::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(TimeoutListener::new(listener), app).await.unwrap();
    });
    let client = reqwest::Client::new();

    // Submission endpoints tunnel even while reads return 503.
    let response = client
        .post(format!("http://{addr}/ct/v1/add-chain"))
        .header("content-type", "application/json")
        .body("{\"chain\":[]}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "{\"sct_version\":0}");

    let response = client
        .get(format!("http://{addr}/ct/v1/get-roots"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    for path in [
        "/ct/v1/get-sth",
        "/ct/v1/get-sth-consistency?first=1&second=2",
        "/ct/v1/get-entries?start=0&end=0",
        "/ct/v1/get-entry-and-proof?leaf_index=0&tree_size=1",
    ] {
        let response = client
            .get(format!("http://{addr}{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503, "{path}");
    }
}
