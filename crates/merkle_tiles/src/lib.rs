// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Merkle tree arithmetic for tiled transparency logs: RFC 6962 proofs over
//! a [`HashReader`], tile coordinates and authentication plans, and the
//! collapsed/fragmented accumulators used to rebuild a tree from leaf tiles
//! arriving in any order.

pub mod collapse;
pub mod tile;
pub mod tlog;

pub use collapse::{CollapsedTree, FragmentedTree};
pub use tile::{tile_path, Tile, TilePlan, FULL_WIDTH, TILE_HEIGHT};
pub use tlog::{
    consistency_proof, consistency_proof_indexes, inclusion_proof, inclusion_proof_indexes,
    node_hash, record_hash, stored_hash_count, stored_hash_index, stored_hashes, tree_hash,
    tree_hash_indexes, verify_consistency_proof, verify_inclusion_proof, Hash, HashReader,
    PreloadedHashes, Proof, TlogError, EMPTY_HASH, HASH_SIZE,
};
