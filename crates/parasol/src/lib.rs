// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! parasol exposes a tile-based, checkpoint-signed static CT log through
//! the classic RFC 6962 monitoring interface: leaf positions, inclusion and
//! consistency proofs, and decoded entries. Submission endpoints are
//! tunneled to the upstream log unchanged.
//!
//! The moving parts: [`index`] keeps a persistent map from leaf hash to
//! leaf index and a fragmented Merkle accumulator of everything downloaded
//! so far, promoting each checkpoint only after reproducing its root hash
//! from the leaves; [`proofs`] answers proof queries by fetching and
//! authenticating whichever internal tiles are needed; [`entries`] rebuilds
//! legacy `{leaf_input, extra_data}` pairs from data tiles and a
//! content-addressed issuer cache.

pub mod base64_bytes;
pub mod checkpoint;
pub mod entries;
pub mod error;
pub mod fetch;
pub mod handlers;
pub mod index;
pub mod issuers;
pub mod listener;
pub mod proofs;
pub mod server;
pub mod store;
