// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Parsing of the upstream signed checkpoint into an RFC 6962 signed tree
//! head.
//!
//! A checkpoint is a signed note: an origin line, a decimal tree size, a
//! base64 root hash, optional non-empty extension lines, a blank line, and
//! one or more signature lines of the form `— <origin> <base64>`. The log's
//! own signature is selected by key id; its payload carries the key id, a
//! millisecond timestamp, and the `TreeHeadSignature` bytes:
//!
//! ```text
//! struct {
//!     opaque key_id[4];
//!     uint64 timestamp;
//!     TreeHeadSignature signature;
//! } RFC6962NoteSignature;
//! ```
//!
//! The signature bytes are extracted, not verified; verification is the
//! business of whoever consumes the `get-sth` response.

use base64::prelude::*;
use byteorder::{BigEndian, ByteOrder};
use merkle_tiles::{Hash, HASH_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The 32-byte RFC 6962 log ID (SHA-256 of the log's public key).
pub type LogId = [u8; 32];

/// An RFC 6962 signed tree head, served verbatim as the `get-sth` response
/// and persisted as JSON in the state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sha256_root_hash: Hash,
    #[serde(with = "crate::base64_bytes")]
    pub tree_head_signature: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("malformed checkpoint: {0}")]
    Malformed(&'static str),
    #[error("checkpoint is missing a signature from the log")]
    MissingSignature,
}

// Splits off one newline-terminated line. A checkpoint with no trailing
// newline on its last line is malformed.
fn chomp_line(input: &[u8]) -> Option<(&str, &[u8])> {
    let newline = input.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&input[..newline]).ok()?;
    Some((line, &input[newline + 1..]))
}

// First four bytes of SHA-256(origin || "\n" || 0x05 || log_id), the key id
// the log uses for its RFC 6962 note signature.
fn note_key_id(origin: &str, log_id: &LogId) -> [u8; 4] {
    let mut hasher = Sha256::new();
    hasher.update(origin.as_bytes());
    hasher.update([b'\n', 0x05]);
    hasher.update(log_id);
    let digest = hasher.finalize();
    digest[..4].try_into().expect("digest is at least 4 bytes")
}

/// Parses a signed checkpoint, selecting the signature of the log
/// identified by `log_id`.
///
/// # Errors
///
/// Returns [`CheckpointError::Malformed`] on any format violation and
/// [`CheckpointError::MissingSignature`] if no signature line matches the
/// log's key id.
pub fn parse_checkpoint(input: &[u8], log_id: &LogId) -> Result<SignedTreeHead, CheckpointError> {
    let (origin, input) =
        chomp_line(input).ok_or(CheckpointError::Malformed("missing origin line"))?;

    let (size_line, input) =
        chomp_line(input).ok_or(CheckpointError::Malformed("missing tree size line"))?;
    let tree_size: u64 = size_line
        .parse()
        .map_err(|_| CheckpointError::Malformed("invalid tree size"))?;

    let (hash_line, mut input) =
        chomp_line(input).ok_or(CheckpointError::Malformed("missing root hash line"))?;
    let root_hash = BASE64_STANDARD
        .decode(hash_line)
        .map_err(|_| CheckpointError::Malformed("invalid root hash encoding"))?;
    let root_hash: [u8; HASH_SIZE] = root_hash
        .try_into()
        .map_err(|_| CheckpointError::Malformed("root hash has wrong length"))?;

    // Zero or more non-empty extension lines, terminated by a blank line.
    loop {
        let (line, rest) =
            chomp_line(input).ok_or(CheckpointError::Malformed("note ended prematurely"))?;
        input = rest;
        if line.is_empty() {
            break;
        }
    }

    let signature_prefix = format!("\u{2014} {origin} ");
    let key_id = note_key_id(origin, log_id);
    loop {
        let Some((line, rest)) = chomp_line(input) else {
            return Err(CheckpointError::MissingSignature);
        };
        input = rest;
        let Some(encoded) = line.strip_prefix(&signature_prefix) else {
            continue;
        };
        let signature = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| CheckpointError::Malformed("invalid signature encoding"))?;
        if !signature.starts_with(&key_id) {
            continue;
        }
        if signature.len() < 12 {
            return Err(CheckpointError::Malformed("signature too short"));
        }
        return Ok(SignedTreeHead {
            tree_size,
            timestamp: BigEndian::read_u64(&signature[4..12]),
            sha256_root_hash: Hash(root_hash),
            tree_head_signature: signature[12..].to_vec(),
        });
    }
}
