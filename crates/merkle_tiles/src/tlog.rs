// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Merkle tree arithmetic for an append-only transparency log, following
//! [RFC 6962](https://tools.ietf.org/html/rfc6962#section-2.1) and the
//! stored-hash layout of Crosby and Wallach's ["Efficient Data Structures
//! for Tamper-Evident
//! Logging"](https://www.usenix.org/legacy/event/sec09/tech/full_papers/crosby.pdf).
//!
//! Hashes for interior nodes are addressed by a dense *stored hash index*
//! (see [`stored_hash_index`]); everything that needs node hashes reads them
//! through the [`HashReader`] trait, so proofs can be computed over any
//! backing storage that can produce hashes by index.

use base64::prelude::*;
use serde::{
    de::{self, Visitor},
    Deserialize, Serialize,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlogError {
    #[error("invalid transparency proof")]
    InvalidProof,
    #[error("malformed hash")]
    MalformedHash,
    #[error("invalid tile")]
    InvalidTile,
    #[error("bad math")]
    BadMath,
    #[error("downloaded inconsistent tile")]
    InconsistentTile,
    #[error("indexes not in tree")]
    IndexesNotInTree,
    #[error("hash index {0} was not preloaded")]
    MissingHash(u64),
    #[error("unmet input condition: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    InvalidBase64(#[from] base64::DecodeError),
}

/// The size of a [`Hash`] in bytes.
pub const HASH_SIZE: usize = 32;

/// A Hash identifies a log record or tree node.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Hash(pub [u8; HASH_SIZE]);

/// A verifiable inclusion or consistency proof: sibling subtree hashes,
/// innermost first.
pub type Proof = Vec<Hash>;

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct HashVisitor;

        impl Visitor<'_> for HashVisitor {
            type Value = Hash;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a base64 encoded string representing a 32-byte hash")
            }

            fn visit_str<E>(self, value: &str) -> Result<Hash, E>
            where
                E: de::Error,
            {
                Hash::parse_hash(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(HashVisitor)
    }
}

impl Hash {
    /// Returns a new Hash with contents decoded from the given
    /// base64-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the decoded hash size is not [`HASH_SIZE`].
    pub fn parse_hash(s: &str) -> Result<Self, TlogError> {
        let data = BASE64_STANDARD.decode(s)?;
        Ok(Hash(data.try_into().map_err(|_| TlogError::MalformedHash)?))
    }
}

/// `EMPTY_HASH` is the hash of the empty tree, per RFC 6962, Section 2.1.
/// It is the SHA-256 hash of the empty string.
pub const EMPTY_HASH: Hash = Hash([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

/// Returns the content hash for the given record data:
/// `SHA-256(0x00 || data)`.
pub fn record_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Returns the hash for an interior node with the given left and right
/// children: `SHA-256(0x01 || left || right)`.
pub fn node_hash(left: Hash, right: Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

// Returns k, the maximum power of 2 strictly smaller than n, along with
// l = log2(k). Requires n >= 2.
fn maxpow2(n: u64) -> (u64, u8) {
    let l = u8::try_from((n - 1).ilog2()).expect("log2 of a u64 fits in u8");
    (1 << l, l)
}

/// Maps the tree coordinates `(level, n)` to a dense linear ordering usable
/// for hash storage: level L's n'th hash is stored right after level L+1's
/// 2n+1'th hash.
pub fn stored_hash_index(level: u8, n: u64) -> u64 {
    let mut n = n;
    for _ in 0..level {
        n = 2 * n + 1;
    }
    let mut i = 0;
    while n > 0 {
        i += n;
        n >>= 1;
    }
    i + u64::from(level)
}

/// The inverse of [`stored_hash_index`]:
/// `split_stored_hash_index(stored_hash_index(level, n)) == (level, n)`.
///
/// # Panics
///
/// Panics on internal math errors.
pub fn split_stored_hash_index(index: u64) -> (u8, u64) {
    // Find the last record whose hashes start at or before index.
    // stored_hash_index(0, n) < 2n, so start at index/2 and scan forward.
    let mut n = index / 2;
    let mut index_n = stored_hash_index(0, n);
    assert!(index_n <= index, "bad math in split_stored_hash_index");
    loop {
        // Each record n adds 1 + trailing_zeros(n+1) hashes.
        let x = index_n + 1 + u64::from((n + 1).trailing_zeros());
        if x > index {
            break;
        }
        n += 1;
        index_n = x;
    }
    let level = u8::try_from(index - index_n).expect("level fits in u8");
    (level, n >> level)
}

/// Returns the number of stored hashes expected for a tree with `n` records.
pub fn stored_hash_count(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut count = stored_hash_index(0, n - 1) + 1;
    let mut i = n - 1;
    while i & 1 != 0 {
        count += 1;
        i >>= 1;
    }
    count
}

/// Returns the hashes that must be stored when writing record `n` with hash
/// `h`, starting at storage index `stored_hash_index(0, n)`. May read up to
/// `log n` earlier hashes from `r` to complete subtrees.
///
/// # Errors
///
/// Returns an error if `r` fails to read the required hashes.
///
/// # Panics
///
/// Panics if `r` returns the wrong number of hashes.
pub fn stored_hashes<R: HashReader>(n: u64, h: Hash, r: &R) -> Result<Vec<Hash>, TlogError> {
    let mut hashes = vec![h];

    // Each trailing 1 bit in n completes a subtree and consumes a hash from
    // an adjacent one.
    let m = u8::try_from((n + 1).trailing_zeros()).expect("trailing zeros of u64 fit in u8");
    let mut indexes = vec![0u64; m.into()];
    for i in 0..m {
        // n >> i is always odd here.
        indexes[usize::from(m - 1 - i)] = stored_hash_index(i, (n >> i) - 1);
    }

    let old = r.read_hashes(&indexes)?;
    assert_eq!(old.len(), indexes.len(), "bad read_hashes implementation");

    let mut h = h;
    for i in 0..m {
        h = node_hash(old[usize::from(m - 1 - i)], h);
        hashes.push(h);
    }

    Ok(hashes)
}

/// A `HashReader` can read hashes for nodes in the log's tree structure.
pub trait HashReader {
    /// Returns the hashes with the given stored hash indexes. Indexes are
    /// requested in increasing order.
    ///
    /// # Errors
    ///
    /// Must return as many hashes as indexes, or an error.
    fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError>;
}

/// A [`HashReader`] over a fixed set of already-fetched hashes, for running
/// proof arithmetic after the required indexes have been retrieved (and
/// authenticated) elsewhere.
pub struct PreloadedHashes(HashMap<u64, Hash>);

impl PreloadedHashes {
    /// Pairs up `indexes` and `hashes` positionally.
    ///
    /// # Panics
    ///
    /// Panics if the slices have different lengths.
    pub fn new(indexes: &[u64], hashes: &[Hash]) -> Self {
        assert_eq!(indexes.len(), hashes.len(), "index/hash length mismatch");
        Self(indexes.iter().copied().zip(hashes.iter().copied()).collect())
    }
}

impl HashReader for PreloadedHashes {
    fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError> {
        indexes
            .iter()
            .map(|&x| self.0.get(&x).copied().ok_or(TlogError::MissingHash(x)))
            .collect()
    }
}

// Appends the storage indexes needed to compute the hash of the complete
// subtrees covering [lo, hi).
fn subtree_index(mut lo: u64, hi: u64, need: &mut Vec<u64>) {
    while lo < hi {
        let (k, level) = maxpow2(hi - lo + 1);
        debug_assert!(lo & (k - 1) == 0, "bad math in subtree_index");
        need.push(stored_hash_index(level, lo >> level));
        lo += k;
    }
}

// Computes the hash of [lo, hi) from the hashes produced for
// `subtree_index(lo, hi)`, consuming them from the iterator.
fn subtree_hash(mut lo: u64, hi: u64, hashes: &mut impl Iterator<Item = Hash>) -> Hash {
    let mut stack = Vec::new();
    while lo < hi {
        let (k, _) = maxpow2(hi - lo + 1);
        stack.push(hashes.next().expect("hash stream exhausted"));
        lo += k;
    }
    // Hash up from the rightmost subtree.
    let mut h = stack.pop().expect("empty subtree");
    while let Some(left) = stack.pop() {
        h = node_hash(left, h);
    }
    h
}

/// Computes the indexes needed to compute the root hash of a tree with `n`
/// records.
pub fn tree_hash_indexes(n: u64) -> Vec<u64> {
    let mut need = Vec::new();
    subtree_index(0, n, &mut need);
    need
}

/// Computes the root hash of the tree with `n` records, reading previously
/// stored hashes from `r`.
///
/// # Errors
///
/// Returns an error if `r` fails to read the required hashes.
pub fn tree_hash<R: HashReader>(n: u64, r: &R) -> Result<Hash, TlogError> {
    if n == 0 {
        return Ok(EMPTY_HASH);
    }
    let need = tree_hash_indexes(n);
    let hashes = r.read_hashes(&need)?;
    if hashes.len() != need.len() {
        return Err(TlogError::BadMath);
    }
    let mut it = hashes.into_iter();
    let h = subtree_hash(0, n, &mut it);
    debug_assert!(it.next().is_none(), "leftover hashes in tree_hash");
    Ok(h)
}

// Appends the indexes needed to prove that leaf `n` is contained in the
// subtree [lo, hi).
fn leaf_proof_index(lo: u64, hi: u64, n: u64, need: &mut Vec<u64>) {
    debug_assert!(lo <= n && n < hi, "bad math in leaf_proof_index");
    if lo + 1 == hi {
        return;
    }
    let (k, _) = maxpow2(hi - lo);
    if n < lo + k {
        leaf_proof_index(lo, lo + k, n, need);
        subtree_index(lo + k, hi, need);
    } else {
        subtree_index(lo, lo + k, need);
        leaf_proof_index(lo + k, hi, n, need);
    }
}

// Builds the proof that leaf `n` is contained in the subtree [lo, hi),
// consuming hashes in the order produced by `leaf_proof_index`.
fn leaf_proof(lo: u64, hi: u64, n: u64, hashes: &mut impl Iterator<Item = Hash>) -> Proof {
    if lo + 1 == hi {
        return Vec::new();
    }
    let (k, _) = maxpow2(hi - lo);
    let (mut proof, sibling) = if n < lo + k {
        let proof = leaf_proof(lo, lo + k, n, hashes);
        let sibling = subtree_hash(lo + k, hi, hashes);
        (proof, sibling)
    } else {
        let sibling = subtree_hash(lo, lo + k, hashes);
        let proof = leaf_proof(lo + k, hi, n, hashes);
        (proof, sibling)
    };
    proof.push(sibling);
    proof
}

/// Returns the storage indexes needed for the proof that the tree of size
/// `tree_size` contains the record at `leaf_index`.
///
/// # Errors
///
/// Returns an error if `leaf_index` is not within the tree.
pub fn inclusion_proof_indexes(tree_size: u64, leaf_index: u64) -> Result<Vec<u64>, TlogError> {
    if leaf_index >= tree_size {
        return Err(TlogError::InvalidInput(format!(
            "leaf index {leaf_index} outside tree of size {tree_size}"
        )));
    }
    let mut need = Vec::new();
    leaf_proof_index(0, tree_size, leaf_index, &mut need);
    Ok(need)
}

/// Returns the proof that the tree of size `tree_size` contains the record
/// at `leaf_index`.
///
/// # Errors
///
/// Returns an error for invalid inputs or if `r` fails to read hashes.
pub fn inclusion_proof<R: HashReader>(
    tree_size: u64,
    leaf_index: u64,
    r: &R,
) -> Result<Proof, TlogError> {
    let need = inclusion_proof_indexes(tree_size, leaf_index)?;
    if need.is_empty() {
        return Ok(Vec::new());
    }
    let hashes = r.read_hashes(&need)?;
    if hashes.len() != need.len() {
        return Err(TlogError::BadMath);
    }
    let mut it = hashes.into_iter();
    let proof = leaf_proof(0, tree_size, leaf_index, &mut it);
    debug_assert!(it.next().is_none(), "leftover hashes in inclusion_proof");
    Ok(proof)
}

// Appends the indexes needed to prove that the first `n` records of the
// subtree [lo, hi) form a prefix of it.
fn tree_proof_index(lo: u64, hi: u64, n: u64, need: &mut Vec<u64>) {
    debug_assert!(lo < n && n <= hi, "bad math in tree_proof_index");
    if n == hi {
        if lo != 0 {
            subtree_index(lo, hi, need);
        }
        return;
    }
    let (k, _) = maxpow2(hi - lo);
    if n <= lo + k {
        tree_proof_index(lo, lo + k, n, need);
        subtree_index(lo + k, hi, need);
    } else {
        subtree_index(lo, lo + k, need);
        tree_proof_index(lo + k, hi, n, need);
    }
}

// Builds the proof that the first `n` records of the subtree [lo, hi) form
// a prefix of it, consuming hashes in `tree_proof_index` order.
fn tree_proof(lo: u64, hi: u64, n: u64, hashes: &mut impl Iterator<Item = Hash>) -> Proof {
    if n == hi {
        if lo == 0 {
            return Vec::new();
        }
        return vec![subtree_hash(lo, hi, hashes)];
    }
    let (k, _) = maxpow2(hi - lo);
    let (mut proof, sibling) = if n <= lo + k {
        let proof = tree_proof(lo, lo + k, n, hashes);
        let sibling = subtree_hash(lo + k, hi, hashes);
        (proof, sibling)
    } else {
        let sibling = subtree_hash(lo, lo + k, hashes);
        let proof = tree_proof(lo + k, hi, n, hashes);
        (proof, sibling)
    };
    proof.push(sibling);
    proof
}

/// Returns the storage indexes needed for the proof that the tree of size
/// `tree_size` contains as a prefix the tree of smaller size `old_size`.
///
/// # Errors
///
/// Returns an error unless `0 < old_size <= tree_size`.
pub fn consistency_proof_indexes(tree_size: u64, old_size: u64) -> Result<Vec<u64>, TlogError> {
    if old_size < 1 || old_size > tree_size {
        return Err(TlogError::InvalidInput(format!(
            "cannot prove consistency of size {old_size} within size {tree_size}"
        )));
    }
    let mut need = Vec::new();
    tree_proof_index(0, tree_size, old_size, &mut need);
    Ok(need)
}

/// Returns the proof that the tree of size `tree_size` contains as a prefix
/// all the records of the tree of smaller size `old_size`.
///
/// # Errors
///
/// Returns an error for invalid inputs or if `r` fails to read hashes.
pub fn consistency_proof<R: HashReader>(
    tree_size: u64,
    old_size: u64,
    r: &R,
) -> Result<Proof, TlogError> {
    let need = consistency_proof_indexes(tree_size, old_size)?;
    if need.is_empty() {
        return Ok(Vec::new());
    }
    let hashes = r.read_hashes(&need)?;
    if hashes.len() != need.len() {
        return Err(TlogError::BadMath);
    }
    let mut it = hashes.into_iter();
    let proof = tree_proof(0, tree_size, old_size, &mut it);
    debug_assert!(it.next().is_none(), "leftover hashes in consistency_proof");
    Ok(proof)
}

// Runs an inclusion proof back up to the root, innermost sibling last in
// `proof`.
fn run_leaf_proof(
    proof: &[Hash],
    lo: u64,
    hi: u64,
    n: u64,
    leaf_hash: Hash,
) -> Result<Hash, TlogError> {
    debug_assert!(lo <= n && n < hi, "bad math in run_leaf_proof");
    if lo + 1 == hi {
        if !proof.is_empty() {
            return Err(TlogError::InvalidProof);
        }
        return Ok(leaf_hash);
    }
    let Some((&sibling, rest)) = proof.split_last() else {
        return Err(TlogError::InvalidProof);
    };
    let (k, _) = maxpow2(hi - lo);
    if n < lo + k {
        let h = run_leaf_proof(rest, lo, lo + k, n, leaf_hash)?;
        Ok(node_hash(h, sibling))
    } else {
        let h = run_leaf_proof(rest, lo + k, hi, n, leaf_hash)?;
        Ok(node_hash(sibling, h))
    }
}

/// Verifies that `proof` proves inclusion of the record at `leaf_index`
/// with hash `leaf_hash` in the tree of size `tree_size` with root
/// `root_hash`.
///
/// # Errors
///
/// Returns [`TlogError::InvalidProof`] if verification fails.
pub fn verify_inclusion_proof(
    proof: &Proof,
    tree_size: u64,
    root_hash: Hash,
    leaf_index: u64,
    leaf_hash: Hash,
) -> Result<(), TlogError> {
    if leaf_index >= tree_size {
        return Err(TlogError::InvalidProof);
    }
    let reconstructed = run_leaf_proof(proof, 0, tree_size, leaf_index, leaf_hash)?;
    if reconstructed == root_hash {
        Ok(())
    } else {
        Err(TlogError::InvalidProof)
    }
}

// Runs a consistency proof, returning (old root, new root) as reconstructed
// from the proof hashes.
fn run_tree_proof(
    proof: &[Hash],
    lo: u64,
    hi: u64,
    n: u64,
    old_hash: Hash,
) -> Result<(Hash, Hash), TlogError> {
    debug_assert!(lo < n && n <= hi, "bad math in run_tree_proof");
    if n == hi {
        if lo == 0 {
            if !proof.is_empty() {
                return Err(TlogError::InvalidProof);
            }
            return Ok((old_hash, old_hash));
        }
        if proof.len() != 1 {
            return Err(TlogError::InvalidProof);
        }
        return Ok((proof[0], proof[0]));
    }
    let Some((&sibling, rest)) = proof.split_last() else {
        return Err(TlogError::InvalidProof);
    };
    let (k, _) = maxpow2(hi - lo);
    if n <= lo + k {
        let (old, new) = run_tree_proof(rest, lo, lo + k, n, old_hash)?;
        Ok((old, node_hash(new, sibling)))
    } else {
        let (old, new) = run_tree_proof(rest, lo + k, hi, n, old_hash)?;
        Ok((node_hash(sibling, old), node_hash(sibling, new)))
    }
}

/// Verifies that `proof` proves that the tree of size `tree_size` with root
/// `root_hash` contains as a prefix the tree of size `old_size` with root
/// `old_hash`.
///
/// # Errors
///
/// Returns [`TlogError::InvalidProof`] if verification fails.
pub fn verify_consistency_proof(
    proof: &Proof,
    tree_size: u64,
    root_hash: Hash,
    old_size: u64,
    old_hash: Hash,
) -> Result<(), TlogError> {
    if old_size < 1 || old_size > tree_size {
        return Err(TlogError::InvalidProof);
    }
    let (old, new) = run_tree_proof(proof, 0, tree_size, old_size, old_hash)?;
    if old == old_hash && new == root_hash {
        Ok(())
    } else {
        Err(TlogError::InvalidProof)
    }
}
