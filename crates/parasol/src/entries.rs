// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Decoding of upstream data-tile entries and materialization of the legacy
//! `get-entries` items.
//!
//! Each data tile entry is laid out as:
//!
//! ```text
//! struct {
//!     TimestampedEntry timestamped_entry;   // includes extensions
//!     select (entry_type) {
//!         case x509_entry: Empty;
//!         case precert_entry: ASN.1Cert pre_certificate;
//!     };
//!     Fingerprint certificate_chain<0..2^16-1>;
//! } TileLeaf;
//!
//! opaque Fingerprint[32];
//! ```
//!
//! The extensions block must carry exactly one `leaf_index` extension (type
//! 0, a 40-bit big-endian integer) equal to the entry's absolute position
//! in the log. The reconstructed `timestamped_entry` is the raw bytes from
//! the start of the entry through the end of the extensions block, so
//! `leaf_input` is simply `{0x00, 0x00}` (version v1, leaf type
//! `timestamped_entry`) followed by those bytes.

use crate::checkpoint::SignedTreeHead;
use crate::fetch::FetchError;
use crate::issuers::{self, IssuerError};
use crate::server::AppState;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use merkle_tiles::FULL_WIDTH;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EntryParseError {
    #[error("invalid entry type {0}")]
    InvalidType(u16),
    #[error("duplicate leaf_index extension")]
    DuplicateLeafIndex,
    #[error("missing leaf_index extension")]
    MissingLeafIndex,
    #[error("leaf_index extension is {0} bytes, expected 5")]
    BadLeafIndexLength(usize),
    #[error("entry carries leaf_index {found}, expected {expected}")]
    LeafIndexMismatch { found: u64, expected: u64 },
    #[error("certificate_chain length {0} is not a multiple of 32")]
    MalformedChain(usize),
    #[error(transparent)]
    Truncated(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("error parsing entry {index}: {source}")]
    Parse {
        index: u64,
        #[source]
        source: EntryParseError,
    },
    #[error("issuer {0} missing after resolution")]
    MissingIssuer(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Issuer(#[from] IssuerError),
}

/// One decoded upstream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Raw RFC 6962 `TimestampedEntry` bytes, extensions included.
    pub timestamped_entry: Vec<u8>,
    /// Present iff this is a precertificate entry.
    pub precertificate: Option<Vec<u8>>,
    /// SHA-256 fingerprints of the certificate chain.
    pub chain: Vec<[u8; 32]>,
}

fn read_length_prefixed<R: Read>(reader: &mut R, nbytes: usize) -> std::io::Result<Vec<u8>> {
    let length = reader.read_uint::<BigEndian>(nbytes)?;
    let mut buffer = vec![0; usize::try_from(length).expect("length fits in usize")];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

fn write_length_prefixed<W: Write>(
    writer: &mut W,
    data: &[u8],
    nbytes: usize,
) -> std::io::Result<()> {
    writer.write_uint::<BigEndian>(data.len() as u64, nbytes)?;
    writer.write_all(data)
}

// Scans a CTExtensions block for the single mandatory leaf_index extension.
fn leaf_index_extension(extensions: &[u8]) -> Result<u64, EntryParseError> {
    let mut s = Cursor::new(extensions);
    let mut leaf_index = None;
    while usize::try_from(s.position()).expect("cursor position fits in usize") < extensions.len()
    {
        let extension_type = s.read_u8()?;
        let data = read_length_prefixed(&mut s, 2)?;
        if extension_type == 0 {
            if leaf_index.is_some() {
                return Err(EntryParseError::DuplicateLeafIndex);
            }
            if data.len() != 5 {
                return Err(EntryParseError::BadLeafIndexLength(data.len()));
            }
            leaf_index = Some(Cursor::new(&data).read_uint::<BigEndian>(5)?);
        }
    }
    leaf_index.ok_or(EntryParseError::MissingLeafIndex)
}

impl Entry {
    /// Parses one entry from the front of `input`, returning it along with
    /// the unread remainder. The caller supplies the absolute index it
    /// expects this entry to occupy; a mismatch with the entry's own
    /// `leaf_index` extension means the tile is inconsistent.
    pub fn parse(input: &[u8], expected_index: u64) -> Result<(Self, &[u8]), EntryParseError> {
        let mut s = Cursor::new(input);
        s.read_u64::<BigEndian>()?; // timestamp, kept verbatim below
        let entry_type = s.read_u16::<BigEndian>()?;
        match entry_type {
            0 => {
                read_length_prefixed(&mut s, 3)?; // signed_entry
            }
            1 => {
                let mut issuer_key_hash = [0u8; 32];
                s.read_exact(&mut issuer_key_hash)?;
                read_length_prefixed(&mut s, 3)?; // tbs_certificate
            }
            t => return Err(EntryParseError::InvalidType(t)),
        }

        let extensions = read_length_prefixed(&mut s, 2)?;
        let leaf_index = leaf_index_extension(&extensions)?;
        if leaf_index != expected_index {
            return Err(EntryParseError::LeafIndexMismatch {
                found: leaf_index,
                expected: expected_index,
            });
        }

        let consumed = usize::try_from(s.position()).expect("cursor position fits in usize");
        let timestamped_entry = input[..consumed].to_vec();

        let precertificate = if entry_type == 1 {
            Some(read_length_prefixed(&mut s, 3)?)
        } else {
            None
        };

        let chain_bytes = read_length_prefixed(&mut s, 2)?;
        if chain_bytes.len() % 32 != 0 {
            return Err(EntryParseError::MalformedChain(chain_bytes.len()));
        }
        let chain = chain_bytes
            .chunks_exact(32)
            .map(|c| c.try_into().expect("chunks are 32 bytes"))
            .collect();

        let rest = &input[usize::try_from(s.position()).expect("cursor position fits in usize")..];
        Ok((
            Self {
                timestamped_entry,
                precertificate,
                chain,
            },
            rest,
        ))
    }

    /// The RFC 6962 `MerkleTreeLeaf` bytes: version v1, leaf type
    /// `timestamped_entry`, then the timestamped entry itself.
    pub fn leaf_input(&self) -> Vec<u8> {
        let mut buffer = vec![0, 0];
        buffer.extend_from_slice(&self.timestamped_entry);
        buffer
    }

    /// The RFC 6962 `extra_data` bytes: for precertificates the
    /// length-prefixed precertificate first, then the length-prefixed chain
    /// of length-prefixed issuer certificates in fingerprint order. The
    /// chain section is always present, even when empty.
    ///
    /// # Panics
    ///
    /// Panics if writing to the internal buffer fails, which should never
    /// happen.
    pub fn extra_data(
        &self,
        issuers: &HashMap<[u8; 32], Vec<u8>>,
    ) -> Result<Vec<u8>, MaterializeError> {
        let mut chain = Vec::new();
        for fingerprint in &self.chain {
            let issuer = issuers
                .get(fingerprint)
                .ok_or_else(|| MaterializeError::MissingIssuer(hex::encode(fingerprint)))?;
            write_length_prefixed(&mut chain, issuer, 3).expect("write to Vec");
        }
        let mut buffer = Vec::new();
        if let Some(precertificate) = &self.precertificate {
            write_length_prefixed(&mut buffer, precertificate, 3).expect("write to Vec");
        }
        write_length_prefixed(&mut buffer, &chain, 3).expect("write to Vec");
        Ok(buffer)
    }
}

/// One element of a `get-entries` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetEntriesItem {
    #[serde(with = "crate::base64_bytes")]
    pub leaf_input: Vec<u8>,
    #[serde(with = "crate::base64_bytes")]
    pub extra_data: Vec<u8>,
}

/// Materializes the entries `[begin, end_excl)`, clamped to the single data
/// tile containing `begin`: downloads the tile, decodes the entries, and
/// resolves their issuer chains. Callers re-query to advance past the tile.
pub async fn download_entries(
    state: &Arc<AppState>,
    sth: &SignedTreeHead,
    begin: u64,
    end_excl: u64,
    cancel: &CancellationToken,
) -> Result<Vec<GetEntriesItem>, MaterializeError> {
    let full = u64::from(FULL_WIDTH);
    let tile = begin / full;
    let skip = begin % full;
    let count = full.min(end_excl - tile * full) - skip;

    let data = state
        .fetcher
        .tile("data", tile, sth.tree_size, cancel)
        .await?;

    let mut rest = data.as_slice();
    for i in 0..skip {
        let index = tile * full + i;
        let (_, r) = Entry::parse(rest, index)
            .map_err(|source| MaterializeError::Parse { index, source })?;
        rest = r;
    }

    let mut entries = Vec::with_capacity(usize::try_from(count).expect("count fits in usize"));
    let mut fingerprints = HashSet::new();
    for i in 0..count {
        let index = tile * full + skip + i;
        let (entry, r) = Entry::parse(rest, index)
            .map_err(|source| MaterializeError::Parse { index, source })?;
        rest = r;
        fingerprints.extend(entry.chain.iter().copied());
        entries.push(entry);
    }

    let issuers = issuers::resolve(state, fingerprints, cancel).await?;

    entries
        .iter()
        .map(|entry| {
            Ok(GetEntriesItem {
                leaf_input: entry.leaf_input(),
                extra_data: entry.extra_data(&issuers)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_index_ext(leaf_index: u64) -> Vec<u8> {
        let mut ext = Vec::new();
        ext.write_u8(0).unwrap();
        ext.write_u16::<BigEndian>(5).unwrap();
        ext.write_uint::<BigEndian>(leaf_index, 5).unwrap();
        ext
    }

    fn encode_x509_entry(
        timestamp: u64,
        certificate: &[u8],
        extensions: &[u8],
        chain: &[[u8; 32]],
    ) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.write_u64::<BigEndian>(timestamp).unwrap();
        buffer.write_u16::<BigEndian>(0).unwrap();
        write_length_prefixed(&mut buffer, certificate, 3).unwrap();
        write_length_prefixed(&mut buffer, extensions, 2).unwrap();
        write_length_prefixed(&mut buffer, &chain.concat(), 2).unwrap();
        buffer
    }

    fn encode_precert_entry(
        timestamp: u64,
        issuer_key_hash: &[u8; 32],
        tbs: &[u8],
        extensions: &[u8],
        precertificate: &[u8],
        chain: &[[u8; 32]],
    ) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.write_u64::<BigEndian>(timestamp).unwrap();
        buffer.write_u16::<BigEndian>(1).unwrap();
        buffer.extend_from_slice(issuer_key_hash);
        write_length_prefixed(&mut buffer, tbs, 3).unwrap();
        write_length_prefixed(&mut buffer, extensions, 2).unwrap();
        write_length_prefixed(&mut buffer, precertificate, 3).unwrap();
        write_length_prefixed(&mut buffer, &chain.concat(), 2).unwrap();
        buffer
    }

    #[test]
    fn test_parse_x509_entry() {
        let chain = [[0xAA; 32], [0xBB; 32]];
        let encoded = encode_x509_entry(77, b"certificate der", &leaf_index_ext(3), &chain);
        let (entry, rest) = Entry::parse(&encoded, 3).unwrap();
        assert!(rest.is_empty());
        assert!(entry.precertificate.is_none());
        assert_eq!(entry.chain, chain);

        // leaf_input is {0, 0} followed by the bytes up to the end of the
        // extensions block.
        let chain_section_len = 2 + 64;
        let expected_te = &encoded[..encoded.len() - chain_section_len];
        let mut expected = vec![0, 0];
        expected.extend_from_slice(expected_te);
        assert_eq!(entry.leaf_input(), expected);
    }

    #[test]
    fn test_parse_precert_entry() {
        let encoded = encode_precert_entry(
            77,
            &[0xCC; 32],
            b"tbs certificate",
            &leaf_index_ext(9),
            b"precert der",
            &[[0xDD; 32]],
        );
        let (entry, rest) = Entry::parse(&encoded, 9).unwrap();
        assert!(rest.is_empty());
        assert_eq!(entry.precertificate.as_deref(), Some(b"precert der".as_slice()));
        assert_eq!(entry.chain, vec![[0xDD; 32]]);
    }

    #[test]
    fn test_parse_consumes_one_entry_at_a_time() {
        let mut stream = encode_x509_entry(1, b"first", &leaf_index_ext(0), &[]);
        stream.extend(encode_x509_entry(2, b"second", &leaf_index_ext(1), &[[1; 32]]));

        let (first, rest) = Entry::parse(&stream, 0).unwrap();
        let (second, rest) = Entry::parse(rest, 1).unwrap();
        assert!(rest.is_empty());
        assert!(first.chain.is_empty());
        assert_eq!(second.chain.len(), 1);
    }

    #[test]
    fn test_leaf_index_mismatch() {
        let encoded = encode_x509_entry(1, b"cert", &leaf_index_ext(4), &[]);
        assert!(matches!(
            Entry::parse(&encoded, 5),
            Err(EntryParseError::LeafIndexMismatch {
                found: 4,
                expected: 5
            })
        ));
    }

    #[test]
    fn test_duplicate_leaf_index_extension() {
        let mut ext = leaf_index_ext(4);
        ext.extend(leaf_index_ext(4));
        let encoded = encode_x509_entry(1, b"cert", &ext, &[]);
        assert!(matches!(
            Entry::parse(&encoded, 4),
            Err(EntryParseError::DuplicateLeafIndex)
        ));
    }

    #[test]
    fn test_missing_leaf_index_extension() {
        // A single unknown extension; no leaf_index.
        let mut ext = Vec::new();
        ext.write_u8(7).unwrap();
        ext.write_u16::<BigEndian>(2).unwrap();
        ext.extend_from_slice(b"xx");
        let encoded = encode_x509_entry(1, b"cert", &ext, &[]);
        assert!(matches!(
            Entry::parse(&encoded, 0),
            Err(EntryParseError::MissingLeafIndex)
        ));
    }

    #[test]
    fn test_unknown_extensions_are_skipped() {
        let mut ext = Vec::new();
        ext.write_u8(7).unwrap();
        ext.write_u16::<BigEndian>(2).unwrap();
        ext.extend_from_slice(b"xx");
        ext.extend(leaf_index_ext(0));
        let encoded = encode_x509_entry(1, b"cert", &ext, &[]);
        Entry::parse(&encoded, 0).unwrap();
    }

    #[test]
    fn test_bad_leaf_index_length() {
        let mut ext = Vec::new();
        ext.write_u8(0).unwrap();
        ext.write_u16::<BigEndian>(4).unwrap();
        ext.extend_from_slice(&[0; 4]);
        let encoded = encode_x509_entry(1, b"cert", &ext, &[]);
        assert!(matches!(
            Entry::parse(&encoded, 0),
            Err(EntryParseError::BadLeafIndexLength(4))
        ));
    }

    #[test]
    fn test_invalid_entry_type() {
        let mut buffer = Vec::new();
        buffer.write_u64::<BigEndian>(1).unwrap();
        buffer.write_u16::<BigEndian>(2).unwrap();
        assert!(matches!(
            Entry::parse(&buffer, 0),
            Err(EntryParseError::InvalidType(2))
        ));
    }

    #[test]
    fn test_truncated_entry() {
        let encoded = encode_x509_entry(1, b"cert", &leaf_index_ext(0), &[]);
        assert!(matches!(
            Entry::parse(&encoded[..encoded.len() - 1], 0),
            Err(EntryParseError::Truncated(_))
        ));
    }

    #[test]
    fn test_extra_data_layout() {
        let issuer_der = b"issuer der".to_vec();
        let fingerprint = [0xEE; 32];
        let issuers = HashMap::from([(fingerprint, issuer_der.clone())]);

        let encoded = encode_precert_entry(
            1,
            &[0xCC; 32],
            b"tbs",
            &leaf_index_ext(0),
            b"precert",
            &[fingerprint],
        );
        let (entry, _) = Entry::parse(&encoded, 0).unwrap();

        let mut expected_chain = Vec::new();
        write_length_prefixed(&mut expected_chain, &issuer_der, 3).unwrap();
        let mut expected = Vec::new();
        write_length_prefixed(&mut expected, b"precert", 3).unwrap();
        write_length_prefixed(&mut expected, &expected_chain, 3).unwrap();

        assert_eq!(entry.extra_data(&issuers).unwrap(), expected);
    }

    #[test]
    fn test_extra_data_empty_chain_is_present() {
        let encoded = encode_x509_entry(1, b"cert", &leaf_index_ext(0), &[]);
        let (entry, _) = Entry::parse(&encoded, 0).unwrap();
        // An x509 entry with no fingerprints still carries the (empty)
        // chain section.
        assert_eq!(entry.extra_data(&HashMap::new()).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_extra_data_missing_issuer() {
        let encoded = encode_x509_entry(1, b"cert", &leaf_index_ext(0), &[[9; 32]]);
        let (entry, _) = Entry::parse(&encoded, 0).unwrap();
        assert!(matches!(
            entry.extra_data(&HashMap::new()),
            Err(MaterializeError::MissingIssuer(_))
        ));
    }
}
