//! The `.files` manifest: record layout, codec, and log replay.
//!
//! A manifest record is the logical tuple
//! `(chunk_id, mtime_ns, file_size, content_hash, path)`. Encoding
//! concatenates the fields, DEFLATE-compresses the result, wraps it in a
//! [`crate::crypto`] frame, and length-prefixes it (4-byte little-endian)
//! for appending to the `.files` log. A record with an all-zero
//! `chunk_id` and `content_hash` is a [tombstone](Record::is_tombstone),
//! marking `path` deleted.
//!
//! The *current* state of the backed-up tree is the result of
//! [replaying](replay) the log in order: later records supersede earlier
//! ones for the same path, and tombstones remove the path entirely.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::chunkstore::ChunkId;
use crate::crypto::{self, CryptoError, KeyCache};

/// Length of the content hash field (SHA-256).
pub const HASH_LEN: usize = 32;

/// 4-byte little-endian length prefix used for each frame in the log.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// A single logical manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub chunk_id: ChunkId,
    pub mtime_ns: u64,
    pub file_size: u64,
    pub content_hash: [u8; HASH_LEN],
    pub path: String,
}

impl Record {
    /// Build the tombstone record for `path`: zero chunk id, zero hash.
    pub fn tombstone(path: impl Into<String>) -> Self {
        Record {
            chunk_id: ChunkId::ZERO,
            mtime_ns: 0,
            file_size: 0,
            content_hash: [0u8; HASH_LEN],
            path: path.into(),
        }
    }

    /// A record with zero chunk id and zero hash marks `path` as deleted.
    pub fn is_tombstone(&self) -> bool {
        self.chunk_id == ChunkId::ZERO && self.content_hash == [0u8; HASH_LEN]
    }
}

/// Errors from encoding, decoding, or replaying manifest records.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("DEFLATE (de)compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error(
        "decoded record is too short: expected at least {expected} bytes for the fixed fields, got {actual}"
    )]
    TooShort { expected: usize, actual: usize },

    #[error("record path is not valid UTF-8")]
    InvalidPath(#[source] std::string::FromUtf8Error),
}

/// Size of the fixed-width prefix of an encoded record, before the
/// variable-length UTF-8 path: 16-byte chunk id + 8-byte mtime + 8-byte
/// size + 32-byte hash.
const FIXED_FIELDS_LEN: usize = 16 + 8 + 8 + HASH_LEN;

/// Encode a record into a length-prefixed, compressed, encrypted frame
/// ready to append to the `.files` log.
#[instrument(level = "debug", skip(record, key), fields(path = %record.path))]
pub fn encode_record(
    record: &Record,
    key: &[u8; 16],
    salt: [u8; crypto::SALT_LEN],
) -> Result<Vec<u8>, ManifestError> {
    let mut plain = Vec::with_capacity(FIXED_FIELDS_LEN + record.path.len());
    plain.extend_from_slice(record.chunk_id.as_bytes());
    plain.extend_from_slice(&record.mtime_ns.to_le_bytes());
    plain.extend_from_slice(&record.file_size.to_le_bytes());
    plain.extend_from_slice(&record.content_hash);
    plain.extend_from_slice(record.path.as_bytes());

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&plain)
        .map_err(ManifestError::Compression)?;
    let compressed = encoder.finish().map_err(ManifestError::Compression)?;

    let mut frame = Cursor::new(Vec::new());
    crypto::encrypt(Cursor::new(compressed), &mut frame, key, salt)?;
    let frame = frame.into_inner();

    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + frame.len());
    out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
    out.extend_from_slice(&frame);
    Ok(out)
}

/// Decode a single encrypted frame (without its length prefix) back into a
/// [`Record`].
pub fn decode_record(frame: &[u8], password: &str, cache: &dyn KeyCache) -> Result<Record, ManifestError> {
    let mut compressed = Vec::new();
    crypto::decrypt(Cursor::new(frame), &mut compressed, password, cache)?;

    let mut plain = Vec::new();
    DeflateDecoder::new(Cursor::new(compressed))
        .read_to_end(&mut plain)
        .map_err(ManifestError::Compression)?;

    if plain.len() < FIXED_FIELDS_LEN {
        return Err(ManifestError::TooShort {
            expected: FIXED_FIELDS_LEN,
            actual: plain.len(),
        });
    }

    let chunk_id = ChunkId::from_bytes(plain[0..16].try_into().unwrap());
    let mtime_ns = u64::from_le_bytes(plain[16..24].try_into().unwrap());
    let file_size = u64::from_le_bytes(plain[24..32].try_into().unwrap());
    let content_hash: [u8; HASH_LEN] = plain[32..32 + HASH_LEN].try_into().unwrap();
    let path = String::from_utf8(plain[32 + HASH_LEN..].to_vec())
        .map_err(ManifestError::InvalidPath)?;

    Ok(Record {
        chunk_id,
        mtime_ns,
        file_size,
        content_hash,
        path,
    })
}

/// The logical state of `path -> record` after replaying a log, plus the
/// reverse index `content_hash -> chunk_id` used for dedup/rename
/// detection.
#[derive(Debug, Default)]
pub struct ManifestState {
    pub files: HashMap<String, Record>,
    pub hashes_to_chunks: HashMap<[u8; HASH_LEN], ChunkId>,
}

/// Split a raw `.files` buffer into length-prefixed frames.
///
/// Stops at the first frame whose declared length exceeds the remaining
/// bytes (a truncated trailing record, tolerated per spec) rather than
/// erroring; the truncation is logged, not propagated.
pub fn split_frames(log: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + LENGTH_PREFIX_LEN <= log.len() {
        let len =
            u32::from_le_bytes(log[offset..offset + LENGTH_PREFIX_LEN].try_into().unwrap()) as usize;
        let start = offset + LENGTH_PREFIX_LEN;
        if start + len > log.len() {
            warn!(
                offset,
                declared_len = len,
                remaining = log.len() - start,
                "truncated trailing manifest record, stopping replay here"
            );
            break;
        }
        frames.push(&log[start..start + len]);
        offset = start + len;
    }
    frames
}

/// Replay decoded records into a [`ManifestState`].
///
/// Records are applied in order: a later record for the same path
/// supersedes an earlier one, and a tombstone removes the path. The
/// `hashes_to_chunks` index is populated for every non-tombstone record
/// whose chunk is present in `live_chunks`; it is retained even after the
/// owning path is tombstoned, so renamed/moved content can still be
/// deduplicated against it.
pub fn replay<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    live_chunks: &std::collections::HashSet<ChunkId>,
) -> ManifestState {
    let mut state = ManifestState::default();
    for record in records {
        if record.is_tombstone() {
            state.files.remove(&record.path);
            continue;
        }
        if live_chunks.contains(&record.chunk_id) {
            state
                .hashes_to_chunks
                .insert(record.content_hash, record.chunk_id);
        }
        state.files.insert(record.path.clone(), record.clone());
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SaltKeyCache;

    fn sample_record(path: &str) -> Record {
        Record {
            chunk_id: ChunkId::from_bytes([7u8; 16]),
            mtime_ns: 123_456_789,
            file_size: 42,
            content_hash: [9u8; HASH_LEN],
            path: path.to_string(),
        }
    }

    #[test]
    fn record_round_trips() {
        let cache = SaltKeyCache::new();
        let key = cache.get_or_derive("pw", [1u8; crypto::SALT_LEN]);
        let record = sample_record("dir/file.txt");

        let encoded = encode_record(&record, &key, [1u8; crypto::SALT_LEN]).unwrap();
        let frame = &encoded[LENGTH_PREFIX_LEN..];
        let decoded = decode_record(frame, "pw", &cache).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn tombstone_round_trips_and_is_recognized() {
        let cache = SaltKeyCache::new();
        let key = cache.get_or_derive("pw", [2u8; crypto::SALT_LEN]);
        let tombstone = Record::tombstone("deleted.txt");
        assert!(tombstone.is_tombstone());

        let encoded = encode_record(&tombstone, &key, [2u8; crypto::SALT_LEN]).unwrap();
        let decoded = decode_record(&encoded[LENGTH_PREFIX_LEN..], "pw", &cache).unwrap();
        assert!(decoded.is_tombstone());
        assert_eq!(decoded.path, "deleted.txt");
    }

    #[test]
    fn tombstone_after_write_removes_path() {
        let write = sample_record("a.txt");
        let tombstone = Record::tombstone("a.txt");
        let live = std::collections::HashSet::from([write.chunk_id]);
        let state = replay([&write, &tombstone], &live);
        assert!(!state.files.contains_key("a.txt"));
    }

    #[test]
    fn later_record_supersedes_earlier_for_same_path() {
        let mut first = sample_record("a.txt");
        first.file_size = 1;
        let mut second = sample_record("a.txt");
        second.file_size = 2;
        let live = std::collections::HashSet::from([first.chunk_id, second.chunk_id]);
        let state = replay([&first, &second], &live);
        assert_eq!(state.files["a.txt"].file_size, 2);
    }

    #[test]
    fn truncated_trailing_frame_is_tolerated() {
        let cache = SaltKeyCache::new();
        let key = cache.get_or_derive("pw", [3u8; crypto::SALT_LEN]);
        let good = encode_record(&sample_record("a.txt"), &key, [3u8; crypto::SALT_LEN]).unwrap();

        let mut log = good.clone();
        // Append a truncated trailing record: a length prefix claiming more
        // bytes than actually follow.
        log.extend_from_slice(&100u32.to_le_bytes());
        log.extend_from_slice(&[0u8; 10]);

        let frames = split_frames(&log);
        assert_eq!(frames.len(), 1);
        let decoded = decode_record(frames[0], "pw", &cache).unwrap();
        assert_eq!(decoded.path, "a.txt");
    }
}
