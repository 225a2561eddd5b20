//! The chunk store: opaque encrypted blobs named by a random 16-byte id.
//!
//! A chunk's name on the remote is the lowercase hex of a fresh random
//! 128-bit value generated at upload time — never derived from content.
//! That's intentional (spec.md §3): a content-derived name would let the
//! remote fingerprint blobs by recomputing the hash of guessed plaintexts.
//!
//! Publishing a chunk is atomic: the blob is written to `<id>.tmp` and
//! only renamed to `<id>` once fully written, so a crash mid-upload never
//! leaves a partially-written file under its final name.

use std::collections::HashSet;
use std::io::{Cursor, Read};

use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::crypto::{self, CryptoError, KeyCache};
use crate::transport::{Transport, TransportError};

/// A 16-byte, randomly generated chunk identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; 16]);

impl ChunkId {
    /// The sentinel value used by tombstone manifest records. Never
    /// assigned to a real chunk.
    pub const ZERO: ChunkId = ChunkId([0u8; 16]);

    /// Generate a fresh random chunk id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        ChunkId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ChunkId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The chunk's filename on the remote: lowercase hex, no extension.
    pub fn filename(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a chunk id from a remote filename, rejecting anything that
    /// isn't exactly 32 lowercase hex characters.
    pub fn parse_filename(name: &str) -> Option<Self> {
        if name.len() != 32 || name.contains('.') {
            return None;
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(name, &mut bytes).ok()?;
        Some(ChunkId(bytes))
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.filename())
    }
}

/// Errors from publishing, fetching, or garbage-collecting chunks.
#[derive(Error, Debug)]
pub enum ChunkStoreError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("crypto error for chunk {chunk_id}: {source}")]
    Crypto {
        chunk_id: ChunkId,
        #[source]
        source: CryptoError,
    },
}

/// Operations against the remote's flat chunk namespace.
pub struct ChunkStore<'t> {
    transport: &'t dyn Transport,
}

impl<'t> ChunkStore<'t> {
    pub fn new(transport: &'t dyn Transport) -> Self {
        Self { transport }
    }

    /// Remove any `*.tmp` debris left by an interrupted previous session.
    ///
    /// Must run to completion before any upload in the current session
    /// begins (spec.md §5: "the `*.tmp` cleanup at session start executes
    /// strictly before any upload begins").
    #[instrument(skip(self))]
    pub fn cleanup_stale_temp_files(&self) -> Result<(), ChunkStoreError> {
        for name in self.transport.listdir()? {
            if name.ends_with(".tmp") {
                warn!(name, "removing stale temp file from interrupted session");
                self.transport.remove(&name)?;
            }
        }
        Ok(())
    }

    /// List the chunk ids currently present on the remote: files whose
    /// name contains no dot (spec.md §6, "Remote directory layout").
    pub fn list_chunks(&self) -> Result<HashSet<ChunkId>, ChunkStoreError> {
        let mut chunks = HashSet::new();
        for name in self.transport.listdir()? {
            if let Some(id) = ChunkId::parse_filename(&name) {
                chunks.insert(id);
            }
        }
        Ok(chunks)
    }

    /// Encrypt `plaintext` and publish it atomically as a new chunk: write
    /// to `<id>.tmp`, then rename to `<id>` only once the write (and its
    /// backfilled GCM tag) are complete.
    ///
    /// `salt` is the session's key-derivation salt (see
    /// [`crate::crypto::SaltKeyCache`]): every chunk and manifest record in
    /// one backup or restore session shares the same salt, so the password
    /// is only run through PBKDF2 once per session rather than once per
    /// blob.
    #[instrument(skip(self, plaintext, key))]
    pub fn upload<R: Read>(
        &self,
        id: ChunkId,
        plaintext: R,
        key: &[u8; 16],
        salt: [u8; crypto::SALT_LEN],
    ) -> Result<(), ChunkStoreError> {
        let tmp_name = format!("{id}.tmp");
        {
            let mut sink = self.transport.open_write(&tmp_name)?;
            crypto::encrypt(plaintext, &mut *sink, key, salt).map_err(|source| {
                ChunkStoreError::Crypto {
                    chunk_id: id,
                    source,
                }
            })?;
        }
        self.transport.rename(&tmp_name, &id.filename())?;
        debug!(%id, "chunk published");
        Ok(())
    }

    /// Fetch and decrypt a chunk's plaintext content into memory.
    #[instrument(skip(self, password, cache))]
    pub fn download(
        &self,
        id: ChunkId,
        password: &str,
        cache: &dyn KeyCache,
    ) -> Result<Vec<u8>, ChunkStoreError> {
        let bytes = self.transport.get_to_buffer(&id.filename())?;
        let mut plaintext = Vec::new();
        crypto::decrypt(Cursor::new(bytes), &mut plaintext, password, cache).map_err(|source| {
            ChunkStoreError::Crypto {
                chunk_id: id,
                source,
            }
        })?;
        Ok(plaintext)
    }

    /// Delete every chunk present on the remote but absent from
    /// `required`. Must run strictly after all upload workers have
    /// joined (spec.md §5).
    #[instrument(skip(self, required))]
    pub fn garbage_collect(&self, required: &HashSet<ChunkId>) -> Result<usize, ChunkStoreError> {
        let present = self.list_chunks()?;
        let orphans: Vec<_> = present.difference(required).copied().collect();
        for orphan in &orphans {
            self.transport.remove(&orphan.filename())?;
        }
        info!(removed = orphans.len(), "orphan chunk GC complete");
        Ok(orphans.len())
    }
}
