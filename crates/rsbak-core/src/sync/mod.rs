//! The synchronization engine: reconciling local filesystem state against
//! the remote's chunk store and manifest.
//!
//! [`backup`] walks a local tree and brings the remote up to date with it
//! (dedup by content hash, rename detection, tombstones, orphan GC).
//! [`restore`] does the inverse: replay the manifest and reconstruct a
//! local tree from remote chunks. Both share the local-enumeration and
//! hashing helpers in this module.

pub mod backup;
pub mod restore;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

use crate::chunkstore::ChunkStoreError;
use crate::crypto::CryptoError;
use crate::manifest::{ManifestError, HASH_LEN};
use crate::transport::TransportError;

pub use backup::{run_backup, BackupOptions, BackupReport};
pub use restore::{run_restore, RestoreOptions, RestoreReport};

/// Errors from running a backup or restore session.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    ChunkStore(#[from] ChunkStoreError),

    #[error("invalid filter regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("local filesystem error at {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("writing manifest frame: {0}")]
    ManifestWrite(#[source] std::io::Error),
}

/// A local file discovered by [`enumerate_local_files`], not yet classified.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// Path relative to the source root, using forward slashes.
    pub rel_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub mtime_ns: u64,
}

/// Recursively enumerate `root`, returning entries sorted by descending
/// size (spec.md §4.5 step 5: larger files start first).
///
/// A file that disappears between enumeration and stat (an `NFS` race) is
/// skipped with a warning rather than treated as an error, per spec.md §7's
/// per-file soft-error policy; so are entries whose name is excluded by a
/// substring in `exclusions`.
pub fn enumerate_local_files(root: &Path, exclusions: &[String]) -> Vec<LocalEntry> {
    let mut entries = Vec::new();
    for dir_entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !dir_entry.file_type().is_file() {
            continue;
        }
        let absolute_path = dir_entry.path().to_path_buf();
        let Ok(rel_path) = absolute_path.strip_prefix(root) else {
            continue;
        };
        let rel_path = rel_path.to_string_lossy().replace('\\', "/");
        if exclusions.iter().any(|pattern| rel_path.contains(pattern)) {
            continue;
        }

        let metadata = match fs::metadata(&absolute_path) {
            Ok(m) => m,
            Err(source) => {
                warn!(path = %rel_path, %source, "file vanished before stat, skipping");
                continue;
            }
        };
        let mtime_ns = match mtime_ns(&metadata) {
            Ok(t) => t,
            Err(source) => {
                warn!(path = %rel_path, %source, "could not read mtime, skipping");
                continue;
            }
        };

        entries.push(LocalEntry {
            rel_path,
            absolute_path,
            size: metadata.len(),
            mtime_ns,
        });
    }
    entries.sort_by(|a, b| b.size.cmp(&a.size));
    entries
}

/// Convert a file's modification time to nanoseconds since the Unix epoch.
pub fn mtime_ns(metadata: &fs::Metadata) -> std::io::Result<u64> {
    let modified = metadata.modified()?;
    let duration = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Ok(duration.as_nanos() as u64)
}

/// SHA-256 of a file's content, streamed in fixed-size blocks.
///
/// Returns an `Err` for permission-denied or special-file cases
/// (spec.md §4.5's "stat-unhashable" soft error) rather than panicking.
pub fn hash_file(path: &Path) -> std::io::Result<[u8; HASH_LEN]> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}
