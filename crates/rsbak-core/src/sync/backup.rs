//! The backup path: bring the remote up to date with a local tree.
//!
//! Implements spec.md §4.5's algorithm: enumerate the remote, replay its
//! manifest, tombstone locally-deleted paths, classify every local file as
//! unchanged / deduplicated-or-renamed / new, then upload new content
//! through the worker pool. Every classified record — tombstone, dedup, or
//! freshly uploaded — is appended to `.files` the moment it's decided
//! rather than batched until the run finishes, so a fatal error partway
//! through uploads doesn't cost the durability of records already settled.
//! Garbage collection runs last, once every upload has joined.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use rand::RngCore;
use tracing::{debug, instrument, warn};

use crate::chunkstore::{ChunkId, ChunkStore};
use crate::crypto::{self, KeyCache, SaltKeyCache};
use crate::manifest::{self, ManifestState, Record};
use crate::transport::Transport;
use crate::workerpool;

use super::{enumerate_local_files, hash_file, LocalEntry, SyncError};

/// Knobs for a single backup run.
pub struct BackupOptions {
    /// Substring patterns; a local path containing any of them is skipped.
    pub exclusions: Vec<String>,
    /// Worker pool size for new-content uploads.
    pub workers: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            exclusions: Vec::new(),
            workers: workerpool::DEFAULT_WORKERS,
        }
    }
}

/// Summary counts from a completed backup, useful for CLI reporting and
/// for asserting the idempotence properties in spec.md §8.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackupReport {
    pub unchanged: usize,
    pub deduplicated: usize,
    pub uploaded: usize,
    pub tombstoned: usize,
    pub orphans_removed: usize,
}

/// Run a backup of `local_root` to `transport`, authenticating manifest and
/// chunk frames with `password`.
#[instrument(skip(transport, password, options), fields(local_root = %local_root.display()))]
pub fn run_backup(
    local_root: &Path,
    transport: &dyn Transport,
    password: &str,
    options: &BackupOptions,
) -> Result<BackupReport, SyncError> {
    let store = ChunkStore::new(transport);
    store.cleanup_stale_temp_files()?;

    let distant_chunks = store.list_chunks()?;
    let existing_log = fetch_manifest_log(transport)?;
    let cache = SaltKeyCache::new();
    let records = decode_all(&existing_log, password, &cache)?;
    let state = manifest::replay(&records, &distant_chunks);

    let entries = enumerate_local_files(local_root, &options.exclusions);
    let local_paths: HashSet<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();

    // One session salt/key for every frame written in this run (see
    // chunkstore::upload's doc comment): PBKDF2 runs once, not once per
    // blob.
    let mut session_salt = [0u8; crypto::SALT_LEN];
    rand::rng().fill_bytes(&mut session_salt);
    let key = cache.get_or_derive(password, session_salt);

    // A single append-mode handle, shared behind a mutex, so every
    // classified record lands on `.files` as soon as it's decided instead
    // of being held in memory until the run finishes — a chunk published
    // via atomic rename but never recorded would otherwise be invisible to
    // the next backup and collected as an orphan for nothing.
    let sink: Mutex<Box<dyn Write + Send>> = Mutex::new(transport.open_append(".files")?);

    let mut required = HashSet::new();
    let mut report = BackupReport::default();

    for path in state.files.keys() {
        if !local_paths.contains(path.as_str()) {
            let record = Record::tombstone(path.clone());
            append_one(&sink, &record, &key, session_salt)?;
            report.tombstoned += 1;
        }
    }

    let mut upload_jobs = Vec::new();
    for entry in entries {
        match classify(&entry, &state) {
            Classification::Unchanged(chunk_id) => {
                required.insert(chunk_id);
                report.unchanged += 1;
            }
            Classification::Duplicate { chunk_id, hash } => {
                required.insert(chunk_id);
                let record = Record {
                    chunk_id,
                    mtime_ns: entry.mtime_ns,
                    file_size: entry.size,
                    content_hash: hash,
                    path: entry.rel_path.clone(),
                };
                append_one(&sink, &record, &key, session_salt)?;
                report.deduplicated += 1;
            }
            Classification::New(hash) => {
                upload_jobs.push(UploadJob {
                    entry,
                    chunk_id: ChunkId::generate(),
                    content_hash: hash,
                });
            }
            Classification::Unhashable => {}
        }
    }

    let upload_results = workerpool::run(transport, options.workers, upload_jobs, |t, job| {
        upload_one(t, &job, &key, session_salt, &sink)
    });
    for result in upload_results {
        let chunk_id = result?;
        required.insert(chunk_id);
        report.uploaded += 1;
    }

    report.orphans_removed = store.garbage_collect(&required)?;
    debug!(?report, "backup complete");
    Ok(report)
}

fn append_one(
    sink: &Mutex<Box<dyn Write + Send>>,
    record: &Record,
    key: &[u8; 16],
    salt: [u8; crypto::SALT_LEN],
) -> Result<(), SyncError> {
    let frame = manifest::encode_record(record, key, salt)?;
    let mut guard = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.write_all(&frame).map_err(SyncError::ManifestWrite)?;
    debug!(path = %record.path, "manifest record appended");
    Ok(())
}

enum Classification {
    Unchanged(ChunkId),
    Duplicate {
        chunk_id: ChunkId,
        hash: [u8; manifest::HASH_LEN],
    },
    New([u8; manifest::HASH_LEN]),
    Unhashable,
}

fn classify(entry: &LocalEntry, state: &ManifestState) -> Classification {
    if let Some(stored) = state.files.get(&entry.rel_path) {
        if stored.mtime_ns >= entry.mtime_ns && stored.file_size == entry.size {
            return Classification::Unchanged(stored.chunk_id);
        }
    }

    let hash = match hash_file(&entry.absolute_path) {
        Ok(h) => h,
        Err(source) => {
            warn!(path = %entry.rel_path, %source, "could not hash file, skipping");
            return Classification::Unhashable;
        }
    };

    match state.hashes_to_chunks.get(&hash) {
        Some(&chunk_id) => Classification::Duplicate { chunk_id, hash },
        None => Classification::New(hash),
    }
}

struct UploadJob {
    entry: LocalEntry,
    chunk_id: ChunkId,
    content_hash: [u8; manifest::HASH_LEN],
}

/// Upload one new chunk and append its manifest record immediately,
/// through the shared `sink`, before returning — mirroring the original
/// implementation's single critical section around "upload, then record"
/// (spec.md §4.5 step 6), just guarded by a mutex instead of a thread lock
/// held for the whole send-files loop.
fn upload_one(
    transport: &dyn Transport,
    job: &UploadJob,
    key: &[u8; 16],
    salt: [u8; crypto::SALT_LEN],
    sink: &Mutex<Box<dyn Write + Send>>,
) -> Result<ChunkId, SyncError> {
    let file = File::open(&job.entry.absolute_path).map_err(|source| SyncError::LocalIo {
        path: job.entry.absolute_path.clone(),
        source,
    })?;
    let store = ChunkStore::new(transport);
    store.upload(job.chunk_id, file, key, salt)?;

    let record = Record {
        chunk_id: job.chunk_id,
        mtime_ns: job.entry.mtime_ns,
        file_size: job.entry.size,
        content_hash: job.content_hash,
        path: job.entry.rel_path.clone(),
    };
    append_one(sink, &record, key, salt)?;
    Ok(job.chunk_id)
}

fn fetch_manifest_log(transport: &dyn Transport) -> Result<Vec<u8>, SyncError> {
    if transport.isfile(".files")? {
        Ok(transport.get_to_buffer(".files")?)
    } else {
        Ok(Vec::new())
    }
}

fn decode_all(
    log: &[u8],
    password: &str,
    cache: &dyn KeyCache,
) -> Result<Vec<Record>, SyncError> {
    manifest::split_frames(log)
        .into_iter()
        .map(|frame| Ok(manifest::decode_record(frame, password, cache)?))
        .collect()
}

