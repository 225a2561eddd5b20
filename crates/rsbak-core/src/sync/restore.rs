//! The restore path: reconstruct a local tree from remote chunks and the
//! manifest.
//!
//! Implements spec.md §4.6: fetch and replay the manifest, apply optional
//! include/exclude filters, skip files whose content already matches, and
//! stream-decrypt everything else to disk with mtimes restored.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::chunkstore::ChunkStore;
use crate::crypto::SaltKeyCache;
use crate::manifest::{self, ManifestState, Record};
use crate::transport::Transport;
use crate::workerpool;

use super::{hash_file, SyncError};

/// Knobs for a single restore run.
pub struct RestoreOptions {
    pub include: Option<Regex>,
    pub exclude: Option<Regex>,
    /// When a path fails the include/exclude filter, the faithful-to-source
    /// behavior was to stop planning entirely (a bug: one excluded path
    /// would abort the whole restore). The corrected default is to skip
    /// just that path and continue; set this to `true` to reproduce the
    /// original, broken `break` behavior instead.
    pub stop_on_filter_mismatch: bool,
    /// Print the paths that would be restored and do nothing else.
    pub list_only: bool,
    pub workers: usize,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            include: None,
            exclude: None,
            stop_on_filter_mismatch: false,
            list_only: false,
            workers: workerpool::DEFAULT_WORKERS,
        }
    }
}

/// Summary counts from a completed restore.
#[derive(Debug, Default, Clone)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped_unchanged: usize,
    pub skipped_filtered: usize,
    /// Manifest records whose frame failed to decode (wrong password or a
    /// corrupt blob). Reported, not fatal: spec.md §4.1 treats tag
    /// verification failure as a per-blob error, so one bad record must not
    /// cost the rest of the restore.
    pub corrupted_records: usize,
    /// Files whose chunk failed to download or decrypt. Same non-fatal
    /// treatment as `corrupted_records`, at the per-file stage instead of
    /// the manifest stage.
    pub failed: usize,
    /// Populated only when [`RestoreOptions::list_only`] is set.
    pub listed_paths: Vec<String>,
}

/// Run a restore from `transport` into `local_dest`, decrypting with
/// `password`.
#[instrument(skip(transport, password, options), fields(local_dest = %local_dest.display()))]
pub fn run_restore(
    transport: &dyn Transport,
    local_dest: &Path,
    password: &str,
    options: &RestoreOptions,
) -> Result<RestoreReport, SyncError> {
    let log = if transport.isfile(".files")? {
        transport.get_to_buffer(".files")?
    } else {
        Vec::new()
    };

    let cache = SaltKeyCache::new();
    let frames = manifest::split_frames(&log);
    let mut records = Vec::with_capacity(frames.len());
    let mut report = RestoreReport::default();
    for frame in frames {
        match manifest::decode_record(frame, password, &cache) {
            Ok(record) => records.push(record),
            Err(source) => {
                warn!(%source, "manifest record failed to decode, skipping it");
                report.corrupted_records += 1;
            }
        }
    }

    // live_chunks is irrelevant for restore's own bookkeeping (nothing here
    // performs GC), but replay still needs a set to decide which hashes to
    // index; pass every referenced chunk id so hashes_to_chunks comes out
    // complete. Restore doesn't use hashes_to_chunks at all, only `files`.
    let live_chunks: HashSet<_> = records.iter().map(|r| r.chunk_id).collect();
    let state: ManifestState = manifest::replay(&records, &live_chunks);

    let mut entries: Vec<&Record> = state.files.values().collect();
    entries.sort_by(|a, b| b.file_size.cmp(&a.file_size));

    let mut plan = Vec::new();

    for record in entries {
        match passes_filters(&record.path, options) {
            FilterOutcome::Include => plan.push(record.clone()),
            FilterOutcome::Exclude => {
                report.skipped_filtered += 1;
                if options.stop_on_filter_mismatch {
                    warn!(path = %record.path, "filter mismatch, stopping restore planning early");
                    break;
                }
            }
        }
    }

    if options.list_only {
        report.listed_paths = plan.iter().map(|r| r.path.clone()).collect();
        return Ok(report);
    }

    let jobs: Vec<Record> = plan
        .into_iter()
        .filter(|record| !already_matches(local_dest, record))
        .collect();
    report.skipped_unchanged = state.files.len() - report.skipped_filtered - jobs.len();

    let results = workerpool::run(transport, options.workers, jobs, |t, record| {
        let path = record.path.clone();
        (path, restore_one(t, local_dest, &record, password, &cache))
    });
    for (path, result) in results {
        match result {
            Ok(()) => report.restored += 1,
            Err(source) => {
                // A per-file failure (typically a tag mismatch: wrong
                // password or a corrupt chunk) is reported, not fatal —
                // spec.md §4.1/§7 — so the rest of the restore proceeds.
                warn!(path = %path, %source, "failed to restore file, skipping");
                report.failed += 1;
            }
        }
    }

    debug!(?report, "restore complete");
    Ok(report)
}

enum FilterOutcome {
    Include,
    Exclude,
}

fn passes_filters(path: &str, options: &RestoreOptions) -> FilterOutcome {
    if let Some(include) = &options.include {
        if !include.is_match(path) {
            return FilterOutcome::Exclude;
        }
    }
    if let Some(exclude) = &options.exclude {
        if exclude.is_match(path) {
            return FilterOutcome::Exclude;
        }
    }
    FilterOutcome::Include
}

/// A manifest path is always forward-slash separated, but may have reached
/// this process from a producer that never normalized it (spec.md §4.6 step
/// 4). Normalize here too rather than relying on the writer having done it.
fn destination_path(local_dest: &Path, record_path: &str) -> std::path::PathBuf {
    local_dest.join(record_path.replace('\\', "/"))
}

fn already_matches(local_dest: &Path, record: &Record) -> bool {
    let dest_path = destination_path(local_dest, &record.path);
    if !dest_path.is_file() {
        return false;
    }
    match hash_file(&dest_path) {
        Ok(hash) => hash == record.content_hash,
        Err(_) => false,
    }
}

fn restore_one(
    transport: &dyn Transport,
    local_dest: &Path,
    record: &Record,
    password: &str,
    cache: &SaltKeyCache,
) -> Result<(), SyncError> {
    let dest_path = destination_path(local_dest, &record.path);
    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent).map_err(|source| SyncError::LocalIo {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let store = ChunkStore::new(transport);
    let plaintext = store.download(record.chunk_id, password, cache)?;

    fs::write(&dest_path, &plaintext).map_err(|source| SyncError::LocalIo {
        path: dest_path.clone(),
        source,
    })?;
    set_mtime(&dest_path, record.mtime_ns).map_err(|source| SyncError::LocalIo {
        path: dest_path.clone(),
        source,
    })?;
    info!(path = %record.path, "restored");
    Ok(())
}

fn set_mtime(path: &Path, mtime_ns: u64) -> std::io::Result<()> {
    let mtime = filetime::FileTime::from_unix_time(
        (mtime_ns / 1_000_000_000) as i64,
        (mtime_ns % 1_000_000_000) as u32,
    );
    filetime::set_file_mtime(path, mtime)
}
