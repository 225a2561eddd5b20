//! The crate's top-level error type.
//!
//! Each module owns a focused error enum — [`crate::crypto::CryptoError`],
//! [`crate::manifest::ManifestError`], [`crate::chunkstore::ChunkStoreError`],
//! [`crate::transport::TransportError`], [`crate::sync::SyncError`] — and
//! [`BackupError`] aggregates them via `#[from]` so a caller that doesn't
//! need to match on a specific module's variants can just propagate with
//! `?`. The CLI is the one place that does match on it, to implement
//! spec.md §7's policy (config/usage errors exit quietly, auth/transport
//! setup errors retry the password prompt, per-file errors are logged and
//! skipped rather than raised here at all).

use thiserror::Error;

use crate::chunkstore::ChunkStoreError;
use crate::crypto::CryptoError;
use crate::manifest::ManifestError;
use crate::sync::SyncError;
use crate::transport::TransportError;

/// The crate's aggregate error type.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    ChunkStore(#[from] ChunkStoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The source directory does not exist, or the destination address is
    /// malformed: spec.md §7's "Config/usage" kind. The CLI reports this
    /// and exits without touching the remote.
    #[error("{0}")]
    Usage(String),
}

impl BackupError {
    /// Whether retrying the password prompt could plausibly fix this
    /// error, per spec.md §7 ("Authentication" and "Transport-setup" are
    /// retried up to 5 times; everything else is not).
    pub fn is_retryable_auth_failure(&self) -> bool {
        matches!(
            self,
            BackupError::Transport(TransportError::Authentication)
                | BackupError::Transport(TransportError::Setup { .. })
        )
    }
}
