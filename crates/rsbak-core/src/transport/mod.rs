//! The remote transport adapter: the narrow capability interface THE CORE
//! uses for all I/O to the backup destination.
//!
//! This is deliberately a thin trait, not a general filesystem API: just
//! enough to enumerate a flat directory, open streams, and rename/remove —
//! mirroring what an SFTP session actually exposes. Two adapters implement
//! it: [`local::LocalTransport`] for a plain directory, and
//! [`sftp::SftpTransport`] for a remote host (selected by
//! [`crate::address`] parsing).

pub mod local;
#[cfg(feature = "sftp")]
pub mod sftp;

use std::io::{Read, Write};

use thiserror::Error;

pub use crate::crypto::SeekWrite;

/// Errors from the transport layer. Variants map onto spec.md §7's
/// Config/usage, Authentication, and Transport-setup error kinds; callers
/// decide retry policy (the CLI retries Authentication/TransportSetup up
/// to 5 times).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("authentication failed")]
    Authentication,

    #[error("could not establish connection to {host}: {reason}")]
    Setup { host: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The narrow capability set the backup/restore core requires of a
/// destination: SFTP and a local directory both satisfy it identically.
pub trait Transport: Send + Sync {
    /// Change into `path`, creating it first if it does not yet exist.
    fn chdir(&self, path: &str) -> Result<(), TransportError>;

    fn isdir(&self, path: &str) -> Result<bool, TransportError>;

    fn isfile(&self, path: &str) -> Result<bool, TransportError>;

    /// List entry names directly under the current directory (not
    /// recursive: the remote layout is always flat).
    fn listdir(&self) -> Result<Vec<String>, TransportError>;

    fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>, TransportError>;

    /// Open `name` for writing from scratch, truncating if it exists. The
    /// returned sink must be seekable (the crypto frame backfills its tag).
    fn open_write(&self, name: &str) -> Result<Box<dyn SeekWrite>, TransportError>;

    /// Open `name` for appending, creating it if it does not exist.
    fn open_append(&self, name: &str) -> Result<Box<dyn Write + Send>, TransportError>;

    fn rename(&self, old: &str, new: &str) -> Result<(), TransportError>;

    fn remove(&self, name: &str) -> Result<(), TransportError>;

    /// Fetch `name` entirely into memory.
    fn get_to_buffer(&self, name: &str) -> Result<Vec<u8>, TransportError>;

    /// Open an independent connection to the same destination, for use by
    /// a dedicated worker thread (spec.md §5: "each worker holds its own
    /// transport connection").
    fn clone_connection(&self) -> Result<Box<dyn Transport>, TransportError>;
}
