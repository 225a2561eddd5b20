//! Core library for `rsbak`: encrypted-at-rest remote backup and restore.
//!
//! The three hard subsystems live here:
//!
//! - [`crypto`] — password-derived keys and the streaming authenticated
//!   encryption pipeline that frames every blob written to the remote.
//! - [`manifest`] — the per-file metadata record format and the
//!   append-only `.files` log replay semantics.
//! - [`sync`] — the backup and restore engines that reconcile local
//!   filesystem state against the remote.
//!
//! Supporting modules: [`transport`] (the narrow capability interface onto
//! SFTP or a local directory), [`chunkstore`] (atomic blob publish + orphan
//! GC), [`address`] (the `user@host:/path` parser), and [`workerpool`] (the
//! bounded-concurrency dispatcher shared by both sync paths).

pub mod address;
pub mod chunkstore;
pub mod crypto;
pub mod error;
pub mod manifest;
pub mod sync;
pub mod transport;
pub mod workerpool;

pub use error::BackupError;
