//! A [`Transport`] backed by a real SFTP session (via `ssh2`/libssh2).
//!
//! `ssh2`'s `Session` and `Sftp` types are blocking: every call here parks
//! the calling thread on network I/O, which is exactly why the sync engine
//! dispatches uploads/downloads to a bounded [`crate::workerpool`] of OS
//! threads instead of an async runtime.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use ssh2::{OpenFlags, OpenType, Session, Sftp};
use tracing::{info, instrument};

use super::{SeekWrite, Transport, TransportError};
use crate::address::RemoteAddress;

/// An SFTP transport bound to one authenticated session and a base
/// directory on the remote.
pub struct SftpTransport {
    address: RemoteAddress,
    password: String,
    sftp: Sftp,
    base: PathBuf,
}

impl SftpTransport {
    /// Connect, authenticate with `password`, and `chdir` into the
    /// address's path (creating it if absent).
    ///
    /// Host key verification is skipped when the target host is
    /// `"localhost"`, matching the teacher's sandbox-friendly default for
    /// loopback connections; any other host must match a key already known
    /// to the session (ssh2 consults the system's known_hosts).
    #[instrument(skip(password), fields(host = %address.host, user = %address.user))]
    pub fn connect(address: RemoteAddress, password: &str) -> Result<Self, TransportError> {
        let endpoint = format!("{}:{}", address.host, address.port.unwrap_or(22));
        let tcp = TcpStream::connect(&endpoint).map_err(|source| TransportError::Setup {
            host: address.host.clone(),
            reason: source.to_string(),
        })?;

        let mut session = Session::new().map_err(|source| TransportError::Setup {
            host: address.host.clone(),
            reason: source.to_string(),
        })?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|source| TransportError::Setup {
            host: address.host.clone(),
            reason: source.to_string(),
        })?;

        if address.host != "localhost" {
            verify_known_host(&session, &address.host)?;
        }

        session
            .userauth_password(&address.user, password)
            .map_err(|_| TransportError::Authentication)?;
        if !session.authenticated() {
            return Err(TransportError::Authentication);
        }

        let sftp = session.sftp().map_err(|source| TransportError::Setup {
            host: address.host.clone(),
            reason: source.to_string(),
        })?;

        let base = PathBuf::from(&address.path);
        sftp.mkdir(&base, 0o700).ok();
        info!(host = %address.host, path = %address.path, "sftp session established");

        Ok(Self {
            address,
            password: password.to_string(),
            sftp,
            base,
        })
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

/// Reject the connection unless `host`'s key is already trusted in the
/// user's `known_hosts`. Skipped entirely for `localhost` (see
/// [`SftpTransport::connect`]), since loopback connections in tests and
/// single-machine setups have no meaningful host identity to pin.
fn verify_known_host(session: &Session, host: &str) -> Result<(), TransportError> {
    let setup_err = |reason: String| TransportError::Setup {
        host: host.to_string(),
        reason,
    };

    let mut known_hosts = session.known_hosts().map_err(|e| setup_err(e.to_string()))?;
    let home = std::env::var("HOME").unwrap_or_default();
    let known_hosts_path = Path::new(&home).join(".ssh/known_hosts");
    known_hosts
        .read_file(&known_hosts_path, ssh2::KnownHostFileKind::OpenSSH)
        .map_err(|e| setup_err(format!("reading known_hosts: {e}")))?;

    let (key, _key_type) = session
        .host_key()
        .ok_or_else(|| setup_err("server offered no host key".to_string()))?;

    match known_hosts.check(host, key) {
        ssh2::CheckResult::Match => Ok(()),
        ssh2::CheckResult::Mismatch => {
            Err(setup_err(format!("host key for {host} does not match known_hosts")))
        }
        ssh2::CheckResult::NotFound => {
            Err(setup_err(format!("host key for {host} not found in known_hosts")))
        }
        ssh2::CheckResult::Failure => Err(setup_err("host key check failed".to_string())),
    }
}

impl Transport for SftpTransport {
    #[instrument(skip(self))]
    fn chdir(&self, path: &str) -> Result<(), TransportError> {
        let target = self.resolve(path);
        if self.sftp.stat(&target).is_err() {
            self.sftp
                .mkdir(&target, 0o700)
                .map_err(|source| sftp_io_error(&target, source))?;
        }
        Ok(())
    }

    fn isdir(&self, path: &str) -> Result<bool, TransportError> {
        Ok(self
            .sftp
            .stat(&self.resolve(path))
            .map(|stat| stat.is_dir())
            .unwrap_or(false))
    }

    fn isfile(&self, path: &str) -> Result<bool, TransportError> {
        Ok(self
            .sftp
            .stat(&self.resolve(path))
            .map(|stat| stat.is_file())
            .unwrap_or(false))
    }

    fn listdir(&self) -> Result<Vec<String>, TransportError> {
        let entries = self
            .sftp
            .readdir(&self.base)
            .map_err(|source| sftp_io_error(&self.base, source))?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, _stat)| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .collect())
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>, TransportError> {
        let path = self.resolve(name);
        let file = self
            .sftp
            .open(&path)
            .map_err(|source| sftp_io_error(&path, source))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn SeekWrite>, TransportError> {
        let path = self.resolve(name);
        let file = self
            .sftp
            .open_mode(
                &path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o600,
                OpenType::File,
            )
            .map_err(|source| sftp_io_error(&path, source))?;
        Ok(Box::new(file))
    }

    fn open_append(&self, name: &str) -> Result<Box<dyn Write + Send>, TransportError> {
        let path = self.resolve(name);
        let file = self
            .sftp
            .open_mode(
                &path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
                0o600,
                OpenType::File,
            )
            .map_err(|source| sftp_io_error(&path, source))?;
        Ok(Box::new(file))
    }

    fn rename(&self, old: &str, new: &str) -> Result<(), TransportError> {
        let old_path = self.resolve(old);
        let new_path = self.resolve(new);
        self.sftp
            .rename(&old_path, &new_path, None)
            .map_err(|source| sftp_io_error(&old_path, source))
    }

    fn remove(&self, name: &str) -> Result<(), TransportError> {
        let path = self.resolve(name);
        self.sftp
            .unlink(&path)
            .map_err(|source| sftp_not_found_or_io(&path, source))
    }

    fn get_to_buffer(&self, name: &str) -> Result<Vec<u8>, TransportError> {
        let path = self.resolve(name);
        let mut file = self
            .sftp
            .open(&path)
            .map_err(|source| sftp_not_found_or_io(&path, source))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|source| TransportError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(buf)
    }

    fn clone_connection(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(Self::connect(
            self.address.clone(),
            &self.password,
        )?))
    }
}

fn sftp_io_error(path: &Path, source: ssh2::Error) -> TransportError {
    TransportError::Io {
        path: path.display().to_string(),
        source: std::io::Error::other(source),
    }
}

fn sftp_not_found_or_io(path: &Path, source: ssh2::Error) -> TransportError {
    if source.code() == ssh2::ErrorCode::SFTP(2) {
        TransportError::NotFound(path.display().to_string())
    } else {
        sftp_io_error(path, source)
    }
}
