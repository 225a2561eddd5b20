//! A [`Transport`] backed by a plain local directory.
//!
//! Used both for genuinely local backup destinations and in tests, where it
//! stands in for a remote without needing an SSH fixture.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::instrument;

use super::{SeekWrite, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Open `root` as the backup destination, creating it if absent.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| TransportError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Transport for LocalTransport {
    #[instrument(skip(self))]
    fn chdir(&self, path: &str) -> Result<(), TransportError> {
        let target = self.resolve(path);
        fs::create_dir_all(&target).map_err(|source| TransportError::Io {
            path: target.display().to_string(),
            source,
        })
    }

    fn isdir(&self, path: &str) -> Result<bool, TransportError> {
        Ok(self.resolve(path).is_dir())
    }

    fn isfile(&self, path: &str) -> Result<bool, TransportError> {
        Ok(self.resolve(path).is_file())
    }

    fn listdir(&self) -> Result<Vec<String>, TransportError> {
        let entries = fs::read_dir(&self.root).map_err(|source| TransportError::Io {
            path: self.root.display().to_string(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| TransportError::Io {
                path: self.root.display().to_string(),
                source,
            })?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>, TransportError> {
        let path = self.resolve(name);
        let file = File::open(&path).map_err(|source| self.not_found_or_io(&path, source))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn SeekWrite>, TransportError> {
        let path = self.resolve(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| TransportError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Box::new(file))
    }

    fn open_append(&self, name: &str) -> Result<Box<dyn Write + Send>, TransportError> {
        let path = self.resolve(name);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| TransportError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Box::new(file))
    }

    fn rename(&self, old: &str, new: &str) -> Result<(), TransportError> {
        let old_path = self.resolve(old);
        let new_path = self.resolve(new);
        fs::rename(&old_path, &new_path).map_err(|source| TransportError::Io {
            path: old_path.display().to_string(),
            source,
        })
    }

    fn remove(&self, name: &str) -> Result<(), TransportError> {
        let path = self.resolve(name);
        fs::remove_file(&path).map_err(|source| self.not_found_or_io(&path, source))
    }

    fn get_to_buffer(&self, name: &str) -> Result<Vec<u8>, TransportError> {
        let path = self.resolve(name);
        fs::read(&path).map_err(|source| self.not_found_or_io(&path, source))
    }

    fn clone_connection(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(self.clone()))
    }
}

impl LocalTransport {
    fn not_found_or_io(&self, path: &Path, source: std::io::Error) -> TransportError {
        if source.kind() == std::io::ErrorKind::NotFound {
            TransportError::NotFound(path.display().to_string())
        } else {
            TransportError::Io {
                path: path.display().to_string(),
                source,
            }
        }
    }
}
