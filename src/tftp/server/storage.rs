//! Ready-made file storage for hosts
//!
//! - `DirectoryStorage`: serves a directory tree
//! - `MemoryStorage`: keeps files in memory, handy for embedding and tests

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::callbacks::{FileHandle, FileStorage, HostError};
use super::section::{Direction, SectionId, SectionInfo};
use crate::tftp::core::ErrorCode;

/// Files below a root directory
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
    read_only: bool,
    overwrite: bool,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
            overwrite: true,
        }
    }

    /// Reject every write request
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Allow uploads to replace existing files
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a requested name to a path inside the root
    fn resolve(&self, filename: &str) -> Result<PathBuf, HostError> {
        let requested = Path::new(filename);
        let mut path = self.root.clone();
        for component in requested.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    log::warn!("Rejected path outside the root directory: {}", filename);
                    return Err(HostError::access_violation());
                }
            }
        }
        if path == self.root {
            return Err(HostError::new(ErrorCode::FileNotFound, "No file name given"));
        }
        Ok(path)
    }
}

impl FileStorage for DirectoryStorage {
    fn open(&self, section: &SectionInfo) -> Result<FileHandle, HostError> {
        let path = self.resolve(&section.filename)?;
        let file = match section.direction {
            Direction::Read => {
                if path.is_dir() {
                    return Err(HostError::new(ErrorCode::AccessViolation, "Is a directory"));
                }
                File::open(&path)?
            }
            Direction::Write => {
                if self.read_only {
                    return Err(HostError::access_violation());
                }
                let mut options = OpenOptions::new();
                options.write(true);
                if self.overwrite {
                    options.create(true).truncate(true);
                } else {
                    options.create_new(true);
                }
                options.open(&path)?
            }
        };
        log::debug!("Opened {} for {}", path.display(), section.direction);
        Ok(Box::new(file))
    }

    fn close(&self, _id: SectionId, mut file: FileHandle) -> Result<(), HostError> {
        file.flush()?;
        Ok(())
    }
}

type FileMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

fn lock(files: &FileMap) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
    files.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Files held in memory, keyed by name
///
/// An upload becomes visible only when its handle is flushed, which a
/// section does once the transfer succeeded. Closing without a flush
/// discards it, so a failed upload never replaces an existing file.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: FileMap,
    read_only: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn insert(&self, name: impl Into<String>, contents: impl Into<Vec<u8>>) {
        lock(&self.files).insert(name.into(), contents.into());
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.files).remove(name)
    }

    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileStorage for MemoryStorage {
    fn open(&self, section: &SectionInfo) -> Result<FileHandle, HostError> {
        match section.direction {
            Direction::Read => {
                let contents = self.get(&section.filename).ok_or_else(HostError::not_found)?;
                Ok(Box::new(Cursor::new(contents)))
            }
            Direction::Write if self.read_only => Err(HostError::access_violation()),
            Direction::Write => Ok(Box::new(MemoryUpload {
                name: section.filename.clone(),
                contents: Vec::new(),
                files: Arc::clone(&self.files),
            })),
        }
    }

    fn close(&self, id: SectionId, file: FileHandle) -> Result<(), HostError> {
        log::trace!("Section {}: released memory file", id);
        drop(file);
        Ok(())
    }
}

/// Upload in progress; flushing publishes it
struct MemoryUpload {
    name: String,
    contents: Vec<u8>,
    files: FileMap,
}

impl Read for MemoryUpload {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for MemoryUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.contents.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.files).insert(self.name.clone(), self.contents.clone());
        Ok(())
    }
}
