//! Host integration hooks
//!
//! The daemon never touches storage itself. Every transfer asks the host to
//! open a file, moves bytes through the returned handle and gives the handle
//! back to the host when the section ends. The host is also told when a
//! section starts and when it finishes.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

use super::section::{SectionId, SectionInfo, SectionStatus};
use crate::tftp::core::ErrorCode;

/// Anything the daemon can stream a transfer through
pub trait TransferFile: Read + Write + Send {}

impl<T: Read + Write + Send> TransferFile for T {}

/// Opaque file handle owned by the host; the daemon only reads or writes it
pub type FileHandle = Box<dyn TransferFile>;

/// Failure reported by a host callback
///
/// `code` and `message` become the ERROR packet sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HostError {
    pub code: ErrorCode,
    pub message: String,
}

impl HostError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::from_code(ErrorCode::FileNotFound)
    }

    pub fn access_violation() -> Self {
        Self::from_code(ErrorCode::AccessViolation)
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

impl From<io::Error> for HostError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::NotDefined,
        };
        Self::new(code, err.to_string())
    }
}

/// File storage capability supplied by the host
///
/// `open` is called at most once per section; `close` exactly once for
/// every handle `open` returned, whatever the outcome of the transfer.
pub trait FileStorage: Send + Sync {
    fn open(&self, section: &SectionInfo) -> Result<FileHandle, HostError>;

    fn close(&self, id: SectionId, file: FileHandle) -> Result<(), HostError>;
}

pub type OpenFileCallback = Arc<dyn Fn(&SectionInfo) -> Result<FileHandle, HostError> + Send + Sync>;
pub type CloseFileCallback = Arc<dyn Fn(SectionId, FileHandle) -> Result<(), HostError> + Send + Sync>;
pub type SectionStartedCallback = Arc<dyn Fn(SectionId) + Send + Sync>;
pub type SectionFinishedCallback = Arc<dyn Fn(SectionId, SectionStatus) + Send + Sync>;

/// The set of handlers a section runs with
#[derive(Clone, Default)]
pub struct Callbacks {
    pub open_file: Option<OpenFileCallback>,
    pub close_file: Option<CloseFileCallback>,
    pub section_started: Option<SectionStartedCallback>,
    pub section_finished: Option<SectionFinishedCallback>,
}

impl Callbacks {
    /// Transfers need both file callbacks
    pub fn has_storage(&self) -> bool {
        self.open_file.is_some() && self.close_file.is_some()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("open_file", &self.open_file.is_some())
            .field("close_file", &self.close_file.is_some())
            .field("section_started", &self.section_started.is_some())
            .field("section_finished", &self.section_finished.is_some())
            .finish()
    }
}

/// Per-server callback table
///
/// One handler per kind; registering again replaces the previous handler.
/// Sections take a snapshot when they are admitted, so a replacement only
/// affects sections started afterwards.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    inner: RwLock<Callbacks>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_open_file_callback<F>(&self, callback: F)
    where
        F: Fn(&SectionInfo) -> Result<FileHandle, HostError> + Send + Sync + 'static,
    {
        self.update(|callbacks| callbacks.open_file = Some(Arc::new(callback)));
    }

    pub fn register_close_file_callback<F>(&self, callback: F)
    where
        F: Fn(SectionId, FileHandle) -> Result<(), HostError> + Send + Sync + 'static,
    {
        self.update(|callbacks| callbacks.close_file = Some(Arc::new(callback)));
    }

    pub fn register_section_started_callback<F>(&self, callback: F)
    where
        F: Fn(SectionId) + Send + Sync + 'static,
    {
        self.update(|callbacks| callbacks.section_started = Some(Arc::new(callback)));
    }

    pub fn register_section_finished_callback<F>(&self, callback: F)
    where
        F: Fn(SectionId, SectionStatus) + Send + Sync + 'static,
    {
        self.update(|callbacks| callbacks.section_finished = Some(Arc::new(callback)));
    }

    /// Install both file callbacks from one storage implementation
    pub fn register_storage<S>(&self, storage: Arc<S>)
    where
        S: FileStorage + 'static,
    {
        let opener = Arc::clone(&storage);
        self.update(move |callbacks| {
            callbacks.open_file = Some(Arc::new(move |section: &SectionInfo| opener.open(section)));
            callbacks.close_file = Some(Arc::new(move |id: SectionId, file: FileHandle| storage.close(id, file)));
        });
    }

    pub fn snapshot(&self) -> Callbacks {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, apply: impl FnOnce(&mut Callbacks)) {
        let mut callbacks = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut callbacks);
    }
}
