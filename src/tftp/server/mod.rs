//! TFTP server implementation
//!
//! This module provides the daemon core:
//! - `server`: Server handle, lifecycle and status queries
//! - `dispatcher`: Receive loop, routes datagrams and admits sections
//! - `scheduler`: Retransmission timer
//! - `section`: Per-transfer state machine
//! - `table`: Live sections by id and by client
//! - `callbacks`: Host hooks for file storage and notifications
//! - `storage`: Directory and in-memory storage for hosts
//! - `config`: Server configuration

mod callbacks;
mod config;
mod dispatcher;
mod scheduler;
mod section;
mod server;
mod storage;
mod table;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};

// Public server types
pub use callbacks::{
    CallbackRegistry, Callbacks, CloseFileCallback, FileHandle, FileStorage, HostError, OpenFileCallback,
    SectionFinishedCallback, SectionStartedCallback, TransferFile,
};
pub use config::{Config, DEFAULT_MAX_SECTIONS, DEFAULT_PORT, DEFAULT_TIMEOUT, MAX_RETRIES};
pub use section::{Direction, SectionId, SectionInfo, SectionStatus};
pub use server::{DestroyError, SectionView, Server, TftpdError};
pub use storage::{DirectoryStorage, MemoryStorage};

/// Serve `root` until Ctrl+C
pub async fn run(config: Config, root: PathBuf, read_only: bool, overwrite: bool) -> Result<()> {
    log::info!("Starting TFTP server on {}:{}", config.ip_address, config.port);
    log::info!("Root directory: {}", root.display());
    log::info!("Read-only mode: {}", read_only);

    // Ensure directory exists
    if !root.is_dir() {
        log::error!("Directory does not exist: {}", root.display());
        bail!("Directory does not exist: {}", root.display());
    }
    config.validate()?;

    let storage = DirectoryStorage::new(root)
        .with_read_only(read_only)
        .with_overwrite(overwrite);
    let mut server = Server::with_config(config);
    server.register_storage(Arc::new(storage));

    let view = server.section_view();
    server.register_section_finished_callback(move |id, status| {
        log::debug!("Section {} finished with {:?}, {} still active", id, status, view.active_sections());
    });

    server.start_listening().await?;
    log::info!("TFTP server listening, press Ctrl+C to stop");

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            true
        }
        _ = server.closed() => false,
    };
    if interrupted {
        log::info!("Shutting down");
        server.stop_listening().await?;
    }
    if let Err(err) = server.destroy() {
        bail!("{}", err);
    }
    Ok(())
}
