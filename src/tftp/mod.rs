//! TFTP (Trivial File Transfer Protocol) implementation
//!
//! This module implements the TFTP protocol as described in
//! [RFC 1350](https://www.rfc-editor.org/rfc/rfc1350) (TFTP Protocol version 2).
//! Request options ([RFC 2347](https://www.rfc-editor.org/rfc/rfc2347)) are
//! accepted on the wire and ignored.
//!
//! ## Module Structure
//!
//! ```text
//! tftp/
//! ├── core/           # Core protocol implementation
//! │   ├── packet      # Packet serialization/deserialization
//! │   └── convert     # Netascii translation
//! │
//! ├── server/         # TFTP daemon
//! │   ├── server      # Handle, lifecycle and status queries
//! │   ├── dispatcher  # Receive loop and section admission
//! │   ├── scheduler   # Retransmission timer
//! │   ├── section     # Per-transfer state machine
//! │   ├── table       # Live sections
//! │   ├── callbacks   # Host hooks
//! │   ├── storage     # Directory and memory storage
//! │   └── config      # Server configuration
//! │
//! └── client/         # Blocking TFTP client
//! ```
//!
//! ## Usage Examples
//!
//! ### Start TFTP Server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtftpd::tftp::server::{Config, MemoryStorage, SectionStatus, Server};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! storage.insert("pxelinux.0", vec![0u8; 4096]);
//!
//! let mut server = Server::with_config(Config::new("0.0.0.0".parse()?, 69));
//! server.register_storage(storage);
//! server.register_section_finished_callback(|id, status| {
//!     if status == SectionStatus::Error {
//!         log::warn!("transfer {} failed", id);
//!     }
//! });
//!
//! server.start_listening().await?;
//! # Ok(())
//! # }
//! ```

// Submodules
pub mod client;
pub mod core;
pub mod server;
