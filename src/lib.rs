//! rtftpd: an embeddable TFTP daemon core
//!
//! The host process owns file storage; the daemon speaks the protocol and
//! calls back into the host to open, read, write and close files.

pub mod tftp;
