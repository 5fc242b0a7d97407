//! TFTP client
//!
//! A small blocking RFC 1350 client, used by the command line tool and handy
//! for exercising a server.

mod client;
mod config;

pub use client::Client;
pub use config::ClientConfig;
