use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::tftp::core::TransferMode;

/// TFTP client configuration
///
/// # Example
///
/// ```rust
/// use rtftpd::tftp::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("192.168.1.100".parse().unwrap(), 69).with_timeout(Duration::from_secs(1));
/// assert_eq!(config.retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server IP address
    pub server_ip: IpAddr,
    /// Server port number
    pub server_port: u16,
    /// Time to wait for each reply
    pub timeout: Duration,
    /// Retransmissions before giving up
    pub retries: u32,
    /// Transfer mode sent in the request
    pub mode: TransferMode,
}

impl ClientConfig {
    /// Create new client configuration
    ///
    /// # Arguments
    ///
    /// * `server_ip` - Server IP address
    /// * `server_port` - Server port number (usually 69)
    pub fn new(server_ip: IpAddr, server_port: u16) -> Self {
        Self {
            server_ip,
            server_port,
            timeout: Duration::from_secs(5),
            retries: 5,
            mode: TransferMode::Octet,
        }
    }

    /// Set timeout duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of retransmissions
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.server_port)
    }
}

impl From<SocketAddr> for ClientConfig {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 69)
    }
}
