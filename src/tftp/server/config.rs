use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Well-known TFTP port
pub const DEFAULT_PORT: u16 = 69;
/// Default time to wait for an ACK or DATA before retransmitting
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of concurrent sections
pub const DEFAULT_MAX_SECTIONS: usize = 100;
/// Retransmissions of one packet before a section gives up
pub const MAX_RETRIES: u32 = 5;

/// TFTP server configuration
///
/// # Example
///
/// ```rust
/// use rtftpd::tftp::server::Config;
/// use std::time::Duration;
///
/// let config = Config::new("127.0.0.1".parse().unwrap(), 6969).with_timeout(Duration::from_secs(2));
/// assert_eq!(config.port, 6969);
/// ```
///
/// The same settings can be loaded from TOML:
///
/// ```toml
/// ip_address = "0.0.0.0"
/// port = 69
/// timeout = "5s"
/// max_sections = 100
/// idle_timeout = "5m"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IP address to listen on
    pub ip_address: IpAddr,
    /// Port number to listen on (0 picks a free port)
    pub port: u16,
    /// Ack timeout before a retransmission
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Requests beyond this many live sections are refused
    pub max_sections: usize,
    /// Stop listening after this long without a datagram while no section
    /// is live; `None` keeps the server up until stopped
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,
}

impl Config {
    /// Create a new configuration with default timeout and section limit
    pub fn new(ip_address: IpAddr, port: u16) -> Self {
        Self {
            ip_address,
            port,
            timeout: DEFAULT_TIMEOUT,
            max_sections: DEFAULT_MAX_SECTIONS,
            idle_timeout: None,
        }
    }

    /// Set the ack timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the maximum number of concurrent sections
    pub fn with_max_sections(mut self, max_sections: usize) -> Self {
        self.max_sections = max_sections;
        self
    }

    /// Load a configuration file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        if self.max_sections == 0 {
            bail!("max_sections must be at least 1");
        }
        if self.idle_timeout.is_some_and(|idle| idle.is_zero()) {
            bail!("idle_timeout must be greater than zero; leave it out to never stop");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
    }
}
