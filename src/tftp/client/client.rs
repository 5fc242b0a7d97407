use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use super::config::ClientConfig;
use crate::tftp::core::{
    MAX_DATAGRAM_SIZE, NetasciiDecoder, NetasciiEncoder, Packet, SEGMENT_SIZE, TransferMode, read_segment,
};

/// TFTP client
///
/// Supports file upload (PUT) and download (GET) operations
///
/// # Example
///
/// ```rust,no_run
/// use rtftpd::tftp::client::{Client, ClientConfig};
/// use std::path::Path;
///
/// let config = ClientConfig::new("192.168.1.100".parse().unwrap(), 69);
/// let client = Client::new(config).unwrap();
///
/// // Download file
/// client.get("remote.txt", Path::new("local.txt")).unwrap();
///
/// // Upload file
/// client.put(Path::new("local.txt"), "remote.txt").unwrap();
/// ```
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a new TFTP client
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            bail!("Client timeout must be greater than zero");
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Download a file from the server (RRQ - Read Request)
    ///
    /// Returns the number of bytes received. A failed download leaves no
    /// local file behind.
    pub fn get(&self, remote_file: &str, local_file: &Path) -> Result<u64> {
        log::info!("Downloading {} to {}", remote_file, local_file.display());

        let mut file =
            File::create(local_file).with_context(|| format!("Failed to create {}", local_file.display()))?;
        match self.fetch(remote_file, &mut file) {
            Ok(total) => {
                log::info!("Download complete: {} ({} bytes)", local_file.display(), total);
                Ok(total)
            }
            Err(err) => {
                drop(file);
                let _ = std::fs::remove_file(local_file);
                Err(err)
            }
        }
    }

    /// Upload a file to the server (WRQ - Write Request)
    pub fn put(&self, local_file: &Path, remote_file: &str) -> Result<u64> {
        log::info!("Uploading {} to {}", local_file.display(), remote_file);

        let mut file = File::open(local_file).with_context(|| format!("Failed to open {}", local_file.display()))?;
        let total = self.send(&mut file, remote_file)?;

        log::info!("Upload complete: {} ({} bytes)", remote_file, total);
        Ok(total)
    }

    /// Download `remote_file` into `out`
    pub fn fetch<W: Write>(&self, remote_file: &str, out: &mut W) -> Result<u64> {
        let mut session = Session::open(&self.config)?;
        let mut request = Packet::Rrq {
            filename: remote_file.to_string(),
            mode: self.config.mode,
        };
        let mut expected: u16 = 1;
        let mut total = 0u64;
        let mut decoder = (self.config.mode == TransferMode::Netascii).then(NetasciiDecoder::new);
        let mut text = Vec::new();

        loop {
            let data = session.exchange(&request, |reply| match reply {
                Packet::Data { block_num, data } if block_num == expected => Ok(data),
                other => Err(other),
            })?;
            let last = data.len() < SEGMENT_SIZE;
            match decoder.as_mut() {
                Some(decoder) => {
                    text.clear();
                    decoder.decode(&data, &mut text);
                    if last {
                        decoder.finish(&mut text);
                    }
                    out.write_all(&text)?;
                }
                None => out.write_all(&data)?,
            }
            total += data.len() as u64;
            request = Packet::Ack(expected);

            // If data is less than block size, transfer is complete
            if last {
                session.send(&request)?;
                break;
            }
            expected = expected.wrapping_add(1);
        }

        log::debug!("Transfer complete. Total bytes: {}", total);
        Ok(total)
    }

    /// Upload everything `input` yields as `remote_file`
    pub fn send<R: Read>(&self, input: &mut R, remote_file: &str) -> Result<u64> {
        let mut session = Session::open(&self.config)?;
        let mut request = Packet::Wrq {
            filename: remote_file.to_string(),
            mode: self.config.mode,
        };
        let mut block: u16 = 0;
        let mut total = 0u64;
        let mut last_sent = false;
        let mut encoder = (self.config.mode == TransferMode::Netascii).then(NetasciiEncoder::new);

        loop {
            session.exchange(&request, |reply| match reply {
                Packet::Ack(acked) if acked == block => Ok(()),
                other => Err(other),
            })?;
            if last_sent {
                break;
            }

            let data = read_segment(&mut *input, encoder.as_mut())?;
            last_sent = data.len() < SEGMENT_SIZE;
            total += data.len() as u64;
            block = block.wrapping_add(1);
            request = Packet::Data { block_num: block, data };
        }

        log::debug!("Transfer complete. Total bytes: {}", total);
        Ok(total)
    }
}

/// One transfer's socket and peer
struct Session {
    socket: UdpSocket,
    peer: SocketAddr,
    /// Set once the server answered; later packets must come from there
    locked: bool,
    timeout: Duration,
    retries: u32,
    buf: Vec<u8>,
}

impl Session {
    fn open(config: &ClientConfig) -> Result<Self> {
        let local = match config.server_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(local, 0)).context("Failed to bind client socket")?;
        socket.set_write_timeout(Some(config.timeout))?;

        Ok(Self {
            socket,
            peer: config.server_addr(),
            locked: false,
            timeout: config.timeout,
            retries: config.retries,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        self.socket.send_to(&packet.serialize()?, self.peer)?;
        Ok(())
    }

    /// Send `packet` until `accept` takes a reply, resending on timeout
    ///
    /// `accept` hands back packets it does not want; those are ignored. An
    /// ERROR from the server aborts the transfer.
    fn exchange<T>(&mut self, packet: &Packet, mut accept: impl FnMut(Packet) -> Result<T, Packet>) -> Result<T> {
        let bytes = packet.serialize()?;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                log::warn!("Timeout, resending {} ({}/{})", packet, attempt, self.retries);
            }
            self.socket.send_to(&bytes, self.peer)?;

            let deadline = Instant::now() + self.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                self.socket.set_read_timeout(Some(remaining))?;
                let (len, from) = match self.socket.recv_from(&mut self.buf) {
                    Ok(received) => received,
                    Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
                    Err(err) => return Err(err.into()),
                };
                if from.ip() != self.peer.ip() || (self.locked && from != self.peer) {
                    log::debug!("Ignoring packet from {}", from);
                    continue;
                }

                let reply = match Packet::deserialize(&self.buf[..len]) {
                    Ok(reply) => reply,
                    Err(err) => {
                        log::warn!("Malformed packet from {}: {}", from, err);
                        continue;
                    }
                };
                // The server may answer from another port than the one we asked
                if !self.locked {
                    self.peer = from;
                    self.locked = true;
                }
                match reply {
                    Packet::Error { code, msg } => bail!("Server error {}: {}", code, msg),
                    reply => match accept(reply) {
                        Ok(value) => return Ok(value),
                        Err(other) => log::debug!("Ignoring {}", other),
                    },
                }
            }
        }

        bail!("Server not responding after {} retries", self.retries)
    }
}
