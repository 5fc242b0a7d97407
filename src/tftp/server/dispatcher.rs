//! Receive loop
//!
//! Reads the listening socket, routes datagrams from known peers to their
//! section and admits new sections for RRQ/WRQ from unknown peers. With an
//! idle timeout set, the loop also stops the server once nothing has arrived
//! for that long and no section is live.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use super::callbacks::CallbackRegistry;
use super::section::{self, Direction, Section, SectionEnv, SectionEvent};
use super::table::{AdmitError, SectionTable};
use crate::tftp::core::{ErrorCode, MAX_DATAGRAM_SIZE, Opcode, Packet, TransferMode};

/// Sending half of the listening socket, shared by all sections
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    socket: Arc<UdpSocket>,
}

impl Outbound {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub async fn send(&self, packet: &Packet, peer: SocketAddr) {
        let bytes = match packet.serialize() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("Cannot encode {} for {}: {}", packet, peer, err);
                return;
            }
        };
        match self.socket.send_to(&bytes, peer).await {
            Ok(_) => log::debug!("Sent {} to {}", packet, peer),
            Err(err) => log::warn!("Failed to send {} to {}: {}", packet, peer, err),
        }
    }
}

pub(crate) struct Dispatcher {
    socket: Arc<UdpSocket>,
    outbound: Outbound,
    table: Arc<SectionTable>,
    registry: Arc<CallbackRegistry>,
    env: SectionEnv,
    max_sections: usize,
    idle_timeout: Option<Duration>,
    shutdown: Arc<watch::Sender<bool>>,
    sections: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<CallbackRegistry>,
        env: SectionEnv,
        max_sections: usize,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            outbound: Outbound::new(Arc::clone(&socket)),
            socket,
            table: Arc::clone(&env.table),
            registry,
            env,
            max_sections,
            idle_timeout: None,
            shutdown,
            sections: JoinSet::new(),
        }
    }

    /// Stop the server after this long without a datagram
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Serve until `signal` fires or the server idles out, then terminate every section
    pub async fn run(mut self, mut signal: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let idle_timeout = self.idle_timeout.unwrap_or_default();
        let idle = time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = signal.changed() => break,
                received = self.socket.recv_from(&mut buf) => {
                    if self.idle_timeout.is_some() {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    match received {
                        Ok((len, peer)) => self.dispatch(&buf[..len], peer).await,
                        // ICMP port-unreachable surfaces here on some platforms
                        Err(err) => log::warn!("Receive error: {}", err),
                    }
                }
                _ = &mut idle, if self.idle_timeout.is_some() => {
                    if self.table.is_empty() {
                        log::info!("No request for {:?}, stopping", idle_timeout);
                        self.shutdown.send_replace(true);
                        break;
                    }
                    // Live sections keep the server up
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
                Some(joined) = self.sections.join_next() => {
                    if let Err(err) = joined {
                        log::error!("Section task failed: {}", err);
                    }
                }
            }
        }
        self.terminate().await;
    }

    async fn dispatch(&mut self, bytes: &[u8], peer: SocketAddr) {
        if let Some(inbox) = self.table.route(peer) {
            match inbox.try_send(SectionEvent::Datagram(Packet::deserialize(bytes))) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Inbox of the section for {} is full, dropping datagram", peer)
                }
                // The section just ended
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
            return;
        }

        match Packet::deserialize(bytes) {
            Ok(Packet::Rrq { filename, mode }) => self.admit(peer, filename, mode, Direction::Read).await,
            Ok(Packet::Wrq { filename, mode }) => self.admit(peer, filename, mode, Direction::Write).await,
            Ok(packet) => log::debug!("Discarding {} from unknown peer {}", packet, peer),
            Err(err) => {
                log::warn!("Malformed packet from {}: {}", peer, err);
                // Only a broken request or an unknown opcode deserves an answer
                let answer = match Opcode::peek(bytes) {
                    Some(Opcode::Rrq | Opcode::Wrq) => true,
                    Some(_) => false,
                    None => bytes.len() >= 2,
                };
                if answer {
                    let reply = Packet::Error {
                        code: ErrorCode::IllegalOperation,
                        msg: err.to_string(),
                    };
                    self.outbound.send(&reply, peer).await;
                }
            }
        }
    }

    async fn admit(&mut self, peer: SocketAddr, filename: String, mode: TransferMode, direction: Direction) {
        match self.table.admit(peer, filename, mode, direction, self.max_sections) {
            Ok(admission) => {
                let section = Section::new(
                    admission.info,
                    admission.clock,
                    self.registry.snapshot(),
                    self.env.clone(),
                );
                let outbound = self.outbound.clone();
                self.sections.spawn(section::drive(section, admission.inbox, outbound));
            }
            Err(err @ AdmitError::Full(_)) => {
                log::warn!("Rejecting request from {}: {}", peer, err);
                let reply = Packet::Error {
                    code: ErrorCode::NotDefined,
                    msg: "Server busy".to_string(),
                };
                self.outbound.send(&reply, peer).await;
            }
            Err(err @ AdmitError::Busy(_)) => log::debug!("Ignoring request: {}", err),
        }
    }

    async fn terminate(mut self) {
        let live = self.table.len();
        if live > 0 {
            log::info!("Terminating {} active section(s)", live);
        }
        for inbox in self.table.inboxes() {
            // Waits for room; fails only if the section already ended
            let _ = inbox.send(SectionEvent::Shutdown).await;
        }
        while let Some(joined) = self.sections.join_next().await {
            if let Err(err) = joined {
                log::error!("Section task failed: {}", err);
            }
        }
        self.table.clear();
    }
}
