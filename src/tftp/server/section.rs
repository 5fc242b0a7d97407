//! Transfer sections
//!
//! A section is one client transfer. Its protocol logic is a synchronous
//! state machine (`Section::start`, `Section::handle`, `Section::finish`)
//! which is driven by a per-section task (`drive`). Every transition runs on
//! the blocking pool because it may call into the host, so a slow host only
//! holds up its own section.
//!
//! Netascii transfers are translated on the way through: CR LF and CR NUL
//! on the wire, plain LF and CR in the host's file.
//!
//! ```text
//! Init --request--> Opening --open ok--> Active --last block--> Done
//!   |                  |                   |
//!   +--no storage--+   +--open failed--+   +--error/timeout/violation--+
//!                  v                   v                               v
//!                Failed              Failed                          Failed
//! ```

use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::task;

use super::callbacks::{Callbacks, FileHandle, SectionFinishedCallback};
use super::dispatcher::Outbound;
use super::server::LastError;
use super::table::{SectionClock, SectionTable};
use crate::tftp::core::{
    ErrorCode, NetasciiDecoder, NetasciiEncoder, Packet, PacketError, SEGMENT_SIZE, TransferMode, read_segment,
};

/// Identifier of a section, unique for the lifetime of its server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(u64);

impl SectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Status of a section as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionStatus {
    /// Running, or completed successfully
    Ok,
    /// Failed; terminal
    Error,
    /// No such section (never existed, or already removed)
    Undefined,
}

/// Which way the file moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// RRQ: the server sends DATA
    Read,
    /// WRQ: the server sends ACK
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// What the host gets to know about a section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub id: SectionId,
    pub client: SocketAddr,
    pub filename: String,
    pub mode: TransferMode,
    pub direction: Direction,
    pub started_at: DateTime<Local>,
}

/// Input to a section
#[derive(Debug, Clone)]
pub(crate) enum SectionEvent {
    Datagram(Result<Packet, PacketError>),
    TimerExpired,
    Shutdown,
}

/// Transfer progress while exchanging DATA/ACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Last block sent (read) or acknowledged (write)
    pub block: u16,
    pub retries: u32,
    /// Read only: the block in flight is the short, final one
    pub last_block_sent: bool,
    last_sent: Packet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionState {
    Init,
    Opening,
    Active(Progress),
    Done,
    Failed,
}

/// Result of one transition: what to send, and whether the section ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub reply: Option<Packet>,
    pub outcome: Option<SectionStatus>,
}

impl Transition {
    fn idle() -> Self {
        Self::default()
    }

    fn reply(reply: Option<Packet>) -> Self {
        Self { reply, outcome: None }
    }

    fn end(reply: Option<Packet>, status: SectionStatus) -> Self {
        Self {
            reply,
            outcome: Some(status),
        }
    }
}

/// Server-wide state a section works against
#[derive(Debug, Clone)]
pub(crate) struct SectionEnv {
    pub table: Arc<SectionTable>,
    pub errors: Arc<LastError>,
    pub timeout: Duration,
    pub max_retries: u32,
}

pub(crate) struct Section {
    info: SectionInfo,
    state: SectionState,
    file: Option<FileHandle>,
    callbacks: Callbacks,
    clock: Arc<SectionClock>,
    env: SectionEnv,
    error_msg: Option<String>,
    encoder: Option<NetasciiEncoder>,
    decoder: Option<NetasciiDecoder>,
}

/// `true` if `block` lies in the half of the sequence space before `current`
fn is_behind(block: u16, current: u16) -> bool {
    let distance = current.wrapping_sub(block);
    distance != 0 && distance < 0x8000
}

impl Section {
    pub fn new(info: SectionInfo, clock: Arc<SectionClock>, callbacks: Callbacks, env: SectionEnv) -> Self {
        let netascii = info.mode == TransferMode::Netascii;
        let encoder = (netascii && info.direction == Direction::Read).then(NetasciiEncoder::new);
        let decoder = (netascii && info.direction == Direction::Write).then(NetasciiDecoder::new);
        Self {
            encoder,
            decoder,
            info,
            state: SectionState::Init,
            file: None,
            callbacks,
            clock,
            env,
            error_msg: None,
        }
    }

    pub fn id(&self) -> SectionId {
        self.info.id
    }

    pub fn state(&self) -> &SectionState {
        &self.state
    }

    /// Why the section failed, if it did
    pub fn error_msg(&self) -> Option<&str> {
        self.error_msg.as_deref()
    }

    /// Announce the section and process its request
    pub fn start(&mut self) -> Transition {
        log::info!(
            "Section {}: {} request for '{}' ({}) from {}",
            self.info.id,
            self.info.direction,
            self.info.filename,
            self.info.mode,
            self.info.client
        );
        if let Some(started) = &self.callbacks.section_started {
            started(self.info.id);
        }

        if self.state != SectionState::Init {
            return Transition::idle();
        }
        let Some(open) = self.callbacks.open_file.clone().filter(|_| self.callbacks.has_storage()) else {
            let message = "File storage callbacks are not registered";
            self.env.errors.record(message);
            return self.fail(ErrorCode::NotDefined, message);
        };

        self.state = SectionState::Opening;
        match open(&self.info) {
            Ok(file) => {
                self.file = Some(file);
                self.activate()
            }
            Err(err) => {
                self.env.errors.record(format!(
                    "Section {}: cannot open '{}': {}",
                    self.info.id, self.info.filename, err
                ));
                self.fail(err.code, err.message)
            }
        }
    }

    /// Apply one event
    pub fn handle(&mut self, event: SectionEvent) -> Transition {
        let state = std::mem::replace(&mut self.state, SectionState::Failed);
        match (state, event) {
            (SectionState::Active(progress), SectionEvent::Datagram(Ok(packet))) => self.on_packet(progress, packet),
            (SectionState::Active(progress), SectionEvent::Datagram(Err(err))) => {
                // The retransmission timer keeps running
                log::warn!("Section {}: dropping malformed packet: {}", self.info.id, err);
                self.resume(progress, None)
            }
            (SectionState::Active(progress), SectionEvent::TimerExpired) => self.on_timer(progress),
            (SectionState::Init | SectionState::Opening | SectionState::Active(_), SectionEvent::Shutdown) => {
                self.fail(ErrorCode::NotDefined, "Server is shutting down")
            }
            (
                state @ (SectionState::Init | SectionState::Opening),
                SectionEvent::Datagram(_) | SectionEvent::TimerExpired,
            ) => {
                self.state = state;
                Transition::idle()
            }
            (state @ (SectionState::Done | SectionState::Failed), _) => {
                self.state = state;
                Transition::idle()
            }
        }
    }

    /// Release the file and report the final status to the table and the host
    ///
    /// Only a successful transfer flushes the file before closing it. A
    /// failing flush or close turns success into an error.
    pub fn finish(&mut self, outcome: SectionStatus) -> SectionStatus {
        let mut status = outcome;
        if let Some(mut file) = self.file.take() {
            if status == SectionStatus::Ok {
                if let Err(err) = file.flush() {
                    let message = format!("Section {}: cannot flush '{}': {}", self.info.id, self.info.filename, err);
                    log::warn!("{}", message);
                    self.env.errors.record(message.clone());
                    self.error_msg = Some(message);
                    status = SectionStatus::Error;
                }
            }
            if let Some(close) = &self.callbacks.close_file {
                if let Err(err) = close(self.info.id, file) {
                    let message = format!("Section {}: cannot close '{}': {}", self.info.id, self.info.filename, err);
                    log::warn!("{}", message);
                    self.env.errors.record(message.clone());
                    self.error_msg = Some(message);
                    status = SectionStatus::Error;
                }
            }
        }
        if status == SectionStatus::Error {
            self.state = SectionState::Failed;
        }
        self.clock.disarm();
        self.env.table.set_status(self.info.id, status);

        match status {
            SectionStatus::Ok => log::info!("Section {}: transfer of '{}' complete", self.info.id, self.info.filename),
            _ => log::warn!(
                "Section {}: transfer of '{}' failed: {}",
                self.info.id,
                self.info.filename,
                self.error_msg().unwrap_or("unknown error")
            ),
        }
        if let Some(finished) = &self.callbacks.section_finished {
            finished(self.info.id, status);
        }
        status
    }

    fn initial_block(&self) -> u16 {
        match self.info.direction {
            Direction::Read => 1,
            Direction::Write => 0,
        }
    }

    fn activate(&mut self) -> Transition {
        let (packet, last_block_sent) = match self.info.direction {
            Direction::Read => match self.read_block() {
                Ok(data) => {
                    let last = data.len() < SEGMENT_SIZE;
                    (Packet::Data { block_num: 1, data }, last)
                }
                Err(err) => return self.fail(ErrorCode::NotDefined, format!("Read error: {}", err)),
            },
            Direction::Write => (Packet::Ack(0), false),
        };

        self.clock.rearm();
        let progress = Progress {
            block: self.initial_block(),
            retries: 0,
            last_block_sent,
            last_sent: packet.clone(),
        };
        self.resume(progress, Some(packet))
    }

    fn on_packet(&mut self, progress: Progress, packet: Packet) -> Transition {
        match (self.info.direction, packet) {
            (_, Packet::Error { code, msg }) => {
                self.error_msg = Some(format!("Client sent error {}: {}", code.as_u16(), msg));
                self.clock.disarm();
                self.state = SectionState::Failed;
                Transition::end(None, SectionStatus::Error)
            }
            (Direction::Read, Packet::Ack(block)) => self.on_ack(progress, block),
            (Direction::Write, Packet::Data { block_num, data }) => self.on_data(progress, block_num, data),
            (_, Packet::Rrq { .. } | Packet::Wrq { .. }) => {
                // The client never saw our first reply
                let reply = (progress.block == self.initial_block()).then(|| progress.last_sent.clone());
                self.resume(progress, reply)
            }
            (_, packet) => self.fail(
                ErrorCode::IllegalOperation,
                format!("Unexpected {} during {} transfer", packet.opcode(), self.info.direction),
            ),
        }
    }

    fn on_ack(&mut self, mut progress: Progress, block: u16) -> Transition {
        if block == progress.block {
            if progress.last_block_sent {
                self.clock.disarm();
                self.state = SectionState::Done;
                return Transition::end(None, SectionStatus::Ok);
            }

            let next = progress.block.wrapping_add(1);
            let data = match self.read_block() {
                Ok(data) => data,
                Err(err) => return self.fail(ErrorCode::NotDefined, format!("Read error: {}", err)),
            };
            progress.last_block_sent = data.len() < SEGMENT_SIZE;
            progress.block = next;
            progress.retries = 0;
            progress.last_sent = Packet::Data { block_num: next, data };
            self.clock.rearm();
            let packet = progress.last_sent.clone();
            self.resume(progress, Some(packet))
        } else if block == progress.block.wrapping_sub(1) {
            log::debug!("Section {}: duplicate ACK <block: {}>", self.info.id, block);
            let packet = progress.last_sent.clone();
            self.resume(progress, Some(packet))
        } else if is_behind(block, progress.block) {
            self.resume(progress, None)
        } else {
            let message = format!("ACK for block {} while block {} is in flight", block, progress.block);
            self.fail(ErrorCode::IllegalOperation, message)
        }
    }

    fn on_data(&mut self, mut progress: Progress, block_num: u16, data: Vec<u8>) -> Transition {
        let expected = progress.block.wrapping_add(1);
        if block_num == expected {
            let last = data.len() < SEGMENT_SIZE;
            if let Err(err) = self.write_block(&data, last) {
                return self.fail(ErrorCode::DiskFull, format!("Write error: {}", err));
            }
            let ack = Packet::Ack(expected);
            progress.block = expected;
            progress.retries = 0;
            progress.last_sent = ack.clone();

            if last {
                self.clock.disarm();
                self.state = SectionState::Done;
                return Transition::end(Some(ack), SectionStatus::Ok);
            }
            self.clock.rearm();
            self.resume(progress, Some(ack))
        } else if block_num == progress.block {
            log::debug!("Section {}: duplicate DATA <block: {}>", self.info.id, block_num);
            let packet = progress.last_sent.clone();
            self.resume(progress, Some(packet))
        } else if is_behind(block_num, progress.block) {
            self.resume(progress, None)
        } else {
            let message = format!("DATA block {} while expecting block {}", block_num, expected);
            self.fail(ErrorCode::IllegalOperation, message)
        }
    }

    fn on_timer(&mut self, mut progress: Progress) -> Transition {
        if !self.clock.take_expired(self.env.timeout) {
            return self.resume(progress, None);
        }
        if progress.retries >= self.env.max_retries {
            let message = format!("Client not responding after {} retries", self.env.max_retries);
            return self.fail(ErrorCode::NotDefined, message);
        }

        progress.retries += 1;
        log::warn!(
            "Section {}: timeout, retrying ({}/{})",
            self.info.id,
            progress.retries,
            self.env.max_retries
        );
        self.clock.rearm();
        let packet = progress.last_sent.clone();
        self.resume(progress, Some(packet))
    }

    fn resume(&mut self, progress: Progress, reply: Option<Packet>) -> Transition {
        self.state = SectionState::Active(progress);
        Transition::reply(reply)
    }

    fn fail(&mut self, code: ErrorCode, message: impl Into<String>) -> Transition {
        let message = message.into();
        self.clock.disarm();
        self.state = SectionState::Failed;
        self.error_msg = Some(message.clone());
        Transition::end(Some(Packet::Error { code, msg: message }), SectionStatus::Error)
    }

    /// Read up to one segment; fewer bytes only at end of file
    fn read_block(&mut self) -> io::Result<Vec<u8>> {
        let file = self.file.as_mut().ok_or_else(|| io::Error::other("no open file"))?;
        read_segment(&mut **file, self.encoder.as_mut())
    }

    fn write_block(&mut self, data: &[u8], last: bool) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(|| io::Error::other("no open file"))?;
        let Some(decoder) = self.decoder.as_mut() else {
            return file.write_all(data);
        };
        let mut text = Vec::with_capacity(data.len());
        decoder.decode(data, &mut text);
        if last {
            decoder.finish(&mut text);
        }
        file.write_all(&text)
    }
}

/// Run one transition on the blocking pool, handing the section back
async fn on_blocking_pool<T, F>(mut section: Section, apply: F) -> Result<(Section, T), task::JoinError>
where
    F: FnOnce(&mut Section) -> T + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(move || {
        let output = apply(&mut section);
        (section, output)
    })
    .await
}

/// Section task: feeds events into the state machine until it ends
pub(crate) async fn drive(section: Section, mut inbox: mpsc::Receiver<SectionEvent>, outbound: Outbound) {
    let id = section.id();
    let peer = section.info.client;
    let table = Arc::clone(&section.env.table);
    let finished = section.callbacks.section_finished.clone();

    let (mut section, mut step) = match on_blocking_pool(section, Section::start).await {
        Ok(started) => started,
        Err(err) => return abandon(id, &table, finished, err).await,
    };

    loop {
        if let Some(reply) = step.reply.take() {
            outbound.send(&reply, peer).await;
        }
        if let Some(outcome) = step.outcome {
            if let Err(err) = on_blocking_pool(section, move |s| s.finish(outcome)).await {
                log::error!("Section {}: finishing failed: {}", id, err);
            }
            break;
        }

        // A closed inbox means the dispatcher is gone
        let event = inbox.recv().await.unwrap_or(SectionEvent::Shutdown);
        match on_blocking_pool(section, move |s| s.handle(event)).await {
            Ok((next, transition)) => {
                section = next;
                step = transition;
            }
            Err(err) => return abandon(id, &table, finished, err).await,
        }
    }

    table.remove(id);
}

/// The state machine panicked inside a host callback; report and forget the section
async fn abandon(
    id: SectionId,
    table: &SectionTable,
    finished: Option<SectionFinishedCallback>,
    err: task::JoinError,
) {
    log::error!("Section {}: processing panicked: {}", id, err);
    table.set_status(id, SectionStatus::Error);
    if let Some(finished) = finished {
        if let Err(err) = task::spawn_blocking(move || finished(id, SectionStatus::Error)).await {
            log::error!("Section {}: finished callback panicked: {}", id, err);
        }
    }
    table.remove(id);
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use super::*;
    use crate::tftp::server::callbacks::{CallbackRegistry, FileStorage, HostError};
    use crate::tftp::server::storage::MemoryStorage;

    struct Harness {
        table: Arc<SectionTable>,
        errors: Arc<LastError>,
        storage: Arc<MemoryStorage>,
        registry: CallbackRegistry,
        closed: Arc<AtomicUsize>,
        finished: Arc<Mutex<Vec<(SectionId, SectionStatus)>>>,
    }

    impl Harness {
        fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let closed = Arc::new(AtomicUsize::new(0));
            let finished = Arc::new(Mutex::new(Vec::new()));
            let registry = CallbackRegistry::new();

            let opener = Arc::clone(&storage);
            registry.register_open_file_callback(move |info| opener.open(info));
            let closer = Arc::clone(&storage);
            let counter = Arc::clone(&closed);
            registry.register_close_file_callback(move |id, file| {
                counter.fetch_add(1, Ordering::SeqCst);
                closer.close(id, file)
            });
            let log = Arc::clone(&finished);
            registry.register_section_finished_callback(move |id, status| log.lock().unwrap().push((id, status)));

            Self {
                table: Arc::new(SectionTable::new()),
                errors: Arc::new(LastError::default()),
                storage,
                registry,
                closed,
                finished,
            }
        }

        fn section(&self, direction: Direction, filename: &str) -> Section {
            self.section_with(direction, filename, Duration::from_secs(5), 5)
        }

        fn section_in(&self, mode: TransferMode, direction: Direction, filename: &str) -> Section {
            self.build(mode, direction, filename, Duration::from_secs(5), 5)
        }

        fn section_with(&self, direction: Direction, filename: &str, timeout: Duration, max_retries: u32) -> Section {
            self.build(TransferMode::Octet, direction, filename, timeout, max_retries)
        }

        fn build(
            &self,
            mode: TransferMode,
            direction: Direction,
            filename: &str,
            timeout: Duration,
            max_retries: u32,
        ) -> Section {
            let admission = self
                .table
                .admit(
                    SocketAddr::from(([127, 0, 0, 1], 40000)),
                    filename.to_string(),
                    mode,
                    direction,
                    10,
                )
                .unwrap();
            let env = SectionEnv {
                table: Arc::clone(&self.table),
                errors: Arc::clone(&self.errors),
                timeout,
                max_retries,
            };
            Section::new(admission.info, admission.clock, self.registry.snapshot(), env)
        }

        fn finished(&self) -> Vec<(SectionId, SectionStatus)> {
            self.finished.lock().unwrap().clone()
        }
    }

    /// Yields `remaining` bytes of 0x42 and counts what is written to it
    struct Synthetic {
        remaining: u64,
        written: Arc<AtomicU64>,
    }

    impl Synthetic {
        fn new(remaining: u64) -> Self {
            Self {
                remaining,
                written: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    impl Read for Synthetic {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
            buf[..len].fill(0x42);
            self.remaining -= len as u64;
            Ok(len)
        }
    }

    impl Write for Synthetic {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.fetch_add(buf.len() as u64, Ordering::SeqCst);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn packet(packet: Packet) -> SectionEvent {
        SectionEvent::Datagram(Ok(packet))
    }

    fn data(block_num: u16, len: usize) -> Packet {
        Packet::Data {
            block_num,
            data: vec![0x5A; len],
        }
    }

    #[test]
    fn test_is_behind_wraps() {
        assert!(is_behind(4, 5));
        assert!(is_behind(65535, 0));
        assert!(!is_behind(5, 5));
        assert!(!is_behind(6, 5));
        assert!(!is_behind(0, 65535));
    }

    #[test]
    fn test_read_exact_multiple_ends_with_empty_block() {
        let harness = Harness::new();
        harness.storage.insert("report.txt", vec![7u8; 1024]);
        let mut section = harness.section(Direction::Read, "report.txt");

        assert_eq!(section.start().reply, Some(Packet::Data { block_num: 1, data: vec![7; 512] }));
        assert_eq!(section.handle(packet(Packet::Ack(1))).reply, Some(Packet::Data { block_num: 2, data: vec![7; 512] }));
        assert_eq!(section.handle(packet(Packet::Ack(2))).reply, Some(Packet::Data { block_num: 3, data: Vec::new() }));

        let last = section.handle(packet(Packet::Ack(3)));
        assert_eq!(last, Transition::end(None, SectionStatus::Ok));
        assert_eq!(section.state(), &SectionState::Done);

        let id = section.id();
        assert_eq!(section.finish(SectionStatus::Ok), SectionStatus::Ok);
        assert_eq!(harness.closed.load(Ordering::SeqCst), 1);
        assert_eq!(harness.finished(), vec![(id, SectionStatus::Ok)]);
        assert_eq!(harness.table.status(id), SectionStatus::Ok);
    }

    #[test]
    fn test_read_short_file_is_single_block() {
        let harness = Harness::new();
        harness.storage.insert("small", b"hello".to_vec());
        let mut section = harness.section(Direction::Read, "small");

        assert_eq!(section.start().reply, Some(Packet::Data { block_num: 1, data: b"hello".to_vec() }));
        assert_eq!(section.handle(packet(Packet::Ack(1))).outcome, Some(SectionStatus::Ok));
    }

    #[test]
    fn test_read_duplicate_and_stale_acks() {
        let harness = Harness::new();
        harness.storage.insert("big", vec![1u8; 2000]);
        let mut section = harness.section(Direction::Read, "big");

        section.start();
        section.handle(packet(Packet::Ack(1)));
        let block3 = section.handle(packet(Packet::Ack(2))).reply.unwrap();
        assert_eq!(block3, Packet::Data { block_num: 3, data: vec![1; 512] });

        // Duplicate of the previous ACK resends block 3 without advancing
        assert_eq!(section.handle(packet(Packet::Ack(2))).reply, Some(block3));
        // Older ACKs are ignored
        assert_eq!(section.handle(packet(Packet::Ack(1))), Transition::idle());
        match section.state() {
            SectionState::Active(progress) => assert_eq!(progress.block, 3),
            state => panic!("unexpected state {:?}", state),
        }

        let last = section.handle(packet(Packet::Ack(3))).reply.unwrap();
        assert_eq!(last, Packet::Data { block_num: 4, data: vec![1; 2000 - 3 * 512] });
        assert_eq!(section.handle(packet(Packet::Ack(4))).outcome, Some(SectionStatus::Ok));
    }

    #[test]
    fn test_ack_ahead_is_a_protocol_violation() {
        let harness = Harness::new();
        harness.storage.insert("file", vec![0u8; 600]);
        let mut section = harness.section(Direction::Read, "file");
        section.start();

        let step = section.handle(packet(Packet::Ack(9)));
        assert!(matches!(
            step.reply,
            Some(Packet::Error { code: ErrorCode::IllegalOperation, .. })
        ));
        assert_eq!(step.outcome, Some(SectionStatus::Error));
        assert_eq!(section.state(), &SectionState::Failed);
        assert!(section.error_msg().unwrap().contains("block 9"));

        section.finish(SectionStatus::Error);
        assert_eq!(harness.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_opcode_for_direction_fails() {
        let harness = Harness::new();
        harness.storage.insert("file", vec![0u8; 10]);
        let mut section = harness.section(Direction::Read, "file");
        section.start();

        let step = section.handle(packet(data(1, 10)));
        assert!(matches!(
            step.reply,
            Some(Packet::Error { code: ErrorCode::IllegalOperation, .. })
        ));
    }

    #[test]
    fn test_write_acks_each_block_and_dedups() {
        let harness = Harness::new();
        let mut section = harness.section(Direction::Write, "upload.bin");

        assert_eq!(section.start().reply, Some(Packet::Ack(0)));
        assert_eq!(section.handle(packet(data(1, 512))).reply, Some(Packet::Ack(1)));
        assert_eq!(section.handle(packet(data(1, 512))).reply, Some(Packet::Ack(1)));
        assert_eq!(section.handle(packet(data(2, 512))).reply, Some(Packet::Ack(2)));

        let last = section.handle(packet(data(3, 100)));
        assert_eq!(last, Transition::end(Some(Packet::Ack(3)), SectionStatus::Ok));

        section.finish(SectionStatus::Ok);
        assert_eq!(harness.storage.get("upload.bin").unwrap().len(), 2 * 512 + 100);
    }

    #[test]
    fn test_write_data_ahead_fails() {
        let harness = Harness::new();
        let mut section = harness.section(Direction::Write, "upload.bin");
        section.start();

        let step = section.handle(packet(data(5, 512)));
        assert_eq!(step.outcome, Some(SectionStatus::Error));
    }

    #[test]
    fn test_open_failure_skips_close() {
        let harness = Harness::new();
        let mut section = harness.section(Direction::Read, "missing.txt");

        let step = section.start();
        assert_eq!(
            step,
            Transition::end(Some(Packet::error(ErrorCode::FileNotFound)), SectionStatus::Error)
        );
        let id = section.id();
        section.finish(SectionStatus::Error);

        assert_eq!(harness.closed.load(Ordering::SeqCst), 0);
        assert_eq!(harness.finished(), vec![(id, SectionStatus::Error)]);
        assert!(harness.errors.get().unwrap().contains("missing.txt"));
    }

    #[test]
    fn test_missing_storage_fails_immediately() {
        let harness = Harness::new();
        let registry = CallbackRegistry::new();
        registry.register_open_file_callback(|_| Err(HostError::not_found()));
        let admission = harness
            .table
            .admit(
                SocketAddr::from(([127, 0, 0, 1], 40001)),
                "file".to_string(),
                TransferMode::Octet,
                Direction::Read,
                10,
            )
            .unwrap();
        let env = SectionEnv {
            table: Arc::clone(&harness.table),
            errors: Arc::clone(&harness.errors),
            timeout: Duration::from_secs(1),
            max_retries: 5,
        };
        let mut section = Section::new(admission.info, admission.clock, registry.snapshot(), env);

        let step = section.start();
        assert!(matches!(step.reply, Some(Packet::Error { code: ErrorCode::NotDefined, .. })));
        assert_eq!(step.outcome, Some(SectionStatus::Error));
        assert!(harness.errors.get().is_some());
    }

    #[test]
    fn test_timeouts_resend_then_fail() {
        let harness = Harness::new();
        harness.storage.insert("file", vec![3u8; 100]);
        let mut section = harness.section_with(Direction::Read, "file", Duration::ZERO, 2);

        let first = section.start().reply;
        assert_eq!(section.handle(SectionEvent::TimerExpired).reply, first);
        assert_eq!(section.handle(SectionEvent::TimerExpired).reply, first);

        let step = section.handle(SectionEvent::TimerExpired);
        assert!(matches!(step.reply, Some(Packet::Error { code: ErrorCode::NotDefined, .. })));
        assert_eq!(step.outcome, Some(SectionStatus::Error));

        // A late expiry after failure changes nothing
        assert_eq!(section.handle(SectionEvent::TimerExpired), Transition::idle());
    }

    #[test]
    fn test_timer_not_elapsed_is_ignored() {
        let harness = Harness::new();
        harness.storage.insert("file", vec![3u8; 100]);
        let mut section = harness.section_with(Direction::Read, "file", Duration::from_secs(60), 2);
        section.start();

        assert_eq!(section.handle(SectionEvent::TimerExpired), Transition::idle());
    }

    #[test]
    fn test_duplicate_does_not_reset_retries() {
        let harness = Harness::new();
        let mut section = harness.section_with(Direction::Write, "upload", Duration::ZERO, 3);
        section.start();
        section.handle(SectionEvent::TimerExpired);
        section.handle(packet(data(0, 512)));

        match section.state() {
            SectionState::Active(progress) => assert_eq!(progress.retries, 1),
            state => panic!("unexpected state {:?}", state),
        }
    }

    #[test]
    fn test_peer_error_ends_without_reply() {
        let harness = Harness::new();
        let mut section = harness.section(Direction::Write, "upload");
        section.start();

        let step = section.handle(packet(Packet::Error {
            code: ErrorCode::DiskFull,
            msg: "full".to_string(),
        }));
        assert_eq!(step, Transition::end(None, SectionStatus::Error));
        assert!(section.error_msg().unwrap().contains("full"));
    }

    #[test]
    fn test_malformed_datagram_is_dropped() {
        let harness = Harness::new();
        let mut section = harness.section(Direction::Write, "upload");
        section.start();
        section.handle(packet(data(1, 512)));

        let step = section.handle(SectionEvent::Datagram(Err(PacketError::TooShort { len: 1 })));
        assert_eq!(step, Transition::idle());
        match section.state() {
            SectionState::Active(progress) => assert_eq!(progress.block, 1),
            state => panic!("unexpected state {:?}", state),
        }
        assert!(section.error_msg().is_none());

        assert_eq!(section.handle(packet(data(2, 10))).outcome, Some(SectionStatus::Ok));
        assert_eq!(section.finish(SectionStatus::Ok), SectionStatus::Ok);
        assert_eq!(harness.storage.get("upload").unwrap().len(), 512 + 10);
    }

    #[test]
    fn test_failed_upload_keeps_previous_contents() {
        let harness = Harness::new();
        harness.storage.insert("cfg", b"good config".to_vec());
        let mut section = harness.section(Direction::Write, "cfg");
        section.start();
        assert_eq!(section.handle(packet(Packet::Data { block_num: 1, data: vec![0xEE; 512] })).reply, Some(Packet::Ack(1)));

        let step = section.handle(packet(Packet::Error {
            code: ErrorCode::NotDefined,
            msg: "cancelled".to_string(),
        }));
        assert_eq!(step.outcome, Some(SectionStatus::Error));
        assert_eq!(section.finish(SectionStatus::Error), SectionStatus::Error);

        assert_eq!(harness.closed.load(Ordering::SeqCst), 1);
        assert_eq!(harness.storage.get("cfg").unwrap(), b"good config");
    }

    #[test]
    fn test_netascii_read_translates_line_endings() {
        let harness = Harness::new();
        harness.storage.insert("motd", b"hello\nworld\r".to_vec());
        let mut section = harness.section_in(TransferMode::Netascii, Direction::Read, "motd");

        assert_eq!(
            section.start().reply,
            Some(Packet::Data {
                block_num: 1,
                data: b"hello\r\nworld\r\0".to_vec()
            })
        );
        assert_eq!(section.handle(packet(Packet::Ack(1))).outcome, Some(SectionStatus::Ok));
    }

    #[test]
    fn test_netascii_write_carries_cr_across_blocks() {
        let harness = Harness::new();
        let mut section = harness.section_in(TransferMode::Netascii, Direction::Write, "notes.txt");
        section.start();

        let mut first = vec![b'x'; SEGMENT_SIZE - 1];
        first.push(b'\r');
        assert_eq!(section.handle(packet(Packet::Data { block_num: 1, data: first })).reply, Some(Packet::Ack(1)));
        let step = section.handle(packet(Packet::Data {
            block_num: 2,
            data: b"\nend\r\0".to_vec(),
        }));
        assert_eq!(step.outcome, Some(SectionStatus::Ok));
        section.finish(SectionStatus::Ok);

        let mut expected = vec![b'x'; SEGMENT_SIZE - 1];
        expected.extend_from_slice(b"\nend\r");
        assert_eq!(harness.storage.get("notes.txt").unwrap(), expected);
    }

    #[test]
    fn test_callbacks_fire_in_order_with_one_id() {
        let harness = Harness::new();
        harness.storage.insert("file", b"abc".to_vec());
        let events = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&events);
        harness
            .registry
            .register_section_started_callback(move |id| log.lock().unwrap().push(("started", id)));
        let log = Arc::clone(&events);
        let storage = Arc::clone(&harness.storage);
        harness.registry.register_open_file_callback(move |info| {
            log.lock().unwrap().push(("open", info.id));
            storage.open(info)
        });
        let log = Arc::clone(&events);
        let storage = Arc::clone(&harness.storage);
        harness.registry.register_close_file_callback(move |id, file| {
            log.lock().unwrap().push(("close", id));
            storage.close(id, file)
        });
        let log = Arc::clone(&events);
        harness
            .registry
            .register_section_finished_callback(move |id, _| log.lock().unwrap().push(("finished", id)));

        let mut section = harness.section(Direction::Read, "file");
        let id = section.id();
        section.start();
        // A repeated request is not a new section
        section.handle(packet(Packet::Rrq {
            filename: "file".to_string(),
            mode: TransferMode::Octet,
        }));
        section.handle(packet(Packet::Ack(1)));
        section.finish(SectionStatus::Ok);

        assert_eq!(
            *events.lock().unwrap(),
            vec![("started", id), ("open", id), ("close", id), ("finished", id)]
        );
    }

    #[test]
    fn test_read_block_numbers_wrap() {
        let harness = Harness::new();
        let size = 65_536 * SEGMENT_SIZE as u64 + 100;
        harness
            .registry
            .register_open_file_callback(move |_| Ok(Box::new(Synthetic::new(size)) as FileHandle));
        let mut section = harness.section(Direction::Read, "huge.img");

        assert!(matches!(section.start().reply, Some(Packet::Data { block_num: 1, .. })));
        for block in 1..u16::MAX {
            let reply = section.handle(packet(Packet::Ack(block))).reply;
            assert!(
                matches!(reply, Some(Packet::Data { block_num, .. }) if block_num == block + 1),
                "after ACK {}",
                block
            );
        }

        let wrapped = section.handle(packet(Packet::Ack(u16::MAX))).reply.unwrap();
        assert_eq!(wrapped, Packet::Data { block_num: 0, data: vec![0x42; SEGMENT_SIZE] });
        // Duplicate of the ACK before the wrap resends block 0
        assert_eq!(section.handle(packet(Packet::Ack(u16::MAX))).reply, Some(wrapped));
        // Older ACKs from before the wrap are ignored
        assert_eq!(section.handle(packet(Packet::Ack(u16::MAX - 1))), Transition::idle());

        let last = section.handle(packet(Packet::Ack(0))).reply.unwrap();
        assert_eq!(last, Packet::Data { block_num: 1, data: vec![0x42; 100] });
        assert_eq!(section.handle(packet(Packet::Ack(1))).outcome, Some(SectionStatus::Ok));
    }

    #[test]
    fn test_write_block_numbers_wrap() {
        let harness = Harness::new();
        let written = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&written);
        harness.registry.register_open_file_callback(move |_| {
            let file: FileHandle = Box::new(Synthetic {
                remaining: 0,
                written: Arc::clone(&sink),
            });
            Ok(file)
        });
        let mut section = harness.section(Direction::Write, "huge.img");

        assert_eq!(section.start().reply, Some(Packet::Ack(0)));
        for block in 1..=u16::MAX {
            assert_eq!(section.handle(packet(data(block, SEGMENT_SIZE))).reply, Some(Packet::Ack(block)));
        }

        assert_eq!(section.handle(packet(data(0, SEGMENT_SIZE))).reply, Some(Packet::Ack(0)));
        // Duplicate of block 0 is acknowledged again, block 65535 is stale
        assert_eq!(section.handle(packet(data(0, SEGMENT_SIZE))).reply, Some(Packet::Ack(0)));
        assert_eq!(section.handle(packet(data(u16::MAX, SEGMENT_SIZE))), Transition::idle());

        let last = section.handle(packet(data(1, 7)));
        assert_eq!(last, Transition::end(Some(Packet::Ack(1)), SectionStatus::Ok));
        assert_eq!(written.load(Ordering::SeqCst), 65_536 * SEGMENT_SIZE as u64 + 7);
    }

    #[test]
    fn test_repeated_request_resends_first_reply_only() {
        let harness = Harness::new();
        harness.storage.insert("file", vec![9u8; 700]);
        let mut section = harness.section(Direction::Read, "file");
        let first = section.start().reply;

        let rrq = Packet::Rrq {
            filename: "file".to_string(),
            mode: TransferMode::Octet,
        };
        assert_eq!(section.handle(packet(rrq.clone())).reply, first);
        section.handle(packet(Packet::Ack(1)));
        assert_eq!(section.handle(packet(rrq)), Transition::idle());
    }

    #[test]
    fn test_shutdown_fails_active_section() {
        let harness = Harness::new();
        let mut section = harness.section(Direction::Write, "upload");
        section.start();

        let step = section.handle(SectionEvent::Shutdown);
        assert_eq!(step.outcome, Some(SectionStatus::Error));
        assert_eq!(section.finish(SectionStatus::Error), SectionStatus::Error);
        assert_eq!(harness.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_failure_turns_success_into_error() {
        let harness = Harness::new();
        harness.storage.insert("file", b"abc".to_vec());
        harness
            .registry
            .register_close_file_callback(|_, _| Err(HostError::new(ErrorCode::NotDefined, "flush failed")));
        let mut section = harness.section(Direction::Read, "file");

        section.start();
        assert_eq!(section.handle(packet(Packet::Ack(1))).outcome, Some(SectionStatus::Ok));
        assert_eq!(section.finish(SectionStatus::Ok), SectionStatus::Error);
        assert_eq!(section.state(), &SectionState::Failed);
        assert!(harness.errors.get().unwrap().contains("flush failed"));
    }
}
