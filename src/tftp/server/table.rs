//! Section table
//!
//! Maps client endpoints and section ids to live sections. The table is
//! shared by the dispatcher, the scheduler and every section; its lock only
//! guards the maps and is never held while a section does work.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::mpsc;

use super::section::{Direction, SectionEvent, SectionId, SectionInfo, SectionStatus};
use crate::tftp::core::TransferMode;

/// Events a section may have queued before new datagrams are dropped
pub const INBOX_CAPACITY: usize = 1024;

/// Last-activity clock of one section, shared with the scheduler
#[derive(Debug, Default)]
pub struct SectionClock {
    state: Mutex<ClockState>,
}

#[derive(Debug, Default)]
struct ClockState {
    /// `None` while the section is not waiting on the peer
    last_activity: Option<Instant>,
    expiry_pending: bool,
}

impl SectionClock {
    pub fn rearm(&self) {
        let mut state = self.lock();
        state.last_activity = Some(Instant::now());
        state.expiry_pending = false;
    }

    pub fn disarm(&self) {
        let mut state = self.lock();
        state.last_activity = None;
        state.expiry_pending = false;
    }

    /// Scheduler side: true once per expiry, until the section handles it
    pub fn poll_expired(&self, now: Instant, timeout: Duration) -> bool {
        let mut state = self.lock();
        let expired = state
            .last_activity
            .is_some_and(|last| now.saturating_duration_since(last) >= timeout);
        if expired && !state.expiry_pending {
            state.expiry_pending = true;
            return true;
        }
        false
    }

    /// The expiry could not be delivered; report it again on the next poll
    pub fn withdraw_expiry(&self) {
        self.lock().expiry_pending = false;
    }

    /// Section side: whether the timeout really elapsed
    pub fn take_expired(&self, timeout: Duration) -> bool {
        let mut state = self.lock();
        state.expiry_pending = false;
        state.last_activity.is_some_and(|last| last.elapsed() >= timeout)
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("section limit of {0} reached")]
    Full(usize),
    #[error("{0} already has an active section")]
    Busy(SocketAddr),
}

/// Everything a newly admitted section needs to run
#[derive(Debug)]
pub struct Admission {
    pub info: SectionInfo,
    pub inbox: mpsc::Receiver<SectionEvent>,
    pub clock: Arc<SectionClock>,
}

#[derive(Debug)]
struct SectionEntry {
    info: SectionInfo,
    status: SectionStatus,
    inbox: mpsc::Sender<SectionEvent>,
    clock: Arc<SectionClock>,
}

#[derive(Debug, Default)]
struct Sections {
    by_id: HashMap<SectionId, SectionEntry>,
    by_peer: HashMap<SocketAddr, SectionId>,
}

#[derive(Debug)]
pub struct SectionTable {
    sections: Mutex<Sections>,
    next_id: AtomicU64,
}

impl Default for SectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionTable {
    pub fn new() -> Self {
        Self {
            sections: Mutex::new(Sections::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a section for `client`, allocating a fresh id
    pub fn admit(
        &self,
        client: SocketAddr,
        filename: String,
        mode: TransferMode,
        direction: Direction,
        limit: usize,
    ) -> Result<Admission, AdmitError> {
        let mut sections = self.lock();
        if sections.by_peer.contains_key(&client) {
            return Err(AdmitError::Busy(client));
        }
        if sections.by_id.len() >= limit {
            return Err(AdmitError::Full(limit));
        }

        let id = SectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = SectionInfo {
            id,
            client,
            filename,
            mode,
            direction,
            started_at: Local::now(),
        };
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let clock = Arc::new(SectionClock::default());

        sections.by_peer.insert(client, id);
        sections.by_id.insert(
            id,
            SectionEntry {
                info: info.clone(),
                status: SectionStatus::Ok,
                inbox: tx,
                clock: Arc::clone(&clock),
            },
        );

        Ok(Admission {
            info,
            inbox: rx,
            clock,
        })
    }

    /// Inbox of the section serving `peer`, if any
    pub fn route(&self, peer: SocketAddr) -> Option<mpsc::Sender<SectionEvent>> {
        let sections = self.lock();
        let id = sections.by_peer.get(&peer)?;
        sections.by_id.get(id).map(|entry| entry.inbox.clone())
    }

    pub fn set_status(&self, id: SectionId, status: SectionStatus) {
        if let Some(entry) = self.lock().by_id.get_mut(&id) {
            entry.status = status;
        }
    }

    pub fn remove(&self, id: SectionId) -> bool {
        let mut sections = self.lock();
        match sections.by_id.remove(&id) {
            Some(entry) => {
                sections.by_peer.remove(&entry.info.client);
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: SectionId) -> SectionStatus {
        self.lock()
            .by_id
            .get(&id)
            .map_or(SectionStatus::Undefined, |entry| entry.status)
    }

    pub fn info(&self, id: SectionId) -> Option<SectionInfo> {
        self.lock().by_id.get(&id).map(|entry| entry.info.clone())
    }

    pub fn id_for(&self, peer: SocketAddr) -> Option<SectionId> {
        self.lock().by_peer.get(&peer).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell every section whose timer ran out since the last poll, returning how many were told
    ///
    /// An expiry that finds the inbox full is reported again on a later poll.
    pub fn notify_expired(&self, now: Instant, timeout: Duration) -> usize {
        let sections = self.lock();
        let mut notified = 0;
        for entry in sections.by_id.values() {
            if !entry.clock.poll_expired(now, timeout) {
                continue;
            }
            match entry.inbox.try_send(SectionEvent::TimerExpired) {
                Ok(()) => notified += 1,
                Err(mpsc::error::TrySendError::Full(_)) => entry.clock.withdraw_expiry(),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        notified
    }

    /// Inboxes of every live section
    pub fn inboxes(&self) -> Vec<mpsc::Sender<SectionEvent>> {
        self.lock().by_id.values().map(|entry| entry.inbox.clone()).collect()
    }

    /// Drop every entry, returning how many there were
    pub fn clear(&self) -> usize {
        let mut sections = self.lock();
        sections.by_peer.clear();
        let count = sections.by_id.len();
        sections.by_id.clear();
        count
    }

    fn lock(&self) -> MutexGuard<'_, Sections> {
        self.sections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
