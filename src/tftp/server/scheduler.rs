//! Retransmission timer
//!
//! Ticks at a quarter of the ack timeout and tells every section whose peer
//! has been silent for a full timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use super::table::SectionTable;

const MIN_TICK: Duration = Duration::from_millis(10);

pub(crate) fn tick_period(timeout: Duration) -> Duration {
    (timeout / 4).max(MIN_TICK)
}

pub(crate) async fn run(table: Arc<SectionTable>, timeout: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(tick_period(timeout));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let notified = table.notify_expired(Instant::now(), timeout);
                if notified > 0 {
                    log::trace!("Timer expired for {} section(s)", notified);
                }
            }
        }
    }
    log::debug!("Retransmission timer stopped");
}
