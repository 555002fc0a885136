// =============================================================================
// Lossy Broadcast — non-blocking fan-out from the feed to its consumers
// =============================================================================
//
// The feed must never wait on a slow consumer. Each registered sink gets a
// `try_send`; a full buffer drops the event for that sink only. Contrast with
// the candle streamer's emission, which awaits every subscriber.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

/// After the first drop, lag is reported again every this many drops.
const DROP_REPORT_EVERY: u64 = 1_000;

pub struct LossyBroadcast<T> {
    name: &'static str,
    sinks: Vec<mpsc::Sender<T>>,
    dropped: AtomicU64,
}

/// Result of one [`LossyBroadcast::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

impl<T: Clone> LossyBroadcast<T> {
    pub fn new(name: &'static str, sinks: Vec<mpsc::Sender<T>>) -> Self {
        Self {
            name,
            sinks,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, item: T) -> PublishOutcome {
        let mut outcome = PublishOutcome {
            delivered: 0,
            dropped: 0,
            closed: 0,
        };

        for (idx, sink) in self.sinks.iter().enumerate() {
            match sink.try_send(item.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if should_report_drops(total) {
                        warn!(broadcast = self.name, sink = idx, dropped_total = total, "consumer lagging, events dropped");
                    } else {
                        trace!(broadcast = self.name, sink = idx, "sink full, event dropped");
                    }
                }
                Err(TrySendError::Closed(_)) => outcome.closed += 1,
            }
        }

        outcome
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// True once sinks were registered and every one of them is gone.
    pub fn all_closed(&self) -> bool {
        !self.sinks.is_empty() && self.sinks.iter().all(|s| s.is_closed())
    }

    /// Total events dropped because a sink was full.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn should_report_drops(total: u64) -> bool {
    total == 1 || total % DROP_REPORT_EVERY == 0
}
