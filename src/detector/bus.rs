//! Process-wide proposal channel.
//!
//! A `tokio::sync::broadcast` channel: every receiver (audit, alerting,
//! deviation store) sees every event independently. Publishing never blocks
//! and never fails the caller; with no receivers the event is dropped, and a
//! lagging receiver loses the oldest events.

use tokio::sync::broadcast;
use tracing::debug;

use crate::config::defaults;
use crate::types::ProposalEvent;

#[derive(Clone)]
pub struct ProposalBus {
    tx: broadcast::Sender<ProposalEvent>,
}

impl ProposalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProposalEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget. Returns the number of receivers reached.
    pub fn publish(&self, event: ProposalEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                debug!(deviation_id = %event.deviation.id, "Proposal dropped, no receivers");
                0
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProposalBus {
    fn default() -> Self {
        Self::new(defaults::PROPOSAL_BUS_CAPACITY)
    }
}
