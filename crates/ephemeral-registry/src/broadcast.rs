//! Fan-out of registry events to connected observers

use crate::types::RegistryEvent;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Best-effort event fan-out.
///
/// Emitting never waits on observers: each receiver has a bounded backlog and
/// an observer that falls behind sees `RecvError::Lagged` instead of slowing
/// the sender down.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<RegistryEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver `event` to every current subscriber. Returns how many
    /// subscribers it was queued for.
    pub fn emit(&self, event: RegistryEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                trace!(?event, "No observers connected, event dropped");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
