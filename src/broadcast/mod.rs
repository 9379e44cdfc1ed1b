//! Store-and-forward broadcast plumbing: one BBS transport multiplexed
//! into content-typed channels.

pub mod router;

pub use router::{BroadcastRouter, DEDUP_CACHE_SIZE};

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::Timestamp;

/// Content channels multiplexed over the bus. The byte value is the wire
/// tag; never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BroadcastContentType {
    SwapOffers = 0,
    SoftwareUpdates = 1,
    ExchangeRates = 2,
}

impl BroadcastContentType {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::SwapOffers,
            1 => Self::SoftwareUpdates,
            2 => Self::ExchangeRates,
            _ => return None,
        })
    }
}

/// Consumer of one content channel. Returning `true` confirms a successful
/// parse; `false` flags the payload as malformed so it is not forwarded.
pub trait BroadcastListener: Send + Sync {
    fn on_message(&self, timestamp: Timestamp, payload: &[u8]) -> bool;
}

/// Outbound half of the BBS bus.
pub trait BbsTransport: Send + Sync {
    fn publish(&self, frame: &[u8]);
}

/// Process-local bus delivering every published frame to all attached
/// routers, the sender's included. Test and harness transport.
#[derive(Default)]
pub struct InMemoryBbsBus {
    routers: Mutex<Vec<Weak<BroadcastRouter>>>,
    clock: Mutex<Timestamp>,
}

impl InMemoryBbsBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, router: &Arc<BroadcastRouter>) {
        self.routers.lock().push(Arc::downgrade(router));
    }
}

impl BbsTransport for InMemoryBbsBus {
    fn publish(&self, frame: &[u8]) {
        let timestamp = {
            let mut clock = self.clock.lock();
            *clock += 1;
            *clock
        };
        let routers: Vec<Arc<BroadcastRouter>> = self
            .routers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for router in routers {
            router.handle_frame(timestamp, frame);
        }
    }
}
