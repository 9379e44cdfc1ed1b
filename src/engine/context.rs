//! Self-reschedule machinery for re-entrant state machines. A scheduled
//! update is a queued TxId, resolved against the live transaction table
//! when it fires; a transfer dropped in the meantime is a no-op.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use crate::gateway::Gateway;
use crate::types::TxId;

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<TxId>,
    scheduled: HashSet<TxId>,
}

/// Idempotent per-transfer update scheduler. Every pending entry is
/// bracketed by `async_started`/`async_finished` on the gateway.
#[derive(Default)]
pub struct UpdateQueue {
    inner: Mutex<QueueInner>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an update for `tx_id` unless one is already pending. Returns
    /// whether a new event was posted.
    pub fn schedule(&self, tx_id: TxId, gateway: &dyn Gateway) -> bool {
        let mut inner = self.inner.lock();
        if !inner.scheduled.insert(tx_id) {
            return false;
        }
        inner.queue.push_back(tx_id);
        gateway.async_started();
        true
    }

    /// Pop the next pending transfer, releasing its event so the update may
    /// reschedule itself. The caller owes one `async_finished` per pop.
    pub fn take_next(&self) -> Option<TxId> {
        let mut inner = self.inner.lock();
        let tx_id = inner.queue.pop_front()?;
        inner.scheduled.remove(&tx_id);
        Some(tx_id)
    }

    pub fn is_scheduled(&self, tx_id: &TxId) -> bool {
        self.inner.lock().scheduled.contains(tx_id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StubGateway;

    #[test]
    fn schedule_is_idempotent_until_taken() {
        let queue = UpdateQueue::new();
        let gateway = StubGateway::new();
        let tx_id = TxId::generate();

        assert!(queue.schedule(tx_id, &gateway));
        assert!(!queue.schedule(tx_id, &gateway));
        assert_eq!(gateway.async_depth(), 1);

        assert_eq!(queue.take_next(), Some(tx_id));
        gateway.async_finished();
        assert!(queue.take_next().is_none());

        // Released events may be re-armed.
        assert!(queue.schedule(tx_id, &gateway));
        assert!(queue.is_scheduled(&tx_id));
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let queue = UpdateQueue::new();
        let gateway = StubGateway::new();
        let first = TxId::generate();
        let second = TxId::generate();
        queue.schedule(first, &gateway);
        queue.schedule(second, &gateway);
        assert_eq!(queue.take_next(), Some(first));
        assert_eq!(queue.take_next(), Some(second));
    }
}
