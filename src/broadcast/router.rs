//! Content-typed dispatch over the BBS bus. Inbound frames are
//! deduplicated by content hash before any listener sees them.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::broadcast::{BbsTransport, BroadcastContentType, BroadcastListener};
use crate::types::Timestamp;

/// Wire framing version.
const PROTOCOL_VERSION: u8 = 1;

/// Entries kept in the duplicate-suppression LRU.
pub const DEDUP_CACHE_SIZE: usize = 512;

#[derive(Default)]
struct SeenCache {
    order: VecDeque<[u8; 32]>,
    seen: HashSet<[u8; 32]>,
}

impl SeenCache {
    /// Record a frame hash; returns false when it was already known.
    fn insert(&mut self, digest: [u8; 32]) -> bool {
        if !self.seen.insert(digest) {
            return false;
        }
        self.order.push_back(digest);
        while self.order.len() > DEDUP_CACHE_SIZE {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

#[derive(Default)]
struct RouterInner {
    listeners: Vec<(BroadcastContentType, Weak<dyn BroadcastListener>)>,
    seen: SeenCache,
}

/// Multiplexes one store-and-forward transport into content channels.
/// Listeners are weakly held and notified in registration order.
pub struct BroadcastRouter {
    transport: Arc<dyn BbsTransport>,
    inner: Mutex<RouterInner>,
}

impl BroadcastRouter {
    pub fn new(transport: Arc<dyn BbsTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            inner: Mutex::new(RouterInner::default()),
        })
    }

    pub fn register_listener(
        &self,
        content_type: BroadcastContentType,
        listener: &Arc<dyn BroadcastListener>,
    ) {
        self.inner
            .lock()
            .listeners
            .push((content_type, Arc::downgrade(listener)));
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn BroadcastListener>) {
        let target = Arc::downgrade(listener);
        self.inner
            .lock()
            .listeners
            .retain(|(_, registered)| !registered.ptr_eq(&target));
    }

    /// Frame a payload with its content tag and hand it to the bus.
    pub fn send_raw_message(&self, content_type: BroadcastContentType, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.push(PROTOCOL_VERSION);
        frame.push(content_type as u8);
        frame.extend_from_slice(payload);
        self.transport.publish(&frame);
    }

    /// Inbound frame from the bus. Malformed and duplicate frames are
    /// dropped without reaching listeners; failures stay local to the
    /// offending message.
    pub fn handle_frame(&self, timestamp: Timestamp, frame: &[u8]) {
        if frame.len() < 2 || frame[0] != PROTOCOL_VERSION {
            debug!("dropping frame with unknown framing");
            return;
        }
        let content_type = match BroadcastContentType::from_u8(frame[1]) {
            Some(content_type) => content_type,
            None => {
                debug!(tag = frame[1], "dropping frame with unknown content type");
                return;
            }
        };

        let digest: [u8; 32] = Sha256::digest(frame).into();
        let listeners: Vec<Arc<dyn BroadcastListener>> = {
            let mut inner = self.inner.lock();
            if !inner.seen.insert(digest) {
                debug!(?content_type, "dropping duplicate frame");
                return;
            }
            inner
                .listeners
                .iter()
                .filter(|(registered_type, _)| *registered_type == content_type)
                .filter_map(|(_, listener)| listener.upgrade())
                .collect()
        };

        let payload = &frame[2..];
        for listener in listeners {
            if !listener.on_message(timestamp, payload) {
                debug!(?content_type, "listener rejected malformed payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::InMemoryBbsBus;

    struct RecordingListener {
        received: Mutex<Vec<Vec<u8>>>,
        accept: bool,
    }

    impl RecordingListener {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                accept,
            })
        }

        fn received(&self) -> Vec<Vec<u8>> {
            self.received.lock().clone()
        }
    }

    impl BroadcastListener for RecordingListener {
        fn on_message(&self, _timestamp: Timestamp, payload: &[u8]) -> bool {
            self.received.lock().push(payload.to_vec());
            self.accept
        }
    }

    #[test]
    fn routes_by_content_type() {
        let bus = InMemoryBbsBus::new();
        let router = BroadcastRouter::new(bus.clone());
        bus.attach(&router);

        let offers = RecordingListener::new(true);
        let rates = RecordingListener::new(true);
        router.register_listener(
            BroadcastContentType::SwapOffers,
            &(offers.clone() as Arc<dyn BroadcastListener>),
        );
        router.register_listener(
            BroadcastContentType::ExchangeRates,
            &(rates.clone() as Arc<dyn BroadcastListener>),
        );

        router.send_raw_message(BroadcastContentType::SwapOffers, b"offer");
        router.send_raw_message(BroadcastContentType::ExchangeRates, b"rate");

        assert_eq!(offers.received(), vec![b"offer".to_vec()]);
        assert_eq!(rates.received(), vec![b"rate".to_vec()]);
    }

    #[test]
    fn duplicate_frames_are_suppressed() {
        let bus = InMemoryBbsBus::new();
        let router = BroadcastRouter::new(bus.clone());
        bus.attach(&router);

        let listener = RecordingListener::new(true);
        router.register_listener(
            BroadcastContentType::SwapOffers,
            &(listener.clone() as Arc<dyn BroadcastListener>),
        );

        router.send_raw_message(BroadcastContentType::SwapOffers, b"same");
        router.send_raw_message(BroadcastContentType::SwapOffers, b"same");
        router.send_raw_message(BroadcastContentType::SwapOffers, b"other");

        assert_eq!(listener.received().len(), 2);
    }

    #[test]
    fn unregistered_and_dropped_listeners_stop_receiving() {
        let bus = InMemoryBbsBus::new();
        let router = BroadcastRouter::new(bus.clone());
        bus.attach(&router);

        let listener = RecordingListener::new(true);
        let handle = listener.clone() as Arc<dyn BroadcastListener>;
        router.register_listener(BroadcastContentType::SwapOffers, &handle);

        router.send_raw_message(BroadcastContentType::SwapOffers, b"one");
        router.unregister_listener(&handle);
        router.send_raw_message(BroadcastContentType::SwapOffers, b"two");
        assert_eq!(listener.received().len(), 1);
    }

    #[test]
    fn malformed_frames_are_dropped_before_listeners() {
        let bus = InMemoryBbsBus::new();
        let router = BroadcastRouter::new(bus.clone());
        bus.attach(&router);

        let listener = RecordingListener::new(true);
        router.register_listener(
            BroadcastContentType::SwapOffers,
            &(listener.clone() as Arc<dyn BroadcastListener>),
        );

        router.handle_frame(1, &[]);
        router.handle_frame(2, &[PROTOCOL_VERSION]);
        router.handle_frame(3, &[PROTOCOL_VERSION + 1, 0, 1]);
        router.handle_frame(4, &[PROTOCOL_VERSION, 200, 1]);
        assert!(listener.received().is_empty());
    }
}
