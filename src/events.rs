//! Model-change fan-out towards the host application. One observer sink is
//! registered at a time; dispatch is at-least-once from the engine's view,
//! so observers must be idempotent.

use std::sync::Weak;

use parking_lot::Mutex;

use crate::types::{
    Amount, ChangeAction, Coin, ExchangeRate, Height, TxDescription, TxId, WalletAddress,
};

/// Aggregated balance snapshot delivered with `on_status`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalletStatus {
    pub available: Amount,
    pub maturing: Amount,
    pub receiving: Amount,
    pub sending: Amount,
    pub current_height: Height,
}

/// Callback surface observed by the host UI bridge.
pub trait WalletObserver: Send + Sync {
    fn on_status(&self, _status: &WalletStatus) {}
    fn on_tx_status(&self, _action: ChangeAction, _items: &[TxDescription]) {}
    fn on_all_utxo_changed(&self, _coins: &[Coin]) {}
    fn on_addresses_changed(&self, _action: ChangeAction, _items: &[WalletAddress]) {}
    fn on_exchange_rates(&self, _rates: &[ExchangeRate]) {}
    fn on_notifications_changed(&self) {}
    fn on_sync_progress(&self, _done: u32, _total: u32) {}
    fn on_payment_proof_exported(&self, _tx_id: TxId, _proof: &[u8]) {}
}

/// Single-sink dispatcher; a gone observer turns every call into a no-op.
#[derive(Default)]
pub struct EventFanOut {
    sink: Mutex<Option<Weak<dyn WalletObserver>>>,
}

impl EventFanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_observer(&self, observer: Weak<dyn WalletObserver>) {
        *self.sink.lock() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.sink.lock() = None;
    }

    fn with_sink(&self, dispatch: impl FnOnce(&dyn WalletObserver)) {
        let sink = self.sink.lock().clone();
        if let Some(observer) = sink.and_then(|weak| weak.upgrade()) {
            dispatch(observer.as_ref());
        }
    }

    pub fn status(&self, status: &WalletStatus) {
        self.with_sink(|observer| observer.on_status(status));
    }

    pub fn tx_status(&self, action: ChangeAction, items: &[TxDescription]) {
        self.with_sink(|observer| observer.on_tx_status(action, items));
    }

    pub fn all_utxo_changed(&self, coins: &[Coin]) {
        self.with_sink(|observer| observer.on_all_utxo_changed(coins));
    }

    pub fn addresses_changed(&self, action: ChangeAction, items: &[WalletAddress]) {
        self.with_sink(|observer| observer.on_addresses_changed(action, items));
    }

    pub fn exchange_rates(&self, rates: &[ExchangeRate]) {
        self.with_sink(|observer| observer.on_exchange_rates(rates));
    }

    pub fn notifications_changed(&self) {
        self.with_sink(|observer| observer.on_notifications_changed());
    }

    pub fn sync_progress(&self, done: u32, total: u32) {
        self.with_sink(|observer| observer.on_sync_progress(done, total));
    }

    pub fn payment_proof_exported(&self, tx_id: TxId, proof: &[u8]) {
        self.with_sink(|observer| observer.on_payment_proof_exported(tx_id, proof));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct CountingObserver {
        calls: Mutex<u32>,
    }

    impl WalletObserver for CountingObserver {
        fn on_sync_progress(&self, _done: u32, _total: u32) {
            *self.calls.lock() += 1;
        }
    }

    #[test]
    fn dropped_observer_is_a_no_op() {
        let fan_out = EventFanOut::new();
        let observer = Arc::new(CountingObserver::default());
        fan_out.set_observer(Arc::downgrade(&observer) as Weak<dyn WalletObserver>);

        fan_out.sync_progress(1, 2);
        assert_eq!(*observer.calls.lock(), 1);

        let weak = Arc::downgrade(&observer) as Weak<dyn WalletObserver>;
        drop(observer);
        fan_out.set_observer(weak);
        // Does not panic, does not dispatch.
        fan_out.sync_progress(2, 2);
    }
}
