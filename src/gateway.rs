//! Outbound edge of the transaction engine. The supervisor implements this
//! in production; tests drive machines against [`StubGateway`].

use parking_lot::Mutex;

use crate::params::TxParamsMessage;
use crate::types::{ChainState, KernelId, TxId, WalletId};

/// Everything a transaction state machine may ask of its host.
pub trait Gateway: Send + Sync {
    /// Store-and-forward, best-effort delivery to the peer.
    fn send_tx_params(&self, peer: WalletId, msg: TxParamsMessage);

    /// Ask the node for a Merkle proof of the kernel; the result arrives
    /// through a later `update`.
    fn confirm_kernel(&self, tx_id: TxId, kernel_id: KernelId);

    /// Synchronous read of the latest known tip.
    fn get_tip(&self) -> Option<ChainState>;

    /// Subscribe this transfer to the next tip change.
    fn update_on_next_tip(&self, tx_id: TxId);

    /// The transfer reached a terminal status.
    fn on_tx_completed(&self, tx_id: TxId);

    /// Ref-counted re-entrancy markers bracketing asynchronous work.
    fn async_started(&self);
    fn async_finished(&self);
}

/// Recording gateway for tests and local harnesses.
#[derive(Default)]
pub struct StubGateway {
    tip: Mutex<Option<ChainState>>,
    sent: Mutex<Vec<(WalletId, TxParamsMessage)>>,
    kernel_requests: Mutex<Vec<(TxId, KernelId)>>,
    next_tip_subscriptions: Mutex<Vec<TxId>>,
    completed: Mutex<Vec<TxId>>,
    async_depth: Mutex<i64>,
}

impl StubGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tip(self, tip: ChainState) -> Self {
        *self.tip.lock() = Some(tip);
        self
    }

    pub fn set_tip(&self, tip: ChainState) {
        *self.tip.lock() = Some(tip);
    }

    pub fn sent_messages(&self) -> Vec<(WalletId, TxParamsMessage)> {
        self.sent.lock().clone()
    }

    pub fn kernel_requests(&self) -> Vec<(TxId, KernelId)> {
        self.kernel_requests.lock().clone()
    }

    pub fn next_tip_subscriptions(&self) -> Vec<TxId> {
        self.next_tip_subscriptions.lock().clone()
    }

    pub fn completed(&self) -> Vec<TxId> {
        self.completed.lock().clone()
    }

    pub fn async_depth(&self) -> i64 {
        *self.async_depth.lock()
    }
}

impl Gateway for StubGateway {
    fn send_tx_params(&self, peer: WalletId, msg: TxParamsMessage) {
        self.sent.lock().push((peer, msg));
    }

    fn confirm_kernel(&self, tx_id: TxId, kernel_id: KernelId) {
        self.kernel_requests.lock().push((tx_id, kernel_id));
    }

    fn get_tip(&self) -> Option<ChainState> {
        self.tip.lock().clone()
    }

    fn update_on_next_tip(&self, tx_id: TxId) {
        self.next_tip_subscriptions.lock().push(tx_id);
    }

    fn on_tx_completed(&self, tx_id: TxId) {
        self.completed.lock().push(tx_id);
    }

    fn async_started(&self) {
        *self.async_depth.lock() += 1;
    }

    fn async_finished(&self) {
        *self.async_depth.lock() -= 1;
    }
}
