//! Wallet supervisor: owns the active transaction table, fans chain and
//! peer events into the per-transfer machines and implements the gateway
//! they talk back through.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bincode::Options as _;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::db::schema::WalletParam;
use crate::db::store::{StoreError, WalletStore};
use crate::engine::{SimpleTransfer, TxError, TxStateMachine, UpdateQueue};
use crate::events::{EventFanOut, WalletObserver, WalletStatus};
use crate::gateway::Gateway;
use crate::keykeeper::{KeyKeeper, KeyKeeperError, KeyUsage};
use crate::params::{TxParameterId, TxParamsMessage};
use crate::types::{
    now_timestamp, Amount, ChainState, ChangeAction, CoinStatus, Height, KernelId, TxId,
    TxStatus, TxType, WalletAddress, WalletId, MAX_HEIGHT,
};

/// Safety valve for one reactor tick; a healthy machine blocks long before.
const MAX_PUMP_ROUNDS: usize = 10_000;

/// Outbound peer-message transport (store-and-forward, best effort).
pub trait PeerEndpoint: Send + Sync {
    fn send_tx_params(&self, peer: WalletId, msg: &TxParamsMessage);
}

/// Node-facing surface the supervisor needs: proofs and tips.
pub trait NodeEndpoint: Send + Sync {
    fn request_kernel_proof(&self, tx_id: TxId, kernel_id: KernelId);
    fn tip(&self) -> Option<ChainState>;
}

/// Recording peer transport for tests and local harnesses.
#[derive(Default)]
pub struct StubPeerEndpoint {
    sent: Mutex<Vec<(WalletId, TxParamsMessage)>>,
}

impl StubPeerEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<(WalletId, TxParamsMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent(&self) -> Vec<(WalletId, TxParamsMessage)> {
        self.sent.lock().clone()
    }
}

impl PeerEndpoint for StubPeerEndpoint {
    fn send_tx_params(&self, peer: WalletId, msg: &TxParamsMessage) {
        self.sent.lock().push((peer, msg.clone()));
    }
}

/// Recording node endpoint with a configurable tip.
#[derive(Default)]
pub struct StubNodeEndpoint {
    tip: Mutex<Option<ChainState>>,
    requests: Mutex<Vec<(TxId, KernelId)>>,
}

impl StubNodeEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tip(&self, tip: ChainState) {
        *self.tip.lock() = Some(tip);
    }

    pub fn kernel_requests(&self) -> Vec<(TxId, KernelId)> {
        self.requests.lock().clone()
    }
}

impl NodeEndpoint for StubNodeEndpoint {
    fn request_kernel_proof(&self, tx_id: TxId, kernel_id: KernelId) {
        self.requests.lock().push((tx_id, kernel_id));
    }

    fn tip(&self) -> Option<ChainState> {
        self.tip.lock().clone()
    }
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    KeyKeeper(#[from] KeyKeeperError),
    #[error("no key keeper configured")]
    NoKeyKeeper,
}

struct WalletInner {
    store: Arc<WalletStore>,
    keykeeper: Option<Arc<dyn KeyKeeper>>,
    peers: Arc<dyn PeerEndpoint>,
    node: Arc<dyn NodeEndpoint>,
    queue: Arc<UpdateQueue>,
    active: Mutex<HashMap<TxId, Arc<TxStateMachine>>>,
    next_tip: Mutex<HashSet<TxId>>,
    async_pending: AtomicI64,
    events: EventFanOut,
}

impl Gateway for WalletInner {
    fn send_tx_params(&self, peer: WalletId, msg: TxParamsMessage) {
        self.peers.send_tx_params(peer, &msg);
    }

    fn confirm_kernel(&self, tx_id: TxId, kernel_id: KernelId) {
        self.node.request_kernel_proof(tx_id, kernel_id);
    }

    fn get_tip(&self) -> Option<ChainState> {
        self.node.tip()
    }

    fn update_on_next_tip(&self, tx_id: TxId) {
        self.next_tip.lock().insert(tx_id);
    }

    fn on_tx_completed(&self, tx_id: TxId) {
        let removed = self.active.lock().remove(&tx_id);
        if let Some(machine) = removed {
            machine.free_resources();
        }
        match self.store.tx_description(&tx_id) {
            Ok(Some(description)) => {
                self.events
                    .tx_status(ChangeAction::Updated, std::slice::from_ref(&description));
            }
            Ok(None) => {}
            Err(err) => warn!(tx = %tx_id, "completion event skipped: {err}"),
        }
        match self.store.coins() {
            Ok(coins) => self.events.all_utxo_changed(&coins),
            Err(err) => warn!(tx = %tx_id, "utxo event skipped: {err}"),
        }
        if let Ok(status) = load_status(&self.store) {
            self.events.status(&status);
        }
        debug!(tx = %tx_id, "transaction reached terminal status");
    }

    fn async_started(&self) {
        self.async_pending.fetch_add(1, Ordering::SeqCst);
    }

    fn async_finished(&self) {
        self.async_pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Single-threaded wallet core. All entry points are invoked from the
/// owning reactor thread; `run_pending` is the reactor tick that drains
/// self-scheduled updates.
pub struct Wallet {
    inner: Arc<WalletInner>,
    config: EngineConfig,
}

impl Wallet {
    pub fn new(
        store: Arc<WalletStore>,
        keykeeper: Option<Arc<dyn KeyKeeper>>,
        peers: Arc<dyn PeerEndpoint>,
        node: Arc<dyn NodeEndpoint>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WalletInner {
                store,
                keykeeper,
                peers,
                node,
                queue: Arc::new(UpdateQueue::new()),
                active: Mutex::new(HashMap::new()),
                next_tip: Mutex::new(HashSet::new()),
                async_pending: AtomicI64::new(0),
                events: EventFanOut::new(),
            }),
            config,
        }
    }

    pub fn store(&self) -> &Arc<WalletStore> {
        &self.inner.store
    }

    pub fn set_observer(&self, observer: std::sync::Weak<dyn WalletObserver>) {
        self.inner.events.set_observer(observer);
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Outstanding async operations across every machine; zero means the
    /// reactor is quiescent.
    pub fn outstanding_async(&self) -> i64 {
        self.inner.async_pending.load(Ordering::SeqCst)
    }

    // ---- address book ----

    /// Mint a new local address: allocates an own-id, derives the BBS key
    /// behind it and persists the entry.
    pub fn allocate_own_address(&self, label: &str) -> Result<WalletAddress, WalletError> {
        let keeper = self
            .inner
            .keykeeper
            .as_ref()
            .ok_or(WalletError::NoKeyKeeper)?;
        let own_id = self.inner.store.next_counter(WalletParam::NextOwnId)?;
        let wallet_id = keeper.derive_public(own_id, KeyUsage::Bbs)?;
        let address = WalletAddress {
            wallet_id,
            label: label.to_string(),
            category: String::new(),
            create_time: now_timestamp(),
            duration: WalletAddress::DURATION_FOREVER,
            own_id,
        };
        self.inner.store.save_address(&address)?;
        self.inner
            .events
            .addresses_changed(ChangeAction::Added, std::slice::from_ref(&address));
        Ok(address)
    }

    // ---- transaction lifecycle ----

    /// Kick off an outgoing simple transfer; returns once the machine is
    /// active and the current tick has drained.
    pub fn start_simple_transfer(
        &self,
        my_id: WalletId,
        peer_id: WalletId,
        amount: Amount,
        fee: Amount,
        message: Vec<u8>,
    ) -> Result<TxId, TxError> {
        if fee < self.config.min_fee {
            return Err(TxError::Fault(crate::engine::TxFault::new(
                crate::types::TxFailureReason::FeeTooLow,
                false,
            )));
        }
        let tx_id = TxId::generate();
        let store = &self.inner.store;
        store.set_parameter(&tx_id, TxParameterId::TransactionType, &TxType::Simple, true, 0)?;
        store.set_parameter(&tx_id, TxParameterId::IsSender, &true, false, 0)?;
        store.set_parameter(&tx_id, TxParameterId::IsInitiator, &true, false, 0)?;
        store.set_parameter(&tx_id, TxParameterId::Amount, &amount, true, 0)?;
        store.set_parameter(&tx_id, TxParameterId::Fee, &fee, true, 0)?;
        store.set_parameter(&tx_id, TxParameterId::MyId, &my_id, false, 0)?;
        store.set_parameter(&tx_id, TxParameterId::PeerId, &peer_id, false, 0)?;
        store.set_parameter(&tx_id, TxParameterId::Message, &message, true, 0)?;
        store.set_parameter(&tx_id, TxParameterId::Lifetime, &self.config.tx_lifetime, false, 0)?;
        store.set_parameter(
            &tx_id,
            TxParameterId::PeerResponseTime,
            &self.config.peer_response_time,
            true,
            0,
        )?;
        store.set_parameter(&tx_id, TxParameterId::CreateTime, &now_timestamp(), true, 0)?;
        store.set_parameter(&tx_id, TxParameterId::Status, &TxStatus::Pending, true, 0)?;
        if let Some(tip) = self.inner.node.tip() {
            store.set_parameter(&tx_id, TxParameterId::MinHeight, &tip.height, true, 0)?;
        }

        let machine = self.activate(tx_id, TxType::Simple)?;
        machine.update_async(&*self.inner);
        self.run_pending();
        Ok(tx_id)
    }

    /// Bring every resumable stored transfer back into the active table.
    pub fn resume_all(&self) -> Result<(), TxError> {
        for tx_id in self.inner.store.list_tx_ids()? {
            let description = match self.inner.store.tx_description(&tx_id)? {
                Some(description) => description,
                None => continue,
            };
            if !description.can_resume() || self.inner.active.lock().contains_key(&tx_id) {
                continue;
            }
            if let Ok(machine) = self.activate(tx_id, description.tx_type) {
                machine.update_async(&*self.inner);
            }
        }
        self.run_pending();
        Ok(())
    }

    pub fn cancel_transaction(&self, tx_id: TxId) -> Result<bool, TxError> {
        let machine = {
            let active = self.inner.active.lock();
            active.get(&tx_id).cloned()
        };
        let machine = match machine {
            Some(machine) => machine,
            None => {
                let tx_type = match self.inner.store.tx_description(&tx_id)? {
                    Some(description) => description.tx_type,
                    None => return Ok(false),
                };
                self.activate(tx_id, tx_type)?
            }
        };
        let cancelled = machine.cancel(&*self.inner)?;
        self.run_pending();
        Ok(cancelled)
    }

    // ---- event fan-in ----

    /// Inbound peer message addressed to `to`, one of our BBS endpoints.
    pub fn on_tx_message(&self, to: WalletId, msg: TxParamsMessage) -> Result<(), TxError> {
        let tx_id = msg.tx_id;
        let store = &self.inner.store;

        let known = store
            .get_parameter::<TxType>(&tx_id, TxParameterId::TransactionType, 0)?
            .is_some();
        if known {
            let status = store
                .get_parameter::<TxStatus>(&tx_id, TxParameterId::Status, 0)?
                .unwrap_or(TxStatus::Pending);
            // A message into a terminal transfer is a no-op.
            if status.is_terminal() {
                debug!(tx = %tx_id, "message for terminal transaction dropped");
                return Ok(());
            }
            // Once a peer is recorded, messages from anyone else are ignored.
            if let Some(peer_id) =
                store.get_parameter::<WalletId>(&tx_id, TxParameterId::PeerId, 0)?
            {
                if peer_id != msg.from {
                    debug!(tx = %tx_id, from = %msg.from, "message from unexpected peer dropped");
                    return Ok(());
                }
            }
        } else {
            let tx_type = match msg.tx_type {
                Some(tx_type) => tx_type,
                None => {
                    debug!(tx = %tx_id, "message without type for unknown transaction dropped");
                    return Ok(());
                }
            };
            store.set_parameter(&tx_id, TxParameterId::TransactionType, &tx_type, true, 0)?;
            store.set_parameter(&tx_id, TxParameterId::IsInitiator, &false, false, 0)?;
            store.set_parameter(&tx_id, TxParameterId::IsSender, &false, false, 0)?;
            store.set_parameter(&tx_id, TxParameterId::Status, &TxStatus::Pending, true, 0)?;
            store.set_parameter(&tx_id, TxParameterId::CreateTime, &now_timestamp(), true, 0)?;
            store.set_parameter(&tx_id, TxParameterId::MyId, &to, false, 0)?;
            store.set_parameter(&tx_id, TxParameterId::PeerId, &msg.from, false, 0)?;
        }

        for param in &msg.params {
            if is_protected_param(param.id) {
                continue;
            }
            store.set_tx_parameter_raw(&tx_id, param.id, param.sub, false, &param.cell)?;
        }

        let tx_type = store
            .get_parameter::<TxType>(&tx_id, TxParameterId::TransactionType, 0)?
            .unwrap_or(TxType::Simple);
        let machine = match self.lookup_or_activate(tx_id, tx_type)? {
            Some(machine) => machine,
            None => return Ok(()),
        };
        machine.update_async(&*self.inner);
        self.run_pending();
        Ok(())
    }

    /// New tip observed: persist it and wake every subscribed transfer.
    pub fn on_tip_changed(&self, state: &ChainState) -> Result<(), TxError> {
        self.inner.store.set_system_state(&state.id())?;
        let woken: Vec<TxId> = self.inner.next_tip.lock().drain().collect();
        for tx_id in woken {
            if let Some(machine) = self.inner.active.lock().get(&tx_id).cloned() {
                machine.update_async(&*self.inner);
            }
        }
        self.run_pending();
        Ok(())
    }

    /// Chain reorg below `height`: re-open proofs gained above it.
    pub fn on_rolled_back(&self, height: Height) -> Result<(), TxError> {
        let machines: Vec<Arc<TxStateMachine>> =
            self.inner.active.lock().values().cloned().collect();
        for machine in machines {
            if machine.rollback(height)? {
                machine.update_async(&*self.inner);
            }
        }
        self.run_pending();
        Ok(())
    }

    /// Kernel proof request resolved. `proof_height` is `None` while the
    /// kernel is still unconfirmed at the current tip.
    pub fn on_kernel_proof(
        &self,
        tx_id: TxId,
        proof_height: Option<Height>,
    ) -> Result<(), TxError> {
        let machine = {
            let active = self.inner.active.lock();
            active.get(&tx_id).cloned()
        };
        let machine = match machine {
            Some(machine) => machine,
            // The transfer finished or was cancelled while the request was
            // in flight; drop the result.
            None => return Ok(()),
        };
        match proof_height {
            Some(height) => {
                let changed = self.inner.store.set_parameter(
                    &tx_id,
                    TxParameterId::KernelProofHeight,
                    &height,
                    false,
                    0,
                )?;
                if changed {
                    machine.update_async(&*self.inner);
                }
            }
            None => {
                let tip_height = self
                    .inner
                    .node
                    .tip()
                    .map(|tip| tip.height)
                    .unwrap_or_default();
                self.inner.store.set_parameter(
                    &tx_id,
                    TxParameterId::KernelUnconfirmedHeight,
                    &tip_height,
                    false,
                    0,
                )?;
                self.inner.update_on_next_tip(tx_id);
            }
        }
        self.run_pending();
        Ok(())
    }

    /// Reactor tick: drain self-scheduled updates to quiescence.
    pub fn run_pending(&self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            let tx_id = match self.inner.queue.take_next() {
                Some(tx_id) => tx_id,
                None => return,
            };
            let machine = {
                let active = self.inner.active.lock();
                active.get(&tx_id).cloned()
            };
            // A machine dropped after scheduling is a no-op by contract.
            if let Some(machine) = machine {
                machine.update(&*self.inner);
            }
            self.inner.async_finished();
        }
        warn!("update queue did not quiesce within {MAX_PUMP_ROUNDS} rounds");
    }

    /// Aggregate balance snapshot for observers.
    pub fn status(&self) -> Result<WalletStatus, TxError> {
        Ok(load_status(&self.inner.store)?)
    }

    /// Export a transferable receipt for a completed transfer and fan the
    /// bytes out to the observer.
    pub fn export_payment_proof(&self, tx_id: TxId) -> Result<Option<Vec<u8>>, TxError> {
        let description = match self.inner.store.tx_description(&tx_id)? {
            Some(description) if description.status == TxStatus::Completed => description,
            _ => return Ok(None),
        };
        let kernel_id = match description.kernel_id {
            Some(kernel_id) => kernel_id,
            None => return Ok(None),
        };
        let proof = crate::db::codec::options()
            .serialize(&(tx_id, kernel_id, description.amount, description.peer_id))
            .unwrap_or_default();
        self.inner.events.payment_proof_exported(tx_id, &proof);
        Ok(Some(proof))
    }

    fn lookup_or_activate(
        &self,
        tx_id: TxId,
        tx_type: TxType,
    ) -> Result<Option<Arc<TxStateMachine>>, TxError> {
        if let Some(machine) = self.inner.active.lock().get(&tx_id).cloned() {
            return Ok(Some(machine));
        }
        match self.activate(tx_id, tx_type) {
            Ok(machine) => Ok(Some(machine)),
            Err(TxError::Fault(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn activate(&self, tx_id: TxId, tx_type: TxType) -> Result<Arc<TxStateMachine>, TxError> {
        let logic: Box<dyn crate::engine::TxLogic> = match tx_type {
            TxType::Simple => Box::new(SimpleTransfer),
            other => {
                warn!(tx = %tx_id, ?other, "no negotiation logic for this type");
                return Err(TxError::Fault(crate::engine::TxFault::new(
                    crate::types::TxFailureReason::InvalidTransaction,
                    false,
                )));
            }
        };
        let machine = Arc::new(TxStateMachine::new(
            tx_id,
            Arc::clone(&self.inner.store),
            self.inner.keykeeper.clone(),
            Arc::clone(&self.inner.queue),
            logic,
        ));
        self.inner.active.lock().insert(tx_id, Arc::clone(&machine));
        Ok(machine)
    }
}

fn load_status(store: &Arc<WalletStore>) -> Result<WalletStatus, StoreError> {
    let current_height = store
        .system_state()?
        .map(|id| id.height)
        .unwrap_or_default();
    let mut status = WalletStatus {
        current_height,
        ..WalletStatus::default()
    };
    for coin in store.coins()? {
        match coin.status {
            CoinStatus::Available => {
                if coin.maturity == MAX_HEIGHT || coin.maturity <= current_height {
                    status.available += coin.id.value;
                } else {
                    status.maturing += coin.id.value;
                }
            }
            CoinStatus::Maturing => status.maturing += coin.id.value,
            CoinStatus::Incoming => status.receiving += coin.id.value,
            CoinStatus::Outgoing => status.sending += coin.id.value,
            _ => {}
        }
    }
    Ok(status)
}

/// Parameters a peer may never overwrite.
fn is_protected_param(id: u32) -> bool {
    matches!(
        TxParameterId::from_u32(id),
        Some(
            TxParameterId::Status
                | TxParameterId::IsInitiator
                | TxParameterId::IsSender
                | TxParameterId::MyId
                | TxParameterId::PeerId
                | TxParameterId::NonceSlot
                | TxParameterId::ModifyTime
                | TxParameterId::CreateTime
                | TxParameterId::InputCoins
                | TxParameterId::OutputCoins
                | TxParameterId::TransactionType
        )
    ) || TxParameterId::from_u32(id).is_none()
}
