//! Per-transfer state machines. Every machine shares the outer `update`
//! contract — external-failure check, one round of type-specific work,
//! expiry, modify-time stamping, failure conversion — and plugs its
//! negotiation logic in through [`TxLogic`].

use std::cmp::min;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::store::{StoreError, WalletStore};
use crate::gateway::Gateway;
use crate::keykeeper::{KeyKeeper, KeyKeeperError, SlotId};
use crate::messages::failure_message;
use crate::params::{ParamError, ParameterValue, TxParameterId, TxParamsMessage};
use crate::types::{
    now_timestamp, Height, KernelId, TxFailureReason, TxId, TxStatus, TxType, WalletId,
    MATURITY_STD,
};

pub mod context;
pub mod simple;
pub mod wallet;

pub use context::UpdateQueue;
pub use simple::SimpleTransfer;
pub use wallet::{NodeEndpoint, PeerEndpoint, StubNodeEndpoint, StubPeerEndpoint, Wallet};

/// Result of one round of type-specific work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// More synchronous work is possible; the machine reschedules itself.
    Progressed,
    /// Waiting for a peer message.
    BlockedOnPeer,
    /// Waiting for a kernel proof.
    BlockedOnProof,
    /// The transfer reached a terminal status.
    Finished,
}

/// Transfer-scoped failure: converted into the `on_failed` path by the
/// outer update loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxFault {
    pub reason: TxFailureReason,
    pub notify: bool,
}

impl TxFault {
    pub fn new(reason: TxFailureReason, notify: bool) -> Self {
        Self { reason, notify }
    }
}

#[derive(Debug, Error)]
pub enum TxError {
    #[error("transaction failed: {}", failure_message(.0.reason))]
    Fault(TxFault),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TxFault> for TxError {
    fn from(fault: TxFault) -> Self {
        Self::Fault(fault)
    }
}

impl From<ParamError> for TxError {
    fn from(err: ParamError) -> Self {
        match err {
            ParamError::MissingMandatory(_) => {
                Self::Fault(TxFault::new(TxFailureReason::MissingMandatoryParameter, true))
            }
            ParamError::Store(err) => Self::Store(err),
        }
    }
}

/// Map a keeper status onto the failure taxonomy: user rejection is final,
/// everything else is retryable.
pub fn fault_from_keykeeper(err: KeyKeeperError) -> TxError {
    let reason = match err {
        KeyKeeperError::UserAbort => TxFailureReason::KeyKeeperUserAbort,
        _ => TxFailureReason::KeyKeeperError,
    };
    TxError::Fault(TxFault::new(reason, true))
}

/// Type-specific negotiation logic. `update_impl` is re-entrant: each call
/// performs at most one round of work and returns.
pub trait TxLogic: Send + Sync {
    fn tx_type(&self) -> TxType;

    fn update_impl(
        &self,
        tx: &TxStateMachine,
        gateway: &dyn Gateway,
    ) -> Result<UpdateOutcome, TxError>;
}

/// Re-entrant state machine driving one transfer. All durable state lives
/// in the parameter store; the machine itself can be dropped and rebuilt at
/// any point.
pub struct TxStateMachine {
    id: TxId,
    store: Arc<WalletStore>,
    keykeeper: Option<Arc<dyn KeyKeeper>>,
    queue: Arc<UpdateQueue>,
    logic: Box<dyn TxLogic>,
    is_initiator: OnceCell<bool>,
}

impl TxStateMachine {
    pub fn new(
        id: TxId,
        store: Arc<WalletStore>,
        keykeeper: Option<Arc<dyn KeyKeeper>>,
        queue: Arc<UpdateQueue>,
        logic: Box<dyn TxLogic>,
    ) -> Self {
        Self {
            id,
            store,
            keykeeper,
            queue,
            logic,
            is_initiator: OnceCell::new(),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn tx_type(&self) -> TxType {
        self.logic.tx_type()
    }

    pub fn store(&self) -> &Arc<WalletStore> {
        &self.store
    }

    // ---- parameter access ----

    pub fn get_parameter<T: ParameterValue>(
        &self,
        id: TxParameterId,
    ) -> Result<Option<T>, TxError> {
        Ok(self.store.get_parameter(&self.id, id, 0)?)
    }

    pub fn get_mandatory<T: ParameterValue>(&self, id: TxParameterId) -> Result<T, TxError> {
        Ok(self.store.get_mandatory(&self.id, id, 0)?)
    }

    pub fn set_parameter<T: ParameterValue>(
        &self,
        id: TxParameterId,
        value: &T,
    ) -> Result<bool, TxError> {
        Ok(self.store.set_parameter(&self.id, id, value, false, 0)?)
    }

    pub fn set_parameter_public<T: ParameterValue>(
        &self,
        id: TxParameterId,
        value: &T,
    ) -> Result<bool, TxError> {
        Ok(self.store.set_parameter(&self.id, id, value, true, 0)?)
    }

    pub fn status(&self) -> Result<Option<TxStatus>, TxError> {
        self.get_parameter(TxParameterId::Status)
    }

    pub fn set_status(&self, status: TxStatus) -> Result<(), TxError> {
        self.set_parameter_public(TxParameterId::Status, &status)?;
        Ok(())
    }

    pub fn is_initiator(&self) -> Result<bool, TxError> {
        self.is_initiator
            .get_or_try_init(|| self.get_mandatory::<bool>(TxParameterId::IsInitiator))
            .copied()
    }

    // ---- outer update loop ----

    /// Run one update round. Safe to call at any time: terminal transfers
    /// ignore it, failures are absorbed into the failure path.
    pub fn update(&self, gateway: &dyn Gateway) {
        gateway.async_started();
        if let Err(err) = self.update_inner(gateway) {
            match err {
                TxError::Fault(fault) => {
                    error!(tx = %self.id, "{}", failure_message(fault.reason));
                    self.on_failed(gateway, fault.reason, fault.notify);
                }
                TxError::Store(err) => {
                    error!(tx = %self.id, "update failed: {err}");
                    self.on_failed(gateway, TxFailureReason::Unknown, true);
                }
            }
        }
        gateway.async_finished();
    }

    fn update_inner(&self, gateway: &dyn Gateway) -> Result<(), TxError> {
        let status = self.status()?;
        if status.map_or(false, TxStatus::is_terminal) {
            return Ok(());
        }

        // Failure imposed from outside (peer or supervisor) while the
        // negotiation is running.
        if let Some(reason) = self.get_parameter::<TxFailureReason>(TxParameterId::FailureReason)? {
            if status == Some(TxStatus::InProgress) {
                return Err(TxFault::new(reason, true).into());
            }
        }

        let outcome = self.logic.update_impl(self, gateway)?;
        if outcome == UpdateOutcome::Progressed {
            self.update_async(gateway);
        }

        self.check_expired(gateway)?;
        self.stamp_modify_time()?;
        Ok(())
    }

    /// Idempotent self-reschedule: at most one pending update per transfer.
    pub fn update_async(&self, gateway: &dyn Gateway) {
        self.queue.schedule(self.id, gateway);
    }

    fn check_expired(&self, gateway: &dyn Gateway) -> Result<(), TxError> {
        let status = self.status()?;
        if status.map_or(false, TxStatus::is_terminal) {
            return Ok(());
        }

        let max_height = match self.get_parameter::<Height>(TxParameterId::MaxHeight)? {
            Some(height) => height,
            None => match self.get_parameter::<Height>(TxParameterId::PeerResponseHeight)? {
                Some(height) => height,
                // No data to decide on.
                None => return Ok(()),
            },
        };

        let registered = self
            .get_parameter::<bool>(TxParameterId::TransactionRegistered)?
            .unwrap_or(false);
        let kernel_id = self.get_parameter::<KernelId>(TxParameterId::KernelId)?;

        if !registered || kernel_id.is_none() {
            if let Some(tip) = gateway.get_tip() {
                if tip.height > max_height {
                    info!(
                        tx = %self.id,
                        tip = tip.height,
                        max_height,
                        "transaction expired before registration"
                    );
                    return Err(TxFault::new(TxFailureReason::TransactionExpired, false).into());
                }
            }
        } else if let Some(unconfirmed) =
            self.get_parameter::<Height>(TxParameterId::KernelUnconfirmedHeight)?
        {
            if unconfirmed > 0 && unconfirmed >= max_height {
                info!(
                    tx = %self.id,
                    unconfirmed,
                    max_height,
                    "transaction expired waiting for kernel confirmation"
                );
                return Err(TxFault::new(TxFailureReason::TransactionExpired, false).into());
            }
        }
        Ok(())
    }

    fn stamp_modify_time(&self) -> Result<(), TxError> {
        let previous = self
            .get_parameter::<u64>(TxParameterId::ModifyTime)?
            .unwrap_or_default();
        let stamp = now_timestamp().max(previous);
        self.set_parameter_public(TxParameterId::ModifyTime, &stamp)?;
        Ok(())
    }

    // ---- cancel / rollback / failure ----

    pub fn can_cancel(&self) -> Result<bool, TxError> {
        Ok(self.status()?.map_or(false, TxStatus::can_cancel))
    }

    /// Cancel from `Pending` or `InProgress`; a cancel mid-negotiation
    /// tells the peer first.
    pub fn cancel(&self, gateway: &dyn Gateway) -> Result<bool, TxError> {
        let status = self.status()?.unwrap_or(TxStatus::Failed);
        if !status.can_cancel() {
            info!(tx = %self.id, ?status, "cancel refused in this state");
            return Ok(false);
        }
        if status == TxStatus::InProgress {
            self.notify_failure(gateway, TxFailureReason::Canceled)?;
        }
        self.set_status(TxStatus::Canceled)?;
        self.store.rollback_tx(&self.id)?;
        self.free_resources();
        gateway.on_tx_completed(self.id);
        Ok(true)
    }

    /// Chain reorg below `height`: a kernel proved above it is no longer
    /// proven, the transfer re-enters `Registering`.
    pub fn rollback(&self, height: Height) -> Result<bool, TxError> {
        match self.get_parameter::<Height>(TxParameterId::KernelProofHeight)? {
            Some(proof_height) if proof_height > height => {
                self.set_parameter_public(TxParameterId::Status, &TxStatus::Registering)?;
                self.set_parameter(TxParameterId::KernelProofHeight, &0u64)?;
                self.set_parameter(TxParameterId::KernelUnconfirmedHeight, &0u64)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Terminal failure path: persist the reason, roll back reservations,
    /// release resources, report completion exactly once.
    pub fn on_failed(&self, gateway: &dyn Gateway, reason: TxFailureReason, notify: bool) {
        if notify {
            if let Err(err) = self.notify_failure(gateway, reason) {
                warn!(tx = %self.id, "failure notification not sent: {err}");
            }
        }
        let terminal = if reason == TxFailureReason::Canceled {
            TxStatus::Canceled
        } else {
            TxStatus::Failed
        };
        let result = self
            .store
            .set_parameter(&self.id, TxParameterId::FailureReason, &reason, false, 0)
            .and_then(|_| {
                self.store
                    .set_parameter(&self.id, TxParameterId::Status, &terminal, true, 0)
            })
            .and_then(|_| self.store.rollback_tx(&self.id));
        if let Err(err) = result {
            warn!(tx = %self.id, "failure bookkeeping incomplete: {err}");
        }
        self.free_resources();
        gateway.on_tx_completed(self.id);
    }

    /// Tell the peer the transfer is dead. Only meaningful while the
    /// transfer could still have looked valid to them.
    fn notify_failure(&self, gateway: &dyn Gateway, reason: TxFailureReason) -> Result<(), TxError> {
        let status = self.status()?.unwrap_or(TxStatus::Failed);
        if !matches!(status, TxStatus::Pending | TxStatus::InProgress) {
            return Ok(());
        }
        let mut msg = TxParamsMessage::new();
        msg.add(TxParameterId::FailureReason, &reason);
        self.send_tx_params(gateway, msg)?;
        Ok(())
    }

    /// Assemble and send a peer message. Returns false when the transfer
    /// has no complete `MyId`/`PeerId` pair yet.
    pub fn send_tx_params(
        &self,
        gateway: &dyn Gateway,
        mut msg: TxParamsMessage,
    ) -> Result<bool, TxError> {
        msg.tx_id = self.id;
        msg.tx_type = Some(self.tx_type());

        let my_id = self.get_parameter(TxParameterId::MyId)?;
        let peer_id = self.get_parameter(TxParameterId::PeerId)?;
        let (my_id, peer_id) = match (my_id, peer_id) {
            (Some(my_id), Some(peer_id)) => (my_id, peer_id),
            _ => return Ok(false),
        };
        msg.from = my_id;

        // Attach the secure-channel identity only once both sides are known.
        let my_secure = self.get_parameter::<WalletId>(TxParameterId::MySecureWalletId)?;
        let peer_secure = self.get_parameter::<WalletId>(TxParameterId::PeerSecureWalletId)?;
        if let (Some(my_secure), Some(_)) = (my_secure, peer_secure) {
            msg.add(TxParameterId::PeerSecureWalletId, &my_secure);
        }

        gateway.send_tx_params(peer_id, msg);
        Ok(true)
    }

    /// Move to `Registering` and ask the node for the kernel proof.
    pub fn confirm_kernel(&self, gateway: &dyn Gateway, kernel_id: KernelId) -> Result<(), TxError> {
        self.set_status(TxStatus::Registering)?;
        gateway.confirm_kernel(self.id, kernel_id);
        Ok(())
    }

    /// Terminal success path.
    pub fn complete_tx(&self, gateway: &dyn Gateway) -> Result<(), TxError> {
        info!(tx = %self.id, "transaction completed");
        self.set_status(TxStatus::Completed)?;
        self.free_resources();
        gateway.on_tx_completed(self.id);
        Ok(())
    }

    /// Post-proof settlement: clamp confirm/spent heights *down* to the
    /// proof height (never raise them) and re-derive maturity.
    pub fn set_completed_tx_coin_statuses(&self, proof_height: Height) -> Result<(), TxError> {
        let mut modified = self.store.coins_by_tx(&self.id)?;
        for coin in &mut modified {
            let incoming = coin.create_tx_id == Some(self.id);
            let outgoing = coin.spent_tx_id == Some(self.id);
            if incoming {
                coin.confirm_height = min(coin.confirm_height, proof_height);
                coin.maturity = proof_height + MATURITY_STD;
            }
            if outgoing {
                coin.spent_height = min(coin.spent_height, proof_height);
            }
        }
        self.store.save_coins(&modified)?;
        Ok(())
    }

    // ---- key keeper plumbing ----

    pub fn keykeeper_strict(&self) -> Result<&Arc<dyn KeyKeeper>, TxError> {
        self.keykeeper
            .as_ref()
            .ok_or_else(|| TxFault::new(TxFailureReason::NoKeyKeeper, true).into())
    }

    /// Current nonce slot, allocating one on demand.
    pub fn slot(&self, allocate_if_absent: bool) -> Result<SlotId, TxError> {
        let current = self
            .get_parameter::<SlotId>(TxParameterId::NonceSlot)?
            .unwrap_or(SlotId::INVALID);
        if allocate_if_absent && current == SlotId::INVALID {
            let keeper = self.keykeeper_strict()?;
            let slot = keeper.slot_allocate().map_err(fault_from_keykeeper)?;
            self.set_parameter(TxParameterId::NonceSlot, &slot)?;
            return Ok(slot);
        }
        Ok(current)
    }

    /// Release every keeper resource this transfer holds. Idempotent.
    pub fn free_resources(&self) {
        let keeper = match self.keykeeper.as_ref() {
            Some(keeper) => keeper,
            None => return,
        };
        let slot = self
            .store
            .get_parameter::<SlotId>(&self.id, TxParameterId::NonceSlot, 0)
            .ok()
            .flatten()
            .unwrap_or(SlotId::INVALID);
        if slot != SlotId::INVALID {
            if let Err(err) = keeper.slot_free(slot) {
                warn!(tx = %self.id, "slot release failed: {err}");
            }
            let _ = self.store.set_parameter(
                &self.id,
                TxParameterId::NonceSlot,
                &SlotId::INVALID,
                false,
                0,
            );
        }
    }
}
