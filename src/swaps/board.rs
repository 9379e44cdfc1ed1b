//! Local observable index of swap offers. Canonical truth lives in peer
//! broadcasts plus the linked local transactions; the board reconciles the
//! two and notifies observers synchronously on the delivery thread.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::broadcast::{BroadcastContentType, BroadcastListener, BroadcastRouter};
use crate::db::store::{StoreError, WalletStore};
use crate::params::TxParameterId;
use crate::swaps::protocol::{OfferBoardProtocol, ProtocolError};
use crate::swaps::{SwapCoin, SwapOffer, SwapOfferStatus};
use crate::types::{
    ChainStateId, ChangeAction, Height, Timestamp, TxDescription, TxId, TxStatus, TxType,
};

/// Observer of board changes.
pub trait SwapOffersObserver: Send + Sync {
    fn on_swap_offers_changed(&self, action: ChangeAction, offers: &[SwapOffer]);
}

#[derive(Debug, Error)]
pub enum BoardError {
    /// Mandatory parameter missing, unknown coin, or not `Pending`.
    #[error("offer is missing mandatory parameters or is not publishable")]
    InvalidOffer,
    /// The publisher is not one of the local addresses.
    #[error("offer belongs to another wallet")]
    ForeignOffer,
    #[error("offer with this transaction id is already on the board")]
    OfferAlreadyPublished,
    #[error("offer is already expired at the current chain height")]
    ExpiredOffer,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct BoardInner {
    offers: BTreeMap<TxId, SwapOffer>,
    current_height: Height,
}

/// Pub/sub board of swap offers on top of the broadcast router.
pub struct SwapOffersBoard {
    protocol: OfferBoardProtocol,
    store: Arc<WalletStore>,
    router: Arc<BroadcastRouter>,
    inner: Mutex<BoardInner>,
    observers: Mutex<Vec<Weak<dyn SwapOffersObserver>>>,
}

impl SwapOffersBoard {
    /// Build the board and register it on the SwapOffers channel.
    pub fn new(
        router: Arc<BroadcastRouter>,
        protocol: OfferBoardProtocol,
        store: Arc<WalletStore>,
    ) -> Arc<Self> {
        let current_height = store
            .system_state()
            .ok()
            .flatten()
            .map(|id| id.height)
            .unwrap_or_default();
        let board = Arc::new(Self {
            protocol,
            store,
            router: Arc::clone(&router),
            inner: Mutex::new(BoardInner {
                offers: BTreeMap::new(),
                current_height,
            }),
            observers: Mutex::new(Vec::new()),
        });
        let listener = Arc::clone(&board) as Arc<dyn BroadcastListener>;
        router.register_listener(BroadcastContentType::SwapOffers, &listener);
        board
    }

    pub fn subscribe(&self, observer: &Arc<dyn SwapOffersObserver>) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn SwapOffersObserver>) {
        let target = Arc::downgrade(observer);
        self.observers
            .lock()
            .retain(|registered| !registered.ptr_eq(&target));
    }

    pub fn offers_list(&self) -> Vec<SwapOffer> {
        self.inner.lock().offers.values().cloned().collect()
    }

    /// Validate, sign, broadcast and admit a locally published offer.
    pub fn publish_offer(&self, offer: &SwapOffer) -> Result<(), BoardError> {
        if !offer.has_mandatory_params()
            || offer.coin == SwapCoin::Unknown
            || offer.status != SwapOfferStatus::Pending
        {
            return Err(BoardError::InvalidOffer);
        }
        let publisher_known = self
            .store
            .address(&offer.publisher_id)?
            .map_or(false, |address| address.is_own());
        if !publisher_known {
            return Err(BoardError::ForeignOffer);
        }
        {
            let inner = self.inner.lock();
            if inner.offers.contains_key(&offer.tx_id) {
                return Err(BoardError::OfferAlreadyPublished);
            }
            if offer.is_expired_at(inner.current_height) {
                return Err(BoardError::ExpiredOffer);
            }
        }
        // An offer whose linked transaction already left the rendezvous
        // phase is silently rejected.
        if self.linked_tx_blocks(&offer.tx_id)? {
            debug!(tx = %offer.tx_id, "offer rejected: linked transaction is past rendezvous");
            return Ok(());
        }

        let message = self.protocol.create_message(offer)?;
        self.router
            .send_raw_message(BroadcastContentType::SwapOffers, &message);
        self.admit(offer.clone());
        Ok(())
    }

    /// Linked-transaction reconciliation: AtomicSwap transfers entering
    /// `InProgress`, `Canceled` or `Failed` take their offer off the board.
    pub fn on_transaction_changed(&self, action: ChangeAction, txs: &[TxDescription]) {
        if action != ChangeAction::Updated {
            return;
        }
        for tx in txs {
            if tx.tx_type != TxType::AtomicSwap {
                continue;
            }
            let status = match tx.status {
                TxStatus::InProgress => SwapOfferStatus::InProgress,
                TxStatus::Canceled => SwapOfferStatus::Canceled,
                TxStatus::Failed => SwapOfferStatus::Failed,
                _ => continue,
            };
            let removed = self.inner.lock().offers.remove(&tx.tx_id);
            if let Some(mut offer) = removed {
                offer.status = status;
                self.notify(ChangeAction::Removed, std::slice::from_ref(&offer));
            }
        }
    }

    /// Chain-height progression: drop every offer past its response window.
    pub fn on_system_state_changed(&self, id: &ChainStateId) {
        let expired: Vec<SwapOffer> = {
            let mut inner = self.inner.lock();
            inner.current_height = id.height;
            let expired_ids: Vec<TxId> = inner
                .offers
                .values()
                .filter(|offer| offer.is_expired_at(id.height))
                .map(|offer| offer.tx_id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|tx_id| inner.offers.remove(&tx_id))
                .collect()
        };
        for mut offer in expired {
            offer.status = SwapOfferStatus::Expired;
            self.notify(ChangeAction::Removed, std::slice::from_ref(&offer));
        }
    }

    fn process_incoming(&self, offer: SwapOffer) {
        match offer.status {
            SwapOfferStatus::Pending => {
                if !offer.has_mandatory_params() || offer.coin == SwapCoin::Unknown {
                    debug!(tx = %offer.tx_id, "incoming offer dropped: invalid");
                    return;
                }
                {
                    let inner = self.inner.lock();
                    // Dedup by tx id: the first admitted offer stays
                    // canonical, later bodies are ignored.
                    if inner.offers.contains_key(&offer.tx_id) {
                        return;
                    }
                    if offer.is_expired_at(inner.current_height) {
                        debug!(tx = %offer.tx_id, "incoming offer dropped: expired");
                        return;
                    }
                }
                match self.linked_tx_blocks(&offer.tx_id) {
                    Ok(true) => {
                        debug!(tx = %offer.tx_id, "incoming offer dropped: linked transaction terminal");
                        return;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(tx = %offer.tx_id, "offer admission check failed: {err}");
                        return;
                    }
                }
                self.admit(offer);
            }
            status => {
                // Non-pending broadcasts are status updates for offers we
                // may already hold; unknown ids record nothing.
                let removed = self.inner.lock().offers.remove(&offer.tx_id);
                if let Some(mut known) = removed {
                    known.status = status;
                    self.notify(ChangeAction::Removed, std::slice::from_ref(&known));
                }
            }
        }
    }

    fn admit(&self, offer: SwapOffer) {
        {
            let mut inner = self.inner.lock();
            if inner.offers.contains_key(&offer.tx_id) {
                return;
            }
            inner.offers.insert(offer.tx_id, offer.clone());
        }
        self.notify(ChangeAction::Added, std::slice::from_ref(&offer));
    }

    /// Whether the local transaction behind `tx_id` already left the
    /// rendezvous phase.
    fn linked_tx_blocks(&self, tx_id: &TxId) -> Result<bool, StoreError> {
        let tx_type =
            self.store
                .get_parameter::<TxType>(tx_id, TxParameterId::TransactionType, 0)?;
        if tx_type != Some(TxType::AtomicSwap) {
            return Ok(false);
        }
        let status = self
            .store
            .get_parameter::<TxStatus>(tx_id, TxParameterId::Status, 0)?;
        Ok(matches!(
            status,
            Some(TxStatus::InProgress | TxStatus::Canceled | TxStatus::Failed)
        ))
    }

    fn notify(&self, action: ChangeAction, offers: &[SwapOffer]) {
        let observers: Vec<Arc<dyn SwapOffersObserver>> = self
            .observers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.on_swap_offers_changed(action, offers);
        }
    }
}

impl BroadcastListener for SwapOffersBoard {
    fn on_message(&self, _timestamp: Timestamp, payload: &[u8]) -> bool {
        match self.protocol.parse_message(payload) {
            Some(offer) => {
                self.process_incoming(offer);
                true
            }
            None => false,
        }
    }
}
