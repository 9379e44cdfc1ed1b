//! Atomic-swap rendezvous: the published offer type and the board that
//! tracks it. The cross-chain handshake itself lives elsewhere; this layer
//! only governs offer discovery.

pub mod board;
pub mod protocol;

pub use board::{BoardError, SwapOffersBoard, SwapOffersObserver};
pub use protocol::OfferBoardProtocol;

use serde::{Deserialize, Serialize};

use crate::params::{ParameterMap, TxParameterId};
use crate::types::{Amount, Height, TxId, TxType, WalletId};

/// Counterpart chain of a swap offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SwapCoin {
    Bitcoin = 0,
    Litecoin = 1,
    Qtum = 2,
    Unknown = 3,
}

/// Lifecycle of a published offer. Only `Pending` offers are publishable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SwapOfferStatus {
    Pending = 0,
    InProgress = 1,
    Completed = 2,
    Canceled = 3,
    Expired = 4,
    Failed = 5,
}

/// Signed willingness to enter a cross-chain swap under stated parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOffer {
    pub tx_id: TxId,
    pub status: SwapOfferStatus,
    pub publisher_id: WalletId,
    pub coin: SwapCoin,
    pub params: ParameterMap,
}

/// Parameters an offer must carry to be admissible.
pub const MANDATORY_OFFER_PARAMS: [TxParameterId; 6] = [
    TxParameterId::AtomicSwapCoin,
    TxParameterId::AtomicSwapIsNativeSide,
    TxParameterId::Amount,
    TxParameterId::AtomicSwapAmount,
    TxParameterId::MinHeight,
    TxParameterId::PeerResponseTime,
];

impl SwapOffer {
    pub fn new(tx_id: TxId, status: SwapOfferStatus, publisher_id: WalletId, coin: SwapCoin) -> Self {
        let mut params = ParameterMap::new();
        params.set(TxParameterId::TransactionType, &TxType::AtomicSwap);
        params.set(TxParameterId::AtomicSwapCoin, &coin);
        Self {
            tx_id,
            status,
            publisher_id,
            coin,
            params,
        }
    }

    pub fn min_height(&self) -> Option<Height> {
        self.params.get(TxParameterId::MinHeight)
    }

    pub fn peer_response_time(&self) -> Option<Height> {
        self.params.get(TxParameterId::PeerResponseTime)
    }

    pub fn amount(&self) -> Option<Amount> {
        self.params.get(TxParameterId::Amount)
    }

    pub fn swap_amount(&self) -> Option<Amount> {
        self.params.get(TxParameterId::AtomicSwapAmount)
    }

    pub fn is_native_side(&self) -> Option<bool> {
        self.params.get(TxParameterId::AtomicSwapIsNativeSide)
    }

    /// Height at which the offer stops being answerable.
    pub fn expiry_height(&self) -> Option<Height> {
        Some(
            self.min_height()?
                .saturating_add(self.peer_response_time()?),
        )
    }

    pub fn is_expired_at(&self, height: Height) -> bool {
        self.expiry_height()
            .map_or(false, |expiry| expiry <= height)
    }

    /// Every mandatory parameter present, typed as an atomic swap.
    pub fn has_mandatory_params(&self) -> bool {
        MANDATORY_OFFER_PARAMS
            .iter()
            .all(|id| self.params.contains(*id))
            && self.params.get::<TxType>(TxParameterId::TransactionType)
                == Some(TxType::AtomicSwap)
    }
}
