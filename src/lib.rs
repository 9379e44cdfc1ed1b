//! Core of a privacy-preserving UTXO wallet: transactional parameter
//! store, re-entrant negotiation engine, and the peer-to-peer board of
//! atomic-swap offers riding the broadcast bus.

pub mod broadcast;
pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod keykeeper;
pub mod messages;
pub mod params;
pub mod swaps;
pub mod telemetry;
pub mod types;

pub use broadcast::{BbsTransport, BroadcastContentType, BroadcastListener, BroadcastRouter,
    InMemoryBbsBus};
pub use config::WalletConfig;
pub use db::{StoreError, WalletStore};
pub use engine::{
    SimpleTransfer, TxError, TxFault, TxLogic, TxStateMachine, UpdateOutcome, UpdateQueue, Wallet,
};
pub use events::{EventFanOut, WalletObserver, WalletStatus};
pub use gateway::{Gateway, StubGateway};
pub use keykeeper::{KeyKeeper, KeyKeeperError, KeyUsage, LocalKeyKeeper};
pub use params::{ParameterMap, TxParameterId, TxParamsMessage};
pub use swaps::{
    BoardError, OfferBoardProtocol, SwapCoin, SwapOffer, SwapOfferStatus, SwapOffersBoard,
    SwapOffersObserver,
};
pub use types::{
    ChainState, ChainStateId, ChangeAction, Coin, CoinId, CoinStatus, Height, KernelId,
    TxDescription, TxFailureReason, TxId, TxStatus, TxType, WalletAddress, WalletId,
};
