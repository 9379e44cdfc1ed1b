use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Block height on the native chain.
pub type Height = u64;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Native coin amount in base units.
pub type Amount = u64;

/// 32-byte block or commitment hash.
pub type Hash32 = [u8; 32];

/// Sentinel for "not yet at any height" fields (unconfirmed, unspent).
pub const MAX_HEIGHT: Height = Height::MAX;

/// Height of the first block; ancestry checks bottom out here.
pub const GENESIS_HEIGHT: Height = 1;

/// Maturity delta applied to freshly confirmed outputs.
pub const MATURITY_STD: Height = 0;

pub fn now_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// 16-byte transfer identifier, stable across peers, persistence and wire.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxId(pub [u8; 16]);

impl TxId {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// BBS endpoint identity: a 32-byte public key that doubles as the wallet's
/// routable address.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WalletId(pub [u8; 32]);

impl WalletId {
    pub const ZERO: WalletId = WalletId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Signed commitment identifying a transaction on chain.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KernelId(pub [u8; 32]);

impl KernelId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Lifecycle of a tracked transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TxStatus {
    Pending = 0,
    InProgress = 1,
    Canceled = 2,
    Completed = 3,
    Failed = 4,
    Registering = 5,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }

    pub fn can_cancel(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn can_resume(self) -> bool {
        !self.is_terminal()
    }
}

/// Negotiation protocol implemented by a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TxType {
    Simple = 0,
    AtomicSwap = 1,
    AssetIssue = 2,
}

/// Action attached to model-change notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Added,
    Removed,
    Updated,
    Reset,
}

/// Stable failure catalog. Discriminants are persisted and sent on the wire;
/// never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TxFailureReason {
    Unknown = 0,
    Canceled = 1,
    PeerSignatureInvalid = 2,
    FailedToRegister = 3,
    InvalidTransaction = 4,
    InvalidKernelProof = 5,
    TransactionExpired = 6,
    NoInputs = 7,
    NotEnoughFunds = 8,
    KeyKeeperError = 9,
    KeyKeeperUserAbort = 10,
    NoKeyKeeper = 11,
    NoMasterKey = 12,
    MissingMandatoryParameter = 13,
    PeerResponseTooLate = 14,
    FeeTooLow = 15,
}

/// Full chain-state header tracked by the wallet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub height: Height,
    pub hash: Hash32,
    pub hash_prev: Hash32,
    pub difficulty: u64,
    pub timestamp: Timestamp,
    pub hash_utxos: Hash32,
    pub hash_kernels: Hash32,
}

impl ChainState {
    pub fn id(&self) -> ChainStateId {
        ChainStateId {
            height: self.height,
            hash: self.hash,
        }
    }
}

/// `(height, hash)` primary key of a chain-state row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainStateId {
    pub height: Height,
    pub hash: Hash32,
}

impl fmt::Display for ChainStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode(&self.hash[..8]), self.height)
    }
}

/// Key domain an output was derived under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CoinKind {
    Regular = 0,
    Change = 1,
    Coinbase = 2,
    Fee = 3,
}

/// Unique identifier of a wallet-controlled output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoinId {
    pub idx: u64,
    pub kind: CoinKind,
    pub sub_idx: u32,
    pub value: Amount,
}

impl CoinId {
    pub fn new(idx: u64, kind: CoinKind, sub_idx: u32, value: Amount) -> Self {
        Self {
            idx,
            kind,
            sub_idx,
            value,
        }
    }
}

/// Spend-state of a wallet-controlled output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoinStatus {
    Available,
    Outgoing,
    Incoming,
    ChangeV0,
    Spent,
    Consumed,
    Maturing,
}

/// UTXO tracked by the wallet.
///
/// A coin with a `spent_tx_id` is never `Available`; `maturity` never drops
/// below `confirm_height`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub id: CoinId,
    pub status: CoinStatus,
    pub maturity: Height,
    pub confirm_height: Height,
    pub spent_height: Height,
    pub create_tx_id: Option<TxId>,
    pub spent_tx_id: Option<TxId>,
}

impl Coin {
    pub fn new(id: CoinId) -> Self {
        Self {
            id,
            status: CoinStatus::Available,
            maturity: MAX_HEIGHT,
            confirm_height: MAX_HEIGHT,
            spent_height: MAX_HEIGHT,
            create_tx_id: None,
            spent_tx_id: None,
        }
    }

    pub fn is_available(&self, at: Height) -> bool {
        matches!(self.status, CoinStatus::Available) && self.maturity <= at
    }
}

/// Address book entry. `own_id` is non-zero iff the local wallet holds the
/// private key material behind `wallet_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub wallet_id: WalletId,
    pub label: String,
    pub category: String,
    pub create_time: Timestamp,
    pub duration: u64,
    pub own_id: u64,
}

impl WalletAddress {
    /// Duration value meaning "never expires".
    pub const DURATION_FOREVER: u64 = 0;

    pub fn is_own(&self) -> bool {
        self.own_id != 0
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.duration != Self::DURATION_FOREVER && self.create_time + self.duration <= now
    }
}

/// Denormalised projection of a transfer's parameter map, built for
/// observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDescription {
    pub tx_id: TxId,
    pub tx_type: TxType,
    pub amount: Amount,
    pub fee: Amount,
    pub change: Amount,
    pub min_height: Height,
    pub peer_id: WalletId,
    pub my_id: WalletId,
    pub message: Vec<u8>,
    pub create_time: Timestamp,
    pub modify_time: Timestamp,
    pub sender: bool,
    pub self_tx: bool,
    pub status: TxStatus,
    pub kernel_id: Option<KernelId>,
    pub failure_reason: Option<TxFailureReason>,
}

impl TxDescription {
    pub fn can_resume(&self) -> bool {
        self.status.can_resume()
    }
}

/// Published conversion rate, fanned out to observers verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from: String,
    pub to: String,
    pub rate: Amount,
    pub updated: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_ids_are_unique_and_roundtrip_hex() {
        let a = TxId::generate();
        let b = TxId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }

    #[test]
    fn terminal_statuses_cannot_cancel_or_resume() {
        for status in [TxStatus::Completed, TxStatus::Canceled, TxStatus::Failed] {
            assert!(status.is_terminal());
            assert!(!status.can_cancel());
            assert!(!status.can_resume());
        }
        assert!(TxStatus::Pending.can_cancel());
        assert!(TxStatus::InProgress.can_cancel());
        assert!(!TxStatus::Registering.can_cancel());
        assert!(TxStatus::Registering.can_resume());
    }

    #[test]
    fn address_expiry_honours_forever_duration() {
        let mut address = WalletAddress {
            wallet_id: WalletId::ZERO,
            label: "peer".into(),
            category: String::new(),
            create_time: 100,
            duration: WalletAddress::DURATION_FOREVER,
            own_id: 0,
        };
        assert!(!address.is_expired(u64::MAX));
        address.duration = 50;
        assert!(address.is_expired(150));
        assert!(!address.is_expired(149));
    }
}
