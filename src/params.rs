//! Typed views over the per-transfer parameter rows. One central dispatch
//! maps every parameter id to its value type; the framed cell encoding is
//! identical on disk and on the wire, so parameters replay to peers without
//! re-encoding.

use std::collections::BTreeMap;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::codec::options;
use crate::db::store::{StoreError, WalletStore};
use crate::keykeeper::SlotId;
use crate::swaps::SwapCoin;
use crate::types::{
    CoinId, KernelId, TxDescription, TxFailureReason, TxId, TxStatus, TxType, WalletId,
};

/// Cell layout version; bumped only with a migration of stored rows.
pub const PARAM_CODEC_VERSION: u8 = 1;

/// Catalog of per-transfer parameter slots. Discriminants are persisted and
/// sent on the wire; never renumber. Swap-specific slots live in a dedicated
/// range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TxParameterId {
    TransactionType = 0,
    IsSender = 1,
    Amount = 2,
    Fee = 3,
    Change = 4,
    MinHeight = 5,
    MaxHeight = 6,
    Message = 7,
    MyId = 8,
    PeerId = 9,
    IsInitiator = 10,
    Lifetime = 11,
    CreateTime = 12,
    ModifyTime = 13,
    Status = 14,
    KernelId = 15,
    FailureReason = 16,
    TransactionRegistered = 17,
    KernelProofHeight = 18,
    KernelUnconfirmedHeight = 19,
    PeerResponseTime = 20,
    PeerResponseHeight = 21,
    NonceSlot = 22,
    PeerProtoVersion = 23,
    MySecureWalletId = 24,
    PeerSecureWalletId = 25,
    PeerSignature = 26,
    InputCoins = 27,
    OutputCoins = 28,
    InvitationSent = 29,

    AtomicSwapCoin = 300,
    AtomicSwapIsNativeSide = 301,
    AtomicSwapAmount = 302,
}

impl TxParameterId {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::TransactionType,
            1 => Self::IsSender,
            2 => Self::Amount,
            3 => Self::Fee,
            4 => Self::Change,
            5 => Self::MinHeight,
            6 => Self::MaxHeight,
            7 => Self::Message,
            8 => Self::MyId,
            9 => Self::PeerId,
            10 => Self::IsInitiator,
            11 => Self::Lifetime,
            12 => Self::CreateTime,
            13 => Self::ModifyTime,
            14 => Self::Status,
            15 => Self::KernelId,
            16 => Self::FailureReason,
            17 => Self::TransactionRegistered,
            18 => Self::KernelProofHeight,
            19 => Self::KernelUnconfirmedHeight,
            20 => Self::PeerResponseTime,
            21 => Self::PeerResponseHeight,
            22 => Self::NonceSlot,
            23 => Self::PeerProtoVersion,
            24 => Self::MySecureWalletId,
            25 => Self::PeerSecureWalletId,
            26 => Self::PeerSignature,
            27 => Self::InputCoins,
            28 => Self::OutputCoins,
            29 => Self::InvitationSent,
            300 => Self::AtomicSwapCoin,
            301 => Self::AtomicSwapIsNativeSide,
            302 => Self::AtomicSwapAmount,
            _ => return None,
        })
    }
}

/// Value type carried by a parameter cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    Bool = 0,
    U8 = 1,
    U32 = 2,
    U64 = 3,
    TxId = 4,
    WalletId = 5,
    KernelId = 6,
    TxStatus = 7,
    TxType = 8,
    FailureReason = 9,
    SwapCoin = 10,
    CoinList = 11,
    Bytes = 12,
}

impl TypeTag {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Bool,
            1 => Self::U8,
            2 => Self::U32,
            3 => Self::U64,
            4 => Self::TxId,
            5 => Self::WalletId,
            6 => Self::KernelId,
            7 => Self::TxStatus,
            8 => Self::TxType,
            9 => Self::FailureReason,
            10 => Self::SwapCoin,
            11 => Self::CoinList,
            12 => Self::Bytes,
            _ => return None,
        })
    }
}

/// Central id -> type dispatch. Every consumer decodes through this table.
pub fn type_tag(id: TxParameterId) -> TypeTag {
    use TxParameterId::*;
    match id {
        TransactionType => TypeTag::TxType,
        IsSender | IsInitiator | TransactionRegistered | InvitationSent
        | AtomicSwapIsNativeSide => TypeTag::Bool,
        Amount | Change | Fee | MinHeight | MaxHeight | Lifetime | CreateTime | ModifyTime
        | KernelProofHeight | KernelUnconfirmedHeight | PeerResponseTime | PeerResponseHeight
        | AtomicSwapAmount => TypeTag::U64,
        Message | PeerSignature => TypeTag::Bytes,
        MyId | PeerId | MySecureWalletId | PeerSecureWalletId => TypeTag::WalletId,
        Status => TypeTag::TxStatus,
        KernelId => TypeTag::KernelId,
        FailureReason => TypeTag::FailureReason,
        NonceSlot | PeerProtoVersion => TypeTag::U32,
        InputCoins | OutputCoins => TypeTag::CoinList,
        AtomicSwapCoin => TypeTag::SwapCoin,
    }
}

/// Types storable in a parameter cell.
pub trait ParameterValue: Sized {
    const TAG: TypeTag;
    fn encode_value(&self) -> Vec<u8>;
    fn decode_value(bytes: &[u8]) -> Option<Self>;
}

macro_rules! parameter_value {
    ($ty:ty, $tag:expr) => {
        impl ParameterValue for $ty {
            const TAG: TypeTag = $tag;

            fn encode_value(&self) -> Vec<u8> {
                options().serialize(self).unwrap_or_default()
            }

            fn decode_value(bytes: &[u8]) -> Option<Self> {
                decode_exact(bytes)
            }
        }
    };
}

parameter_value!(bool, TypeTag::Bool);
parameter_value!(u8, TypeTag::U8);
parameter_value!(u32, TypeTag::U32);
parameter_value!(u64, TypeTag::U64);
parameter_value!(TxId, TypeTag::TxId);
parameter_value!(WalletId, TypeTag::WalletId);
parameter_value!(KernelId, TypeTag::KernelId);
parameter_value!(TxStatus, TypeTag::TxStatus);
parameter_value!(TxType, TypeTag::TxType);
parameter_value!(TxFailureReason, TypeTag::FailureReason);
parameter_value!(SlotId, TypeTag::U32);
parameter_value!(SwapCoin, TypeTag::SwapCoin);
parameter_value!(Vec<CoinId>, TypeTag::CoinList);
parameter_value!(Vec<u8>, TypeTag::Bytes);

fn decode_exact<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    options().with_limit(MAX_CELL_BYTES as u64).deserialize(bytes).ok()
}

/// Hard cap on a single decoded cell; adversarial lengths stop here.
pub const MAX_CELL_BYTES: usize = 64 * 1024;

/// Frame a typed value: `[version][tag][len u32 le][value bytes]`.
pub fn encode_cell<T: ParameterValue>(value: &T) -> Vec<u8> {
    let body = value.encode_value();
    let mut cell = Vec::with_capacity(body.len() + 6);
    cell.push(PARAM_CODEC_VERSION);
    cell.push(T::TAG as u8);
    cell.extend_from_slice(&(body.len() as u32).to_le_bytes());
    cell.extend_from_slice(&body);
    cell
}

/// Split a framed cell into `(tag, value bytes)`; `None` on any malformation.
pub fn split_cell(cell: &[u8]) -> Option<(TypeTag, &[u8])> {
    if cell.len() < 6 || cell[0] != PARAM_CODEC_VERSION {
        return None;
    }
    let tag = TypeTag::from_u8(cell[1])?;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&cell[2..6]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_CELL_BYTES || cell.len() != 6 + len {
        return None;
    }
    Some((tag, &cell[6..]))
}

/// Decode a framed cell as `T`, verifying the tag expected for `id`.
pub fn decode_cell<T: ParameterValue>(id: TxParameterId, cell: &[u8]) -> Option<T> {
    let (tag, body) = split_cell(cell)?;
    if tag != T::TAG || tag != type_tag(id) {
        return None;
    }
    T::decode_value(body)
}

/// Error surfaced by the typed parameter layer.
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("mandatory parameter {0:?} is missing")]
    MissingMandatory(TxParameterId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WalletStore {
    /// Typed read of `(tx_id, id, sub)`. `Ok(None)` when absent; a present
    /// but undecodable cell fails loudly.
    pub fn get_parameter<T: ParameterValue>(
        &self,
        tx_id: &TxId,
        id: TxParameterId,
        sub: u32,
    ) -> Result<Option<T>, StoreError> {
        match self.tx_parameter_raw(tx_id, id.as_u32(), sub)? {
            Some((_, cell)) => match decode_cell::<T>(id, &cell) {
                Some(value) => Ok(Some(value)),
                None => Err(StoreError::ParameterType(id.as_u32())),
            },
            None => Ok(None),
        }
    }

    /// Typed write; idempotent on equal value. `public` marks the row as
    /// transmissible to the peer.
    pub fn set_parameter<T: ParameterValue>(
        &self,
        tx_id: &TxId,
        id: TxParameterId,
        value: &T,
        public: bool,
        sub: u32,
    ) -> Result<bool, StoreError> {
        if T::TAG != type_tag(id) {
            return Err(StoreError::ParameterType(id.as_u32()));
        }
        self.set_tx_parameter_raw(tx_id, id.as_u32(), sub, public, &encode_cell(value))
    }

    pub fn get_mandatory<T: ParameterValue>(
        &self,
        tx_id: &TxId,
        id: TxParameterId,
        sub: u32,
    ) -> Result<T, ParamError> {
        self.get_parameter(tx_id, id, sub)?
            .ok_or(ParamError::MissingMandatory(id))
    }

    pub fn delete_parameter(
        &self,
        tx_id: &TxId,
        id: TxParameterId,
        sub: u32,
    ) -> Result<(), StoreError> {
        self.delete_tx_parameter(tx_id, id.as_u32(), sub)
    }

    /// Denormalised projection of one transfer for observers.
    pub fn tx_description(&self, tx_id: &TxId) -> Result<Option<TxDescription>, StoreError> {
        let tx_type = match self.get_parameter::<TxType>(tx_id, TxParameterId::TransactionType, 0)? {
            Some(tx_type) => tx_type,
            None => return Ok(None),
        };
        let status = self
            .get_parameter(tx_id, TxParameterId::Status, 0)?
            .unwrap_or(TxStatus::Pending);
        let my_id = self
            .get_parameter(tx_id, TxParameterId::MyId, 0)?
            .unwrap_or(WalletId::ZERO);
        let peer_id = self
            .get_parameter(tx_id, TxParameterId::PeerId, 0)?
            .unwrap_or(WalletId::ZERO);
        Ok(Some(TxDescription {
            tx_id: *tx_id,
            tx_type,
            amount: self
                .get_parameter(tx_id, TxParameterId::Amount, 0)?
                .unwrap_or_default(),
            fee: self
                .get_parameter(tx_id, TxParameterId::Fee, 0)?
                .unwrap_or_default(),
            change: self
                .get_parameter(tx_id, TxParameterId::Change, 0)?
                .unwrap_or_default(),
            min_height: self
                .get_parameter(tx_id, TxParameterId::MinHeight, 0)?
                .unwrap_or_default(),
            self_tx: my_id == peer_id && !my_id.is_zero(),
            peer_id,
            my_id,
            message: self
                .get_parameter(tx_id, TxParameterId::Message, 0)?
                .unwrap_or_default(),
            create_time: self
                .get_parameter(tx_id, TxParameterId::CreateTime, 0)?
                .unwrap_or_default(),
            modify_time: self
                .get_parameter(tx_id, TxParameterId::ModifyTime, 0)?
                .unwrap_or_default(),
            sender: self
                .get_parameter(tx_id, TxParameterId::IsSender, 0)?
                .unwrap_or_default(),
            status,
            kernel_id: self.get_parameter(tx_id, TxParameterId::KernelId, 0)?,
            failure_reason: self.get_parameter(tx_id, TxParameterId::FailureReason, 0)?,
        }))
    }
}

/// In-memory parameter map used by swap offers and wire payloads. Entries
/// are ordered, so the serialized form is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMap {
    entries: BTreeMap<(u32, u32), ParamCell>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamCell {
    pub public: bool,
    #[serde(with = "serde_bytes")]
    pub cell: Vec<u8>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: ParameterValue>(&mut self, id: TxParameterId, value: &T) -> &mut Self {
        self.set_ext(id, value, true, 0)
    }

    pub fn set_ext<T: ParameterValue>(
        &mut self,
        id: TxParameterId,
        value: &T,
        public: bool,
        sub: u32,
    ) -> &mut Self {
        debug_assert!(T::TAG == type_tag(id));
        self.entries.insert(
            (id.as_u32(), sub),
            ParamCell {
                public,
                cell: encode_cell(value),
            },
        );
        self
    }

    pub fn get<T: ParameterValue>(&self, id: TxParameterId) -> Option<T> {
        self.get_sub(id, 0)
    }

    pub fn get_sub<T: ParameterValue>(&self, id: TxParameterId, sub: u32) -> Option<T> {
        self.entries
            .get(&(id.as_u32(), sub))
            .and_then(|entry| decode_cell(id, &entry.cell))
    }

    pub fn delete(&mut self, id: TxParameterId) {
        self.entries.remove(&(id.as_u32(), 0));
    }

    pub fn contains(&self, id: TxParameterId) -> bool {
        self.entries.contains_key(&(id.as_u32(), 0))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &ParamCell)> {
        self.entries
            .iter()
            .map(|((id, sub), cell)| (*id, *sub, cell))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Peer-bound parameter update, the one wire message of the negotiation
/// protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParamsMessage {
    pub tx_id: TxId,
    pub tx_type: Option<TxType>,
    pub from: WalletId,
    pub params: Vec<WireParam>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireParam {
    pub id: u32,
    pub sub: u32,
    #[serde(with = "serde_bytes")]
    pub cell: Vec<u8>,
}

impl TxParamsMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T: ParameterValue>(&mut self, id: TxParameterId, value: &T) -> &mut Self {
        self.add_sub(id, value, 0)
    }

    pub fn add_sub<T: ParameterValue>(
        &mut self,
        id: TxParameterId,
        value: &T,
        sub: u32,
    ) -> &mut Self {
        debug_assert!(T::TAG == type_tag(id));
        self.params.push(WireParam {
            id: id.as_u32(),
            sub,
            cell: encode_cell(value),
        });
        self
    }

    pub fn add_raw(&mut self, id: u32, sub: u32, cell: Vec<u8>) -> &mut Self {
        self.params.push(WireParam { id, sub, cell });
        self
    }

    pub fn get<T: ParameterValue>(&self, id: TxParameterId) -> Option<T> {
        self.params
            .iter()
            .find(|param| param.id == id.as_u32() && param.sub == 0)
            .and_then(|param| decode_cell(id, &param.cell))
    }

    pub fn encode(&self) -> Vec<u8> {
        options().serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        options()
            .with_limit((MAX_CELL_BYTES * 16) as u64)
            .deserialize(bytes)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> WalletStore {
        WalletStore::open(&dir.path().join("wallet.redb")).expect("open store")
    }

    #[test]
    fn typed_roundtrip_through_store() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir);
        let tx_id = TxId::generate();

        assert!(store
            .set_parameter(&tx_id, TxParameterId::Amount, &42u64, true, 0)
            .expect("set"));
        assert!(!store
            .set_parameter(&tx_id, TxParameterId::Amount, &42u64, true, 0)
            .expect("idempotent"));
        assert_eq!(
            store
                .get_parameter::<u64>(&tx_id, TxParameterId::Amount, 0)
                .expect("get"),
            Some(42)
        );

        store
            .set_parameter(&tx_id, TxParameterId::Status, &TxStatus::InProgress, true, 0)
            .expect("status");
        assert_eq!(
            store
                .get_parameter::<TxStatus>(&tx_id, TxParameterId::Status, 0)
                .expect("get status"),
            Some(TxStatus::InProgress)
        );

        store
            .delete_parameter(&tx_id, TxParameterId::Amount, 0)
            .expect("delete");
        assert_eq!(
            store
                .get_parameter::<u64>(&tx_id, TxParameterId::Amount, 0)
                .expect("get"),
            None
        );
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir);
        let tx_id = TxId::generate();

        assert!(matches!(
            store.set_parameter(&tx_id, TxParameterId::Amount, &true, false, 0),
            Err(StoreError::ParameterType(_))
        ));

        store
            .set_parameter(&tx_id, TxParameterId::Amount, &7u64, false, 0)
            .expect("set");
        assert!(matches!(
            store.get_parameter::<bool>(&tx_id, TxParameterId::Amount, 0),
            Err(StoreError::ParameterType(_))
        ));
    }

    #[test]
    fn get_mandatory_reports_missing_slot() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir);
        let tx_id = TxId::generate();
        let err = store
            .get_mandatory::<u64>(&tx_id, TxParameterId::Fee, 0)
            .expect_err("must be missing");
        assert!(matches!(
            err,
            ParamError::MissingMandatory(TxParameterId::Fee)
        ));
    }

    #[test]
    fn cell_frame_rejects_tampering() {
        let cell = encode_cell(&99u64);
        assert_eq!(decode_cell::<u64>(TxParameterId::Amount, &cell), Some(99));

        let mut bad_version = cell.clone();
        bad_version[0] ^= 1;
        assert!(decode_cell::<u64>(TxParameterId::Amount, &bad_version).is_none());

        let mut bad_tag = cell.clone();
        bad_tag[1] = TypeTag::Bool as u8;
        assert!(decode_cell::<u64>(TxParameterId::Amount, &bad_tag).is_none());

        let truncated = &cell[..cell.len() - 1];
        assert!(decode_cell::<u64>(TxParameterId::Amount, truncated).is_none());
    }

    #[test]
    fn wire_message_roundtrip() {
        let mut msg = TxParamsMessage::new();
        msg.tx_id = TxId::generate();
        msg.tx_type = Some(TxType::Simple);
        msg.from = WalletId::from_bytes([3u8; 32]);
        msg.add(TxParameterId::Amount, &1_000u64)
            .add(TxParameterId::Fee, &10u64)
            .add(TxParameterId::IsSender, &false);

        let decoded = TxParamsMessage::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
        assert_eq!(decoded.get::<u64>(TxParameterId::Amount), Some(1_000));
        assert_eq!(decoded.get::<bool>(TxParameterId::IsSender), Some(false));
        assert!(TxParamsMessage::decode(&msg.encode()[..5]).is_none());
    }
}
