use redb::TableDefinition;

use crate::types::{CoinId, Height, TxId};

/// First shipped layout: all core tables plus the version stamp.
pub const SCHEMA_VERSION_V1: u32 = 1;
/// Adds seeded wallet metadata defaults.
pub const SCHEMA_VERSION_V2: u32 = 2;
pub const SCHEMA_VERSION_LATEST: u32 = SCHEMA_VERSION_V2;

/// Wallet-level scalar parameters, keyed by [`WalletParam`].
pub const WALLET_PARAMS: TableDefinition<u32, &[u8]> = TableDefinition::new("wallet_params");
/// Applied migrations: version -> apply timestamp.
pub const MIGRATIONS: TableDefinition<u32, u64> = TableDefinition::new("migrations");
/// Chain-state rows keyed by rowid.
pub const STATES: TableDefinition<u64, &[u8]> = TableDefinition::new("states");
/// `(height, hash) -> rowid` lookup for chain-state rows.
pub const STATE_INDEX: TableDefinition<&[u8], u64> = TableDefinition::new("state_index");
/// Rows with no children, keyed by `(height, rowid)`.
pub const TIPS: TableDefinition<&[u8], u64> = TableDefinition::new("tips");
/// Tips whose full ancestry is present and functional.
pub const TIPS_REACHABLE: TableDefinition<&[u8], u64> = TableDefinition::new("tips_reachable");
/// Wallet-controlled outputs keyed by [`coin_key`].
pub const COINS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("coins");
/// Address book keyed by the 32-byte wallet id.
pub const ADDRESSES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("addresses");
/// Per-transfer parameter rows keyed by [`tx_param_key`].
pub const TX_PARAMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tx_params");

/// Keys into [`WALLET_PARAMS`]. Discriminants are persisted; never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum WalletParam {
    DbVersion = 0,
    SystemStateId = 1,
    NextStateRow = 2,
    NextOwnId = 3,
    NextCoinIdx = 4,
}

pub fn state_index_key(height: Height, hash: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hash);
    key
}

/// Inclusive range covering every state-index entry at `height`.
pub fn state_index_bounds(height: Height) -> (Vec<u8>, Vec<u8>) {
    (
        state_index_key(height, &[0u8; 32]),
        state_index_key(height, &[0xffu8; 32]),
    )
}

pub fn tip_key(height: Height, rowid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(&rowid.to_be_bytes());
    key
}

pub fn coin_key(id: &CoinId) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.extend_from_slice(&id.idx.to_be_bytes());
    key.push(id.kind as u8);
    key.extend_from_slice(&id.sub_idx.to_be_bytes());
    key.extend_from_slice(&id.value.to_be_bytes());
    key
}

pub fn tx_param_key(tx_id: &TxId, param: u32, sub: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(tx_id.as_bytes());
    key.extend_from_slice(&param.to_be_bytes());
    key.extend_from_slice(&sub.to_be_bytes());
    key
}

/// Prefix covering every parameter row of one transfer.
pub fn tx_param_prefix(tx_id: &TxId) -> Vec<u8> {
    tx_id.as_bytes().to_vec()
}
