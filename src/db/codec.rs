use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChainState, ChainStateId, Coin, WalletAddress};

/// Error surfaced when encoding or decoding stored records fails.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Deterministic options shared by disk records and wire payloads.
pub fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Chain-state row as stored: the header plus the linkage the DAG walks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRow {
    pub state: ChainState,
    pub row_prev: Option<u64>,
    pub count_next: u32,
    pub functional: bool,
    pub reachable: bool,
}

impl StateRow {
    pub fn new(state: ChainState) -> Self {
        Self {
            state,
            row_prev: None,
            count_next: 0,
            functional: false,
            reachable: false,
        }
    }
}

pub fn encode_state_row(row: &StateRow) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(row)?)
}

pub fn decode_state_row(bytes: &[u8]) -> Result<StateRow, CodecError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_coin(coin: &Coin) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(coin)?)
}

pub fn decode_coin(bytes: &[u8]) -> Result<Coin, CodecError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_address(address: &WalletAddress) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(address)?)
}

pub fn decode_address(bytes: &[u8]) -> Result<WalletAddress, CodecError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_state_id(id: &ChainStateId) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(id)?)
}

pub fn decode_state_id(bytes: &[u8]) -> Result<ChainStateId, CodecError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_u32(value: u32) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(&value)?)
}

pub fn decode_u32(bytes: &[u8]) -> Result<u32, CodecError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_u64(value: u64) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(&value)?)
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64, CodecError> {
    Ok(options().deserialize(bytes)?)
}
