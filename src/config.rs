use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Height;

const DEFAULT_TX_LIFETIME: Height = 720;
const DEFAULT_PEER_RESPONSE_TIME: Height = 1_440;
const DEFAULT_DEDUP_CACHE_SIZE: usize = 512;
const DEFAULT_MIN_FEE: u64 = 100;

/// High-level wallet configuration exposed to runtime services.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WalletConfig {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub broadcast: BroadcastConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl WalletConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}

/// Storage paths and lifecycle metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the wallet database file.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/wallet.redb"),
        }
    }
}

/// Negotiation defaults applied to freshly created transfers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Blocks a transfer stays registrable after its min height.
    pub tx_lifetime: Height,
    /// Blocks the peer gets to answer a negotiation round.
    pub peer_response_time: Height,
    /// Smallest fee accepted for an outgoing transfer.
    pub min_fee: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tx_lifetime: DEFAULT_TX_LIFETIME,
            peer_response_time: DEFAULT_PEER_RESPONSE_TIME,
            min_fee: DEFAULT_MIN_FEE,
        }
    }
}

/// Broadcast-bus tuning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Entries kept in the router's duplicate-suppression cache.
    pub dedup_cache_size: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            dedup_cache_size: DEFAULT_DEDUP_CACHE_SIZE,
        }
    }
}
