//! Canonical user-visible message catalog. Defaults are embedded; a TOML
//! file may override individual keys. The catalog is authoritative across
//! versions: failure enums map to stable keys.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use toml::Value;
use tracing::warn;

use crate::types::TxFailureReason;

#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    overrides: HashMap<String, String>,
}

impl MessageCatalog {
    pub fn from_file(path: &Path) -> Result<Self, MessageCatalogError> {
        let contents = fs::read_to_string(path)?;
        let overrides = parse_catalog(&contents)?;
        Ok(Self { overrides })
    }

    pub fn text(&self, key: &str) -> String {
        if let Some(value) = self.overrides.get(key) {
            value.clone()
        } else if let Some(default) = DEFAULT_MESSAGES.get(key) {
            default.clone()
        } else {
            key.to_string()
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageCatalogError {
    #[error("failed to read wallet message catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse wallet message catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("wallet message catalog root must be a table")]
    RootNotTable,
    #[error("wallet message catalog entry `{key}` must be a string or table")]
    InvalidValue { key: String },
}

static DEFAULT_MESSAGES: Lazy<HashMap<String, String>> = Lazy::new(|| {
    parse_catalog(include_str!("../wallet_messages.toml"))
        .expect("embedded wallet_messages.toml must be valid")
});

static CATALOG: OnceCell<MessageCatalog> = OnceCell::new();

pub fn catalog() -> &'static MessageCatalog {
    CATALOG.get_or_init(|| {
        load_catalog_from_optional_path(catalog_path_from_env().as_deref()).unwrap_or_else(|err| {
            warn!("wallet messages unavailable: {err}");
            MessageCatalog::default()
        })
    })
}

/// Canonical text for a failure reason.
pub fn failure_message(reason: TxFailureReason) -> String {
    catalog().text(failure_key(reason))
}

fn failure_key(reason: TxFailureReason) -> &'static str {
    match reason {
        TxFailureReason::Unknown => "failure.unknown",
        TxFailureReason::Canceled => "failure.canceled",
        TxFailureReason::PeerSignatureInvalid => "failure.peer_signature_invalid",
        TxFailureReason::FailedToRegister => "failure.failed_to_register",
        TxFailureReason::InvalidTransaction => "failure.invalid_transaction",
        TxFailureReason::InvalidKernelProof => "failure.invalid_kernel_proof",
        TxFailureReason::TransactionExpired => "failure.transaction_expired",
        TxFailureReason::NoInputs => "failure.no_inputs",
        TxFailureReason::NotEnoughFunds => "failure.not_enough_funds",
        TxFailureReason::KeyKeeperError => "failure.key_keeper_error",
        TxFailureReason::KeyKeeperUserAbort => "failure.key_keeper_user_abort",
        TxFailureReason::NoKeyKeeper => "failure.no_key_keeper",
        TxFailureReason::NoMasterKey => "failure.no_master_key",
        TxFailureReason::MissingMandatoryParameter => "failure.missing_mandatory_parameter",
        TxFailureReason::PeerResponseTooLate => "failure.peer_response_too_late",
        TxFailureReason::FeeTooLow => "failure.fee_too_low",
    }
}

pub(crate) fn load_catalog_from_optional_path(
    path: Option<&Path>,
) -> Result<MessageCatalog, MessageCatalogError> {
    if let Some(path) = path {
        MessageCatalog::from_file(path)
    } else {
        Ok(MessageCatalog::default())
    }
}

fn catalog_path_from_env() -> Option<PathBuf> {
    if let Some(value) = env::var_os("MIRAGE_WALLET_MESSAGES_PATH") {
        return Some(PathBuf::from(value));
    }
    let candidate = PathBuf::from("wallet_messages.toml");
    if candidate.exists() {
        Some(candidate)
    } else {
        None
    }
}

fn parse_catalog(input: &str) -> Result<HashMap<String, String>, MessageCatalogError> {
    let value: Value = toml::from_str(input)?;
    let table = value.as_table().ok_or(MessageCatalogError::RootNotTable)?;
    let mut flattened = HashMap::new();
    for (key, value) in table {
        flatten_value(&mut flattened, key, value)?;
    }
    Ok(flattened)
}

fn flatten_value(
    target: &mut HashMap<String, String>,
    prefix: &str,
    value: &Value,
) -> Result<(), MessageCatalogError> {
    match value {
        Value::Table(table) => {
            for (child, child_value) in table {
                let next_key = if prefix.is_empty() {
                    child.clone()
                } else {
                    format!("{prefix}.{child}")
                };
                flatten_value(target, &next_key, child_value)?;
            }
            Ok(())
        }
        Value::String(text) => {
            target.insert(prefix.to_string(), text.clone());
            Ok(())
        }
        _ => Err(MessageCatalogError::InvalidValue {
            key: prefix.to_string(),
        }),
    }
}
