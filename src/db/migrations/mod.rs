//! Versioned, idempotent schema migrations. The stored version is brought
//! forward step by step and every applied step is recorded in the
//! migrations table; a version newer than the compiled one is rejected at
//! open.

pub(crate) mod v2;

use tracing::info;

use crate::db::codec;
use crate::db::schema::{self, WalletParam};
use crate::db::store::{StoreError, WalletStore};
use crate::types::now_timestamp;

pub(crate) fn apply_all(store: &WalletStore) -> Result<(), StoreError> {
    let stored = store.schema_version()?;
    if stored > schema::SCHEMA_VERSION_LATEST {
        return Err(StoreError::SchemaVersion {
            stored,
            supported: schema::SCHEMA_VERSION_LATEST,
        });
    }

    if stored == 0 {
        // Fresh store: stamp the current layout, no upgrades to run.
        let mut writer = store.write()?;
        writer.set_wallet_param(
            WalletParam::DbVersion,
            &codec::encode_u32(schema::SCHEMA_VERSION_LATEST)?,
        )?;
        writer.record_migration(schema::SCHEMA_VERSION_LATEST, now_timestamp())?;
        writer.commit()?;
        return Ok(());
    }

    let mut version = stored;
    if version < schema::SCHEMA_VERSION_V2 {
        v2::apply(store)?;
        version = schema::SCHEMA_VERSION_V2;
        let mut writer = store.write()?;
        writer.set_wallet_param(WalletParam::DbVersion, &codec::encode_u32(version)?)?;
        writer.record_migration(version, now_timestamp())?;
        writer.commit()?;
        info!(from = stored, to = version, "wallet store migrated");
    }
    Ok(())
}
