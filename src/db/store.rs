use std::collections::BTreeSet;
use std::path::Path;

use redb::{Database, ReadableTable, WriteTransaction};
use thiserror::Error;
use tracing::debug;

use crate::db::codec::{self, CodecError, StateRow};
use crate::db::{migrations, schema};
use crate::types::{
    ChainState, ChainStateId, Coin, CoinId, CoinStatus, Height, TxId, WalletAddress, WalletId,
    GENESIS_HEIGHT, MAX_HEIGHT,
};

/// Error surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Any fault reported by the embedded database, message preserved.
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Codec(#[from] CodecError),
    #[error("schema version {stored} is not supported (compiled for {supported})")]
    SchemaVersion { stored: u32, supported: u32 },
    #[error("blob size mismatch: expected {expected} bytes, got {actual}")]
    BlobSizeMismatch { expected: usize, actual: usize },
    /// A single-row update touched an unexpected number of rows. Programmer
    /// error, not a user fault.
    #[error("update touched an unexpected number of rows")]
    UnexpectedRowCount,
    #[error("chain state already present")]
    DuplicateState,
    #[error("chain state row {0} not found")]
    StateNotFound(u64),
    #[error("cannot delete a functional chain state")]
    DeleteFunctionalState,
    #[error("parameter type mismatch for id {0}")]
    ParameterType(u32),
}

pub(crate) fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Transactional wallet store over an embedded database. All writes go
/// through [`WriteTransaction`]s; an uncommitted transaction rolls back on
/// drop. Transactions do not nest.
#[derive(Debug)]
pub struct WalletStore {
    db: Database,
}

impl WalletStore {
    /// Open or initialise a store at `path`. Validates the stored schema
    /// version after running pending migrations; an unknown version fails
    /// with [`StoreError::SchemaVersion`].
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend)?;
        let store = Self { db };
        store.ensure_tables()?;
        migrations::apply_all(&store)?;
        let version = store.schema_version()?;
        if version != schema::SCHEMA_VERSION_LATEST {
            return Err(StoreError::SchemaVersion {
                stored: version,
                supported: schema::SCHEMA_VERSION_LATEST,
            });
        }
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            txn.open_table(schema::WALLET_PARAMS).map_err(backend)?;
            txn.open_table(schema::MIGRATIONS).map_err(backend)?;
            txn.open_table(schema::STATES).map_err(backend)?;
            txn.open_table(schema::STATE_INDEX).map_err(backend)?;
            txn.open_table(schema::TIPS).map_err(backend)?;
            txn.open_table(schema::TIPS_REACHABLE).map_err(backend)?;
            txn.open_table(schema::COINS).map_err(backend)?;
            txn.open_table(schema::ADDRESSES).map_err(backend)?;
            txn.open_table(schema::TX_PARAMS).map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }

    /// Start a batched write session.
    pub fn write(&self) -> Result<StoreWriter, StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        Ok(StoreWriter { txn })
    }

    // ---- wallet-level parameters ----

    pub fn wallet_param(&self, id: schema::WalletParam) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(schema::WALLET_PARAMS).map_err(backend)?;
        let value = table
            .get(id as u32)
            .map_err(backend)?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        match self.wallet_param(schema::WalletParam::DbVersion)? {
            Some(bytes) => Ok(codec::decode_u32(&bytes)?),
            None => Ok(0),
        }
    }

    pub fn system_state(&self) -> Result<Option<ChainStateId>, StoreError> {
        match self.wallet_param(schema::WalletParam::SystemStateId)? {
            Some(bytes) => Ok(Some(codec::decode_state_id(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_system_state(&self, id: &ChainStateId) -> Result<(), StoreError> {
        let mut writer = self.write()?;
        writer.set_wallet_param(schema::WalletParam::SystemStateId, &codec::encode_state_id(id)?)?;
        writer.commit()
    }

    /// Bump-and-return for monotonic wallet counters.
    pub fn next_counter(&self, id: schema::WalletParam) -> Result<u64, StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        let next = {
            let mut table = txn.open_table(schema::WALLET_PARAMS).map_err(backend)?;
            let current = match table.get(id as u32).map_err(backend)? {
                Some(guard) => codec::decode_u64(guard.value())?,
                None => 0,
            };
            let next = current + 1;
            table
                .insert(id as u32, codec::encode_u64(next)?.as_slice())
                .map_err(backend)?;
            next
        };
        txn.commit().map_err(backend)?;
        Ok(next)
    }

    // ---- chain-state DAG ----

    /// Insert a chain-state row, linking it to its parent and adopting any
    /// already-present children. The row enters `Tips` iff it ends up with
    /// no children.
    pub fn insert_state(&self, state: &ChainState) -> Result<u64, StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        let rowid = {
            let mut states = txn.open_table(schema::STATES).map_err(backend)?;
            let mut index = txn.open_table(schema::STATE_INDEX).map_err(backend)?;
            let mut tips = txn.open_table(schema::TIPS).map_err(backend)?;
            let mut params = txn.open_table(schema::WALLET_PARAMS).map_err(backend)?;

            let key = schema::state_index_key(state.height, &state.hash);
            if index.get(key.as_slice()).map_err(backend)?.is_some() {
                return Err(StoreError::DuplicateState);
            }

            let rowid = {
                let current = match params
                    .get(schema::WalletParam::NextStateRow as u32)
                    .map_err(backend)?
                {
                    Some(guard) => codec::decode_u64(guard.value())?,
                    None => 0,
                };
                let next = current + 1;
                params
                    .insert(
                        schema::WalletParam::NextStateRow as u32,
                        codec::encode_u64(next)?.as_slice(),
                    )
                    .map_err(backend)?;
                next
            };

            let mut row = StateRow::new(state.clone());

            // Link to the parent when it is already present.
            let parent_key =
                schema::state_index_key(state.height.wrapping_sub(1), &state.hash_prev);
            let parent = index
                .get(parent_key.as_slice())
                .map_err(backend)?
                .map(|guard| guard.value());
            if let Some(parent_row) = parent {
                row.row_prev = Some(parent_row);
                let mut prow = load_state_row(&states, parent_row)?;
                if prow.count_next == 0 {
                    tips.remove(schema::tip_key(prow.state.height, parent_row).as_slice())
                        .map_err(backend)?;
                }
                prow.count_next += 1;
                save_state_row(&mut states, parent_row, &prow)?;
            }

            // Adopt children inserted before their parent.
            let (lo, hi) = schema::state_index_bounds(state.height + 1);
            let candidates: Vec<u64> = index
                .range(lo.as_slice()..=hi.as_slice())
                .map_err(backend)?
                .map(|entry| entry.map(|(_, value)| value.value()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend)?;
            for child_row in candidates {
                let mut crow = load_state_row(&states, child_row)?;
                if crow.state.hash_prev == state.hash {
                    crow.row_prev = Some(rowid);
                    save_state_row(&mut states, child_row, &crow)?;
                    row.count_next += 1;
                }
            }

            save_state_row(&mut states, rowid, &row)?;
            index.insert(key.as_slice(), rowid).map_err(backend)?;
            if row.count_next == 0 {
                tips.insert(schema::tip_key(state.height, rowid).as_slice(), rowid)
                    .map_err(backend)?;
            }
            rowid
        };
        txn.commit().map_err(backend)?;
        Ok(rowid)
    }

    pub fn get_state(&self, rowid: u64) -> Result<ChainState, StoreError> {
        Ok(self.get_state_row(rowid)?.state)
    }

    pub fn get_state_row(&self, rowid: u64) -> Result<StateRow, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let states = txn.open_table(schema::STATES).map_err(backend)?;
        match states.get(rowid).map_err(backend)? {
            Some(guard) => Ok(codec::decode_state_row(guard.value())?),
            None => Err(StoreError::StateNotFound(rowid)),
        }
    }

    pub fn state_find(&self, id: &ChainStateId) -> Result<Option<u64>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let index = txn.open_table(schema::STATE_INDEX).map_err(backend)?;
        let key = schema::state_index_key(id.height, &id.hash);
        Ok(index
            .get(key.as_slice())
            .map_err(backend)?
            .map(|guard| guard.value()))
    }

    /// Delete a non-functional row, unlinking children and returning the
    /// parent to `Tips` when it loses its last child.
    pub fn delete_idle(&self, rowid: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut states = txn.open_table(schema::STATES).map_err(backend)?;
            let mut index = txn.open_table(schema::STATE_INDEX).map_err(backend)?;
            let mut tips = txn.open_table(schema::TIPS).map_err(backend)?;

            let row = load_state_row(&states, rowid)?;
            if row.functional {
                return Err(StoreError::DeleteFunctionalState);
            }

            // Children lose their parent link.
            let (lo, hi) = schema::state_index_bounds(row.state.height + 1);
            let candidates: Vec<u64> = index
                .range(lo.as_slice()..=hi.as_slice())
                .map_err(backend)?
                .map(|entry| entry.map(|(_, value)| value.value()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend)?;
            for child_row in candidates {
                let mut crow = load_state_row(&states, child_row)?;
                if crow.row_prev == Some(rowid) {
                    crow.row_prev = None;
                    save_state_row(&mut states, child_row, &crow)?;
                }
            }

            if row.count_next == 0 {
                tips.remove(schema::tip_key(row.state.height, rowid).as_slice())
                    .map_err(backend)?;
            }

            if let Some(parent_row) = row.row_prev {
                let mut prow = load_state_row(&states, parent_row)?;
                if prow.count_next == 0 {
                    return Err(StoreError::UnexpectedRowCount);
                }
                prow.count_next -= 1;
                if prow.count_next == 0 {
                    tips.insert(
                        schema::tip_key(prow.state.height, parent_row).as_slice(),
                        parent_row,
                    )
                    .map_err(backend)?;
                }
                save_state_row(&mut states, parent_row, &prow)?;
            }

            states.remove(rowid).map_err(backend)?;
            index
                .remove(schema::state_index_key(row.state.height, &row.state.hash).as_slice())
                .map_err(backend)?;
        }
        txn.commit().map_err(backend)
    }

    /// Mark a row functional and propagate reachability: a functional row
    /// whose parent is reachable (or which sits at genesis height) becomes
    /// reachable, joins the reachable tip set and evicts its parent from it.
    pub fn set_state_functional(&self, rowid: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut states = txn.open_table(schema::STATES).map_err(backend)?;
            let index = txn.open_table(schema::STATE_INDEX).map_err(backend)?;
            let mut reachable_tips = txn.open_table(schema::TIPS_REACHABLE).map_err(backend)?;

            let mut row = load_state_row(&states, rowid)?;
            if !row.functional {
                row.functional = true;
                save_state_row(&mut states, rowid, &row)?;
            }

            let parent_reachable = match row.row_prev {
                Some(parent_row) => load_state_row(&states, parent_row)?.reachable,
                None => row.state.height == GENESIS_HEIGHT,
            };
            if !parent_reachable || row.reachable {
                return Ok(());
            }

            let mut frontier = vec![rowid];
            while let Some(current) = frontier.pop() {
                let mut crow = load_state_row(&states, current)?;
                crow.reachable = true;
                save_state_row(&mut states, current, &crow)?;
                reachable_tips
                    .insert(
                        schema::tip_key(crow.state.height, current).as_slice(),
                        current,
                    )
                    .map_err(backend)?;
                if let Some(parent_row) = crow.row_prev {
                    let prow = load_state_row(&states, parent_row)?;
                    reachable_tips
                        .remove(schema::tip_key(prow.state.height, parent_row).as_slice())
                        .map_err(backend)?;
                }

                let (lo, hi) = schema::state_index_bounds(crow.state.height + 1);
                let candidates: Vec<u64> = index
                    .range(lo.as_slice()..=hi.as_slice())
                    .map_err(backend)?
                    .map(|entry| entry.map(|(_, value)| value.value()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(backend)?;
                for child_row in candidates {
                    let child = load_state_row(&states, child_row)?;
                    if child.row_prev == Some(current) && child.functional && !child.reachable {
                        frontier.push(child_row);
                    }
                }
            }
        }
        txn.commit().map_err(backend)
    }

    pub fn tips(&self) -> Result<Vec<(Height, u64)>, StoreError> {
        self.collect_tips(false)
    }

    pub fn tips_reachable(&self) -> Result<Vec<(Height, u64)>, StoreError> {
        self.collect_tips(true)
    }

    fn collect_tips(&self, reachable: bool) -> Result<Vec<(Height, u64)>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = if reachable {
            txn.open_table(schema::TIPS_REACHABLE).map_err(backend)?
        } else {
            txn.open_table(schema::TIPS).map_err(backend)?
        };
        let mut out = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let (key, value) = entry.map_err(backend)?;
            let key = key.value();
            if key.len() != 16 {
                return Err(StoreError::BlobSizeMismatch {
                    expected: 16,
                    actual: key.len(),
                });
            }
            let mut height_bytes = [0u8; 8];
            height_bytes.copy_from_slice(&key[..8]);
            out.push((Height::from_be_bytes(height_bytes), value.value()));
        }
        Ok(out)
    }

    pub fn list_state_rows(&self) -> Result<Vec<(u64, StateRow)>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let states = txn.open_table(schema::STATES).map_err(backend)?;
        let mut out = Vec::new();
        for entry in states.iter().map_err(backend)? {
            let (key, value) = entry.map_err(backend)?;
            out.push((key.value(), codec::decode_state_row(value.value())?));
        }
        Ok(out)
    }

    // ---- coins ----

    pub fn coin(&self, id: &CoinId) -> Result<Option<Coin>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let coins = txn.open_table(schema::COINS).map_err(backend)?;
        match coins.get(schema::coin_key(id).as_slice()).map_err(backend)? {
            Some(guard) => Ok(Some(codec::decode_coin(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn coins(&self) -> Result<Vec<Coin>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let coins = txn.open_table(schema::COINS).map_err(backend)?;
        let mut out = Vec::new();
        for entry in coins.iter().map_err(backend)? {
            let (_, value) = entry.map_err(backend)?;
            out.push(codec::decode_coin(value.value())?);
        }
        Ok(out)
    }

    /// Persist a batch of coins in one transaction.
    pub fn save_coins(&self, coins: &[Coin]) -> Result<(), StoreError> {
        let mut writer = self.write()?;
        for coin in coins {
            writer.put_coin(coin)?;
        }
        writer.commit()
    }

    /// Every coin created or spent by `tx_id`.
    pub fn coins_by_tx(&self, tx_id: &TxId) -> Result<Vec<Coin>, StoreError> {
        Ok(self
            .coins()?
            .into_iter()
            .filter(|coin| {
                coin.create_tx_id == Some(*tx_id) || coin.spent_tx_id == Some(*tx_id)
            })
            .collect())
    }

    /// Undo a transfer's coin reservations: unconfirmed coins it created are
    /// dropped, coins it was spending return to `Available`.
    pub fn rollback_tx(&self, tx_id: &TxId) -> Result<(), StoreError> {
        let affected = self.coins_by_tx(tx_id)?;
        let mut writer = self.write()?;
        for mut coin in affected {
            if coin.create_tx_id == Some(*tx_id) && coin.confirm_height == MAX_HEIGHT {
                writer.delete_coin(&coin.id)?;
                continue;
            }
            if coin.spent_tx_id == Some(*tx_id) {
                coin.status = CoinStatus::Available;
                coin.spent_tx_id = None;
                coin.spent_height = MAX_HEIGHT;
                writer.put_coin(&coin)?;
            }
        }
        writer.commit()?;
        debug!(tx = %tx_id, "coin reservations rolled back");
        Ok(())
    }

    // ---- addresses ----

    pub fn address(&self, id: &WalletId) -> Result<Option<WalletAddress>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(schema::ADDRESSES).map_err(backend)?;
        match table.get(id.as_bytes().as_slice()).map_err(backend)? {
            Some(guard) => Ok(Some(codec::decode_address(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn addresses(&self) -> Result<Vec<WalletAddress>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(schema::ADDRESSES).map_err(backend)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(backend)? {
            let (_, value) = entry.map_err(backend)?;
            out.push(codec::decode_address(value.value())?);
        }
        Ok(out)
    }

    pub fn save_address(&self, address: &WalletAddress) -> Result<(), StoreError> {
        let mut writer = self.write()?;
        writer.put_address(address)?;
        writer.commit()
    }

    pub fn delete_address(&self, id: &WalletId) -> Result<(), StoreError> {
        let mut writer = self.write()?;
        writer.delete_address(id)?;
        writer.commit()
    }

    // ---- transfer parameters ----

    /// Raw parameter cell: `(public, bytes)`.
    pub fn tx_parameter_raw(
        &self,
        tx_id: &TxId,
        param: u32,
        sub: u32,
    ) -> Result<Option<(bool, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(schema::TX_PARAMS).map_err(backend)?;
        let key = schema::tx_param_key(tx_id, param, sub);
        match table.get(key.as_slice()).map_err(backend)? {
            Some(guard) => Ok(Some(split_param_value(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Idempotent raw write; returns whether the row actually changed.
    pub fn set_tx_parameter_raw(
        &self,
        tx_id: &TxId,
        param: u32,
        sub: u32,
        public: bool,
        cell: &[u8],
    ) -> Result<bool, StoreError> {
        let mut writer = self.write()?;
        let changed = writer.set_tx_parameter_raw(tx_id, param, sub, public, cell)?;
        writer.commit()?;
        Ok(changed)
    }

    pub fn delete_tx_parameter(
        &self,
        tx_id: &TxId,
        param: u32,
        sub: u32,
    ) -> Result<(), StoreError> {
        let mut writer = self.write()?;
        writer.delete_tx_parameter(tx_id, param, sub)?;
        writer.commit()
    }

    /// Every parameter row of one transfer: `(param, sub, public, bytes)`.
    pub fn tx_parameters(&self, tx_id: &TxId) -> Result<Vec<(u32, u32, bool, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(schema::TX_PARAMS).map_err(backend)?;
        let prefix = schema::tx_param_prefix(tx_id);
        let mut out = Vec::new();
        for entry in table.range(prefix.as_slice()..).map_err(backend)? {
            let (key, value) = entry.map_err(backend)?;
            let key = key.value();
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() != 24 {
                return Err(StoreError::BlobSizeMismatch {
                    expected: 24,
                    actual: key.len(),
                });
            }
            let mut param_bytes = [0u8; 4];
            param_bytes.copy_from_slice(&key[16..20]);
            let mut sub_bytes = [0u8; 4];
            sub_bytes.copy_from_slice(&key[20..24]);
            let (public, bytes) = split_param_value(value.value())?;
            out.push((
                u32::from_be_bytes(param_bytes),
                u32::from_be_bytes(sub_bytes),
                public,
                bytes,
            ));
        }
        Ok(out)
    }

    /// Prune the whole parameter subspace of a transfer.
    pub fn delete_tx(&self, tx_id: &TxId) -> Result<(), StoreError> {
        let mut writer = self.write()?;
        writer.delete_tx(tx_id)?;
        writer.commit()
    }

    pub fn list_tx_ids(&self) -> Result<Vec<TxId>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(schema::TX_PARAMS).map_err(backend)?;
        let mut seen = BTreeSet::new();
        for entry in table.iter().map_err(backend)? {
            let (key, _) = entry.map_err(backend)?;
            let key = key.value();
            if key.len() >= 16 {
                let mut id = [0u8; 16];
                id.copy_from_slice(&key[..16]);
                seen.insert(TxId::from_bytes(id));
            }
        }
        Ok(seen.into_iter().collect())
    }
}

/// Batched write session; rolls back on drop unless committed.
pub struct StoreWriter {
    txn: WriteTransaction,
}

impl StoreWriter {
    pub fn set_wallet_param(
        &mut self,
        id: schema::WalletParam,
        value: &[u8],
    ) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(schema::WALLET_PARAMS).map_err(backend)?;
        table.insert(id as u32, value).map_err(backend)?;
        Ok(())
    }

    pub fn put_coin(&mut self, coin: &Coin) -> Result<(), StoreError> {
        let encoded = codec::encode_coin(coin)?;
        let mut table = self.txn.open_table(schema::COINS).map_err(backend)?;
        table
            .insert(schema::coin_key(&coin.id).as_slice(), encoded.as_slice())
            .map_err(backend)?;
        Ok(())
    }

    pub fn delete_coin(&mut self, id: &CoinId) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(schema::COINS).map_err(backend)?;
        table
            .remove(schema::coin_key(id).as_slice())
            .map_err(backend)?;
        Ok(())
    }

    pub fn put_address(&mut self, address: &WalletAddress) -> Result<(), StoreError> {
        let encoded = codec::encode_address(address)?;
        let mut table = self.txn.open_table(schema::ADDRESSES).map_err(backend)?;
        table
            .insert(address.wallet_id.as_bytes().as_slice(), encoded.as_slice())
            .map_err(backend)?;
        Ok(())
    }

    pub fn delete_address(&mut self, id: &WalletId) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(schema::ADDRESSES).map_err(backend)?;
        table
            .remove(id.as_bytes().as_slice())
            .map_err(backend)?;
        Ok(())
    }

    pub fn set_tx_parameter_raw(
        &mut self,
        tx_id: &TxId,
        param: u32,
        sub: u32,
        public: bool,
        cell: &[u8],
    ) -> Result<bool, StoreError> {
        let mut table = self.txn.open_table(schema::TX_PARAMS).map_err(backend)?;
        let key = schema::tx_param_key(tx_id, param, sub);
        let existing = table
            .get(key.as_slice())
            .map_err(backend)?
            .map(|guard| guard.value().to_vec());
        let value = join_param_value(public, cell);
        if existing.as_deref() == Some(value.as_slice()) {
            return Ok(false);
        }
        table
            .insert(key.as_slice(), value.as_slice())
            .map_err(backend)?;
        Ok(true)
    }

    pub fn delete_tx_parameter(
        &mut self,
        tx_id: &TxId,
        param: u32,
        sub: u32,
    ) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(schema::TX_PARAMS).map_err(backend)?;
        table
            .remove(schema::tx_param_key(tx_id, param, sub).as_slice())
            .map_err(backend)?;
        Ok(())
    }

    pub fn delete_tx(&mut self, tx_id: &TxId) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(schema::TX_PARAMS).map_err(backend)?;
        let prefix = schema::tx_param_prefix(tx_id);
        let keys: Vec<Vec<u8>> = table
            .range(prefix.as_slice()..)
            .map_err(backend)?
            .map(|entry| entry.map(|(key, _)| key.value().to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?
            .into_iter()
            .take_while(|key| key.starts_with(&prefix))
            .collect();
        for key in keys {
            table.remove(key.as_slice()).map_err(backend)?;
        }
        Ok(())
    }

    pub fn record_migration(&mut self, version: u32, applied_at: u64) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(schema::MIGRATIONS).map_err(backend)?;
        table.insert(version, applied_at).map_err(backend)?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.txn.commit().map_err(backend)
    }
}

fn load_state_row(
    states: &impl ReadableTable<u64, &'static [u8]>,
    rowid: u64,
) -> Result<StateRow, StoreError> {
    match states.get(rowid).map_err(backend)? {
        Some(guard) => Ok(codec::decode_state_row(guard.value())?),
        // A linked row must exist; its absence means a partial update.
        None => Err(StoreError::UnexpectedRowCount),
    }
}

fn save_state_row(
    states: &mut redb::Table<'_, u64, &'static [u8]>,
    rowid: u64,
    row: &StateRow,
) -> Result<(), StoreError> {
    let encoded = codec::encode_state_row(row)?;
    states.insert(rowid, encoded.as_slice()).map_err(backend)?;
    Ok(())
}

fn join_param_value(public: bool, cell: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(cell.len() + 1);
    value.push(u8::from(public));
    value.extend_from_slice(cell);
    value
}

fn split_param_value(value: &[u8]) -> Result<(bool, Vec<u8>), StoreError> {
    match value.split_first() {
        Some((flag, rest)) => Ok((*flag != 0, rest.to_vec())),
        None => Err(StoreError::BlobSizeMismatch {
            expected: 1,
            actual: 0,
        }),
    }
}
