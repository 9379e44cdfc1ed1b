use crate::db::codec;
use crate::db::schema::WalletParam;
use crate::db::store::{StoreError, WalletStore};

/// v1 -> v2: seed the wallet counters that later layouts assume are present.
pub(crate) fn apply(store: &WalletStore) -> Result<(), StoreError> {
    let mut writer = store.write()?;
    for param in [
        WalletParam::NextStateRow,
        WalletParam::NextOwnId,
        WalletParam::NextCoinIdx,
    ] {
        if store.wallet_param(param)?.is_none() {
            writer.set_wallet_param(param, &codec::encode_u64(0)?)?;
        }
    }
    writer.commit()
}
