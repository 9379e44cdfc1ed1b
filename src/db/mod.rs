pub mod codec;
pub(crate) mod migrations;
pub mod schema;
pub mod store;

pub use codec::StateRow;
pub use store::{StoreError, StoreWriter, WalletStore};
