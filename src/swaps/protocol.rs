//! Signed-offer wire codec: `[body][signature]`, where the body is the
//! deterministic encoding of the offer and the signature is the
//! publisher's BBS key over it. Parsing never throws on adversarial input;
//! silent rejection is the contract.

use std::sync::Arc;

use bincode::Options;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;
use tracing::debug;

use crate::db::codec::options;
use crate::db::store::WalletStore;
use crate::keykeeper::{KeyKeeper, KeyKeeperError, KeyUsage};
use crate::swaps::SwapOffer;
use crate::types::WalletId;

/// Trailing signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Upper bound on an encoded offer body; larger inputs are rejected
/// before deserialization allocates anything.
pub const MAX_BODY_BYTES: u64 = 256 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stated publisher is not one of the wallet's own addresses.
    #[error("publisher {0} is not a local address")]
    ForeignPublisher(WalletId),
    #[error("offer signing failed: {0}")]
    KeyKeeper(#[from] KeyKeeperError),
    #[error(transparent)]
    Store(#[from] crate::db::store::StoreError),
}

/// Encoder/decoder for board messages, bound to the local address book and
/// signing capability.
pub struct OfferBoardProtocol {
    store: Arc<WalletStore>,
    keykeeper: Arc<dyn KeyKeeper>,
}

impl OfferBoardProtocol {
    pub fn new(store: Arc<WalletStore>, keykeeper: Arc<dyn KeyKeeper>) -> Self {
        Self { store, keykeeper }
    }

    /// Serialize and sign an offer on behalf of its publisher. Fails when
    /// the publisher key is not locally held.
    pub fn create_message(&self, offer: &SwapOffer) -> Result<Vec<u8>, ProtocolError> {
        let address = self
            .store
            .address(&offer.publisher_id)?
            .filter(|address| address.is_own())
            .ok_or(ProtocolError::ForeignPublisher(offer.publisher_id))?;

        let body = options().serialize(offer).unwrap_or_default();
        let signature = self
            .keykeeper
            .sign(address.own_id, KeyUsage::Bbs, &body)?;

        let mut message = body;
        message.extend_from_slice(&signature);
        Ok(message)
    }

    /// Verify and decode a board message. Any mismatch — truncation,
    /// unparseable body, unknown publisher key, bad signature — yields
    /// `None`.
    pub fn parse_message(&self, message: &[u8]) -> Option<SwapOffer> {
        if message.len() <= SIGNATURE_LEN {
            return None;
        }
        let (body, signature_bytes) = message.split_at(message.len() - SIGNATURE_LEN);

        let offer: SwapOffer = options()
            .with_limit(MAX_BODY_BYTES)
            .deserialize(body)
            .ok()?;

        let key = VerifyingKey::from_bytes(offer.publisher_id.as_bytes()).ok()?;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(signature_bytes);
        let signature = Signature::from_bytes(&signature);
        if key.verify(body, &signature).is_err() {
            debug!(publisher = %offer.publisher_id, "offer signature rejected");
            return None;
        }
        Some(offer)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::keykeeper::LocalKeyKeeper;
    use crate::params::TxParameterId;
    use crate::swaps::{SwapCoin, SwapOfferStatus};
    use crate::types::{now_timestamp, TxId, WalletAddress};

    struct Fixture {
        _dir: tempfile::TempDir,
        protocol: OfferBoardProtocol,
        store: Arc<WalletStore>,
        keykeeper: Arc<LocalKeyKeeper>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let store =
            Arc::new(WalletStore::open(&dir.path().join("wallet.redb")).expect("open store"));
        let keykeeper = Arc::new(LocalKeyKeeper::new([42u8; 32]));
        let protocol = OfferBoardProtocol::new(
            Arc::clone(&store),
            keykeeper.clone() as Arc<dyn KeyKeeper>,
        );
        Fixture {
            _dir: dir,
            protocol,
            store,
            keykeeper,
        }
    }

    fn own_address(fixture: &Fixture, own_id: u64) -> WalletAddress {
        let wallet_id = fixture
            .keykeeper
            .derive_public(own_id, KeyUsage::Bbs)
            .expect("derive");
        let address = WalletAddress {
            wallet_id,
            label: "mine".into(),
            category: String::new(),
            create_time: now_timestamp(),
            duration: WalletAddress::DURATION_FOREVER,
            own_id,
        };
        fixture.store.save_address(&address).expect("save");
        address
    }

    fn pending_offer(publisher: WalletId) -> SwapOffer {
        let mut offer = SwapOffer::new(
            TxId::generate(),
            SwapOfferStatus::Pending,
            publisher,
            SwapCoin::Bitcoin,
        );
        offer
            .params
            .set(TxParameterId::AtomicSwapIsNativeSide, &true);
        offer.params.set(TxParameterId::Amount, &10_000u64);
        offer.params.set(TxParameterId::AtomicSwapAmount, &25u64);
        offer.params.set(TxParameterId::MinHeight, &100u64);
        offer.params.set(TxParameterId::PeerResponseTime, &50u64);
        offer
    }

    #[test]
    fn signed_offer_roundtrips() {
        let fixture = fixture();
        let address = own_address(&fixture, 1);
        let offer = pending_offer(address.wallet_id);

        let message = fixture.protocol.create_message(&offer).expect("sign");
        let parsed = fixture.protocol.parse_message(&message).expect("parse");
        assert_eq!(parsed, offer);
    }

    #[test]
    fn foreign_publisher_cannot_sign() {
        let fixture = fixture();
        let offer = pending_offer(WalletId::from_bytes([7u8; 32]));
        assert!(matches!(
            fixture.protocol.create_message(&offer),
            Err(ProtocolError::ForeignPublisher(_))
        ));
    }

    #[test]
    fn tampering_any_byte_rejects() {
        let fixture = fixture();
        let address = own_address(&fixture, 2);
        let offer = pending_offer(address.wallet_id);
        let message = fixture.protocol.create_message(&offer).expect("sign");

        // Body byte.
        let mut tampered = message.clone();
        tampered[10] ^= 1;
        assert!(fixture.protocol.parse_message(&tampered).is_none());

        // Signature byte.
        let mut tampered = message.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(fixture.protocol.parse_message(&tampered).is_none());

        // Truncation.
        assert!(fixture
            .protocol
            .parse_message(&message[..SIGNATURE_LEN])
            .is_none());
        assert!(fixture.protocol.parse_message(&[]).is_none());
    }

    #[test]
    fn swapped_publisher_key_rejects() {
        let fixture = fixture();
        let address = own_address(&fixture, 3);
        let other = own_address(&fixture, 4);

        let mut offer = pending_offer(address.wallet_id);
        let message = fixture.protocol.create_message(&offer).expect("sign");

        // Same parameters restated under another publisher do not verify.
        offer.publisher_id = other.wallet_id;
        let forged = fixture.protocol.create_message(&offer).expect("resign");
        assert_ne!(message, forged);

        let mut spliced = options().serialize(&offer).unwrap();
        spliced.extend_from_slice(&message[message.len() - SIGNATURE_LEN..]);
        assert!(fixture.protocol.parse_message(&spliced).is_none());
    }
}
