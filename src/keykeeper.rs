//! Signing capability boundary. The wallet never sees private material in
//! cleartext; everything goes through the [`KeyKeeper`] trait, whether the
//! backend is in-process or a hardware device.

use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use crate::types::WalletId;

/// Reservation for a one-shot signing nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Sentinel for "no slot held"; freeing it is a no-op.
    pub const INVALID: SlotId = SlotId(u32::MAX);
}

/// Number of concurrent nonce slots a keeper backend maintains.
pub const SLOT_COUNT: u32 = 64;

/// Key domain a derivation request targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyUsage {
    /// BBS endpoint keys: address identity and offer signing.
    Bbs = 0,
    /// Kernel commitment keys.
    Kernel = 1,
    /// Output blinding keys.
    Coin = 2,
}

/// Errors surfaced by key keeper backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyKeeperError {
    /// The user rejected the request on the device; not retryable.
    #[error("signing request rejected by user")]
    UserAbort,
    /// Transient backend failure; the caller may retry.
    #[error("key keeper failure: {0}")]
    Failure(String),
    #[error("no free nonce slot")]
    SlotsExhausted,
}

/// Trait implemented by signing backends.
pub trait KeyKeeper: Send + Sync {
    /// Deterministic public key for `(index, usage)`.
    fn derive_public(&self, index: u64, usage: KeyUsage) -> Result<WalletId, KeyKeeperError>;

    /// Sign `msg` with the key behind `(index, usage)`.
    fn sign(&self, index: u64, usage: KeyUsage, msg: &[u8]) -> Result<[u8; 64], KeyKeeperError>;

    /// Reserve a nonce slot.
    fn slot_allocate(&self) -> Result<SlotId, KeyKeeperError>;

    /// Release a nonce slot. Idempotent: releasing [`SlotId::INVALID`] or
    /// an unallocated slot succeeds silently.
    fn slot_free(&self, slot: SlotId) -> Result<(), KeyKeeperError>;
}

/// In-process keeper deriving everything from a single master seed.
pub struct LocalKeyKeeper {
    seed: [u8; 32],
    slots: Mutex<Vec<bool>>,
}

impl LocalKeyKeeper {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            slots: Mutex::new(vec![false; SLOT_COUNT as usize]),
        }
    }

    fn signing_key(&self, index: u64, usage: KeyUsage) -> SigningKey {
        let mut hasher = Sha256::new();
        hasher.update(b"mirage.kdf.v1");
        hasher.update(self.seed);
        hasher.update([usage as u8]);
        hasher.update(index.to_le_bytes());
        let mut secret: [u8; 32] = hasher.finalize().into();
        let key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        key
    }
}

impl Drop for LocalKeyKeeper {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl KeyKeeper for LocalKeyKeeper {
    fn derive_public(&self, index: u64, usage: KeyUsage) -> Result<WalletId, KeyKeeperError> {
        let key = self.signing_key(index, usage);
        Ok(WalletId::from_bytes(key.verifying_key().to_bytes()))
    }

    fn sign(&self, index: u64, usage: KeyUsage, msg: &[u8]) -> Result<[u8; 64], KeyKeeperError> {
        let key = self.signing_key(index, usage);
        Ok(key.sign(msg).to_bytes())
    }

    fn slot_allocate(&self) -> Result<SlotId, KeyKeeperError> {
        let mut slots = self.slots.lock();
        match slots.iter().position(|used| !used) {
            Some(free) => {
                slots[free] = true;
                Ok(SlotId(free as u32))
            }
            None => Err(KeyKeeperError::SlotsExhausted),
        }
    }

    fn slot_free(&self, slot: SlotId) -> Result<(), KeyKeeperError> {
        if slot == SlotId::INVALID {
            return Ok(());
        }
        let mut slots = self.slots.lock();
        if let Some(used) = slots.get_mut(slot.0 as usize) {
            *used = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    #[test]
    fn derivation_is_deterministic_and_usage_separated() {
        let keeper = LocalKeyKeeper::new([5u8; 32]);
        let a = keeper.derive_public(1, KeyUsage::Bbs).expect("derive");
        let b = keeper.derive_public(1, KeyUsage::Bbs).expect("derive");
        let c = keeper.derive_public(1, KeyUsage::Kernel).expect("derive");
        let d = keeper.derive_public(2, KeyUsage::Bbs).expect("derive");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn signatures_verify_against_derived_public() {
        let keeper = LocalKeyKeeper::new([8u8; 32]);
        let public = keeper.derive_public(3, KeyUsage::Bbs).expect("derive");
        let signature = keeper.sign(3, KeyUsage::Bbs, b"payload").expect("sign");

        let key = VerifyingKey::from_bytes(public.as_bytes()).expect("public key");
        let signature = Signature::from_bytes(&signature);
        key.verify(b"payload", &signature).expect("verify");
        assert!(key.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn slot_lifecycle_is_idempotent_on_free() {
        let keeper = LocalKeyKeeper::new([1u8; 32]);
        let first = keeper.slot_allocate().expect("allocate");
        let second = keeper.slot_allocate().expect("allocate");
        assert_ne!(first, second);

        keeper.slot_free(first).expect("free");
        keeper.slot_free(first).expect("double free is a no-op");
        keeper
            .slot_free(SlotId::INVALID)
            .expect("invalid free is a no-op");

        // Freed slot is reused.
        let third = keeper.slot_allocate().expect("allocate");
        assert_eq!(third, first);
    }

    #[test]
    fn slots_exhaust_and_recover() {
        let keeper = LocalKeyKeeper::new([2u8; 32]);
        let slots: Vec<_> = (0..SLOT_COUNT)
            .map(|_| keeper.slot_allocate().expect("allocate"))
            .collect();
        assert!(matches!(
            keeper.slot_allocate(),
            Err(KeyKeeperError::SlotsExhausted)
        ));
        keeper.slot_free(slots[10]).expect("free");
        assert_eq!(keeper.slot_allocate().expect("allocate"), slots[10]);
    }
}
