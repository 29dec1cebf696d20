//! Per-share key material, indexed by access tier.
//!
//! Each tier has a symmetric pre-shared key used to encrypt connections
//! negotiated at that level. The read_only and read_write tiers additionally
//! carry an ed25519 signing identity: read_write holds the private half,
//! read_only may hold only the verifying half, and untrusted has none at
//! all — it can decrypt traffic but cannot verify who wrote it.

use std::collections::BTreeMap;

use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use super::ShareError;
use crate::access::AccessLevel;
use crate::message::KeySet;

/// Pre-shared keys are 256 bits.
pub const PSK_LEN: usize = 32;

/// One tier's asymmetric identity.
#[derive(Clone)]
pub enum SigningTier {
    /// We can sign and verify at this tier.
    Full(SigningKey),
    /// We can only verify signatures made at this tier.
    VerifyOnly(VerifyingKey),
}

impl SigningTier {
    pub fn verifying_key(&self) -> VerifyingKey {
        match self {
            SigningTier::Full(key) => key.verifying_key(),
            SigningTier::VerifyOnly(key) => *key,
        }
    }
}

/// All key material a node holds for one share.
#[derive(Clone, Default)]
pub struct KeyRing {
    psks: BTreeMap<AccessLevel, Vec<u8>>,
    signing: BTreeMap<AccessLevel, SigningTier>,
}

impl KeyRing {
    /// Generate the full key set for a share created locally: psk for all
    /// three tiers, signing pairs for read_only and read_write.
    pub fn generate() -> Self {
        let mut ring = KeyRing::default();
        for level in [
            AccessLevel::Untrusted,
            AccessLevel::ReadOnly,
            AccessLevel::ReadWrite,
        ] {
            let mut psk = vec![0u8; PSK_LEN];
            getrandom::getrandom(&mut psk).expect("failed to generate random bytes");
            ring.psks.insert(level, psk);
        }
        for level in [AccessLevel::ReadOnly, AccessLevel::ReadWrite] {
            let mut seed = [0u8; 32];
            getrandom::getrandom(&mut seed).expect("failed to generate random bytes");
            ring.signing
                .insert(level, SigningTier::Full(SigningKey::from_bytes(&seed)));
        }
        ring
    }

    /// The share's stable identity: SHA-256 of the read_write psk, so peers
    /// holding the share rendezvous without revealing the key.
    pub fn share_id(&self) -> Option<String> {
        self.psks
            .get(&AccessLevel::ReadWrite)
            .map(|psk| hex::encode(Sha256::digest(psk)))
    }

    pub fn psk(&self, level: AccessLevel) -> Option<&[u8]> {
        self.psks.get(&level).map(|k| k.as_slice())
    }

    pub fn signing_key(&self, level: AccessLevel) -> Option<&SigningKey> {
        match self.signing.get(&level) {
            Some(SigningTier::Full(key)) => Some(key),
            _ => None,
        }
    }

    pub fn verifying_key(&self, level: AccessLevel) -> Option<VerifyingKey> {
        self.signing.get(&level).map(|tier| tier.verifying_key())
    }

    /// Highest access tier this ring's keys support.
    pub fn access_level(&self) -> AccessLevel {
        if self.signing_key(AccessLevel::ReadWrite).is_some() {
            AccessLevel::ReadWrite
        } else if self.psk(AccessLevel::ReadOnly).is_some() {
            AccessLevel::ReadOnly
        } else if self.psk(AccessLevel::Untrusted).is_some() {
            AccessLevel::Untrusted
        } else {
            AccessLevel::Unknown
        }
    }

    /// Render the ring as the three tier blocks of a `keys` message.
    pub fn to_wire(&self) -> (KeySet, KeySet, KeySet) {
        let tier = |level: AccessLevel| -> KeySet {
            let (signing, verify) = match self.signing.get(&level) {
                Some(SigningTier::Full(key)) => (Some(hex::encode(key.to_bytes())), None),
                Some(SigningTier::VerifyOnly(key)) => (None, Some(hex::encode(key.to_bytes()))),
                None => (None, None),
            };
            KeySet {
                psk: self.psk(level).map(hex::encode),
                signing,
                verify,
            }
        };
        (
            tier(AccessLevel::Untrusted),
            tier(AccessLevel::ReadOnly),
            tier(AccessLevel::ReadWrite),
        )
    }

    /// Rebuild a ring from the tier blocks of a received `keys` message.
    pub fn from_wire(
        untrusted: &KeySet,
        read_only: &KeySet,
        read_write: &KeySet,
    ) -> Result<Self, ShareError> {
        let mut ring = KeyRing::default();
        for (level, set) in [
            (AccessLevel::Untrusted, untrusted),
            (AccessLevel::ReadOnly, read_only),
            (AccessLevel::ReadWrite, read_write),
        ] {
            if let Some(psk_hex) = &set.psk {
                let psk = hex::decode(psk_hex)
                    .map_err(|_| ShareError::InvalidKey(format!("{level} psk")))?;
                if psk.len() != PSK_LEN {
                    return Err(ShareError::InvalidKey(format!("{level} psk")));
                }
                ring.psks.insert(level, psk);
            }
            if let Some(seed_hex) = &set.signing {
                let seed: [u8; 32] = hex::decode(seed_hex)
                    .ok()
                    .and_then(|raw| raw.try_into().ok())
                    .ok_or_else(|| ShareError::InvalidKey(format!("{level} signing")))?;
                ring.signing
                    .insert(level, SigningTier::Full(SigningKey::from_bytes(&seed)));
            } else if let Some(verify_hex) = &set.verify {
                let raw: [u8; 32] = hex::decode(verify_hex)
                    .ok()
                    .and_then(|raw| raw.try_into().ok())
                    .ok_or_else(|| ShareError::InvalidKey(format!("{level} verify")))?;
                let key = VerifyingKey::from_bytes(&raw)
                    .map_err(|_| ShareError::InvalidKey(format!("{level} verify")))?;
                ring.signing.insert(level, SigningTier::VerifyOnly(key));
            }
        }
        Ok(ring)
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("psk_tiers", &self.psks.keys().collect::<Vec<_>>())
            .field("signing_tiers", &self.signing.keys().collect::<Vec<_>>())
            .finish()
    }
}
