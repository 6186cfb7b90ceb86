//! Envelope Encryption
//!
//! Inputs and outputs of confidential jobs travel as fixed-width numeric
//! blocks encrypted under a secret shared between the requester and the
//! cluster.
//!
//! - Key agreement: X25519 between the requester's keypair and the cluster
//!   public key. Low-order peer keys are rejected.
//! - Per-message key: HKDF-SHA256 over the shared secret, salted with the
//!   caller's 16-byte nonce.
//! - Blocks: each `u128` is sealed with ChaCha20-Poly1305 using the block
//!   index as AEAD nonce and `(count, index)` as associated data, giving a
//!   32-byte ciphertext block (16 bytes payload + 16 bytes tag).
//!
//! Encryption is deterministic for a given (secret, nonce, plaintext), so a
//! nonce must never be reused for different plaintexts under one secret.

use crate::confidential::error::CipherError;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Nonce, Payload},
    ChaCha20Poly1305, Key,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Caller-supplied per-message nonce.
pub type EnvelopeNonce = [u8; 16];

/// Encrypted `u128`: 16 bytes of ciphertext followed by the 16-byte tag.
pub type CipherBlock = [u8; 32];

/// X25519 public key bytes.
pub type PublicKeyBytes = [u8; 32];

const AEAD_NONCE_SIZE: usize = 12;
const BLOCK_KEY_LABEL: &[u8] = b"escrow-envelope-block-key";

/// Fresh random nonce.
pub fn random_nonce() -> EnvelopeNonce {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// =============================================================================
// KEY AGREEMENT
// =============================================================================

/// Long-lived X25519 keypair of a requester or a cluster.
pub struct EnvelopeKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EnvelopeKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.public.to_bytes()
    }

    /// Diffie-Hellman with `peer`. Fails if the result does not depend on
    /// our secret (identity or small-subgroup peer key).
    pub fn agree(&self, peer: &PublicKeyBytes) -> Result<SharedSecret, CipherError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(CipherError::LowOrderPublicKey);
        }
        Ok(SharedSecret(*shared.as_bytes()))
    }
}

impl fmt::Debug for EnvelopeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// 32-byte agreed secret. Wiped on drop.
#[derive(Clone)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

// =============================================================================
// CIPHER
// =============================================================================

/// Authenticated block cipher keyed by a `SharedSecret`.
pub struct EnvelopeCipher {
    secret: [u8; 32],
}

impl EnvelopeCipher {
    pub fn new(secret: &SharedSecret) -> Self {
        Self { secret: secret.0 }
    }

    /// Agree with `peer` and build a cipher in one step.
    pub fn between(local: &EnvelopeKeypair, peer: &PublicKeyBytes) -> Result<Self, CipherError> {
        Ok(Self::new(&local.agree(peer)?))
    }

    fn message_cipher(&self, nonce: &EnvelopeNonce) -> Result<ChaCha20Poly1305, CipherError> {
        let hkdf = Hkdf::<Sha256>::new(Some(&nonce[..]), &self.secret);
        let mut key_bytes = [0u8; 32];
        hkdf.expand(BLOCK_KEY_LABEL, &mut key_bytes)
            .map_err(|_| CipherError::KeyDerivation)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        key_bytes.zeroize();
        Ok(cipher)
    }

    pub fn encrypt(
        &self,
        plaintext: &[u128],
        nonce: &EnvelopeNonce,
    ) -> Result<Vec<CipherBlock>, CipherError> {
        let count = block_count(plaintext.len())?;
        let cipher = self.message_cipher(nonce)?;

        let mut blocks = Vec::with_capacity(plaintext.len());
        for (index, value) in plaintext.iter().enumerate() {
            let (aead_nonce, aad) = block_params(count, index as u32);
            let sealed = cipher
                .encrypt(
                    Nonce::<ChaCha20Poly1305>::from_slice(&aead_nonce),
                    Payload {
                        msg: &value.to_le_bytes(),
                        aad: &aad,
                    },
                )
                .map_err(|_| CipherError::EncryptionFailed { block: index })?;
            let mut block = [0u8; 32];
            if sealed.len() != block.len() {
                return Err(CipherError::EncryptionFailed { block: index });
            }
            block.copy_from_slice(&sealed);
            blocks.push(block);
        }
        Ok(blocks)
    }

    pub fn decrypt(
        &self,
        ciphertext: &[CipherBlock],
        nonce: &EnvelopeNonce,
    ) -> Result<Vec<u128>, CipherError> {
        let count = block_count(ciphertext.len())?;
        let cipher = self.message_cipher(nonce)?;

        let mut values = Vec::with_capacity(ciphertext.len());
        for (index, block) in ciphertext.iter().enumerate() {
            let (aead_nonce, aad) = block_params(count, index as u32);
            let opened = cipher
                .decrypt(
                    Nonce::<ChaCha20Poly1305>::from_slice(&aead_nonce),
                    Payload {
                        msg: block.as_ref(),
                        aad: &aad,
                    },
                )
                .map_err(|_| CipherError::DecryptionFailed { block: index })?;
            let bytes: [u8; 16] = opened
                .as_slice()
                .try_into()
                .map_err(|_| CipherError::DecryptionFailed { block: index })?;
            values.push(u128::from_le_bytes(bytes));
        }
        Ok(values)
    }
}

impl Drop for EnvelopeCipher {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvelopeCipher(..)")
    }
}

fn block_count(len: usize) -> Result<u32, CipherError> {
    u32::try_from(len).map_err(|_| CipherError::TooManyBlocks { count: len })
}

fn block_params(count: u32, index: u32) -> ([u8; AEAD_NONCE_SIZE], [u8; 8]) {
    let mut aead_nonce = [0u8; AEAD_NONCE_SIZE];
    aead_nonce[..4].copy_from_slice(&index.to_le_bytes());
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&count.to_le_bytes());
    aad[4..].copy_from_slice(&index.to_le_bytes());
    (aead_nonce, aad)
}
