//! Stateless AEAD block ciphers derived from pre-shared credentials.
//!
//! Every datagram is sealed with ChaCha20-Poly1305 under a per-user key.
//! Statelessness is a hard requirement for the UDP underlay: decrypting a
//! packet must depend only on the ciphertext and the key, never on prior
//! packets, so datagrams may be lost, duplicated, or reordered freely.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Domain separation prefix for credential key derivation.
const KEY_DERIVE_CONTEXT: &[u8] = b"caligo-psk-v1";

#[derive(Error, Debug)]
pub enum CryptoError {
    /// Opaque by necessity: callers must not be able to distinguish a bad
    /// tag from a short buffer or a wrong key.
    #[error("decryption failed")]
    Decrypt,
}

/// A stateless authenticated cipher bound to one 256-bit key.
///
/// `encrypt` draws a fresh random nonce and prepends it; `decrypt` parses
/// symmetrically. The `_with_nonce` forms are used for the payload block of
/// a datagram, which shares the datagram nonce via [`payload_nonce`] so the
/// wire carries a single nonce and two tags.
#[derive(Clone)]
pub struct BlockCipher {
    aead: ChaCha20Poly1305,
    fingerprint: [u8; 4],
}

impl BlockCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        let digest = Sha3_256::digest(key);
        let mut fingerprint = [0u8; 4];
        fingerprint.copy_from_slice(&digest[..4]);
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            fingerprint,
        }
    }

    /// Create a cipher directly from credentials. See [`derive_key`].
    pub fn from_credentials(username: &str, password: &str) -> Self {
        Self::new(&derive_key(username, password))
    }

    /// Seal `plaintext`, output `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self.encrypt_with_nonce(&nonce, plaintext)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Seal `plaintext` under an explicit nonce, output `ciphertext || tag`.
    pub fn encrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.aead
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Open `nonce || ciphertext || tag`.
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if input.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decrypt);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&input[..NONCE_SIZE]);
        self.decrypt_with_nonce(&nonce, &input[NONCE_SIZE..])
    }

    /// Open `ciphertext || tag` under an explicit nonce.
    pub fn decrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        input: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if input.len() < TAG_SIZE {
            return Err(CryptoError::Decrypt);
        }
        self.aead
            .decrypt(Nonce::from_slice(nonce), input)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Short key fingerprint for logging. Never reveals key material.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.fingerprint)
    }
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Derive the pre-shared 256-bit key for one user.
///
/// Both ends compute SHA3-256 over a fixed context, the username, a zero
/// separator, and the password. The zero byte keeps ("ab","c") and
/// ("a","bc") distinct.
pub fn derive_key(username: &str, password: &str) -> [u8; KEY_SIZE] {
    let mut hasher = Sha3_256::new();
    hasher.update(KEY_DERIVE_CONTEXT);
    hasher.update(username.as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Derive a distinct nonce for the payload block of a datagram.
///
/// The metadata block is sealed under the datagram nonce; sealing the
/// payload under the same key requires a different nonce, produced here by
/// flipping the final byte. One nonce on the wire, two distinct nonces in
/// use.
pub fn payload_nonce(nonce: &[u8; NONCE_SIZE]) -> [u8; NONCE_SIZE] {
    let mut out = *nonce;
    out[NONCE_SIZE - 1] ^= 0xff;
    out
}

/// Try each candidate cipher until one authenticates `input`.
///
/// Returns a clone of the matching candidate together with the plaintext.
/// Candidates are tried in order; with zero matches the error is the same
/// opaque decrypt failure a single cipher would return.
pub fn trial_decrypt(
    candidates: &[BlockCipher],
    input: &[u8],
) -> Result<(BlockCipher, Vec<u8>), CryptoError> {
    for candidate in candidates {
        if let Ok(plaintext) = candidate.decrypt(input) {
            return Ok((candidate.clone(), plaintext));
        }
    }
    Err(CryptoError::Decrypt)
}

/// Trial variant for the explicit-nonce form used on the metadata block.
pub fn trial_decrypt_with_nonce(
    candidates: &[BlockCipher],
    nonce: &[u8; NONCE_SIZE],
    input: &[u8],
) -> Result<(BlockCipher, Vec<u8>), CryptoError> {
    for candidate in candidates {
        if let Ok(plaintext) = candidate.decrypt_with_nonce(nonce, input) {
            return Ok((candidate.clone(), plaintext));
        }
    }
    Err(CryptoError::Decrypt)
}
