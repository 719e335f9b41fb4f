//! Resting-secret envelope — PBKDF2-HMAC-SHA256 key derivation + AES-256-GCM.
//!
//! On-disk layout is `base64(salt ‖ nonce ‖ tag ‖ ciphertext)` with a 16-byte
//! salt, 12-byte nonce, and 16-byte tag. Both salt and nonce are fresh per
//! encryption, so the derived key is single-use and nonce reuse cannot occur.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
/// OWASP 2023 recommendation for PBKDF2-HMAC-SHA256.
pub const PBKDF2_ITERS: u32 = 210_000;
pub const HEADER_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Structure invalid: not base64, or shorter than `salt ‖ nonce ‖ tag`.
    #[error("encrypted data is malformed (corrupt or not encrypted)")]
    Malformed,
    /// Tag verification failed — almost always a wrong passphrase.
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("cipher operation failed")]
    Cipher,
}

/// Derive the 256-bit envelope key from a passphrase and salt.
fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERS, &mut *key);
    key
}

/// Encrypt `plaintext` under `passphrase`, returning the base64 envelope.
/// Salt and nonce are drawn fresh from OS entropy, so repeated calls with
/// identical inputs yield distinct envelopes.
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key));

    // aes-gcm returns ciphertext ‖ tag; the envelope stores tag first.
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Cipher)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);

    Ok(B64.encode(&out))
}

/// Decrypt a base64 envelope. `Malformed` and `WrongPassphrase` are distinct:
/// the former means the blob structure is invalid, the latter that the GCM
/// tag did not verify.
pub fn decrypt(data_b64: &str, passphrase: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let data = B64.decode(data_b64).map_err(|_| CryptoError::Malformed)?;
    if data.len() < HEADER_LEN {
        return Err(CryptoError::Malformed);
    }

    let salt = &data[..SALT_LEN];
    let nonce = &data[SALT_LEN..SALT_LEN + NONCE_LEN];
    let tag = &data[SALT_LEN + NONCE_LEN..HEADER_LEN];
    let ciphertext = &data[HEADER_LEN..];

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key));

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &sealed,
                aad: &[],
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::WrongPassphrase)
}
