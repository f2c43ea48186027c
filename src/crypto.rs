//! XChaCha20-Poly1305 sealing behind [`crate::broker::PairingUri`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Fresh random XChaCha20-Poly1305 key
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypt data using XChaCha20-Poly1305, binding `aad`
pub fn seal_xchacha(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    #[allow(deprecated)]
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))
}

/// Decrypt data using XChaCha20-Poly1305; fails if `aad` differs from sealing
pub fn open_xchacha(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    #[allow(deprecated)]
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))
}

/// Ciphertext with the nonce it was sealed under
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedPayload {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl SealedPayload {
    pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> anyhow::Result<Self> {
        let nonce = generate_nonce();
        let ciphertext = seal_xchacha(key, &nonce, plaintext, aad)?;
        Ok(Self { nonce, ciphertext })
    }

    pub fn open(&self, key: &[u8; KEY_LEN], aad: &[u8]) -> anyhow::Result<Vec<u8>> {
        open_xchacha(key, &self.nonce, &self.ciphertext, aad)
    }

    /// `base64url(nonce).base64url(ciphertext)`
    pub fn to_compact(&self) -> String {
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext)
        )
    }

    pub fn from_compact(compact: &str) -> anyhow::Result<Self> {
        let (nonce, ciphertext) = compact
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Sealed payload is missing its nonce"))?;
        let nonce: [u8; NONCE_LEN] = URL_SAFE_NO_PAD
            .decode(nonce)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Nonce must be {} bytes", NONCE_LEN))?;
        Ok(Self {
            nonce,
            ciphertext: URL_SAFE_NO_PAD.decode(ciphertext)?,
        })
    }
}
