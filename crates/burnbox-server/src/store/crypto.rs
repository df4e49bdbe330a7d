use anyhow::Result;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use zeroize::{ZeroizeOnDrop, Zeroizing};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// 32-byte content encryption key, persisted as `burnbox.key` in the data dir.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Generate a fresh random key from the OS CSPRNG.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Wrap raw key bytes read from disk. `None` unless exactly 32 bytes.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let key: [u8; KEY_SIZE] = bytes.try_into().ok()?;
    Some(EncryptionKey(key))
}

/// Encrypt `plaintext` with `key`, returning `(ciphertext, nonce)`.
/// `aad` is authenticated but not encrypted; the store passes the lookup key
/// so a ciphertext cannot be replayed under another record.
pub fn encrypt(
    key: &EncryptionKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt `ciphertext` with `key` and `nonce`; `aad` must match what was sealed.
pub fn decrypt(
    key: &EncryptionKey,
    ciphertext: &[u8],
    nonce_bytes: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from(*nonce_bytes);

    let plaintext = cipher
        .decrypt(&nonce, Payload { msg: ciphertext, aad })
        .map_err(|e| anyhow::anyhow!("decrypt: {e}"))?;

    Ok(Zeroizing::new(plaintext))
}
