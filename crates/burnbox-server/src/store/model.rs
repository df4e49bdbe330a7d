use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// Stored in redb as bincode-encoded bytes, keyed by the hex lookup key.
/// `content_encrypted` is ChaCha20Poly1305 ciphertext over the payload.
/// Timestamps are plaintext so the reaper can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// Ciphertext + tag, authenticated against the lookup key.
    pub content_encrypted: Vec<u8>,
    /// Per-record random 12-byte nonce.
    pub nonce: [u8; 12],
    /// Unix timestamp (seconds). Diagnostic only.
    pub created_at: i64,
    /// Unix timestamp (seconds); readable only while `now < expires_at`.
    pub expires_at: i64,
}

impl SecretRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}
