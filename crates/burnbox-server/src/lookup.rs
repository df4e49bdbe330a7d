use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::code::normalize_code;
use crate::error::SecretError;

type HmacSha256 = Hmac<Sha256>;

const MIN_SECRET_LEN: usize = 16;

/// Server-held key for lookup-key derivation. Never persisted by the service.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ServerSecret(Vec<u8>);

impl ServerSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, SecretError> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SECRET_LEN {
            return Err(SecretError::Config(format!(
                "server secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self(bytes))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerSecret(..)")
    }
}

/// HMAC-SHA256 digest of a normalized code; the only form of a code that is stored.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupKey([u8; 32]);

impl LookupKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex, used as the table key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Eight hex chars, enough to correlate log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LookupKey({}..)", self.short())
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// Keyed one-way mapping from access codes to lookup keys.
///
/// Holds the HMAC state already keyed with the server secret; each hash
/// works on a clone of it.
#[derive(Clone)]
pub struct CodeHasher {
    mac: HmacSha256,
}

impl CodeHasher {
    pub fn new(secret: ServerSecret) -> Result<Self, SecretError> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| SecretError::Config(format!("server secret rejected: {e}")))?;
        Ok(Self { mac })
    }

    /// Hash `code` after normalization, so `abcd1234` and ` ABCD1234 ` collide.
    pub fn hash(&self, code: &str) -> LookupKey {
        let normalized = normalize_code(code);
        let mut mac = self.mac.clone();
        mac.update(normalized.as_bytes());

        let mut key = [0u8; 32];
        key.copy_from_slice(&mac.finalize().into_bytes());
        LookupKey(key)
    }
}

impl fmt::Debug for CodeHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CodeHasher(..)")
    }
}
