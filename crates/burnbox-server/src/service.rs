use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::code::{CodeGenerator, DEFAULT_ALPHABET, DEFAULT_CODE_LENGTH};
use crate::error::SecretError;
use crate::lookup::{CodeHasher, ServerSecret};
use crate::store::{InsertResult, Store};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10_000;
pub const DEFAULT_MAX_CREATE_ATTEMPTS: u32 = 5;
/// Longest accepted retention. Keeps `now + retention` well inside `i64`.
pub const MAX_RETENTION: Duration = Duration::from_secs(10 * 366 * 24 * 60 * 60);

/// Tunables for the secret lifecycle.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Lifetime of an unredeemed secret.
    pub retention: Duration,
    pub code_length: usize,
    pub code_alphabet: String,
    /// Upper bound on payload length, in characters.
    pub max_payload_size: usize,
    /// Codes drawn per create before giving up on lookup-key collisions.
    pub max_create_attempts: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            code_length: DEFAULT_CODE_LENGTH,
            code_alphabet: DEFAULT_ALPHABET.to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_create_attempts: DEFAULT_MAX_CREATE_ATTEMPTS,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), SecretError> {
        retention_secs(self.retention)?;
        if self.max_payload_size == 0 {
            return Err(SecretError::Config(
                "max payload size must be positive".into(),
            ));
        }
        if self.max_create_attempts == 0 {
            return Err(SecretError::Config(
                "max create attempts must be positive".into(),
            ));
        }
        CodeGenerator::new(&self.code_alphabet, self.code_length)?;
        Ok(())
    }
}

/// Retention in whole seconds, bounded to `1..=MAX_RETENTION`.
fn retention_secs(retention: Duration) -> Result<i64, SecretError> {
    let secs = retention.as_secs();
    if secs == 0 {
        return Err(SecretError::Config(
            "retention must be at least one second".into(),
        ));
    }
    if retention > MAX_RETENTION {
        return Err(SecretError::Config(format!(
            "retention must not exceed {}s",
            MAX_RETENTION.as_secs()
        )));
    }
    i64::try_from(secs)
        .map_err(|_| SecretError::Config(format!("retention of {secs}s is out of range")))
}

/// A freshly created secret. `code` exists nowhere else once this is dropped.
#[derive(Debug)]
pub struct Created {
    pub code: String,
    /// Unix timestamp (seconds).
    pub expires_at: i64,
}

/// Creation and single-use redemption of secrets.
#[derive(Clone)]
pub struct SecretService {
    store: Store,
    generator: CodeGenerator,
    hasher: CodeHasher,
    config: ServiceConfig,
}

impl SecretService {
    pub fn new(
        store: Store,
        server_secret: ServerSecret,
        config: ServiceConfig,
    ) -> Result<Self, SecretError> {
        config.validate()?;
        let generator = CodeGenerator::new(&config.code_alphabet, config.code_length)?;
        info!(
            code_length = generator.length(),
            entropy_bits = generator.entropy_bits(),
            retention_secs = config.retention.as_secs(),
            "secret service ready"
        );
        Ok(Self {
            store,
            generator,
            hasher: CodeHasher::new(server_secret)?,
            config,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn hasher(&self) -> &CodeHasher {
        &self.hasher
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Store `payload` under a new code with the configured retention.
    pub fn create(&self, payload: &str) -> Result<Created, SecretError> {
        self.create_with_retention(payload, self.config.retention)
    }

    pub fn create_with_retention(
        &self,
        payload: &str,
        retention: Duration,
    ) -> Result<Created, SecretError> {
        self.validate_payload(payload)?;
        let retention = retention_secs(retention)?;

        let expires_at = Store::now().saturating_add(retention);
        let attempts = self.config.max_create_attempts;

        for attempt in 1..=attempts {
            let code = self.generator.generate();
            let lookup_key = self.hasher.hash(&code);

            match self.store.insert(&lookup_key, payload.as_bytes(), expires_at)? {
                InsertResult::Inserted => {
                    info!(key = %lookup_key, expires_at, "created secret");
                    return Ok(Created { code, expires_at });
                }
                InsertResult::DuplicateKey => {
                    warn!(attempt, attempts, "lookup key collision, drawing a new code");
                }
            }
        }

        Err(SecretError::CodeSpaceExhausted { attempts })
    }

    /// Redeem `code` exactly once.
    ///
    /// Wrong, expired and already-redeemed codes all take the same path
    /// (hash, one write transaction, abort) and yield the same error.
    pub fn redeem(&self, code: &str) -> Result<String, SecretError> {
        if code.trim().is_empty() {
            return Err(SecretError::validation("code", "required"));
        }

        let lookup_key = self.hasher.hash(code);
        match self.store.take_live(&lookup_key, Store::now())? {
            Some(mut plaintext) => {
                let content = String::from_utf8(std::mem::take(&mut *plaintext))
                    .context("stored content is not valid UTF-8")?;
                Ok(content)
            }
            None => {
                debug!("redeem rejected");
                Err(SecretError::NotFoundOrExpired)
            }
        }
    }

    /// Delete every expired secret now. Returns how many were removed.
    pub fn reap(&self) -> Result<usize, SecretError> {
        Ok(self.store.delete_expired(Store::now())?)
    }

    fn validate_payload(&self, payload: &str) -> Result<(), SecretError> {
        if payload.trim().is_empty() {
            return Err(SecretError::validation("content", "required"));
        }
        let max = self.config.max_payload_size;
        if payload.chars().count() > max {
            return Err(SecretError::validation(
                "content",
                format!("must not exceed {max} characters"),
            ));
        }
        Ok(())
    }
}
