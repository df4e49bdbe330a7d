use thiserror::Error;

/// Caller-facing failures of the secret lifecycle.
#[derive(Debug, Error)]
pub enum SecretError {
    /// Input rejected before any state change.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Wrong code, already redeemed, or expired. Deliberately indistinguishable.
    #[error("That message key is no longer valid.")]
    NotFoundOrExpired,

    /// Every generated code collided with an existing lookup key.
    #[error("could not allocate a unique code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },

    #[error("configuration: {0}")]
    Config(String),

    /// Persistence or crypto failure underneath the service.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SecretError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}
