use rand::{rngs::OsRng, Rng};

use crate::error::SecretError;

/// Upper-case alphanumerics with the easily confused glyphs removed
/// (`0`/`O`, `1`/`I`/`L`).
pub const DEFAULT_ALPHABET: &str = "ABCDEFGHJKMNPQRSTUVWXYZ23456789";
pub const DEFAULT_CODE_LENGTH: usize = 8;

const MIN_CODE_LENGTH: usize = 4;
const MAX_CODE_LENGTH: usize = 64;

/// Produces human-typable access codes from the OS CSPRNG.
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    alphabet: Vec<u8>,
    length: usize,
}

impl CodeGenerator {
    /// Build a generator, rejecting alphabets that would weaken or break codes:
    /// fewer than two symbols, duplicates, or anything other than ASCII
    /// upper-case letters and digits (codes are normalized to upper case).
    pub fn new(alphabet: &str, length: usize) -> Result<Self, SecretError> {
        if !(MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&length) {
            return Err(SecretError::Config(format!(
                "code length must be {MIN_CODE_LENGTH}–{MAX_CODE_LENGTH}, got {length}"
            )));
        }

        let symbols = alphabet.as_bytes().to_vec();
        if symbols
            .iter()
            .any(|b| !(b.is_ascii_uppercase() || b.is_ascii_digit()))
        {
            return Err(SecretError::Config(
                "code alphabet may only contain A-Z and 0-9".into(),
            ));
        }

        let mut distinct = symbols.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != symbols.len() {
            return Err(SecretError::Config(
                "code alphabet contains duplicate symbols".into(),
            ));
        }
        if symbols.len() < 2 {
            return Err(SecretError::Config(
                "code alphabet needs at least two symbols".into(),
            ));
        }

        Ok(Self {
            alphabet: symbols,
            length,
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Entropy of one code in bits.
    pub fn entropy_bits(&self) -> f64 {
        self.length as f64 * (self.alphabet.len() as f64).log2()
    }

    /// Draw a fresh code. `gen_range` samples uniformly (rejection sampling),
    /// so every symbol is equally likely at every position.
    pub fn generate(&self) -> String {
        let mut rng = OsRng;
        (0..self.length)
            .map(|_| self.alphabet[rng.gen_range(0..self.alphabet.len())] as char)
            .collect()
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.as_bytes().to_vec(),
            length: DEFAULT_CODE_LENGTH,
        }
    }
}

/// Canonical form of a submitted code: surrounding whitespace trimmed,
/// ASCII upper-cased. Both the create and redeem paths hash this form.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
