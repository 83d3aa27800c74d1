//! Password strength policy, provisional password generation and hashing.
//!
//! Hashing is argon2id with a random 16-byte salt. Both hashing and
//! verification are CPU-bound; async callers run them on a blocking pool.

use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use guardian_core::{AccountsConfig, GuardianError, Result};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Symbols that satisfy the symbol-class requirement.
pub const POLICY_SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const PROVISIONAL_SYMBOLS: &[u8] = b"!@#$%^&*";

/// Outcome of checking a candidate password against the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrengthReport {
    pub valid: bool,
    pub errors: Vec<String>,
    /// 0..=100
    pub score: u8,
}

/// Password rules for administrator credentials.
pub struct PasswordPolicy {
    min_length: usize,
    history_count: usize,
    provisional_length: usize,
    params: Params,
    sequential_digits: Regex,
    sequential_letters: Regex,
    common_words: Regex,
}

impl std::fmt::Debug for PasswordPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordPolicy")
            .field("min_length", &self.min_length)
            .field("history_count", &self.history_count)
            .field("provisional_length", &self.provisional_length)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct CharClasses {
    upper: bool,
    lower: bool,
    digit: bool,
    symbol: bool,
}

impl CharClasses {
    fn of(password: &str) -> Self {
        let mut classes = CharClasses::default();
        for c in password.chars() {
            if c.is_ascii_uppercase() {
                classes.upper = true;
            } else if c.is_ascii_lowercase() {
                classes.lower = true;
            } else if c.is_ascii_digit() {
                classes.digit = true;
            } else if POLICY_SYMBOLS.contains(c) {
                classes.symbol = true;
            }
        }
        classes
    }

    fn count(&self) -> usize {
        [self.upper, self.lower, self.digit, self.symbol]
            .into_iter()
            .filter(|present| *present)
            .count()
    }
}

impl PasswordPolicy {
    pub fn new(config: &AccountsConfig) -> Result<Self> {
        let params = Params::new(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
            None,
        )
        .map_err(|e| GuardianError::Config(format!("invalid argon2 parameters: {e}")))?;

        let weak = |name: &str, pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                GuardianError::Security(format!("Failed to compile pattern '{name}': {e}"))
            })
        };

        Ok(Self {
            min_length: config.min_password_length,
            history_count: config.password_history,
            provisional_length: config.provisional_password_length.max(4),
            params,
            sequential_digits: weak(
                "sequential_digits",
                r"^(012|123|234|345|456|567|678|789|890)+$",
            )?,
            sequential_letters: weak(
                "sequential_letters",
                r"(?i)^(abc|bcd|cde|def|efg|fgh|ghi|hij|ijk|jkl|klm|lmn|mno|nop|opq|pqr|qrs|rst|stu|tuv|uvw|vwx|wxy|xyz)+$",
            )?,
            common_words: weak("common_words", r"(?i)password|motdepasse|azerty|qwerty")?,
        })
    }

    pub fn history_count(&self) -> usize {
        self.history_count
    }

    /// Names of the weak patterns `password` matches.
    pub fn weak_patterns(&self, password: &str) -> Vec<&'static str> {
        let mut hits = Vec::new();
        let mut chars = password.chars();
        if let Some(first) = chars.next() {
            if password.chars().count() > 1 && chars.all(|c| c == first) {
                hits.push("repeated_character");
            }
        }
        if self.sequential_digits.is_match(password) {
            hits.push("sequential_digits");
        }
        if self.sequential_letters.is_match(password) {
            hits.push("sequential_letters");
        }
        if self.common_words.is_match(password) {
            hits.push("common_word");
        }
        hits
    }

    /// Score from 0 to 100: four points per character up to 40, fifteen per
    /// character class, minus twenty per weak pattern.
    pub fn strength(&self, password: &str) -> u8 {
        let length_score = (password.chars().count() * 4).min(40) as i64;
        let class_score = CharClasses::of(password).count() as i64 * 15;
        let penalty = self.weak_patterns(password).len() as i64 * 20;
        (length_score + class_score - penalty).clamp(0, 100) as u8
    }

    pub fn validate_strength(&self, password: &str) -> StrengthReport {
        let mut errors = Vec::new();
        if password.chars().count() < self.min_length {
            errors.push(format!("must be at least {} characters", self.min_length));
        }
        let classes = CharClasses::of(password);
        if !classes.upper {
            errors.push("must contain an uppercase letter".to_string());
        }
        if !classes.lower {
            errors.push("must contain a lowercase letter".to_string());
        }
        if !classes.digit {
            errors.push("must contain a digit".to_string());
        }
        if !classes.symbol {
            errors.push(format!("must contain a symbol ({POLICY_SYMBOLS})"));
        }
        if !self.weak_patterns(password).is_empty() {
            errors.push("is too predictable".to_string());
        }
        StrengthReport {
            valid: errors.is_empty(),
            errors,
            score: self.strength(password),
        }
    }

    /// Random password with at least one character of every class, shuffled
    /// with the OS generator.
    pub fn generate_provisional_password(&self) -> String {
        let mut rng = OsRng;
        let charset: Vec<u8> = [UPPER, LOWER, DIGITS, PROVISIONAL_SYMBOLS].concat();

        let mut chars: Vec<u8> = [UPPER, LOWER, DIGITS, PROVISIONAL_SYMBOLS]
            .iter()
            .map(|class| class[rng.gen_range(0..class.len())])
            .collect();
        while chars.len() < self.provisional_length {
            chars.push(charset[rng.gen_range(0..charset.len())]);
        }
        chars.shuffle(&mut rng);
        chars.into_iter().map(char::from).collect()
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash_password(&self, password: &str) -> Result<String> {
        let mut salt_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| GuardianError::Security(format!("Failed to encode salt: {e}")))?;
        self.hasher()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| GuardianError::Security(format!("Failed to hash password: {e}")))
    }

    /// Verify against a stored PHC string. Cost parameters come from the hash.
    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| GuardianError::Security(format!("Malformed password hash: {e}")))?;
        match self.hasher().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(GuardianError::Security(format!(
                "Failed to verify password: {e}"
            ))),
        }
    }

    /// Whether `password` matches any of the most recent hashes.
    pub fn is_in_history(&self, password: &str, history: &[String]) -> Result<bool> {
        for hash in history.iter().take(self.history_count) {
            if self.verify_password(password, hash)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PasswordPolicy {
        PasswordPolicy::new(&AccountsConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            ..AccountsConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_strong_password_passes() {
        let report = policy().validate_strength("Sal0n!Booking#24");
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.score, 100);
    }

    #[test]
    fn test_missing_classes_are_reported() {
        let report = policy().validate_strength("short");
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 4);
        assert!(report.errors[0].contains("12"));
    }

    #[test]
    fn test_weak_patterns() {
        let p = policy();
        assert_eq!(p.weak_patterns("aaaaaaaaaaaa"), vec!["repeated_character"]);
        assert_eq!(p.weak_patterns("123456789"), vec!["sequential_digits"]);
        assert_eq!(p.weak_patterns("ABCdef"), vec!["sequential_letters"]);
        assert_eq!(p.weak_patterns("MyPassword!23"), vec!["common_word"]);
        assert!(p.weak_patterns("Sal0n!Booking#24").is_empty());

        let report = p.validate_strength("Qwerty!2024Salon");
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("predictable")));
    }

    #[test]
    fn test_strength_scoring() {
        let p = policy();
        assert_eq!(p.strength(""), 0);
        // 5 chars * 4 + lower class
        assert_eq!(p.strength("abcxz"), 35);
        // 12 repeated lowercase: 40 + 15 - 20
        assert_eq!(p.strength("aaaaaaaaaaaa"), 35);
    }

    #[test]
    fn test_provisional_password_has_every_class() {
        let p = policy();
        for _ in 0..50 {
            let pw = p.generate_provisional_password();
            assert_eq!(pw.len(), 16);
            assert!(pw.chars().any(|c| c.is_ascii_uppercase()));
            assert!(pw.chars().any(|c| c.is_ascii_lowercase()));
            assert!(pw.chars().any(|c| c.is_ascii_digit()));
            assert!(pw.chars().any(|c| "!@#$%^&*".contains(c)));
        }
        assert_ne!(
            p.generate_provisional_password(),
            p.generate_provisional_password()
        );
    }

    #[test]
    fn test_hash_and_verify() {
        let p = policy();
        let hash = p.hash_password("Sal0n!Booking#24").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(p.verify_password("Sal0n!Booking#24", &hash).unwrap());
        assert!(!p.verify_password("wrong", &hash).unwrap());
        assert!(p.verify_password("x", "not-a-hash").is_err());
        // Same password, different salt.
        assert_ne!(hash, p.hash_password("Sal0n!Booking#24").unwrap());
    }

    #[test]
    fn test_history_only_checks_recent_hashes() {
        let p = policy();
        let old: Vec<String> = (0..6)
            .map(|i| p.hash_password(&format!("Older!Pass{i}word")).unwrap())
            .collect();
        assert!(p.is_in_history("Older!Pass0word", &old).unwrap());
        assert!(p.is_in_history("Older!Pass4word", &old).unwrap());
        // Sixth entry is beyond the five-hash window.
        assert!(!p.is_in_history("Older!Pass5word", &old).unwrap());
        assert!(!p.is_in_history("Fresh!Pass9word", &old).unwrap());
    }
}
