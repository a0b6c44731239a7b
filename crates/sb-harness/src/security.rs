use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;
use tracing::warn;

pub use sb_core::types::mask_secret;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SecurityError {
    #[error("csrf token missing")]
    CsrfMissing,
    #[error("csrf token mismatch")]
    CsrfMismatch,
    #[error("invalid API key: {0}")]
    InvalidApiKey(String),
    #[error("secure random generator failed")]
    RandomFailure,
}

// ===========================================================================
// CSRF
// ===========================================================================

const CSRF_TOKEN_BYTES: usize = 32;

/// Per-session anti-forgery token, hex encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct CsrfToken(String);

impl CsrfToken {
    pub fn generate() -> Result<Self, SecurityError> {
        let mut bytes = [0u8; CSRF_TOKEN_BYTES];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| SecurityError::RandomFailure)?;
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for CsrfToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CsrfToken({})", mask_secret(&self.0))
    }
}

/// Compare the token a caller supplied against the session's token.
///
/// Empty values on either side count as missing.
pub fn verify_csrf(session: &str, supplied: &str) -> Result<(), SecurityError> {
    if session.is_empty() || supplied.is_empty() {
        return Err(SecurityError::CsrfMissing);
    }
    if bool::from(session.as_bytes().ct_eq(supplied.as_bytes())) {
        Ok(())
    } else {
        Err(SecurityError::CsrfMismatch)
    }
}

// ===========================================================================
// ApiKeyValidator
// ===========================================================================

/// Sanity checks for credentials entered through the admin surface.
#[derive(Debug, Clone)]
pub struct ApiKeyValidator {
    pub min_length: usize,
}

impl Default for ApiKeyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiKeyValidator {
    pub fn new() -> Self {
        Self { min_length: 8 }
    }

    pub fn validate(&self, key: &str) -> Result<(), SecurityError> {
        if key.is_empty() {
            return Err(SecurityError::InvalidApiKey("key is empty".into()));
        }
        if key.chars().count() < self.min_length {
            return Err(SecurityError::InvalidApiKey(format!(
                "key too short (min {} chars)",
                self.min_length
            )));
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            warn!(key = %mask_secret(key), "rejected api key with whitespace");
            return Err(SecurityError::InvalidApiKey(
                "key contains whitespace or control characters".into(),
            ));
        }
        Ok(())
    }
}
