use sb_harness::security::{mask_secret, verify_csrf, ApiKeyValidator, CsrfToken, SecurityError};

// ---------------------------------------------------------------------------
// CSRF
// ---------------------------------------------------------------------------

#[test]
fn matching_token_passes() {
    let token = CsrfToken::generate().unwrap();
    assert!(verify_csrf(token.as_str(), token.as_str()).is_ok());
}

#[test]
fn empty_supplied_token_is_missing() {
    assert_eq!(verify_csrf("abc123", ""), Err(SecurityError::CsrfMissing));
}

#[test]
fn empty_session_token_is_missing() {
    // A session that never minted a token must not accept an empty match.
    assert_eq!(verify_csrf("", ""), Err(SecurityError::CsrfMissing));
}

#[test]
fn mismatched_token_is_rejected() {
    assert_eq!(
        verify_csrf("abc123", "abc124"),
        Err(SecurityError::CsrfMismatch)
    );
    assert_eq!(
        verify_csrf("abc123", "abc1234"),
        Err(SecurityError::CsrfMismatch)
    );
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

#[test]
fn validator_accepts_realistic_key() {
    let v = ApiKeyValidator::new();
    assert!(v.validate("sk-proj-abcdefghijklmnop").is_ok());
}

#[test]
fn validator_rejects_short_and_spaced_keys() {
    let v = ApiKeyValidator::new();
    assert!(matches!(v.validate("abc"), Err(SecurityError::InvalidApiKey(_))));
    assert!(matches!(
        v.validate("sk-abc def-ghijk"),
        Err(SecurityError::InvalidApiKey(_))
    ));
    assert!(v.validate("").is_err());
}

#[test]
fn masking_keeps_edges_only() {
    assert_eq!(mask_secret("sk-ant-0123456789"), "sk-a...6789");
}
