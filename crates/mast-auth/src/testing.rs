//! Helpers for building tokens in tests. Not for production use: the
//! tokens produced here carry no valid signature.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

/// Build an unsigned token whose payload is the given claims object.
/// Suitable for verifiers running in bypass mode.
pub fn unsigned_token(claims: &serde_json::Value) -> String {
    token_with_header(&serde_json::json!({"alg": "none", "typ": "JWT"}), claims)
}

/// Build a token that advertises RS256 and a kid but carries a bogus
/// signature. Useful for exercising key-lookup failure paths.
pub fn unsigned_rs256_token(claims: &serde_json::Value) -> String {
    token_with_header(
        &serde_json::json!({"alg": "RS256", "kid": "test-kid", "typ": "JWT"}),
        claims,
    )
}

fn token_with_header(header: &serde_json::Value, claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).expect("serialize header"));
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("serialize claims"));
    format!("{header}.{payload}.sig")
}
