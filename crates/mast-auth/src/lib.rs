//! Identity verification against an OIDC issuer.
//!
//! The JWKS document is fetched once at startup and cached for the process
//! lifetime. A signing-key rotation at the issuer therefore requires a
//! process restart; verification against a missing key fails closed.

use std::collections::{BTreeSet, HashMap};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

pub mod testing;

#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// OIDC issuer URL; discovery is performed against
    /// `<issuer>/.well-known/openid-configuration`.
    pub issuer: Option<String>,
    /// Expected audience of presented tokens.
    pub client_id: Option<String>,
    /// Skip signature verification and trust the token payload as-is.
    /// Only for local development and tests.
    pub bypass: bool,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("missing issuer configuration")]
    MissingIssuerConfig,
    #[error("jwt header missing kid")]
    MissingKid,
    #[error("unknown jwk key id {0}")]
    UnknownKey(String),
    #[error("unsupported jwt algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("jwt validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("at_hash claim does not match the presented access token")]
    AtHashMismatch,
    #[error("jwks fetch failed: {0}")]
    JwksFetch(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payload decode error: {0}")]
    Payload(String),
}

/// Normalized claims extracted from a verified identity token.
#[derive(Debug, Clone)]
pub struct Claims {
    pub subject: String,
    pub preferred_username: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub groups: BTreeSet<String>,
    /// False only on the named `at_hash` leniency path: the signature and
    /// issuer/audience checks passed but the `at_hash` claim could not be
    /// cross-checked because no access token accompanied the identity token.
    pub at_hash_verified: bool,
}

impl Claims {
    pub fn display_or_subject(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.preferred_username.as_deref())
            .unwrap_or(&self.subject)
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    groups: Option<serde_json::Value>,
    #[serde(default)]
    at_hash: Option<String>,
}

impl RawClaims {
    fn normalize(self, at_hash_verified: bool) -> Claims {
        Claims {
            subject: self.sub,
            preferred_username: self.preferred_username,
            display_name: self.name,
            email: self.email,
            groups: normalize_groups(self.groups.as_ref()),
            at_hash_verified,
        }
    }
}

/// Group claims arrive either as a single string or as a list; fold both
/// into a set.
pub fn normalize_groups(value: Option<&serde_json::Value>) -> BTreeSet<String> {
    let mut groups = BTreeSet::new();
    match value {
        Some(serde_json::Value::String(s)) => {
            groups.insert(s.clone());
        }
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    groups.insert(s.to_string());
                }
            }
        }
        _ => {}
    }
    groups
}

pub struct IdentityVerifier {
    config: AuthConfig,
    keys: HashMap<String, DecodingKey>,
}

impl IdentityVerifier {
    /// Fetch the issuer's JWKS once and build a verifier around it. A fetch
    /// failure is logged and leaves the key set empty, so every subsequent
    /// verification fails closed rather than panicking at startup.
    pub async fn discover(config: AuthConfig) -> Self {
        if config.bypass {
            warn!("identity verification bypass enabled; tokens are trusted unverified");
            return Self {
                config,
                keys: HashMap::new(),
            };
        }
        let keys = match fetch_jwks(&config).await {
            Ok(keys) => {
                info!(keys = keys.len(), "cached issuer signing keys");
                keys
            }
            Err(err) => {
                error!(error = %err, "failed to fetch JWKS; all verifications will fail closed");
                HashMap::new()
            }
        };
        Self { config, keys }
    }

    /// Construct a verifier with a pre-built key set. Used by tests and by
    /// callers that manage discovery themselves.
    pub fn with_keys(config: AuthConfig, keys: HashMap<String, DecodingKey>) -> Self {
        Self { config, keys }
    }

    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.verify_with_access_token(token, None).await
    }

    /// Verify an identity token, cross-checking its `at_hash` claim against
    /// `access_token` when one is supplied.
    pub async fn verify_with_access_token(
        &self,
        token: &str,
        access_token: Option<&str>,
    ) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if self.config.bypass {
            return decode_payload(token).map(|raw| raw.normalize(true));
        }

        let header = decode_header(token)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header.kid.ok_or(AuthError::MissingKid)?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKey(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.config.client_id {
            validation.set_audience(&[audience]);
        }
        let data = decode::<RawClaims>(token, key, &validation)?;

        // Named leniency path: identity tokens issued without an
        // accompanying access token carry an at_hash claim we cannot
        // cross-check. Accept the otherwise-verified claims and mark the
        // single unverified field instead of rejecting. Any other
        // validation failure has already returned above.
        match (&data.claims.at_hash, access_token) {
            (Some(expected), Some(access_token)) => {
                if compute_at_hash(access_token) != *expected {
                    return Err(AuthError::AtHashMismatch);
                }
                Ok(data.claims.normalize(true))
            }
            (Some(_), None) => {
                warn!(subject = %data.claims.sub, "accepting token with uncheckable at_hash claim");
                Ok(data.claims.normalize(false))
            }
            (None, _) => Ok(data.claims.normalize(true)),
        }
    }
}

/// Left half of SHA-256 over the access token, base64url without padding,
/// per OIDC Core 3.1.3.6 for RS256-signed identity tokens.
pub fn compute_at_hash(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

fn decode_payload(token: &str) -> Result<RawClaims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() < 2 {
        return Err(AuthError::Payload("token missing payload".into()));
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|err| AuthError::Payload(err.to_string()))?;
    serde_json::from_slice(&payload).map_err(|err| AuthError::Payload(err.to_string()))
}

async fn fetch_jwks(config: &AuthConfig) -> Result<HashMap<String, DecodingKey>, AuthError> {
    let issuer = config
        .issuer
        .clone()
        .ok_or(AuthError::MissingIssuerConfig)?;
    let client = reqwest::Client::new();

    let discovery: OidcDiscovery = client
        .get(format!("{}/.well-known/openid-configuration", issuer))
        .send()
        .await?
        .error_for_status()
        .map_err(|err| {
            AuthError::JwksFetch(format!("discovery status: {}", err.status().unwrap_or_default()))
        })?
        .json()
        .await?;

    let body: JwksResponse = client
        .get(&discovery.jwks_uri)
        .send()
        .await?
        .error_for_status()
        .map_err(|err| {
            AuthError::JwksFetch(format!("jwks status: {}", err.status().unwrap_or_default()))
        })?
        .json()
        .await?;

    let mut keys = HashMap::new();
    for key in body.keys {
        if key.kty != "RSA" {
            continue;
        }
        let (Some(n), Some(e)) = (key.n, key.e) else {
            continue;
        };
        let decoding_key = DecodingKey::from_rsa_components(&n, &e)?;
        keys.insert(key.kid, decoding_key);
    }
    if keys.is_empty() {
        return Err(AuthError::JwksFetch("no usable RSA keys returned".into()));
    }
    Ok(keys)
}

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn groups_normalize_from_string_and_list() {
        let single = json!("developers");
        assert_eq!(
            normalize_groups(Some(&single)),
            BTreeSet::from(["developers".to_string()])
        );

        let many = json!(["administrators", "developers", "developers"]);
        let groups = normalize_groups(Some(&many));
        assert_eq!(groups.len(), 2);
        assert!(groups.contains("administrators"));

        assert!(normalize_groups(None).is_empty());
        assert!(normalize_groups(Some(&json!(42))).is_empty());
    }

    #[test]
    fn at_hash_is_stable_and_discriminating() {
        let a = compute_at_hash("access-token-one");
        let b = compute_at_hash("access-token-one");
        let c = compute_at_hash("access-token-two");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Left half of SHA-256 is 16 bytes; base64url without padding.
        assert_eq!(a.len(), 22);
        assert!(!a.contains('='));
    }

    #[tokio::test]
    async fn bypass_mode_decodes_payload_without_verification() {
        let verifier = IdentityVerifier::with_keys(
            AuthConfig {
                bypass: true,
                ..Default::default()
            },
            HashMap::new(),
        );
        let token = testing::unsigned_token(&json!({
            "sub": "alice",
            "name": "Alice",
            "groups": ["developers"],
        }));
        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.subject, "alice");
        assert_eq!(claims.display_or_subject(), "Alice");
        assert!(claims.groups.contains("developers"));
    }

    #[tokio::test]
    async fn empty_key_set_fails_closed() {
        let verifier = IdentityVerifier::with_keys(
            AuthConfig {
                issuer: Some("https://idp.example".into()),
                client_id: Some("mast".into()),
                bypass: false,
            },
            HashMap::new(),
        );
        // Any structurally valid RS256 token must be rejected when no keys
        // were cached at startup.
        let token = testing::unsigned_rs256_token(&json!({"sub": "alice", "exp": 4102444800u64}));
        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let verifier = IdentityVerifier::with_keys(AuthConfig::default(), HashMap::new());
        assert!(matches!(
            verifier.verify("").await.unwrap_err(),
            AuthError::MissingToken
        ));
    }
}
