use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub auth_bypass: bool,
    pub policy_path: Option<PathBuf>,
    /// Static token -> group mappings for service accounts, as a JSON
    /// object in `MAST_SERVICE_TOKENS`.
    pub service_tokens: HashMap<String, String>,
    pub command_timeout_seconds: u64,
    pub dedupe_capacity: usize,
    pub elevate_wildcard: bool,
    pub vault_secrets_path: Option<PathBuf>,
    pub vault_secrets_file: String,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let service_tokens = env::var("MAST_SERVICE_TOKENS")
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            issuer: env::var("OAUTH_ISSUER").ok(),
            client_id: env::var("OAUTH_CLIENT_ID").ok(),
            auth_bypass: flag("AUTH_BYPASS", false),
            policy_path: env::var("POLICY_PATH").ok().map(PathBuf::from),
            service_tokens,
            command_timeout_seconds: env::var("COMMAND_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            dedupe_capacity: env::var("DEDUPE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
            elevate_wildcard: flag("ELEVATE_WILDCARD", true),
            vault_secrets_path: env::var("VAULT_SECRETS_PATH").ok().map(PathBuf::from),
            vault_secrets_file: env::var("VAULT_SECRETS_FILE")
                .unwrap_or_else(|_| "vault-token".to_string()),
        }
    }
}

fn flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
