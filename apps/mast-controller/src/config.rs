use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    /// Callers must belong to this group to submit batches.
    pub required_group: String,
    pub auth_bypass: bool,
    pub vault_secrets_path: Option<PathBuf>,
    pub vault_secrets_file: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("MAST_CONTROLLER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            issuer: env::var("OAUTH_ISSUER").ok(),
            client_id: env::var("OAUTH_CLIENT_ID").ok(),
            required_group: env::var("REQUIRED_GROUP").unwrap_or_else(|_| "user".to_string()),
            auth_bypass: env::var("AUTH_BYPASS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            vault_secrets_path: env::var("VAULT_SECRETS_PATH").ok().map(PathBuf::from),
            vault_secrets_file: env::var("VAULT_SECRETS_FILE")
                .unwrap_or_else(|_| "vault-token".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            issuer: None,
            client_id: None,
            required_group: "user".to_string(),
            auth_bypass: false,
            vault_secrets_path: None,
            vault_secrets_file: "vault-token".to_string(),
        }
    }
}
