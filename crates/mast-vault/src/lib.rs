//! Broker credential lifecycle.
//!
//! Components never hold long-lived broker credentials of their own. The
//! [`CredentialManager`] exchanges the pod's Kubernetes service-account JWT
//! for a short-lived Vault token, reads the broker username/password from a
//! KV-v2 secret, and transparently re-authenticates when the lease nears
//! expiry. When Vault is unreachable or unconfigured it falls back to
//! reading a pre-provisioned Kubernetes Secret through `kubectl`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Safety margin subtracted from every lease: tokens are refreshed while
/// they still have at least this much life left.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(300);

const KUBECTL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CredsError {
    #[error("failed to read service account token: {0}")]
    ServiceAccountToken(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vault returned {status} from {endpoint}")]
    VaultStatus { endpoint: String, status: u16 },
    #[error("malformed vault response: {0}")]
    Malformed(String),
    #[error("kubectl failed: {0}")]
    Kubectl(String),
    #[error("all credential sources failed (vault: {vault}; cluster secret: {cluster})")]
    Exhausted { vault: String, cluster: String },
}

/// Connection parameters for the message broker. Never persisted to disk by
/// consumers; re-fetched on demand.
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl BrokerCredentials {
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            self.port,
            // The default vhost "/" must be percent-encoded in an AMQP URI.
            if self.vhost == "/" {
                "%2f".to_string()
            } else {
                self.vhost.clone()
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub addr: String,
    pub role: String,
    pub k8s_auth_path: String,
    pub secret_path: String,
    pub service_account_token_path: PathBuf,
    /// Try Vault before the cluster-secret fallback when true, the reverse
    /// ordering when false.
    pub prefer_vault: bool,
    /// Pre-provisioned token overriding Kubernetes auth entirely, e.g. from
    /// a secrets mount. Hot-swappable via [`spawn_secrets_watcher`].
    pub static_token: Option<String>,
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_vhost: String,
    pub cluster_secret_namespace: String,
    pub cluster_secret_name: String,
}

impl VaultConfig {
    pub fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            addr: env("VAULT_ADDR").unwrap_or_else(|| "http://vault.vault:8200".into()),
            role: env("VAULT_K8S_ROLE").unwrap_or_else(|| "mast-agent-role".into()),
            k8s_auth_path: env("VAULT_K8S_AUTH_PATH").unwrap_or_else(|| "auth/kubernetes".into()),
            secret_path: env("VAULT_SECRET_PATH").unwrap_or_else(|| "secret/data/rabbitmq".into()),
            service_account_token_path: env("SERVICE_ACCOUNT_TOKEN_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
                }),
            prefer_vault: env("PREFER_VAULT")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            static_token: env("VAULT_TOKEN"),
            broker_host: env("RABBITMQ_HOST").unwrap_or_else(|| "rabbitmq.rabbitmq".into()),
            broker_port: env("RABBITMQ_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5672),
            broker_vhost: env("RABBITMQ_VHOST").unwrap_or_else(|| "/".into()),
            cluster_secret_namespace: env("RABBITMQ_NAMESPACE").unwrap_or_else(|| "rabbitmq".into()),
            cluster_secret_name: env("RABBITMQ_SECRET_NAME")
                .unwrap_or_else(|| "rabbitmq-default-user".into()),
        }
    }
}

/// Vault session state held privately by the manager.
#[derive(Debug, Clone)]
struct VaultSession {
    client_token: String,
    expires_at: Instant,
}

impl VaultSession {
    fn expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct CredentialManager {
    cfg: VaultConfig,
    http: reqwest::Client,
    session: Mutex<Option<VaultSession>>,
    static_token: Arc<RwLock<Option<String>>>,
}

impl CredentialManager {
    pub fn new(cfg: VaultConfig) -> Self {
        let static_token = Arc::new(RwLock::new(cfg.static_token.clone()));
        Self {
            cfg,
            http: reqwest::Client::new(),
            session: Mutex::new(None),
            static_token,
        }
    }

    /// Handle for hot-swapping the static token, e.g. from a secrets-mount
    /// watcher.
    pub fn static_token_handle(&self) -> Arc<RwLock<Option<String>>> {
        Arc::clone(&self.static_token)
    }

    /// Produce broker credentials, trying the configured primary path first
    /// and degrading to the other on failure.
    pub async fn get_credentials(&self) -> Result<BrokerCredentials, CredsError> {
        let (first, second): (Source, Source) = if self.cfg.prefer_vault {
            (Source::Vault, Source::Cluster)
        } else {
            (Source::Cluster, Source::Vault)
        };

        let first_err = match self.fetch(first).await {
            Ok(creds) => return Ok(creds),
            Err(err) => {
                warn!(source = first.name(), error = %err, "credential retrieval failed, trying fallback");
                err
            }
        };
        match self.fetch(second).await {
            Ok(creds) => Ok(creds),
            Err(second_err) => {
                let (vault, cluster) = match first {
                    Source::Vault => (first_err.to_string(), second_err.to_string()),
                    Source::Cluster => (second_err.to_string(), first_err.to_string()),
                };
                error!(%vault, %cluster, "all credential sources failed");
                Err(CredsError::Exhausted { vault, cluster })
            }
        }
    }

    async fn fetch(&self, source: Source) -> Result<BrokerCredentials, CredsError> {
        match source {
            Source::Vault => self.from_vault().await,
            Source::Cluster => self.from_cluster_secret().await,
        }
    }

    async fn from_vault(&self) -> Result<BrokerCredentials, CredsError> {
        let token = self.ensure_token().await?;
        let endpoint = format!("{}/v1/{}", self.cfg.addr, self.cfg.secret_path);
        let response = self
            .http
            .get(&endpoint)
            .header("X-Vault-Token", &token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CredsError::VaultStatus {
                endpoint,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        let (username, password) = parse_kv2_secret(&body)?;
        info!(path = %self.cfg.secret_path, "retrieved broker credentials from vault");
        Ok(self.bundle(username, password))
    }

    /// Return a Vault token that is good for at least the refresh margin,
    /// re-authenticating at most once.
    async fn ensure_token(&self) -> Result<String, CredsError> {
        if let Some(token) = self.static_token.read().expect("static token lock").clone() {
            return Ok(token);
        }

        let mut session = self.session.lock().await;
        let reusable = match session.as_ref() {
            Some(current) if !current.expired(Instant::now()) => {
                probe_allows_reuse(self.lookup_self_ttl(&current.client_token).await)
            }
            _ => false,
        };

        if !reusable {
            *session = Some(self.login().await?);
        }
        Ok(session.as_ref().expect("session populated").client_token.clone())
    }

    async fn login(&self) -> Result<VaultSession, CredsError> {
        let jwt = tokio::fs::read_to_string(&self.cfg.service_account_token_path).await?;
        let jwt = jwt.trim();
        if jwt.is_empty() {
            return Err(CredsError::Malformed(
                "service account token file is empty".into(),
            ));
        }

        let endpoint = format!("{}/v1/{}/login", self.cfg.addr, self.cfg.k8s_auth_path);
        debug!(role = %self.cfg.role, %endpoint, "authenticating with kubernetes service account");
        let response = self
            .http
            .post(&endpoint)
            .json(&serde_json::json!({"role": self.cfg.role, "jwt": jwt}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CredsError::VaultStatus {
                endpoint,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        let (client_token, lease_duration) = parse_login(&body)?;
        info!(
            lease_secs = lease_duration.as_secs(),
            "vault authentication succeeded"
        );
        Ok(VaultSession {
            client_token,
            expires_at: Instant::now() + lease_duration.saturating_sub(REFRESH_MARGIN),
        })
    }

    async fn lookup_self_ttl(&self, token: &str) -> Result<Duration, CredsError> {
        let endpoint = format!("{}/v1/auth/token/lookup-self", self.cfg.addr);
        let response = self
            .http
            .get(&endpoint)
            .header("X-Vault-Token", token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CredsError::VaultStatus {
                endpoint,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        parse_lookup_ttl(&body)
    }

    /// Fallback: read the broker's pre-existing Kubernetes Secret via the
    /// cluster API. Trades ephemeral-credential hygiene for availability.
    async fn from_cluster_secret(&self) -> Result<BrokerCredentials, CredsError> {
        let username = self.read_secret_field("username").await?;
        let password = self.read_secret_field("password").await?;
        if username.is_empty() || password.is_empty() {
            return Err(CredsError::Kubectl(
                "empty username or password in cluster secret".into(),
            ));
        }
        info!(
            secret = %self.cfg.cluster_secret_name,
            namespace = %self.cfg.cluster_secret_namespace,
            "retrieved broker credentials from cluster secret"
        );
        Ok(self.bundle(username, password))
    }

    async fn read_secret_field(&self, field: &str) -> Result<String, CredsError> {
        let output = tokio::time::timeout(
            KUBECTL_TIMEOUT,
            tokio::process::Command::new("kubectl")
                .args([
                    "get",
                    "secret",
                    &self.cfg.cluster_secret_name,
                    "-n",
                    &self.cfg.cluster_secret_namespace,
                    "-o",
                    &format!("jsonpath={{.data.{field}}}"),
                ])
                .output(),
        )
        .await
        .map_err(|_| CredsError::Kubectl("kubectl timed out".into()))?
        .map_err(|err| CredsError::Kubectl(err.to_string()))?;

        if !output.status.success() {
            return Err(CredsError::Kubectl(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        decode_secret_field(String::from_utf8_lossy(&output.stdout).trim())
    }

    fn bundle(&self, username: String, password: String) -> BrokerCredentials {
        BrokerCredentials {
            username,
            password,
            host: self.cfg.broker_host.clone(),
            port: self.cfg.broker_port,
            vhost: self.cfg.broker_vhost.clone(),
        }
    }
}

#[derive(Clone, Copy)]
enum Source {
    Vault,
    Cluster,
}

impl Source {
    fn name(self) -> &'static str {
        match self {
            Source::Vault => "vault",
            Source::Cluster => "cluster-secret",
        }
    }
}

/// Decide from a lookup-self probe whether the current token can be kept.
/// A TTL at or above the refresh margin keeps it; anything shorter, or a
/// failed probe, forces a single re-authentication.
fn probe_allows_reuse(probe: Result<Duration, CredsError>) -> bool {
    match probe {
        Ok(ttl) if ttl >= REFRESH_MARGIN => true,
        Ok(ttl) => {
            info!(ttl_secs = ttl.as_secs(), "vault token near expiry, re-authenticating");
            false
        }
        Err(err) => {
            warn!(error = %err, "vault token introspection failed, re-authenticating");
            false
        }
    }
}

fn parse_kv2_secret(body: &[u8]) -> Result<(String, String), CredsError> {
    #[derive(Deserialize)]
    struct Kv2 {
        data: Kv2Outer,
    }
    #[derive(Deserialize)]
    struct Kv2Outer {
        data: Kv2Inner,
    }
    #[derive(Deserialize)]
    struct Kv2Inner {
        username: Option<String>,
        password: Option<String>,
    }

    let secret: Kv2 =
        serde_json::from_slice(body).map_err(|err| CredsError::Malformed(err.to_string()))?;
    match (secret.data.data.username, secret.data.data.password) {
        (Some(username), Some(password)) => Ok((username, password)),
        _ => Err(CredsError::Malformed(
            "username or password missing from secret".into(),
        )),
    }
}

fn parse_login(body: &[u8]) -> Result<(String, Duration), CredsError> {
    #[derive(Deserialize)]
    struct Login {
        auth: LoginAuth,
    }
    #[derive(Deserialize)]
    struct LoginAuth {
        client_token: String,
        #[serde(default)]
        lease_duration: Option<u64>,
    }

    let login: Login =
        serde_json::from_slice(body).map_err(|err| CredsError::Malformed(err.to_string()))?;
    let lease = Duration::from_secs(login.auth.lease_duration.unwrap_or(3600));
    Ok((login.auth.client_token, lease))
}

fn parse_lookup_ttl(body: &[u8]) -> Result<Duration, CredsError> {
    #[derive(Deserialize)]
    struct Lookup {
        data: LookupData,
    }
    #[derive(Deserialize)]
    struct LookupData {
        #[serde(default)]
        ttl: u64,
    }

    let lookup: Lookup =
        serde_json::from_slice(body).map_err(|err| CredsError::Malformed(err.to_string()))?;
    Ok(Duration::from_secs(lookup.data.ttl))
}

fn decode_secret_field(encoded: &str) -> Result<String, CredsError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|err| CredsError::Kubectl(format!("invalid base64 in secret: {err}")))?;
    String::from_utf8(bytes)
        .map(|s| s.trim().to_string())
        .map_err(|err| CredsError::Kubectl(format!("secret is not utf-8: {err}")))
}

/// Watch a secrets mount for modification events and hot-swap the cached
/// token whenever the named file changes. Event driven, not a polling loop;
/// the returned watcher must be kept alive.
pub fn spawn_secrets_watcher(
    mount_dir: &Path,
    file_name: &str,
    token: Arc<RwLock<Option<String>>>,
) -> Result<RecommendedWatcher, notify::Error> {
    let (tx, rx) = std::sync::mpsc::channel::<Result<notify::Event, notify::Error>>();
    let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())?;
    watcher.watch(mount_dir, RecursiveMode::NonRecursive)?;

    let file_name = file_name.to_string();
    std::thread::spawn(move || {
        for event in rx {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    error!(error = %err, "secrets watcher error");
                    continue;
                }
            };
            if !event.kind.is_modify() && !event.kind.is_create() {
                continue;
            }
            let changed = event
                .paths
                .iter()
                .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(file_name.as_str()));
            let Some(path) = changed else { continue };
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    let trimmed = contents.trim();
                    if trimmed.is_empty() {
                        warn!(path = %path.display(), "secrets file emptied, keeping previous token");
                        continue;
                    }
                    *token.write().expect("static token lock") = Some(trimmed.to_string());
                    info!(path = %path.display(), "reloaded vault token from secrets mount");
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "failed to re-read secrets file");
                }
            }
        }
    });

    Ok(watcher)
}
