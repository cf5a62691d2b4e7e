mod broker;
mod config;
mod dedupe;
mod dispatch;
mod executor;
mod policy;
mod sink;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mast_auth::{AuthConfig, IdentityVerifier};
use mast_vault::{CredentialManager, VaultConfig};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, ExecutionSettings};
use crate::policy::AuthorizationPolicy;

#[derive(Parser)]
#[command(name = "mast-agent", about = "Privileged execution agent for the mast fleet")]
struct Cli {
    /// Path to the authorization policy file, overriding POLICY_PATH.
    #[arg(long)]
    policy: Option<PathBuf>,
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = AgentConfig::from_env();

    let policy = match cli.policy.clone().or_else(|| cfg.policy_path.clone()) {
        Some(path) => AuthorizationPolicy::load(&path)?,
        None => {
            warn!("no policy file configured, using the built-in default policy");
            AuthorizationPolicy::default()
        }
    };

    let verifier = IdentityVerifier::discover(AuthConfig {
        issuer: cfg.issuer.clone(),
        client_id: cfg.client_id.clone(),
        bypass: cfg.auth_bypass,
    })
    .await;

    let creds = CredentialManager::new(VaultConfig::from_env());
    // Keep the watcher alive for the process lifetime; dropping it stops
    // the mount watch.
    let _watcher = cfg.vault_secrets_path.as_ref().and_then(|path| {
        match mast_vault::spawn_secrets_watcher(
            path,
            &cfg.vault_secrets_file,
            creds.static_token_handle(),
        ) {
            Ok(watcher) => {
                info!(path = %path.display(), "watching secrets mount for token rotation");
                Some(watcher)
            }
            Err(err) => {
                warn!(error = %err, "failed to start secrets watcher");
                None
            }
        }
    });

    let dispatcher = Dispatcher::new(
        policy,
        verifier,
        cfg.service_tokens.clone(),
        cfg.dedupe_capacity,
        ExecutionSettings {
            command_timeout: Duration::from_secs(cfg.command_timeout_seconds),
            elevate_wildcard: cfg.elevate_wildcard,
        },
    );

    tokio::select! {
        _ = supervise(&creds, &dispatcher) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}

/// Reconnect pacing for the consume loop. Failures back off exponentially
/// up to a cap; a clean consumer exit resets the backoff but still pauses,
/// so a broker that accepts and immediately closes connections cannot
/// drive a tight reconnect spin.
struct Reconnect {
    backoff: Duration,
}

impl Reconnect {
    fn new() -> Self {
        Self {
            backoff: INITIAL_BACKOFF,
        }
    }

    fn on_success(&mut self) -> Duration {
        self.backoff = INITIAL_BACKOFF;
        INITIAL_BACKOFF
    }

    fn on_failure(&mut self) -> Duration {
        let pause = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        pause
    }
}

/// Keep the consume loop alive across broker and credential failures with
/// capped exponential backoff. A lost connection must never kill the
/// process.
async fn supervise(creds: &CredentialManager, dispatcher: &Dispatcher) {
    let mut pacing = Reconnect::new();
    loop {
        let pause = match run_once(creds, dispatcher).await {
            Ok(()) => {
                warn!("broker consumer ended, reconnecting");
                pacing.on_success()
            }
            Err(err) => {
                error!(error = %err, "consume loop failed, backing off");
                pacing.on_failure()
            }
        };
        tokio::time::sleep(pause).await;
    }
}

async fn run_once(creds: &CredentialManager, dispatcher: &Dispatcher) -> anyhow::Result<()> {
    let credentials = creds.get_credentials().await?;
    let (_connection, channel) = broker::connect(&credentials).await?;
    broker::consume(&channel, dispatcher).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_back_off_exponentially_to_the_cap() {
        let mut pacing = Reconnect::new();
        assert_eq!(pacing.on_failure(), Duration::from_secs(1));
        assert_eq!(pacing.on_failure(), Duration::from_secs(2));
        assert_eq!(pacing.on_failure(), Duration::from_secs(4));
        for _ in 0..10 {
            pacing.on_failure();
        }
        assert_eq!(pacing.on_failure(), MAX_BACKOFF);
    }

    #[test]
    fn clean_exit_pauses_and_resets_backoff() {
        let mut pacing = Reconnect::new();
        pacing.on_failure();
        pacing.on_failure();
        assert_eq!(pacing.on_success(), INITIAL_BACKOFF);
        assert_eq!(pacing.on_failure(), INITIAL_BACKOFF);
    }
}
