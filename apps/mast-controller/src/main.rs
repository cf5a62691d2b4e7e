mod broker;
mod config;
mod rooms;
mod routes;
mod state;
mod websocket;

use std::sync::Arc;

use clap::Parser;
use mast_auth::{AuthConfig, IdentityVerifier};
use mast_vault::{CredentialManager, VaultConfig};
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "mast-controller", about = "HTTP control plane for the mast fleet")]
struct Cli {
    /// Listen port, overriding MAST_CONTROLLER_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    let verifier = IdentityVerifier::discover(AuthConfig {
        issuer: cfg.issuer.clone(),
        client_id: cfg.client_id.clone(),
        bypass: cfg.auth_bypass,
    })
    .await;

    let creds = Arc::new(CredentialManager::new(VaultConfig::from_env()));
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

    let publisher = Arc::new(broker::QueueBatchPublisher::new(creds.clone()));
    let state = AppState::new(cfg.clone(), verifier, publisher);

    // The bridge is part of the process lifecycle: started here, stopped
    // at shutdown, never tied to an inbound connection event.
    let bridge = tokio::spawn(broker::run_result_bridge(
        creds.clone(),
        state.rooms.clone(),
        state.submitters.clone(),
    ));

    let app = routes::build_router(state);
    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("mast controller listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    bridge.abort();
    Ok(())
}
