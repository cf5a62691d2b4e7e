use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mast_auth::IdentityVerifier;
use mast_proto::CommandBatch;

use crate::config::Config;
use crate::rooms::RoomRegistry;

/// Seam over the commands queue so the HTTP layer can be exercised without
/// a live broker.
#[async_trait]
pub trait BatchPublisher: Send + Sync {
    async fn publish(&self, batch: &CommandBatch) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<IdentityVerifier>,
    pub publisher: Arc<dyn BatchPublisher>,
    pub rooms: RoomRegistry,
    /// batch_id -> submitting subject, consulted when a socket client asks
    /// to join the batch's room.
    pub submitters: Arc<DashMap<String, String>>,
}

impl AppState {
    pub fn new(
        config: Config,
        verifier: IdentityVerifier,
        publisher: Arc<dyn BatchPublisher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            verifier: Arc::new(verifier),
            publisher,
            rooms: RoomRegistry::new(),
            submitters: Arc::new(DashMap::new()),
        }
    }
}
