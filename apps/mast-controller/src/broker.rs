//! Broker plumbing for the controller: batch publishing and the result
//! bridge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use mast_proto::{CommandBatch, ResultMessage, COMMANDS_QUEUE, RESULTS_QUEUE};
use mast_vault::CredentialManager;
use tracing::{debug, error, info, warn};

use crate::rooms::RoomRegistry;
use crate::state::BatchPublisher;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reconnect pacing for the bridge loop. Failures back off exponentially
/// up to a cap; a clean consumer exit resets the backoff but still pauses,
/// so a broker that accepts and immediately closes connections cannot
/// drive a tight reconnect spin.
pub(crate) struct Reconnect {
    backoff: Duration,
}

impl Reconnect {
    pub(crate) fn new() -> Self {
        Self {
            backoff: INITIAL_BACKOFF,
        }
    }

    pub(crate) fn on_success(&mut self) -> Duration {
        self.backoff = INITIAL_BACKOFF;
        INITIAL_BACKOFF
    }

    pub(crate) fn on_failure(&mut self) -> Duration {
        let pause = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        pause
    }
}

async fn open_channel(creds: &CredentialManager, queue: &str) -> anyhow::Result<(Connection, Channel)> {
    let credentials = creds.get_credentials().await?;
    let connection =
        Connection::connect(&credentials.amqp_uri(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok((connection, channel))
}

/// Publishes each batch over a fresh connection. Broker connections are
/// never shared across request handlers.
pub struct QueueBatchPublisher {
    creds: Arc<CredentialManager>,
}

impl QueueBatchPublisher {
    pub fn new(creds: Arc<CredentialManager>) -> Self {
        Self { creds }
    }
}

#[async_trait]
impl BatchPublisher for QueueBatchPublisher {
    async fn publish(&self, batch: &CommandBatch) -> anyhow::Result<()> {
        let (connection, channel) = open_channel(&self.creds, COMMANDS_QUEUE).await?;
        let payload = serde_json::to_vec(batch)?;
        channel
            .basic_publish(
                "",
                COMMANDS_QUEUE,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        debug!(batch_id = %batch.batch_id, "published batch");
        connection.close(200, "publish complete").await.ok();
        Ok(())
    }
}

/// The result bridge: one long-lived consumer per controller process that
/// drains the results queue and fans each frame out to its batch's room.
/// Runs until the task is aborted at shutdown, reconnecting with capped
/// exponential backoff on any broker failure.
pub async fn run_result_bridge(
    creds: Arc<CredentialManager>,
    rooms: RoomRegistry,
    submitters: Arc<DashMap<String, String>>,
) {
    let mut pacing = Reconnect::new();
    loop {
        let pause = match bridge_once(&creds, &rooms, &submitters).await {
            Ok(()) => {
                warn!("result bridge consumer ended, reconnecting");
                pacing.on_success()
            }
            Err(err) => {
                error!(error = %err, "result bridge failed, backing off");
                pacing.on_failure()
            }
        };
        tokio::time::sleep(pause).await;
    }
}

async fn bridge_once(
    creds: &CredentialManager,
    rooms: &RoomRegistry,
    submitters: &DashMap<String, String>,
) -> anyhow::Result<()> {
    let (_connection, channel) = open_channel(creds, RESULTS_QUEUE).await?;
    let mut consumer = channel
        .basic_consume(
            RESULTS_QUEUE,
            "mast-controller-bridge",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    info!("result bridge consuming");

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        match serde_json::from_slice::<ResultMessage>(&delivery.data) {
            Ok(message) => {
                let delivered = route_frame(rooms, submitters, &message);
                debug!(
                    batch_id = %message.batch_id(),
                    subscribers = delivered,
                    "bridged result frame"
                );
            }
            Err(err) => {
                error!(error = %err, "malformed result message, discarding");
            }
        }
        delivery.ack(BasicAckOptions::default()).await?;
    }
    Ok(())
}

/// Route one result frame: fan it out to the batch's room and, on the
/// terminal frame, retire the submitter entry so the map stays bounded by
/// in-flight batches.
fn route_frame(
    rooms: &RoomRegistry,
    submitters: &DashMap<String, String>,
    message: &ResultMessage,
) -> usize {
    let delivered = rooms.publish(message);
    if let ResultMessage::Completed(completed) = message {
        submitters.remove(&completed.batch_id);
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use mast_proto::{BatchCompleted, CommandResult};

    #[test]
    fn completed_frames_retire_submitter_entries() {
        let rooms = RoomRegistry::new();
        let submitters = DashMap::new();
        for batch in ["alice-01", "alice-02"] {
            submitters.insert(batch.to_string(), "alice".to_string());
        }

        route_frame(
            &rooms,
            &submitters,
            &ResultMessage::Result(CommandResult {
                batch_id: "alice-01".into(),
                command_id: 0,
                output: "hello".into(),
            }),
        );
        // Intermediate frames leave the entry alone: the submitter may
        // still join mid-stream.
        assert!(submitters.contains_key("alice-01"));

        for batch in ["alice-01", "alice-02"] {
            route_frame(
                &rooms,
                &submitters,
                &ResultMessage::Completed(BatchCompleted {
                    batch_id: batch.into(),
                    exit_summary: Vec::new(),
                }),
            );
        }
        assert!(submitters.is_empty());
    }

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
