//! Broker plumbing for the agent: durable queue setup, the prefetch-1
//! consume loop, and the result publisher.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use mast_proto::{CommandBatch, ResultMessage, COMMANDS_QUEUE, RESULTS_QUEUE};
use mast_vault::BrokerCredentials;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;
use crate::sink::ResultSink;

pub async fn connect(creds: &BrokerCredentials) -> anyhow::Result<(Connection, Channel)> {
    let connection =
        Connection::connect(&creds.amqp_uri(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    for queue in [COMMANDS_QUEUE, RESULTS_QUEUE] {
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
    }
    // One unacked batch in flight per replica.
    channel.basic_qos(1, BasicQosOptions::default()).await?;
    Ok((connection, channel))
}

/// Publishes result frames onto the durable results queue with persistent
/// delivery.
pub struct QueueResultSink {
    channel: Channel,
}

impl QueueResultSink {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ResultSink for QueueResultSink {
    async fn send(&self, message: ResultMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&message)?;
        self.channel
            .basic_publish(
                "",
                RESULTS_QUEUE,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }
}

/// Consume batches until the connection drops. Malformed messages and
/// processing failures are logged and acked; redelivering them could never
/// succeed, and partially executed batches must not be double-run.
pub async fn consume(channel: &Channel, dispatcher: &Dispatcher) -> anyhow::Result<()> {
    let mut consumer = channel
        .basic_consume(
            COMMANDS_QUEUE,
            "mast-agent",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    info!("agent consuming, waiting for command batches");

    let sink = QueueResultSink::new(channel.clone());
    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        match serde_json::from_slice::<CommandBatch>(&delivery.data) {
            Ok(batch) => {
                debug!(batch_id = %batch.batch_id, commands = batch.commands.len(), "received batch");
                if let Err(err) = dispatcher.process(&batch, &sink).await {
                    error!(batch_id = %batch.batch_id, error = %err, "batch processing aborted");
                }
            }
            Err(err) => {
                error!(error = %err, "malformed batch message, discarding");
            }
        }
        delivery.ack(BasicAckOptions::default()).await?;
    }
    Ok(())
}
