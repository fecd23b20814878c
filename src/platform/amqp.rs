//! Platform broker transport.
//!
//! Publishes bundles to the connector's push exchange and consumes entity
//! notifications from its listen queue.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::Serialize;
use tracing::instrument;

use crate::error::{ConnectorError, Result};
use crate::platform::opencti::ConnectorConfig;
use crate::platform::{Notification, NotificationHandler, NotificationSource};

/// Message placed on the push queue for the platform workers
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub applicant_id: Option<String>,
    pub action_sequence: u32,
    pub entities_types: Vec<String>,
    /// Base64 encoded bundle
    pub content: String,
    pub update: bool,
    pub work_id: Option<String>,
}

pub struct AmqpBus {
    _connection: Connection,
    channel: Channel,
    push_exchange: String,
    push_routing: String,
    listen_queue: String,
    consumer_tag: String,
}

impl AmqpBus {
    pub async fn connect(config: &ConnectorConfig, consumer_tag: impl Into<String>) -> Result<Self> {
        let connection = Connection::connect(&config.connection.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| ConnectorError::transport("amqp connect", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConnectorError::transport("amqp channel", e))?;

        Ok(Self {
            _connection: connection,
            channel,
            push_exchange: config.push_exchange.clone(),
            push_routing: config.push_routing.clone(),
            listen_queue: config.listen.clone(),
            consumer_tag: consumer_tag.into(),
        })
    }

    #[instrument(level = "debug", skip(self, message))]
    pub async fn publish(&self, message: &PushMessage) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into());

        self.channel
            .basic_publish(
                &self.push_exchange,
                &self.push_routing,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| ConnectorError::transport("amqp publish", e))?
            .await
            .map_err(|e| ConnectorError::transport("amqp publish confirm", e))?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSource for AmqpBus {
    async fn listen(&self, handler: Arc<dyn NotificationHandler>) -> Result<()> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.listen_queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConnectorError::transport("amqp consume", e))?;

        tracing::info!(queue = %self.listen_queue, "Listening for notifications");

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(|e| ConnectorError::transport("amqp delivery", e))?;

            match Notification::from_message(&delivery.data) {
                Ok(notification) => {
                    // Handler failures are reported through the work item
                    let _ = handler.handle(notification).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Dropping undecodable notification");
                }
            }

            delivery
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| ConnectorError::transport("amqp ack", e))?;
        }

        Ok(())
    }
}
