//! Platform collaborator: entity reads and edits, bundle imports, connector
//! state and work tracking

pub mod amqp;
pub mod opencti;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConnectorError, Result};
use crate::models::CandidateEntity;

pub use amqp::AmqpBus;
pub use opencti::{OpenCti, OpenCtiClient};

/// Operations the connectors consume from the threat-intelligence platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Read a domain object, `None` when it does not exist
    async fn read_entity(&self, id: &str) -> Result<Option<CandidateEntity>>;

    /// Replace a single field of a domain object
    async fn update_field(&self, id: &str, key: &str, value: &str) -> Result<()>;

    /// Hand a serialized STIX bundle to the platform import
    async fn send_bundle(&self, bundle: &str, work_id: Option<String>) -> Result<()>;

    /// Connector state, `None` when nothing was ever stored
    async fn get_state(&self) -> Result<Option<Value>>;

    async fn set_state(&self, state: Value) -> Result<()>;

    /// Open a work item and return its id
    async fn initiate_work(&self, friendly_name: &str) -> Result<String>;

    /// Close a work item
    async fn mark_processed(&self, work_id: &str, message: &str, in_error: bool) -> Result<()>;
}

/// Request to check one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub entity_id: String,
    pub work_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListenMessage {
    #[serde(default)]
    internal: Option<ListenInternal>,
    #[serde(default)]
    event: Option<ListenEvent>,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    work_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListenInternal {
    #[serde(default)]
    work_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListenEvent {
    entity_id: String,
}

impl Notification {
    /// Decode a listen-queue message. Both the `{event, internal}` layout and
    /// the flat legacy layout are accepted.
    pub fn from_message(body: &[u8]) -> Result<Self> {
        let msg: ListenMessage = serde_json::from_slice(body)?;

        let entity_id = msg
            .event
            .map(|e| e.entity_id)
            .or(msg.entity_id)
            .ok_or_else(|| {
                ConnectorError::parse(
                    String::from_utf8_lossy(body),
                    "notification has no entity_id",
                )
            })?;
        let work_id = msg.internal.and_then(|i| i.work_id).or(msg.work_id);

        Ok(Self { entity_id, work_id })
    }
}

/// Callback invoked once per inbound notification
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Returns the message recorded against the notification's work item
    async fn handle(&self, notification: Notification) -> Result<String>;
}

/// Inbound queue of entity notifications. The source owns the consume loop.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn listen(&self, handler: Arc<dyn NotificationHandler>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_current_layout() {
        let n = Notification::from_message(
            br#"{"internal":{"work_id":"work-1","applicant_id":"u"},"event":{"entity_id":"malware--1"}}"#,
        )
        .unwrap();
        assert_eq!(
            n,
            Notification {
                entity_id: "malware--1".to_string(),
                work_id: Some("work-1".to_string()),
            }
        );
    }

    #[test]
    fn decodes_legacy_layout() {
        let n = Notification::from_message(br#"{"entity_id":"malware--2","work_id":"w"}"#).unwrap();
        assert_eq!(n.entity_id, "malware--2");
        assert_eq!(n.work_id.as_deref(), Some("w"));
    }

    #[test]
    fn missing_entity_is_a_parse_error() {
        assert!(matches!(
            Notification::from_message(br#"{"work_id":"w"}"#),
            Err(ConnectorError::Parse { .. })
        ));
        assert!(matches!(
            Notification::from_message(b"not json"),
            Err(ConnectorError::Serialization(_))
        ));
    }
}
