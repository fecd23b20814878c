//! ANY.RUN live tag stream
//!
//! The sandbox publishes its statistics over DDP on a websocket. After the
//! DDP handshake the stream subscribes to the configured publications and
//! forwards every JSON object it receives.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use crate::collectors::TagEventSource;
use crate::error::{ConnectorError, Result};

/// Collection carrying the daily malware tag statistics
pub const TAG_COLLECTION: &str = "statistics.day.tags";

pub struct AnyRunStream {
    url: Url,
    subscriptions: Vec<String>,
    reconnect_delay: Duration,
}

impl AnyRunStream {
    pub fn new(url: Url, subscriptions: Vec<String>, reconnect_delay: Duration) -> Self {
        Self {
            url,
            subscriptions,
            reconnect_delay,
        }
    }

    /// One websocket session, from handshake until the server closes it
    async fn session(&self, on_message: &(dyn Fn(Value) + Send + Sync)) -> Result<()> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectorError::transport("ANY.RUN websocket connect", e))?;
        let (mut write, mut read) = socket.split();

        let mut outbound = vec![ddp_connect()];
        outbound.extend(self.subscriptions.iter().map(|name| ddp_subscribe(name)));
        for frame in outbound {
            write
                .send(Message::Text(frame.to_string()))
                .await
                .map_err(|e| ConnectorError::transport("ANY.RUN websocket send", e))?;
        }

        tracing::info!(url = %self.url, subscriptions = ?self.subscriptions, "ANY.RUN stream connected");

        while let Some(frame) = read.next().await {
            let frame = frame.map_err(|e| ConnectorError::transport("ANY.RUN websocket read", e))?;
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping non-JSON frame");
                    continue;
                }
            };

            if let Some(pong) = ddp_pong(&value) {
                write
                    .send(Message::Text(pong.to_string()))
                    .await
                    .map_err(|e| ConnectorError::transport("ANY.RUN websocket send", e))?;
                continue;
            }

            if value.is_object() {
                on_message(value);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TagEventSource for AnyRunStream {
    async fn run_forever(&self, on_message: &(dyn Fn(Value) + Send + Sync)) -> Result<()> {
        loop {
            match self.session(on_message).await {
                Ok(()) => tracing::warn!("ANY.RUN stream closed by server"),
                Err(e) => tracing::error!(error = %e, "ANY.RUN stream failed"),
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

fn ddp_connect() -> Value {
    json!({ "msg": "connect", "version": "1", "support": ["1", "pre2", "pre1"] })
}

fn ddp_subscribe(name: &str) -> Value {
    json!({ "msg": "sub", "id": Uuid::new_v4().to_string(), "name": name, "params": [] })
}

/// Reply to a DDP heartbeat, echoing its id when present
fn ddp_pong(value: &Value) -> Option<Value> {
    if value.get("msg").and_then(Value::as_str) != Some("ping") {
        return None;
    }
    let mut pong = json!({ "msg": "pong" });
    if let Some(id) = value.get("id") {
        pong["id"] = id.clone();
    }
    Some(pong)
}
