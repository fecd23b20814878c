//! Source readers: feed snapshots and live tag streams

pub mod anyrun;
pub mod trend_micro;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::FeedItem;

/// Trait for point-in-time feed collectors
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedCollector: Send + Sync {
    /// Feed name
    fn name(&self) -> &'static str;

    /// Fetch the full feed snapshot, in feed order
    async fn fetch(&self) -> Result<Vec<FeedItem>>;
}

/// Trait for continuous event sources.
///
/// `run_forever` hands every decoded message to `on_message` and only returns
/// when the source gives up for good. Reconnecting is the source's job.
#[async_trait]
pub trait TagEventSource: Send + Sync {
    async fn run_forever(&self, on_message: &(dyn Fn(Value) + Send + Sync)) -> Result<()>;
}
