//! Run controllers deciding when ingestion and enrichment work executes

pub mod polling;
pub mod streaming;

pub use polling::{FeedImportRunner, FeedSchedule};
pub use streaming::EnrichmentRunner;
