//! OpenCTI ingestion connectors
//!
//! Two connectors share one runtime shape: a source reader, a transform or
//! match engine, a run controller and a watermark store.
//!
//! - `trend-micro` imports the Trend Micro research feed on a watermark-gated
//!   schedule.
//! - `anyrun` enriches platform malware entities whose names show up in the
//!   ANY.RUN sandbox tag stream.

pub mod collectors;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod models;
pub mod platform;
pub mod runner;
pub mod storage;

pub use error::{ConnectorError, Result};
