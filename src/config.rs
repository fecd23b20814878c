//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Args as ClapArgs, Parser, Subcommand};
use validator::{Validate, ValidationErrors};

use crate::collectors::anyrun::TAG_COLLECTION;
use crate::runner::FeedSchedule;

pub const DEFAULT_EXIT_CODE_ON_FATAL: i32 = 0;
pub const DEFAULT_FATAL_EXIT_DELAY_SECS: u64 = 10;

/// OpenCTI ingestion connectors
#[derive(Parser, Debug, Validate)]
#[command(name = "cti-connectors")]
#[command(about = "Import threat feeds into OpenCTI and enrich its malware records")]
pub struct Args {
    /// OpenCTI platform URL
    #[arg(long, env = "OPENCTI_URL")]
    #[validate(url)]
    pub opencti_url: String,

    /// OpenCTI API token
    #[arg(long, env = "OPENCTI_TOKEN", hide_env_values = true)]
    #[validate(length(min = 1))]
    pub opencti_token: String,

    /// Connector instance id (UUID registered on the platform)
    #[arg(long, env = "CONNECTOR_ID")]
    #[validate(length(min = 1))]
    pub connector_id: String,

    /// Display name, defaults to the connector's own
    #[arg(long, env = "CONNECTOR_NAME")]
    pub connector_name: Option<String>,

    /// Entity types the connector declares, comma separated
    #[arg(long, env = "CONNECTOR_SCOPE", value_delimiter = ',')]
    pub connector_scope: Option<Vec<String>>,

    /// Let the platform trigger the connector on every new entity
    #[arg(long, env = "CONNECTOR_AUTO", default_value = "false")]
    pub connector_auto: bool,

    /// Exit status used after an unrecoverable error
    #[arg(long, env = "EXIT_CODE_ON_FATAL", default_value_t = DEFAULT_EXIT_CODE_ON_FATAL)]
    pub exit_code_on_fatal: i32,

    /// Pause before exiting after an unrecoverable error
    #[arg(long, env = "FATAL_EXIT_DELAY_SECS", default_value_t = DEFAULT_FATAL_EXIT_DELAY_SECS)]
    pub fatal_exit_delay_secs: u64,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    #[command(subcommand)]
    pub connector: ConnectorCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConnectorCommand {
    /// Periodically import the Trend Micro research feed
    TrendMicro(TrendMicroArgs),
    /// Enrich malware entities seen on the ANY.RUN sandbox
    Anyrun(AnyRunArgs),
}

#[derive(ClapArgs, Debug, Validate)]
pub struct TrendMicroArgs {
    /// RSS feed URL
    #[arg(long, env = "TRENDMICRO_URL")]
    #[validate(url)]
    pub trendmicro_url: String,

    /// Days between two imports
    #[arg(long, env = "TRENDMICRO_TIME_INTERVAL", default_value = "7")]
    #[validate(range(min = 1))]
    pub time_interval: u32,

    /// Seconds between two watermark checks
    #[arg(long, env = "POLL_PERIOD_SECS", default_value = "60")]
    #[validate(range(min = 1))]
    pub poll_period_secs: u64,

    /// Keep the watermark in a local file instead of the platform
    #[arg(long, env = "STATE_FILE")]
    pub state_file: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Validate)]
pub struct AnyRunArgs {
    /// Sandbox DDP websocket endpoint
    #[arg(long, env = "ANYRUN_WS_URL", default_value = "wss://app.any.run/websocket")]
    #[validate(url)]
    pub anyrun_ws_url: String,

    /// Publications to subscribe to, comma separated
    #[arg(long, env = "ANYRUN_SUBSCRIPTIONS", value_delimiter = ',', default_value = TAG_COLLECTION)]
    #[validate(length(min = 1))]
    pub anyrun_subscriptions: Vec<String>,

    /// Seconds to wait before reconnecting a dropped stream
    #[arg(long, env = "ANYRUN_RECONNECT_SECS", default_value = "10")]
    #[validate(range(min = 1))]
    pub anyrun_reconnect_secs: u64,
}

/// What the process does when a top-level error escapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalExitPolicy {
    pub exit_code: i32,
    pub delay: Duration,
}

impl FatalExitPolicy {
    /// Policy read straight from the environment, for failures raised before
    /// the command line is parsed. Unset or unreadable values use the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let exit_code = lookup("EXIT_CODE_ON_FATAL")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_EXIT_CODE_ON_FATAL);
        let delay_secs = lookup("FATAL_EXIT_DELAY_SECS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_FATAL_EXIT_DELAY_SECS);

        FatalExitPolicy {
            exit_code,
            delay: Duration::from_secs(delay_secs),
        }
    }
}

/// How to exit when clap rejects the command line.
///
/// Help and version requests return `None` and exit the way clap does. Any
/// other rejection is a configuration error and falls under `policy`.
pub fn parse_failure_policy(error: &clap::Error, policy: FatalExitPolicy) -> Option<FatalExitPolicy> {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => None,
        _ => Some(policy),
    }
}

impl Args {
    /// Validate the global options and the selected connector's options
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;
        match &self.connector {
            ConnectorCommand::TrendMicro(feed) => feed.validate(),
            ConnectorCommand::Anyrun(stream) => stream.validate(),
        }
    }

    pub fn fatal_exit_policy(&self) -> FatalExitPolicy {
        FatalExitPolicy {
            exit_code: self.exit_code_on_fatal,
            delay: Duration::from_secs(self.fatal_exit_delay_secs),
        }
    }

    pub fn scope_or(&self, default: &[&str]) -> Vec<String> {
        match &self.connector_scope {
            Some(scope) if !scope.is_empty() => scope.clone(),
            _ => default.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TrendMicroArgs {
    pub fn schedule(&self) -> FeedSchedule {
        FeedSchedule {
            interval: chrono::Duration::days(i64::from(self.time_interval)),
            poll_period: Duration::from_secs(self.poll_period_secs),
        }
    }
}
