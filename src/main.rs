//! cti-connectors
//!
//! Runs one OpenCTI connector per process, selected by subcommand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use cti_connectors::collectors::anyrun::AnyRunStream;
use cti_connectors::collectors::trend_micro::TrendMicroCollector;
use cti_connectors::config::{
    AnyRunArgs, Args, ConnectorCommand, FatalExitPolicy, TrendMicroArgs, parse_failure_policy,
};
use cti_connectors::models::stix::FeedTransformer;
use cti_connectors::platform::opencti::{ConnectorRegistration, ConnectorType};
use cti_connectors::platform::{AmqpBus, OpenCti, OpenCtiClient, Platform};
use cti_connectors::runner::{EnrichmentRunner, FeedImportRunner};
use cti_connectors::storage::{FileStateStore, PlatformStateStore, StateStore};

#[tokio::main]
async fn main() {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => match parse_failure_policy(&e, FatalExitPolicy::from_env()) {
            None => e.exit(),
            Some(policy) => {
                init_tracing(false);
                tracing::error!("Connector failed: Invalid command line: {}", e);
                tokio::time::sleep(policy.delay).await;
                std::process::exit(policy.exit_code);
            }
        },
    };
    init_tracing(args.log_json);

    let policy = args.fatal_exit_policy();
    if let Err(e) = run(args).await {
        tracing::error!("Connector failed: {:#}", e);
        tokio::time::sleep(policy.delay).await;
        std::process::exit(policy.exit_code);
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cti_connectors=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(args: Args) -> Result<()> {
    args.validate_all().context("Invalid configuration")?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start metrics exporter")?;
        tracing::info!("Metrics on http://{}/metrics", addr);
    }

    let base_url = Url::parse(&args.opencti_url).context("Invalid OpenCTI URL")?;
    let api = OpenCtiClient::new(&base_url, &args.opencti_token, &args.connector_id)?;

    match &args.connector {
        ConnectorCommand::TrendMicro(feed) => run_trend_micro(&args, feed, api).await,
        ConnectorCommand::Anyrun(stream) => run_anyrun(&args, stream, api).await,
    }
}

async fn register(
    args: &Args,
    api: &OpenCtiClient,
    name: &str,
    connector_type: ConnectorType,
    scope: &[&str],
) -> Result<Arc<AmqpBus>> {
    let registration = ConnectorRegistration {
        id: args.connector_id.clone(),
        name: name.to_string(),
        connector_type,
        scope: args.scope_or(scope),
        auto: args.connector_auto,
        only_contextual: false,
    };

    let config = api
        .register_connector(&registration)
        .await
        .context("Failed to register connector")?;
    tracing::info!(connector_id = %args.connector_id, name, "Connector registered");

    let bus = AmqpBus::connect(&config, &args.connector_id)
        .await
        .context("Failed to connect to the platform broker")?;
    Ok(Arc::new(bus))
}

async fn run_trend_micro(args: &Args, feed: &TrendMicroArgs, api: OpenCtiClient) -> Result<()> {
    let name = args.connector_name.as_deref().unwrap_or("Trend Micro");
    let bus = register(args, &api, name, ConnectorType::ExternalImport, &["attack-pattern"]).await?;
    let platform: Arc<dyn Platform> = Arc::new(OpenCti::new(api, bus));

    let state: Arc<dyn StateStore> = match &feed.state_file {
        Some(path) => {
            tracing::info!(path = %path.display(), "Keeping watermark in local file");
            Arc::new(FileStateStore::new(path))
        }
        None => Arc::new(PlatformStateStore::new(platform.clone())),
    };

    let feed_url = Url::parse(&feed.trendmicro_url).context("Invalid Trend Micro URL")?;
    let collector = Arc::new(TrendMicroCollector::new(feed_url)?);
    let transformer = FeedTransformer::new("Trend Micro", "CyberThread Data Import Connector");

    let runner = FeedImportRunner::new(
        "Trend_Micro",
        platform,
        state,
        collector,
        transformer,
        feed.schedule(),
    );
    runner.run_until(shutdown_signal()).await;
    Ok(())
}

async fn run_anyrun(args: &Args, stream: &AnyRunArgs, api: OpenCtiClient) -> Result<()> {
    let name = args.connector_name.as_deref().unwrap_or("AnyRun");
    let bus = register(args, &api, name, ConnectorType::InternalEnrichment, &["malware"]).await?;
    let platform: Arc<dyn Platform> = Arc::new(OpenCti::new(api, bus.clone()));

    let ws_url = Url::parse(&stream.anyrun_ws_url).context("Invalid ANY.RUN websocket URL")?;
    let source = Arc::new(AnyRunStream::new(
        ws_url,
        stream.anyrun_subscriptions.clone(),
        Duration::from_secs(stream.anyrun_reconnect_secs),
    ));

    let runner = EnrichmentRunner::new(platform);
    tokio::select! {
        result = runner.run(source, bus) => {
            result.context("Notification listener stopped")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Connector stop");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
