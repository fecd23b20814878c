//! Watermark-gated feed import loop.
//!
//! Every poll period the runner reads the watermark and decides whether the
//! feed is due. A due run fetches the snapshot, transforms it, imports the
//! bundle and only then commits `last_run`. A failed run commits nothing, so
//! the next tick retries the same window.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;

use crate::collectors::FeedCollector;
use crate::error::Result;
use crate::models::stix::FeedTransformer;
use crate::models::{RunOutcome, Watermark};
use crate::platform::Platform;
use crate::storage::StateStore;

/// Runs that start up to this much before the interval elapses still count
/// as on schedule
pub fn schedule_slack() -> Duration {
    Duration::days(1)
}

/// Scheduling parameters of a feed connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSchedule {
    /// Time between two imports
    pub interval: Duration,
    /// How often the watermark is checked
    pub poll_period: std::time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Idle { next_eligible_at: DateTime<Utc> },
}

/// Decide whether a run is due at `now`
pub fn eligibility(watermark: &Watermark, now: DateTime<Utc>, interval: Duration) -> Eligibility {
    match watermark.last_run {
        None => Eligibility::Eligible,
        Some(last_run) if now - last_run > interval - schedule_slack() => Eligibility::Eligible,
        Some(last_run) => Eligibility::Idle {
            next_eligible_at: last_run + interval,
        },
    }
}

fn days(delta: Duration) -> f64 {
    (delta.num_seconds() as f64 / 86_400.0 * 100.0).round() / 100.0
}

pub struct FeedImportRunner {
    label: String,
    platform: Arc<dyn Platform>,
    state: Arc<dyn StateStore>,
    collector: Arc<dyn FeedCollector>,
    transformer: FeedTransformer,
    schedule: FeedSchedule,
}

impl FeedImportRunner {
    pub fn new(
        label: impl Into<String>,
        platform: Arc<dyn Platform>,
        state: Arc<dyn StateStore>,
        collector: Arc<dyn FeedCollector>,
        transformer: FeedTransformer,
        schedule: FeedSchedule,
    ) -> Self {
        Self {
            label: label.into(),
            platform,
            state,
            collector,
            transformer,
            schedule,
        }
    }

    /// Tick until `shutdown` resolves. A failed tick never ends the loop.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(connector = %self.label, "Fetching {} datasets...", self.label);

        let mut ticker = tokio::time::interval(self.schedule.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(connector = %self.label, "Connector stop");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.tick(Utc::now()).await;
                    tracing::debug!(
                        ran = outcome.ran,
                        next_eligible_at = %outcome.next_eligible_at,
                        error = ?outcome.error,
                        "Tick finished"
                    );
                }
            }
        }
    }

    /// One scheduling decision, and the run it triggers if any
    pub async fn tick(&self, now: DateTime<Utc>) -> RunOutcome {
        let watermark = match self.state.get().await {
            Ok(watermark) => watermark,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read connector state");
                return RunOutcome {
                    ran: false,
                    timestamp: now,
                    next_eligible_at: now,
                    error: Some(e.to_string()),
                };
            }
        };

        match watermark.last_run {
            Some(last_run) => tracing::info!(
                "Connector last run: {}",
                last_run.format("%Y-%m-%d %H:%M:%S")
            ),
            None => tracing::info!("Connector has never run"),
        }

        match eligibility(&watermark, now, self.schedule.interval) {
            Eligibility::Idle { next_eligible_at } => {
                tracing::info!(
                    "Connector will not run, next run in: {} days",
                    days(next_eligible_at - now)
                );
                RunOutcome {
                    ran: false,
                    timestamp: now,
                    next_eligible_at,
                    error: None,
                }
            }
            Eligibility::Eligible => {
                tracing::info!("Connector will run!");
                self.run(now).await
            }
        }
    }

    async fn run(&self, now: DateTime<Utc>) -> RunOutcome {
        let friendly_name = format!("{} run @ {}", self.label, now.format("%Y-%m-%d %H:%M:%S"));

        let result = match self.platform.initiate_work(&friendly_name).await {
            Ok(work_id) => {
                let result = self.import_and_commit(now, &work_id).await;
                self.close_work(&work_id, &result, now).await;
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(count) => {
                metrics::counter!("connector_runs_total", "connector" => self.collector.name(), "outcome" => "committed")
                    .increment(1);
                metrics::counter!("connector_bundle_objects_total", "connector" => self.collector.name())
                    .increment(count as u64);
                tracing::info!(
                    "Last_run stored, next run in: {} days",
                    days(self.schedule.interval)
                );
                RunOutcome {
                    ran: true,
                    timestamp: now,
                    next_eligible_at: now + self.schedule.interval,
                    error: None,
                }
            }
            Err(e) => {
                metrics::counter!("connector_runs_total", "connector" => self.collector.name(), "outcome" => "failed")
                    .increment(1);
                tracing::error!(error = %e, "Connector run failed, last_run left unchanged");
                RunOutcome {
                    ran: true,
                    timestamp: now,
                    next_eligible_at: now,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn import_and_commit(&self, now: DateTime<Utc>, work_id: &str) -> Result<usize> {
        let items = self.collector.fetch().await?;
        let objects = self.transformer.transform_all(&items)?;
        let bundle = self.transformer.bundle(&objects, now)?;

        tracing::info!(objects = objects.len(), "Sending data to OpenCTI...");
        self.platform
            .send_bundle(&bundle, Some(work_id.to_string()))
            .await?;

        self.state.set(Watermark::at(now)).await?;
        Ok(objects.len())
    }

    async fn close_work(&self, work_id: &str, result: &Result<usize>, now: DateTime<Utc>) {
        let (message, in_error) = match result {
            Ok(_) => (
                format!(
                    "Connector successfully run, storing last_run as {}",
                    now.timestamp()
                ),
                false,
            ),
            Err(e) => (e.to_string(), true),
        };

        tracing::info!(work_id = %work_id, in_error, "{}", message);
        if let Err(e) = self.platform.mark_processed(work_id, &message, in_error).await {
            tracing::warn!(work_id = %work_id, error = %e, "Failed to close work item");
        }
    }
}
