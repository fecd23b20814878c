//! Streaming enrichment: tag stream plus gated notification dispatch.
//!
//! The tag catalogue and the entities to check arrive from two independently
//! paced sources. Dispatch stays closed until the first tag has landed, so no
//! entity is ever matched against an empty set.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::collectors::TagEventSource;
use crate::enrichment::{MalwareEnricher, TagSet};
use crate::error::Result;
use crate::platform::{Notification, NotificationHandler, NotificationSource, Platform};

pub struct EnrichmentRunner {
    platform: Arc<dyn Platform>,
    enricher: Arc<MalwareEnricher>,
    tags: TagSet,
}

impl EnrichmentRunner {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            enricher: Arc::new(MalwareEnricher::new(platform.clone())),
            platform,
            tags: TagSet::new(),
        }
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Spawn the stream activity, the only writer of the tag set
    pub fn spawn_stream(&self, source: Arc<dyn TagEventSource>) -> JoinHandle<()> {
        let tags = self.tags.clone();

        tokio::spawn(async move {
            let on_message = move |message: Value| {
                if let Some(tag) = tags.observe(&message) {
                    metrics::counter!("tags_observed_total").increment(1);
                    tracing::debug!(tag = %tag, known = tags.len(), "Sandbox tag received");
                }
            };

            match source.run_forever(&on_message).await {
                Ok(()) => tracing::warn!("Tag stream ended"),
                Err(e) => tracing::error!(error = %e, "Tag stream stopped"),
            }
        })
    }

    /// Wait for the tag set to open, then hand notifications to the enricher
    pub async fn dispatch(&self, notifications: Arc<dyn NotificationSource>) -> Result<()> {
        tracing::info!("Waiting for the first sandbox tag before listening");
        self.tags.ready().await;
        tracing::info!(tags = self.tags.len(), "Tag set ready, listening for entities");

        let handler = Arc::new(DispatchHandler {
            platform: self.platform.clone(),
            enricher: self.enricher.clone(),
            tags: self.tags.clone(),
        });
        notifications.listen(handler).await
    }

    /// Run both activities until the notification source closes
    pub async fn run(
        &self,
        source: Arc<dyn TagEventSource>,
        notifications: Arc<dyn NotificationSource>,
    ) -> Result<()> {
        let stream = self.spawn_stream(source);
        let result = self.dispatch(notifications).await;
        stream.abort();
        result
    }
}

struct DispatchHandler {
    platform: Arc<dyn Platform>,
    enricher: Arc<MalwareEnricher>,
    tags: TagSet,
}

#[async_trait]
impl NotificationHandler for DispatchHandler {
    async fn handle(&self, notification: Notification) -> Result<String> {
        tracing::info!(entity_id = %notification.entity_id, "Stix Domain Object detected, checking it");

        let result = self
            .enricher
            .enrich(&notification.entity_id, &self.tags)
            .await
            .map(|outcome| outcome.to_string());

        let (message, in_error) = match &result {
            Ok(message) => (message.clone(), false),
            Err(e) => {
                tracing::error!(entity_id = %notification.entity_id, error = %e, "Enrichment failed");
                (e.to_string(), true)
            }
        };

        if let Some(work_id) = &notification.work_id {
            if let Err(e) = self.platform.mark_processed(work_id, &message, in_error).await {
                tracing::warn!(work_id = %work_id, error = %e, "Failed to close work item");
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::anyrun::TAG_COLLECTION;
    use crate::enrichment::ENRICHMENT_MARKER;
    use crate::models::CandidateEntity;
    use crate::platform::MockPlatform;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Notification source replaying a fixed list
    struct ScriptedQueue {
        listens: AtomicUsize,
        notifications: Vec<Notification>,
        results: Mutex<Vec<std::result::Result<String, String>>>,
    }

    impl ScriptedQueue {
        fn new(notifications: Vec<Notification>) -> Arc<Self> {
            Arc::new(Self {
                listens: AtomicUsize::new(0),
                notifications,
                results: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl NotificationSource for ScriptedQueue {
        async fn listen(&self, handler: Arc<dyn NotificationHandler>) -> Result<()> {
            self.listens.fetch_add(1, Ordering::SeqCst);
            for n in &self.notifications {
                let result = handler.handle(n.clone()).await.map_err(|e| e.to_string());
                self.results.lock().unwrap().push(result);
            }
            Ok(())
        }
    }

    /// Tag source emitting a fixed list then idling
    struct ScriptedStream(Vec<Value>);

    #[async_trait]
    impl TagEventSource for ScriptedStream {
        async fn run_forever(&self, on_message: &(dyn Fn(Value) + Send + Sync)) -> Result<()> {
            for message in &self.0 {
                on_message(message.clone());
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn notification(entity_id: &str, work_id: Option<&str>) -> Notification {
        Notification {
            entity_id: entity_id.to_string(),
            work_id: work_id.map(str::to_string),
        }
    }

    fn emotet(description: &str) -> CandidateEntity {
        CandidateEntity {
            id: "malware--1".to_string(),
            entity_type: "Malware".to_string(),
            name: "Emotet".to_string(),
            malware_types: vec![],
            description: description.to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_stays_closed_while_tag_set_is_empty() {
        let mut platform = MockPlatform::new();
        platform.expect_read_entity().never();
        let runner = EnrichmentRunner::new(Arc::new(platform));
        let queue = ScriptedQueue::new(vec![notification("malware--1", None)]);

        let gated = tokio::time::timeout(Duration::from_millis(50), runner.dispatch(queue.clone())).await;

        assert!(gated.is_err());
        assert_eq!(queue.listens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_stream_tag_opens_dispatch() {
        let mut platform = MockPlatform::new();
        platform
            .expect_read_entity()
            .times(1)
            .returning(|_| Ok(Some(emotet("x"))));
        platform
            .expect_update_field()
            .withf(|_, key, value| key == "description" && value == format!("x\n\n{}", ENRICHMENT_MARKER))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let runner = EnrichmentRunner::new(Arc::new(platform));
        let stream = Arc::new(ScriptedStream(vec![
            json!({ "msg": "ready", "subs": ["1"] }),
            json!({ "msg": "added", "collection": TAG_COLLECTION, "fields": { "tag": "Emotet" } }),
        ]));
        let queue = ScriptedQueue::new(vec![notification("malware--1", None)]);

        tokio::time::timeout(Duration::from_secs(1), runner.run(stream, queue.clone()))
            .await
            .expect("dispatch should open")
            .unwrap();

        assert!(runner.tags().contains("emotet"));
        assert_eq!(queue.listens.load(Ordering::SeqCst), 1);
        assert_eq!(
            *queue.results.lock().unwrap(),
            vec![Ok("The malware has been enriched".to_string())]
        );
    }

    #[tokio::test]
    async fn outcome_closes_work_item() {
        let mut platform = MockPlatform::new();
        let enriched = format!("x\n\n{}", ENRICHMENT_MARKER);
        platform
            .expect_read_entity()
            .returning(move |_| Ok(Some(emotet(&enriched))));
        platform
            .expect_mark_processed()
            .withf(|work_id, message, in_error| {
                work_id == "work-1" && message == "Malware already enriched" && !*in_error
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let runner = EnrichmentRunner::new(Arc::new(platform));
        runner.tags().insert("emotet");
        let queue = ScriptedQueue::new(vec![notification("malware--1", Some("work-1"))]);

        runner.dispatch(queue.clone()).await.unwrap();
        assert_eq!(
            *queue.results.lock().unwrap(),
            vec![Ok("Malware already enriched".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_entity_closes_work_in_error_and_keeps_listening() {
        let mut platform = MockPlatform::new();
        platform.expect_read_entity().times(2).returning(|id| {
            if id == "malware--404" {
                Ok(None)
            } else {
                Ok(Some(emotet("x")))
            }
        });
        platform.expect_update_field().times(1).returning(|_, _, _| Ok(()));
        platform
            .expect_mark_processed()
            .withf(|work_id, _, in_error| work_id == "w-404" && *in_error)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let runner = EnrichmentRunner::new(Arc::new(platform));
        runner.tags().insert("emotet");
        let queue = ScriptedQueue::new(vec![
            notification("malware--404", Some("w-404")),
            notification("malware--1", None),
        ]);

        runner.dispatch(queue.clone()).await.unwrap();

        let results = queue.results.lock().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().unwrap_err().contains("entity not found"));
        assert!(results[1].is_ok());
    }
}
