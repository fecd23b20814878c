//! Reference set of sandbox tag names

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::watch;

use crate::collectors::anyrun::TAG_COLLECTION;
use crate::models::CandidateEntity;

/// Append-only set of lower-cased tag names.
///
/// Clones share the same set. A single writer (the stream task) inserts while
/// any number of readers match against it. The readiness signal flips once,
/// when the first tag lands.
#[derive(Clone)]
pub struct TagSet {
    inner: Arc<Inner>,
}

struct Inner {
    tags: RwLock<HashSet<String>>,
    ready: watch::Sender<bool>,
}

fn normalize(tag: &str) -> String {
    tag.trim().to_lowercase()
}

impl TagSet {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tags: RwLock::new(HashSet::new()),
                ready,
            }),
        }
    }

    /// Insert a tag, returns whether it was new
    pub fn insert(&self, tag: &str) -> bool {
        let tag = normalize(tag);
        if tag.is_empty() {
            return false;
        }

        let inserted = self
            .inner
            .tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag);

        if inserted {
            self.inner.ready.send_if_modified(|ready| {
                let opened = !*ready;
                *ready = true;
                opened
            });
        }
        inserted
    }

    /// Feed one stream message. Only tag statistics carrying a string
    /// `fields.tag` are kept; the accepted tag is returned.
    pub fn observe(&self, message: &Value) -> Option<String> {
        if message.get("collection").and_then(Value::as_str) != Some(TAG_COLLECTION) {
            return None;
        }
        let tag = normalize(message.get("fields")?.get("tag")?.as_str()?);
        if tag.is_empty() {
            return None;
        }
        self.insert(&tag);
        Some(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.inner
            .tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&normalize(tag))
    }

    pub fn len(&self) -> usize {
        self.inner
            .tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First tag equal to the entity name or to one of its malware types,
    /// ignoring case. Entity values are compared as stored, untrimmed.
    pub fn find_match(&self, entity: &CandidateEntity) -> Option<String> {
        let tags = self.inner.tags.read().unwrap_or_else(PoisonError::into_inner);

        std::iter::once(&entity.name)
            .chain(entity.malware_types.iter())
            .map(|candidate| candidate.to_lowercase())
            .find(|candidate| tags.contains(candidate))
    }

    /// Resolves once the set holds at least one tag. Never times out.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for TagSet {
    fn default() -> Self {
        Self::new()
    }
}
