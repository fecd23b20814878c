//! Malware enrichment from sandbox tag statistics

pub mod tags;

use std::sync::Arc;

use crate::error::{ConnectorError, Result};
use crate::models::CandidateEntity;
use crate::platform::Platform;

pub use tags::TagSet;

/// Appended to enriched descriptions; its presence marks an entity as done
pub const ENRICHMENT_MARKER: &str = "This malware family has been executed on an AnyRun sandbox";

/// What the enricher did with one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    NotApplicable,
    NoMatch,
    AlreadyEnriched,
    Enriched,
}

impl EnrichmentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            EnrichmentOutcome::NotApplicable => "not_applicable",
            EnrichmentOutcome::NoMatch => "no_match",
            EnrichmentOutcome::AlreadyEnriched => "already_enriched",
            EnrichmentOutcome::Enriched => "enriched",
        }
    }
}

impl std::fmt::Display for EnrichmentOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrichmentOutcome::NotApplicable => write!(f, "Entity is not a malware"),
            EnrichmentOutcome::NoMatch => write!(f, "Malware not seen on the sandbox"),
            EnrichmentOutcome::AlreadyEnriched => write!(f, "Malware already enriched"),
            EnrichmentOutcome::Enriched => write!(f, "The malware has been enriched"),
        }
    }
}

/// Pure enrichment decision for one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentDecision {
    NotApplicable,
    NoMatch,
    AlreadyEnriched { tag: String },
    Enrich { tag: String, description: String },
}

impl EnrichmentDecision {
    pub fn outcome(&self) -> EnrichmentOutcome {
        match self {
            EnrichmentDecision::NotApplicable => EnrichmentOutcome::NotApplicable,
            EnrichmentDecision::NoMatch => EnrichmentOutcome::NoMatch,
            EnrichmentDecision::AlreadyEnriched { .. } => EnrichmentOutcome::AlreadyEnriched,
            EnrichmentDecision::Enrich { .. } => EnrichmentOutcome::Enriched,
        }
    }
}

/// Decide whether `entity` should be enriched against the current tags
pub fn decide(entity: &CandidateEntity, tags: &TagSet, marker: &str) -> EnrichmentDecision {
    if !entity.entity_type.eq_ignore_ascii_case("malware") {
        return EnrichmentDecision::NotApplicable;
    }

    let Some(tag) = tags.find_match(entity) else {
        return EnrichmentDecision::NoMatch;
    };

    if entity.description.contains(marker) {
        EnrichmentDecision::AlreadyEnriched { tag }
    } else {
        EnrichmentDecision::Enrich {
            tag,
            description: format!("{}\n\n{}", entity.description, marker),
        }
    }
}

/// Applies enrichment decisions to platform entities
pub struct MalwareEnricher {
    platform: Arc<dyn Platform>,
    marker: String,
}

impl MalwareEnricher {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            marker: ENRICHMENT_MARKER.to_string(),
        }
    }

    /// Check one entity and write at most one description update
    #[tracing::instrument(level = "debug", skip(self, tags))]
    pub async fn enrich(&self, entity_id: &str, tags: &TagSet) -> Result<EnrichmentOutcome> {
        let entity = self
            .platform
            .read_entity(entity_id)
            .await?
            .ok_or_else(|| ConnectorError::EntityNotFound(entity_id.to_string()))?;

        let decision = decide(&entity, tags, &self.marker);
        match &decision {
            EnrichmentDecision::NotApplicable => {
                tracing::debug!(entity_type = %entity.entity_type, "Not a malware, skipping");
            }
            EnrichmentDecision::NoMatch => {
                tracing::debug!(name = %entity.name, "No sandbox tag for this malware");
            }
            EnrichmentDecision::AlreadyEnriched { tag } => {
                tracing::info!(name = %entity.name, tag = %tag, "Malware already enriched");
            }
            EnrichmentDecision::Enrich { tag, description } => {
                self.platform
                    .update_field(&entity.id, "description", description)
                    .await?;
                tracing::info!(name = %entity.name, tag = %tag, "Malware enriched");
            }
        }

        let outcome = decision.outcome();
        metrics::counter!("enrichment_decisions_total", "result" => outcome.label()).increment(1);
        Ok(outcome)
    }
}
