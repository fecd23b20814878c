//! Core data models for the connector runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub mod stix;

/// Persisted marker of the last successful run.
///
/// Stored as `{"last_run": <unix seconds>}`; an empty or missing record means
/// the connector has never run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_run: Option<DateTime<Utc>>,
}

impl Watermark {
    pub fn at(last_run: DateTime<Utc>) -> Self {
        Self {
            last_run: Some(last_run),
        }
    }
}

/// Platform entity considered for enrichment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateEntity {
    pub id: String,
    pub entity_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub malware_types: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

/// One entry pulled from a feed snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub description: String,
    pub published_at: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalReference {
    pub source_name: String,
    pub url: String,
}

/// Platform-ready attack pattern, serialized in STIX 2.1 form
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub spec_version: String,
    #[serde(rename = "id")]
    pub generated_id: String,
    pub name: String,
    #[serde(rename = "created")]
    pub created_at: String,
    pub modified: String,
    #[serde(rename = "created_by_ref")]
    pub created_by: String,
    pub description: String,
    pub external_references: Vec<ExternalReference>,
}

/// Organization credited as the author of imported objects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorIdentity {
    #[serde(rename = "type")]
    pub kind: String,
    pub spec_version: String,
    pub id: String,
    pub name: String,
    pub identity_class: String,
    pub description: String,
    pub created: String,
    pub modified: String,
}

/// Serialized unit handed to the platform import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StixBundle {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub objects: Vec<serde_json::Value>,
}

/// Result of one scheduling tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub ran: bool,
    pub timestamp: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn committed(&self) -> bool {
        self.ran && self.error.is_none()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn watermark_reads_legacy_unix_seconds() {
        let wm: Watermark = serde_json::from_value(json!({ "last_run": 1685959200 })).unwrap();
        assert_eq!(
            wm.last_run,
            Some(Utc.with_ymd_and_hms(2023, 6, 5, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn empty_state_is_never_run() {
        let wm: Watermark = serde_json::from_value(json!({})).unwrap();
        assert_eq!(wm, Watermark::default());
        assert!(wm.last_run.is_none());
    }

    #[test]
    fn watermark_writes_unix_seconds() {
        let wm = Watermark::at(Utc.with_ymd_and_hms(2023, 6, 5, 10, 0, 0).unwrap());
        assert_eq!(serde_json::to_value(wm).unwrap(), json!({ "last_run": 1685959200 }));
    }

    #[test]
    fn candidate_entity_tolerates_nulls() {
        let entity: CandidateEntity = serde_json::from_value(json!({
            "id": "malware--1",
            "entity_type": "Malware",
            "name": "Emotet",
            "malware_types": null,
            "description": null,
        }))
        .unwrap();
        assert!(entity.malware_types.is_empty());
        assert_eq!(entity.description, "");
    }
}
