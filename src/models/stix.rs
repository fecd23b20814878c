//! STIX helpers: deterministic ids, feed timestamp parsing and bundle framing

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::{ConnectorError, Result};
use crate::models::{AuthorIdentity, ExternalReference, FeedItem, ImportObject, StixBundle};

/// Namespace the platform uses to derive STIX ids from contributing properties
const STIX_ID_NAMESPACE: Uuid = uuid::uuid!("00abedb4-aa42-466c-9c01-fed23315a9b7");

const SPEC_VERSION: &str = "2.1";

/// Layout of the date inside an RFC 822 `pubDate`, after the weekday prefix
const FEED_DATE_FORMAT: &str = "%d %b %Y %H:%M:%S";

const STIX_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000Z";

/// Parse a feed publication date (`"Mon, 05 Jun 2023 10:00:00 GMT"`) into a
/// STIX timestamp.
///
/// Only the fixed-width window `[5, 25)` is read. The zone suffix is ignored
/// and the value is taken as UTC.
pub fn parse_published(raw: &str) -> Result<String> {
    let window = raw
        .get(5..25)
        .ok_or_else(|| ConnectorError::parse(raw, "shorter than the RFC 822 date layout"))?;

    let naive = NaiveDateTime::parse_from_str(window, FEED_DATE_FORMAT)
        .map_err(|e| ConnectorError::parse(raw, e))?;

    Ok(naive.and_utc().format(STIX_TIMESTAMP_FORMAT).to_string())
}

/// Render an instant as a STIX timestamp
pub fn stix_timestamp(at: DateTime<Utc>) -> String {
    at.format(STIX_TIMESTAMP_FORMAT).to_string()
}

/// Deterministic `attack-pattern--<uuid>` id for a pattern name
pub fn attack_pattern_id(name: &str) -> String {
    deterministic_id(
        "attack-pattern",
        &json!({ "name": name.trim().to_lowercase() }),
    )
}

/// Deterministic `identity--<uuid>` id for an identity
pub fn identity_id(name: &str, identity_class: &str) -> String {
    deterministic_id(
        "identity",
        &json!({
            "identity_class": identity_class,
            "name": name.trim().to_lowercase(),
        }),
    )
}

fn deterministic_id(kind: &str, contributing: &serde_json::Value) -> String {
    // serde_json maps are key-sorted, so the rendering is canonical
    let canonical = contributing.to_string();
    format!(
        "{}--{}",
        kind,
        Uuid::new_v5(&STIX_ID_NAMESPACE, canonical.as_bytes())
    )
}

/// Turns feed items into attack patterns credited to one organization
#[derive(Debug, Clone)]
pub struct FeedTransformer {
    author_name: String,
    author_description: String,
    author_id: String,
}

impl FeedTransformer {
    pub fn new(author_name: impl Into<String>, author_description: impl Into<String>) -> Self {
        let author_name = author_name.into();
        let author_id = identity_id(&author_name, "organization");
        Self {
            author_name,
            author_description: author_description.into(),
            author_id,
        }
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// The author identity object emitted alongside the patterns
    pub fn author(&self, now: DateTime<Utc>) -> AuthorIdentity {
        let ts = stix_timestamp(now);
        AuthorIdentity {
            kind: "identity".to_string(),
            spec_version: SPEC_VERSION.to_string(),
            id: self.author_id.clone(),
            name: self.author_name.clone(),
            identity_class: "organization".to_string(),
            description: self.author_description.clone(),
            created: ts.clone(),
            modified: ts,
        }
    }

    /// Transform a single feed item
    pub fn transform(&self, item: &FeedItem) -> Result<ImportObject> {
        let created_at = parse_published(&item.published_at)?;

        Ok(ImportObject {
            kind: "attack-pattern".to_string(),
            spec_version: SPEC_VERSION.to_string(),
            generated_id: attack_pattern_id(&item.title),
            name: item.title.clone(),
            modified: created_at.clone(),
            created_at,
            created_by: self.author_id.clone(),
            description: item.description.clone(),
            external_references: vec![ExternalReference {
                source_name: item.title.clone(),
                url: item.link.clone(),
            }],
        })
    }

    /// Transform a whole snapshot. The first malformed item fails the batch.
    pub fn transform_all(&self, items: &[FeedItem]) -> Result<Vec<ImportObject>> {
        items.iter().map(|item| self.transform(item)).collect()
    }

    /// Frame the author and the patterns into a serialized STIX bundle
    pub fn bundle(&self, objects: &[ImportObject], now: DateTime<Utc>) -> Result<String> {
        let mut values = Vec::with_capacity(objects.len() + 1);
        values.push(serde_json::to_value(self.author(now))?);
        for object in objects {
            values.push(serde_json::to_value(object)?);
        }

        let bundle = StixBundle {
            kind: "bundle".to_string(),
            id: format!("bundle--{}", Uuid::new_v4()),
            objects: values,
        };

        Ok(serde_json::to_string(&bundle)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(title: &str, published_at: &str) -> FeedItem {
        FeedItem {
            title: title.to_string(),
            description: "Campaign write-up".to_string(),
            published_at: published_at.to_string(),
            link: "https://www.trendmicro.com/en_us/research/23/f/post.html".to_string(),
        }
    }

    fn transformer() -> FeedTransformer {
        FeedTransformer::new("Trend Micro", "CyberThread Data Import Connector")
    }

    #[test]
    fn parses_rfc822_pub_date() {
        assert_eq!(
            parse_published("Mon, 05 Jun 2023 10:00:00 GMT").unwrap(),
            "2023-06-05T10:00:00.000Z"
        );
    }

    #[test]
    fn rejects_short_or_garbled_dates() {
        assert!(matches!(
            parse_published("2023-06-05"),
            Err(ConnectorError::Parse { .. })
        ));
        assert!(matches!(
            parse_published("Mon, 45 Foo 2023 10:00:00 GMT"),
            Err(ConnectorError::Parse { .. })
        ));
    }

    #[test]
    fn transform_maps_every_field() {
        let t = transformer();
        let obj = t
            .transform(&item("Earth Preta Campaign", "Mon, 05 Jun 2023 10:00:00 GMT"))
            .unwrap();

        assert_eq!(obj.kind, "attack-pattern");
        assert_eq!(obj.name, "Earth Preta Campaign");
        assert_eq!(obj.created_at, "2023-06-05T10:00:00.000Z");
        assert_eq!(obj.created_by, t.author_id());
        assert_eq!(obj.description, "Campaign write-up");
        assert_eq!(
            obj.external_references,
            vec![ExternalReference {
                source_name: "Earth Preta Campaign".to_string(),
                url: "https://www.trendmicro.com/en_us/research/23/f/post.html".to_string(),
            }]
        );
        assert!(obj.generated_id.starts_with("attack-pattern--"));
    }

    #[test]
    fn reimport_produces_identical_objects() {
        let t = transformer();
        let feed = vec![
            item("A", "Mon, 05 Jun 2023 10:00:00 GMT"),
            item("B", "Tue, 06 Jun 2023 11:30:00 GMT"),
        ];
        assert_eq!(t.transform_all(&feed).unwrap(), t.transform_all(&feed).unwrap());
    }

    #[test]
    fn ids_ignore_case_and_padding() {
        assert_eq!(attack_pattern_id("Earth Preta"), attack_pattern_id("  earth preta "));
        assert_ne!(attack_pattern_id("Earth Preta"), attack_pattern_id("Earth Lusca"));
        assert_eq!(
            identity_id("Trend Micro", "organization"),
            transformer().author_id()
        );
    }

    #[test]
    fn one_bad_item_fails_the_batch() {
        let feed = vec![
            item("A", "Mon, 05 Jun 2023 10:00:00 GMT"),
            item("B", "yesterday"),
        ];
        assert!(transformer().transform_all(&feed).is_err());
    }

    #[test]
    fn bundle_leads_with_author() {
        let t = transformer();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let objects = t
            .transform_all(&[item("A", "Mon, 05 Jun 2023 10:00:00 GMT")])
            .unwrap();

        let raw = t.bundle(&objects, now).unwrap();
        let bundle: StixBundle = serde_json::from_str(&raw).unwrap();

        assert_eq!(bundle.kind, "bundle");
        assert!(bundle.id.starts_with("bundle--"));
        assert_eq!(bundle.objects.len(), 2);
        assert_eq!(bundle.objects[0]["type"], "identity");
        assert_eq!(bundle.objects[0]["name"], "Trend Micro");
        assert_eq!(bundle.objects[0]["created"], "2024-01-02T03:04:05.000Z");
        assert_eq!(bundle.objects[1]["type"], "attack-pattern");
        assert_eq!(bundle.objects[1]["created_by_ref"], t.author_id());
    }
}
