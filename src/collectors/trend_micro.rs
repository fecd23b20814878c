//! Trend Micro RSS feed collector

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::collectors::FeedCollector;
use crate::error::{ConnectorError, Result};
use crate::models::FeedItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemField {
    Title,
    Description,
    PubDate,
    Link,
}

impl ItemField {
    fn from_tag(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(ItemField::Title),
            b"description" => Some(ItemField::Description),
            b"pubDate" => Some(ItemField::PubDate),
            b"link" => Some(ItemField::Link),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ItemBuilder {
    title: String,
    description: String,
    pub_date: String,
    link: String,
}

impl ItemBuilder {
    fn push(&mut self, field: ItemField, text: &str) {
        let target = match field {
            ItemField::Title => &mut self.title,
            ItemField::Description => &mut self.description,
            ItemField::PubDate => &mut self.pub_date,
            ItemField::Link => &mut self.link,
        };
        target.push_str(text);
    }

    fn finish(self) -> FeedItem {
        FeedItem {
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            published_at: self.pub_date.trim().to_string(),
            link: self.link.trim().to_string(),
        }
    }
}

fn check_root(name: &[u8]) -> Result<()> {
    if name == b"rss" {
        return Ok(());
    }
    Err(ConnectorError::parse(
        "RSS document",
        format!("unexpected root element <{}>", String::from_utf8_lossy(name)),
    ))
}

/// Parse an RSS 2.0 document into feed items, in document order.
///
/// Items may be interleaved with other channel elements. Markup nested in an
/// item field is flattened to its text.
pub fn parse_rss(xml: &str) -> Result<Vec<FeedItem>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut root_checked = false;
    // Depth of the open <item>, and the item field being read
    let mut item: Option<(usize, ItemBuilder)> = None;
    let mut field: Option<(usize, ItemField)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => {
                depth += 1;
                if !root_checked {
                    check_root(e.name().as_ref())?;
                    root_checked = true;
                } else {
                    match item.as_ref().map(|(item_depth, _)| *item_depth) {
                        None if e.name().as_ref() == b"item" => {
                            item = Some((depth, ItemBuilder::default()));
                        }
                        Some(item_depth) if field.is_none() && depth == item_depth + 1 => {
                            field = ItemField::from_tag(e.name().as_ref()).map(|f| (depth, f));
                        }
                        _ => {}
                    }
                }
            }
            Ok(XmlEvent::Empty(e)) => {
                if !root_checked {
                    check_root(e.name().as_ref())?;
                    root_checked = true;
                }
            }
            Ok(XmlEvent::Text(t)) => {
                if let (Some((_, builder)), Some((_, f))) = (item.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map_err(|e| ConnectorError::parse("RSS document", e))?;
                    builder.push(f, &text);
                }
            }
            Ok(XmlEvent::CData(c)) => {
                if let (Some((_, builder)), Some((_, f))) = (item.as_mut(), field) {
                    builder.push(f, &String::from_utf8_lossy(&c));
                }
            }
            Ok(XmlEvent::End(_)) => {
                if matches!(field, Some((field_depth, _)) if field_depth == depth) {
                    field = None;
                }
                if matches!(&item, Some((item_depth, _)) if *item_depth == depth) {
                    if let Some((_, builder)) = item.take() {
                        items.push(builder.finish());
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(ConnectorError::parse("RSS document", e)),
            _ => {}
        }
        buf.clear();
    }

    if !root_checked {
        return Err(ConnectorError::parse("RSS document", "empty document"));
    }
    Ok(items)
}

/// Trend Micro research feed collector
pub struct TrendMicroCollector {
    client: Client,
    url: Url,
}

impl TrendMicroCollector {
    /// Create a new Trend Micro collector
    pub fn new(url: Url) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ConnectorError::transport("Failed to create HTTP client", e))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl FeedCollector for TrendMicroCollector {
    fn name(&self) -> &'static str {
        "trend_micro"
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| ConnectorError::transport("Failed to fetch Trend Micro feed", e))?;

        let body = response
            .text()
            .await
            .map_err(|e| ConnectorError::transport("Failed to read Trend Micro feed", e))?;

        let items = parse_rss(&body)?;
        tracing::debug!(feed = self.name(), items = items.len(), "Fetched feed snapshot");
        Ok(items)
    }
}
