use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use url::Url;

use crate::utils::{fetch_and_save, RateLimiter};

/// Parsed feed: channel metadata plus the ordered item list, newest first as
/// published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedDocument {
    pub channel: HashMap<String, String>,
    pub items: Vec<ItemDocument>,
}

/// One feed item: flat attributes keyed by element local name, the nested
/// file attachments, and optionally the item's raw XML slice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemDocument {
    pub attrs: HashMap<String, String>,
    pub files: Vec<FileAttachment>,
    pub raw_xml: Option<String>,
}

impl ItemDocument {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Attributes of one nested file element, keyed by attribute local name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileAttachment {
    pub attrs: HashMap<String, String>,
}

impl FileAttachment {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Turns a feed location into a parsed document. The sync engine only sees
/// this shape; the XML and caching details stay behind it.
#[async_trait]
pub trait FeedParser: Send + Sync {
    async fn parse(&self, link: &str, force_reload: bool, capture_raw: bool)
        -> Result<FeedDocument>;
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn push_text(map: &mut HashMap<String, String>, key: &str, text: &str) {
    map.entry(key.to_string())
        .and_modify(|existing| existing.push_str(text))
        .or_insert_with(|| text.to_string());
}

fn start_element(
    e: &BytesStart<'_>,
    doc: &mut FeedDocument,
    current: &mut Option<ItemDocument>,
) -> Result<()> {
    let name = local_name(e);
    match name.as_str() {
        "enclosure" => {
            if let Some(item) = current.as_mut() {
                for attr in e.attributes() {
                    let attr = attr?;
                    let value = attr.unescape_value()?.into_owned();
                    match attr.key.local_name().as_ref() {
                        b"url" => push_text(&mut item.attrs, "enclosureUrl", &value),
                        b"length" => push_text(&mut item.attrs, "enclosureLength", &value),
                        _ => {}
                    }
                }
            }
        }
        "xbrlFile" => {
            if let Some(item) = current.as_mut() {
                let mut file = FileAttachment::default();
                for attr in e.attributes() {
                    let attr = attr?;
                    let key = String::from_utf8_lossy(attr.key.local_name().as_ref())
                        .into_owned();
                    let value = attr.unescape_value()?.into_owned();
                    if key == "inlineXBRL" {
                        // First occurrence anywhere in the item wins.
                        item.attrs
                            .entry("inlineXBRL".to_string())
                            .or_insert_with(|| value.clone());
                    }
                    file.attrs.insert(key, value);
                }
                item.files.push(file);
            }
        }
        "link" if current.is_none() => {
            // Channel-level atom link carries the feed's own location as an
            // href attribute; the plain <link> element has text instead.
            for attr in e.attributes() {
                let attr = attr?;
                if attr.key.local_name().as_ref() == b"href" {
                    let value = attr.unescape_value()?.into_owned();
                    doc.channel.insert("feedLink".to_string(), value);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Parses feed XML into the document shape. Element and attribute names are
/// matched by local name so namespace prefixes never matter.
pub fn parse_feed_xml(xml: &str, capture_raw: bool) -> Result<FeedDocument> {
    let mut reader = Reader::from_str(xml);
    let mut doc = FeedDocument::default();
    let mut current: Option<ItemDocument> = None;
    let mut current_tag: Option<String> = None;
    let mut item_start = 0usize;
    let mut last_pos = 0usize;
    loop {
        let pos_before = last_pos;
        let event = reader.read_event()?;
        last_pos = reader.buffer_position() as usize;
        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                if name == "item" {
                    item_start = pos_before;
                    current = Some(ItemDocument::default());
                    current_tag = None;
                } else {
                    start_element(&e, &mut doc, &mut current)?;
                    current_tag = Some(name);
                }
            }
            Event::Empty(e) => {
                start_element(&e, &mut doc, &mut current)?;
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                if let Some(tag) = &current_tag {
                    match current.as_mut() {
                        Some(item) => push_text(&mut item.attrs, tag, text),
                        None => push_text(&mut doc.channel, tag, text),
                    }
                }
            }
            Event::CData(t) => {
                let raw = String::from_utf8_lossy(&t).into_owned();
                let text = raw.trim();
                if text.is_empty() {
                    continue;
                }
                if let Some(tag) = &current_tag {
                    match current.as_mut() {
                        Some(item) => push_text(&mut item.attrs, tag, text),
                        None => push_text(&mut doc.channel, tag, text),
                    }
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "item" {
                    if let Some(mut item) = current.take() {
                        if capture_raw {
                            item.raw_xml = Some(xml[item_start..last_pos].to_string());
                        }
                        doc.items.push(item);
                    }
                }
                current_tag = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(doc)
}

/// Default parser: downloads feeds through a local file cache and parses the
/// cached XML. Local paths are read directly, for testing against stored
/// archives.
pub struct XmlFeedParser {
    client: Client,
    cache_dir: PathBuf,
    user_agent: String,
}

impl XmlFeedParser {
    pub fn new(client: Client, cache_dir: PathBuf, user_agent: String) -> Self {
        Self {
            client,
            cache_dir,
            user_agent,
        }
    }

    fn cache_target(&self, url: &Url) -> PathBuf {
        let name = url
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|s| !s.is_empty())
            .unwrap_or("feed.xml");
        self.cache_dir.join(name)
    }

    async fn cached_fetch(&self, url: &Url, force_reload: bool) -> Result<String> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let path = self.cache_target(url);
        if force_reload || !path.exists() {
            debug!("caching {} -> {:?}", url, path);
            fetch_and_save(&self.client, url, &path, &self.user_agent, RateLimiter::sec())
                .await?;
        }
        Ok(tokio::fs::read_to_string(&path).await?)
    }
}

#[async_trait]
impl FeedParser for XmlFeedParser {
    async fn parse(
        &self,
        link: &str,
        force_reload: bool,
        capture_raw: bool,
    ) -> Result<FeedDocument> {
        let xml = if link.starts_with("http://") || link.starts_with("https://") {
            self.cached_fetch(&Url::parse(link)?, force_reload).await?
        } else {
            tokio::fs::read_to_string(link).await?
        };
        parse_feed_xml(&xml, capture_raw)
    }
}
