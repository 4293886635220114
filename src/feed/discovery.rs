use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::path::Path;
use url::Url;

use super::{last_day_of_month, parse_feed_datetime};
use crate::config::FeedSource;
use crate::utils::{fetch_text, RateLimiter};

static FEED_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^xbrlrss-(\d{4})-(\d{2})\.xml$").expect("static regex"));

/// One monthly archive the sync cycle should process.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedCandidate {
    pub feed_id: i64,
    pub feed_date: NaiveDate,
    pub link: String,
    /// The source's current modification timestamp, compared against the
    /// stored value and persisted as the feed's new comparison point.
    pub comparison: Option<DateTime<FixedOffset>>,
    pub is_new: bool,
}

/// A listed archive before change detection.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCandidate {
    pub feed_id: i64,
    pub feed_date: NaiveDate,
    pub link: String,
    pub modified: Option<DateTime<FixedOffset>>,
}

fn candidate_from_name(name: &str, link: String, modified: Option<DateTime<FixedOffset>>) -> Option<RawCandidate> {
    let caps = FEED_FILE_RE.captures(name)?;
    let year: i32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    Some(RawCandidate {
        feed_id: i64::from(year) * 100 + i64::from(month),
        feed_date: last_day_of_month(year, month)?,
        link,
        modified,
    })
}

/// Scrapes the remote monthly index: rows holding an archive link and a
/// modification-timestamp cell.
pub async fn list_remote(
    client: &Client,
    base: &Url,
    user_agent: &str,
    limiter: &RateLimiter,
) -> Result<Vec<RawCandidate>> {
    let body = fetch_text(client, base, user_agent, limiter).await?;
    let page = Html::parse_document(&body);
    let row_sel = Selector::parse("table tr").expect("static selector");
    let link_sel = Selector::parse("td a[href]").expect("static selector");
    let cell_sel = Selector::parse("td").expect("static selector");
    let mut found = Vec::new();
    for row in page.select(&row_sel) {
        let href = match row.select(&link_sel).next().and_then(|a| a.value().attr("href")) {
            Some(href) => href,
            None => continue,
        };
        let name = href.rsplit('/').next().unwrap_or(href);
        let modified = row
            .select(&cell_sel)
            .nth(2)
            .map(|td| td.text().collect::<String>())
            .and_then(|text| parse_feed_datetime(&text));
        let link = base.join(href)?.to_string();
        if let Some(candidate) = candidate_from_name(name, link, modified) {
            found.push(candidate);
        }
    }
    Ok(found)
}

/// Scans a local directory of archive files, reading each feed's
/// lastBuildDate as the comparison timestamp. Testing path only.
pub fn list_local(dir: &Path) -> Result<Vec<RawCandidate>> {
    static BUILD_DATE_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"<lastBuildDate>([^<]+)</lastBuildDate>").expect("static regex")
    });
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if !FEED_FILE_RE.is_match(&name) {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let modified = BUILD_DATE_RE
                .captures(&content)
                .and_then(|caps| parse_feed_datetime(&caps[1]));
            if let Some(candidate) =
                candidate_from_name(&name, path.to_string_lossy().into_owned(), modified)
            {
                found.push(candidate);
            }
        }
    }
    Ok(found)
}

/// Change detection against the stored comparison timestamps. A feedId absent
/// from the store is new; a stored timestamp older than the source's is
/// updatable; an unavailable stored timestamp is conservatively included; an
/// up-to-date feed is excluded.
pub fn classify(
    mut listed: Vec<RawCandidate>,
    stored: &HashMap<i64, Option<DateTime<FixedOffset>>>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    last: Option<usize>,
) -> Vec<FeedCandidate> {
    listed.sort_by_key(|c| c.feed_id);
    let mut in_range: Vec<RawCandidate> = listed
        .into_iter()
        .filter(|c| date_from.map_or(true, |from| c.feed_date >= from))
        .filter(|c| date_to.map_or(true, |to| c.feed_date <= to))
        .collect();
    // The last-N window is taken over the listed archives, before change
    // detection; an up-to-date feed inside the window shrinks the result.
    if let Some(n) = last {
        let skip = in_range.len().saturating_sub(n);
        in_range.drain(..skip);
    }
    in_range
        .into_iter()
        .filter_map(|c| {
            let is_new = match stored.get(&c.feed_id) {
                None => true,
                Some(Some(stored_at)) => match c.modified {
                    Some(modified) if modified > *stored_at => false,
                    Some(_) => return None,
                    None => false,
                },
                Some(None) => false,
            };
            Some(FeedCandidate {
                feed_id: c.feed_id,
                feed_date: c.feed_date,
                link: c.link,
                comparison: c.modified,
                is_new,
            })
        })
        .collect()
}

/// Lists and classifies candidates for one cycle. A remote listing failure is
/// non-fatal: it is logged and yields no candidates.
pub async fn discover(
    client: &Client,
    source: &FeedSource,
    user_agent: &str,
    limiter: &RateLimiter,
    stored: &HashMap<i64, Option<DateTime<FixedOffset>>>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    last: Option<usize>,
) -> Result<Vec<FeedCandidate>> {
    let listed = match source {
        FeedSource::Remote(base) => {
            match list_remote(client, base, user_agent, limiter).await {
                Ok(listed) => listed,
                Err(e) => {
                    warn!("could not list feeds from {}: {:#}", base, e);
                    Vec::new()
                }
            }
        }
        FeedSource::Local(dir) => {
            if !dir.is_dir() {
                return Err(anyhow!("{:?} is not a directory", dir));
            }
            list_local(dir)?
        }
    };
    let candidates = classify(listed, stored, date_from, date_to, last);
    info!(
        "discovery found {} candidate feed(s), {} new",
        candidates.len(),
        candidates.iter().filter(|c| c.is_new).count()
    );
    Ok(candidates)
}
