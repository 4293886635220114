use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{debug, info};
use std::collections::HashSet;

use super::discovery::FeedCandidate;
use super::parser::{FeedDocument, FeedParser, ItemDocument};
use super::{last_day_of_month, parse_feed_datetime};
use crate::model::{self, Feed, Filing, FilingFile, RawRssItem};
use crate::store::{FeedBatch, Store, UpsertAction};

/// A feed can hold at most 99,999 filings and a filing at most 999 files;
/// the synthetic ids encode position arithmetically within those bounds.
pub const MAX_FILINGS_PER_FEED: i64 = 99_999;
pub const MAX_FILES_PER_FILING: i64 = 999;
pub const FILING_ID_SPAN: i64 = 100_000;
pub const FILE_ID_SPAN: i64 = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub get_files: bool,
    pub get_raw_items: bool,
    pub reload_cache: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            get_files: true,
            get_raw_items: false,
            reload_cache: false,
        }
    }
}

fn parse_inline_flag(raw: Option<&str>) -> i64 {
    match raw {
        Some(s) if s.to_lowercase().contains('t') => 1,
        _ => 0,
    }
}

fn parse_filing_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

fn parse_period(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

/// Maps a file's type suffix to its tag; unknown types fall back to INS for
/// inline documents and OTHER otherwise.
fn type_tag(file_type: Option<&str>, inline: bool) -> String {
    if let Some(t) = file_type {
        if t.len() >= 3 {
            let suffix = t[t.len() - 3..].to_lowercase();
            match suffix.as_str() {
                "ins" => return "INS".to_string(),
                "sch" => return "SCH".to_string(),
                "cal" => return "CAL".to_string(),
                "def" => return "DEF".to_string(),
                "lab" => return "LAB".to_string(),
                "pre" => return "PRE".to_string(),
                _ => {}
            }
        }
    }
    if inline {
        "INS".to_string()
    } else {
        "OTHER".to_string()
    }
}

fn build_files(item: &ItemDocument, feed_id: i64, filing_id: i64) -> Result<Vec<FilingFile>> {
    let mut files = Vec::with_capacity(item.files.len());
    for attachment in &item.files {
        let sequence: i64 = attachment
            .attr("sequence")
            .ok_or_else(|| anyhow!("file attachment without a sequence"))?
            .parse()?;
        if !(0..=MAX_FILES_PER_FILING).contains(&sequence) {
            return Err(anyhow!(
                "file sequence {} out of range for filing {}",
                sequence,
                filing_id
            ));
        }
        let inline = parse_inline_flag(attachment.attr("inlineXBRL"));
        files.push(FilingFile {
            file_id: filing_id * FILE_ID_SPAN + sequence,
            filing_id,
            feed_id,
            accession_number: item.attr("accessionNumber").map(str::to_string),
            sequence,
            file: attachment.attr("file").map(str::to_string),
            file_type: attachment.attr("type").map(str::to_string),
            size: attachment.attr("size").and_then(|s| s.parse().ok()),
            description: attachment.attr("description").map(str::to_string),
            inline_xbrl: inline,
            url: attachment.attr("url").map(str::to_string),
            type_tag: type_tag(attachment.attr("type"), inline != 0),
            duplicate: 0,
        });
    }
    Ok(files)
}

fn build_filing(
    item: &ItemDocument,
    feed_id: i64,
    filing_id: i64,
    files: &[FilingFile],
) -> Filing {
    let fiscal_year_end = item.attr("fiscalYearEnd").map(str::to_string);
    let (fy_month, fy_day) = fiscal_year_end
        .as_deref()
        .and_then(|raw| {
            let (m, d) = raw.split_once('-')?;
            Some((m.trim().parse().ok()?, d.trim().parse().ok()?))
        })
        .map(|(m, d)| (Some(m), Some(d)))
        .unwrap_or((None, None));
    // The entry point is the instance document when one is identifiable,
    // otherwise the first attached file.
    let entry_point = files
        .iter()
        .find(|f| f.type_tag == "INS")
        .or_else(|| files.first())
        .and_then(|f| f.url.clone());
    Filing {
        filing_id,
        feed_id,
        filing_link: item.attr("link").map(str::to_string),
        entry_point,
        enclosure_url: item.attr("enclosureUrl").map(str::to_string),
        enclosure_size: item.attr("enclosureLength").and_then(|s| s.parse().ok()),
        pub_date: item.attr("pubDate").and_then(parse_feed_datetime),
        company_name: item.attr("companyName").map(str::to_string),
        form_type: item.attr("formType").map(str::to_string),
        inline_xbrl: parse_inline_flag(item.attr("inlineXBRL")),
        filing_date: item.attr("filingDate").and_then(parse_filing_date),
        cik_number: item.attr("cikNumber").map(str::to_string),
        accession_number: item.attr("accessionNumber").map(str::to_string),
        file_number: item.attr("fileNumber").map(str::to_string),
        acceptance_datetime: item.attr("acceptanceDatetime").map(str::to_string),
        period: item.attr("period").and_then(parse_period),
        assigned_sic: item
            .attr("assignedSic")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        assistant_director: item.attr("assistantDirector").map(str::to_string),
        fiscal_year_end,
        fiscal_year_end_month: fy_month,
        fiscal_year_end_day: fy_day,
        duplicate: 0,
    }
}

fn build_feed_record(
    doc: &FeedDocument,
    candidate: &FeedCandidate,
) -> Feed {
    Feed {
        feed_id: candidate.feed_id,
        feed_month: candidate.feed_date,
        title: doc.channel.get("title").cloned(),
        link: candidate.link.clone(),
        feed_link: doc.channel.get("feedLink").cloned(),
        description: doc.channel.get("description").cloned(),
        language: doc.channel.get("language").cloned(),
        pub_date: doc
            .channel
            .get("pubDate")
            .and_then(|s| parse_feed_datetime(s)),
        last_build_date: doc
            .channel
            .get("lastBuildDate")
            .and_then(|s| parse_feed_datetime(s)),
        last_modified_date: candidate.comparison,
    }
}

/// Builds the filing/file/raw-item records for a feed's items. Items arrive
/// newest-first and are processed oldest-first so filingIds increase in
/// chronological order; items whose accession number is already stored are
/// skipped.
pub fn build_items(
    doc: &FeedDocument,
    feed_id: i64,
    existing: &HashSet<String>,
    start_filing_id: i64,
    options: &ExtractOptions,
) -> Result<(Vec<Filing>, Vec<FilingFile>, Vec<RawRssItem>)> {
    let mut filings = Vec::new();
    let mut files = Vec::new();
    let mut raw_items = Vec::new();
    let mut next_id = start_filing_id;
    for item in doc.items.iter().rev() {
        if let Some(accession) = item.attr("accessionNumber") {
            if existing.contains(accession) {
                continue;
            }
        }
        if next_id - feed_id * FILING_ID_SPAN > MAX_FILINGS_PER_FEED {
            return Err(anyhow!(
                "feed {} exceeds {} filings",
                feed_id,
                MAX_FILINGS_PER_FEED
            ));
        }
        let filing_id = next_id;
        next_id += 1;
        let item_files = if options.get_files {
            build_files(item, feed_id, filing_id)?
        } else {
            Vec::new()
        };
        filings.push(build_filing(item, feed_id, filing_id, &item_files));
        files.extend(item_files);
        if options.get_raw_items {
            if let Some(raw) = &item.raw_xml {
                raw_items.push(RawRssItem {
                    filing_id,
                    rss_item: raw.clone(),
                });
            }
        }
    }
    Ok((filings, files, raw_items))
}

async fn assemble_batch(
    store: &dyn Store,
    doc: &FeedDocument,
    candidate: &FeedCandidate,
    insert_feed_record: bool,
    options: &ExtractOptions,
) -> Result<FeedBatch> {
    let existing = if candidate.is_new {
        HashSet::new()
    } else {
        store.accession_numbers_for_feed(candidate.feed_id).await?
    };
    let start_id = match store.max_filing_id(candidate.feed_id).await? {
        Some(max) => max + 1,
        None => candidate.feed_id * FILING_ID_SPAN + 1,
    };
    let (filings, files, raw_items) = build_items(doc, candidate.feed_id, &existing, start_id, options)?;
    debug!(
        "feed {}: {} new filing(s), {} file(s)",
        candidate.feed_id,
        filings.len(),
        files.len()
    );
    let feed = build_feed_record(doc, candidate);
    let action = if insert_feed_record {
        UpsertAction::Insert
    } else {
        UpsertAction::Update
    };
    Ok(FeedBatch {
        feed: Some((model::to_row(&feed)?, action)),
        filings: model::to_rows(&filings)?,
        files: model::to_rows(&files)?,
        raw_items: model::to_rows(&raw_items)?,
    })
}

/// Extracts one monthly feed into a write batch. Re-processed feeds always
/// refresh the cache; new feeds refresh only when asked.
pub async fn extract_feed(
    store: &dyn Store,
    parser: &dyn FeedParser,
    candidate: &FeedCandidate,
    options: &ExtractOptions,
) -> Result<FeedBatch> {
    let force_reload = !candidate.is_new || options.reload_cache;
    let doc = parser
        .parse(&candidate.link, force_reload, options.get_raw_items)
        .await?;
    assemble_batch(store, &doc, candidate, candidate.is_new, options).await
}

/// Extracts the near-real-time pseudo-feed. It is always reloaded and always
/// treated as an update of the current month's feed, except when that feedId
/// is not stored yet (first sighting in a month).
pub async fn extract_latest(
    store: &dyn Store,
    parser: &dyn FeedParser,
    link: &str,
    options: &ExtractOptions,
) -> Result<FeedBatch> {
    let doc = parser.parse(link, true, options.get_raw_items).await?;
    let built = doc
        .channel
        .get("lastBuildDate")
        .and_then(|s| parse_feed_datetime(s))
        .ok_or_else(|| anyhow!("latest feed has no parseable lastBuildDate"))?;
    let year = chrono::Datelike::year(&built.date_naive());
    let month = chrono::Datelike::month(&built.date_naive());
    let feed_id = i64::from(year) * 100 + i64::from(month);
    let known = store.existing_feed_ids().await?;
    let feed_id_absent = !known.contains(&feed_id);
    let candidate = FeedCandidate {
        feed_id,
        feed_date: last_day_of_month(year, month)
            .ok_or_else(|| anyhow!("invalid feed month {}-{}", year, month))?,
        link: link.to_string(),
        comparison: Some(built),
        is_new: feed_id_absent,
    };
    info!(
        "latest filings map to feed {} ({})",
        feed_id,
        if feed_id_absent { "new" } else { "existing" }
    );
    assemble_batch(store, &doc, &candidate, feed_id_absent, options).await
}
