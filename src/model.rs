use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One monthly feed archive (or the near-real-time pseudo-feed's month).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub feed_id: i64,
    pub feed_month: NaiveDate,
    pub title: Option<String>,
    pub link: String,
    pub feed_link: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub pub_date: Option<DateTime<FixedOffset>>,
    pub last_build_date: Option<DateTime<FixedOffset>>,
    pub last_modified_date: Option<DateTime<FixedOffset>>,
}

/// One filing referenced by a feed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filing {
    pub filing_id: i64,
    pub feed_id: i64,
    pub filing_link: Option<String>,
    pub entry_point: Option<String>,
    pub enclosure_url: Option<String>,
    pub enclosure_size: Option<i64>,
    pub pub_date: Option<DateTime<FixedOffset>>,
    pub company_name: Option<String>,
    pub form_type: Option<String>,
    #[serde(rename = "inlineXBRL")]
    pub inline_xbrl: i64,
    pub filing_date: Option<NaiveDate>,
    pub cik_number: Option<String>,
    pub accession_number: Option<String>,
    pub file_number: Option<String>,
    pub acceptance_datetime: Option<String>,
    pub period: Option<NaiveDate>,
    pub assigned_sic: i64,
    pub assistant_director: Option<String>,
    pub fiscal_year_end: Option<String>,
    pub fiscal_year_end_month: Option<i64>,
    pub fiscal_year_end_day: Option<i64>,
    pub duplicate: i64,
}

/// One attachment within a filing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilingFile {
    pub file_id: i64,
    pub filing_id: i64,
    pub feed_id: i64,
    pub accession_number: Option<String>,
    pub sequence: i64,
    pub file: Option<String>,
    #[serde(rename = "type")]
    pub file_type: Option<String>,
    pub size: Option<i64>,
    pub description: Option<String>,
    #[serde(rename = "inlineXBRL")]
    pub inline_xbrl: i64,
    pub url: Option<String>,
    #[serde(rename = "type_tag")]
    pub type_tag: String,
    pub duplicate: i64,
}

/// Entity metadata keyed by CIK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filer {
    pub cik_number: String,
    pub conformed_name: Option<String>,
    pub former_names: Vec<FormerName>,
    #[serde(rename = "industry_code")]
    pub industry_code: Option<String>,
    #[serde(rename = "industry_description")]
    pub industry_description: Option<String>,
    pub state_of_incorporation: Option<String>,
    pub mailing_city: Option<String>,
    pub mailing_state: Option<String>,
    pub mailing_zip: Option<String>,
    pub business_city: Option<String>,
    pub business_state: Option<String>,
    pub business_zip: Option<String>,
    pub country: Option<String>,
}

/// A previously used legal name; lists are kept newest-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormerName {
    pub name: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerMapping {
    pub ticker_symbol: String,
    pub cik_number: String,
}

/// Raw item XML preserved alongside a filing when requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRssItem {
    pub filing_id: i64,
    pub rss_item: String,
}

/// Singleton row recording when the last sync cycle finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub id: i64,
    pub last_update: DateTime<Utc>,
}

/// Row produced by the rename-heuristic query: the most recent filing per
/// CIK joined against the stored filer where the names differ
/// (case-insensitive).
#[derive(Debug, Clone, PartialEq)]
pub struct RenameCandidate {
    pub cik_number: String,
    pub company_name: String,
    pub conformed_name: String,
    pub former_names: Vec<FormerName>,
    pub pub_date: Option<DateTime<FixedOffset>>,
}

/// Serializes typed records into the JSON rows the storage layer consumes.
pub fn to_rows<T: Serialize>(items: &[T]) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|x| serde_json::to_value(x).map_err(Into::into))
        .collect()
}

pub fn to_row<T: Serialize>(item: &T) -> Result<Value> {
    serde_json::to_value(item).map_err(Into::into)
}
