use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::model::RenameCandidate;

pub mod sled;
pub mod sqlite;

pub use self::sled::SledStore;
pub use self::sqlite::SqliteStore;

/// Named collections shared by both backends. Relational tables and document
/// trees use the same names and the same field universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Feeds,
    Filings,
    Files,
    Filers,
    RawItems,
    TickerMapping,
    SyncState,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Feeds,
        Collection::Filings,
        Collection::Files,
        Collection::Filers,
        Collection::RawItems,
        Collection::TickerMapping,
        Collection::SyncState,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Feeds => "feedsInfo",
            Collection::Filings => "filingsInfo",
            Collection::Files => "filesInfo",
            Collection::Filers => "filersInfo",
            Collection::RawItems => "rssItems",
            Collection::TickerMapping => "cikTickerMapping",
            Collection::SyncState => "lastUpdate",
        }
    }

    pub fn primary_field(&self) -> &'static str {
        match self {
            Collection::Feeds => "feedId",
            Collection::Filings => "filingId",
            Collection::Files => "fileId",
            Collection::Filers => "cikNumber",
            Collection::RawItems => "filingId",
            Collection::TickerMapping => "tickerSymbol",
            Collection::SyncState => "id",
        }
    }

    /// Column universe, in insert order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Collection::Feeds => &[
                "feedId",
                "feedMonth",
                "title",
                "link",
                "feedLink",
                "description",
                "language",
                "pubDate",
                "lastBuildDate",
                "lastModifiedDate",
            ],
            Collection::Filings => &[
                "filingId",
                "feedId",
                "filingLink",
                "entryPoint",
                "enclosureUrl",
                "enclosureSize",
                "pubDate",
                "companyName",
                "formType",
                "inlineXBRL",
                "filingDate",
                "cikNumber",
                "accessionNumber",
                "fileNumber",
                "acceptanceDatetime",
                "period",
                "assignedSic",
                "assistantDirector",
                "fiscalYearEnd",
                "fiscalYearEndMonth",
                "fiscalYearEndDay",
                "duplicate",
            ],
            Collection::Files => &[
                "fileId",
                "filingId",
                "feedId",
                "accessionNumber",
                "sequence",
                "file",
                "type",
                "size",
                "description",
                "inlineXBRL",
                "url",
                "type_tag",
                "duplicate",
            ],
            Collection::Filers => &[
                "cikNumber",
                "formerNames",
                "industry_code",
                "industry_description",
                "stateOfIncorporation",
                "mailingState",
                "mailingCity",
                "mailingZip",
                "conformedName",
                "businessCity",
                "businessState",
                "businessZip",
                "country",
            ],
            Collection::RawItems => &["filingId", "rssItem"],
            Collection::TickerMapping => &["tickerSymbol", "cikNumber"],
            Collection::SyncState => &["id", "lastUpdate"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Insert,
    Update,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertStats {
    pub fn merge(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

/// All writes produced by one feed extraction unit.
#[derive(Debug, Clone, Default)]
pub struct FeedBatch {
    /// The feed-level record and its action, or `None` when the feed row
    /// already exists and only items are being appended (latest pseudo-feed).
    pub feed: Option<(Value, UpsertAction)>,
    pub filings: Vec<Value>,
    pub files: Vec<Value>,
    pub raw_items: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeedWriteStats {
    pub feeds: UpsertStats,
    pub filings: UpsertStats,
    pub files: UpsertStats,
    pub raw_items: UpsertStats,
}

impl FeedWriteStats {
    pub fn merge(&mut self, other: &FeedWriteStats) {
        self.feeds.merge(other.feeds);
        self.filings.merge(other.filings);
        self.files.merge(other.files);
        self.raw_items.merge(other.raw_items);
    }
}

/// Storage contract implemented by the relational and document backends.
/// Both must expose identical external behavior: same stats, same field
/// universe, same duplicate-key guarantee per insert batch.
#[async_trait]
pub trait Store: Send + Sync {
    /// Verify-or-create schema/collections. Idempotent and safe to call
    /// redundantly from any worker.
    async fn ensure_schema(&self) -> Result<()>;

    /// Bulk insert or bulk conditional update of JSON records.
    ///
    /// Insert writes the collection's full column universe (absent fields
    /// become null). Update sets `update_fields` (default: the fields present
    /// in each record) on rows matched by `natural_keys` (default: the
    /// collection's primary field).
    async fn upsert(
        &self,
        collection: Collection,
        records: &[Value],
        action: UpsertAction,
        update_fields: Option<&[&str]>,
        natural_keys: Option<&[&str]>,
    ) -> Result<UpsertStats>;

    /// Persist one feed extraction unit. The relational backend wraps this
    /// in a single transaction; the document backend writes sequentially and
    /// surfaces partial failure as an error.
    async fn apply_feed(&self, batch: &FeedBatch) -> Result<FeedWriteStats> {
        let mut stats = FeedWriteStats::default();
        if let Some((feed, action)) = &batch.feed {
            stats.feeds = self
                .upsert(Collection::Feeds, std::slice::from_ref(feed), *action, None, None)
                .await?;
        }
        if !batch.filings.is_empty() {
            stats.filings = self
                .upsert(Collection::Filings, &batch.filings, UpsertAction::Insert, None, None)
                .await?;
        }
        if !batch.files.is_empty() {
            stats.files = self
                .upsert(Collection::Files, &batch.files, UpsertAction::Insert, None, None)
                .await?;
        }
        if !batch.raw_items.is_empty() {
            stats.raw_items = self
                .upsert(Collection::RawItems, &batch.raw_items, UpsertAction::Insert, None, None)
                .await?;
        }
        Ok(stats)
    }

    async fn existing_feed_ids(&self) -> Result<Vec<i64>>;

    /// feedId -> stored comparison timestamp (lastModifiedDate), `None` when
    /// the stored value is unavailable.
    async fn feed_comparison_dates(
        &self,
    ) -> Result<HashMap<i64, Option<DateTime<FixedOffset>>>>;

    async fn accession_numbers_for_feed(&self, feed_id: i64) -> Result<HashSet<String>>;

    async fn max_filing_id(&self, feed_id: i64) -> Result<Option<i64>>;

    async fn distinct_filing_ciks(&self) -> Result<Vec<String>>;

    async fn distinct_filer_ciks(&self) -> Result<Vec<String>>;

    /// Latest filing per CIK joined to the stored filer, restricted to rows
    /// where the filing company name differs from the stored conformed name
    /// (case-insensitive).
    async fn rename_candidates(&self) -> Result<Vec<RenameCandidate>>;

    /// filingIds of non-canonical duplicates: rows sharing an accession
    /// number with an earlier filingId, recomputed from scratch.
    async fn duplicate_filing_ids(&self) -> Result<Vec<i64>>;

    async fn get_by_ids(&self, collection: Collection, ids: &[i64]) -> Result<Vec<Value>>;

    /// Records matching every field of `criteria` (an object keyed by column
    /// names, equality only), ordered by the collection's primary field.
    /// Criteria without a single searchable field are an error.
    async fn search(&self, collection: Collection, criteria: &Value) -> Result<Vec<Value>>;

    async fn clear_collection(&self, collection: Collection) -> Result<u64>;

    async fn count(&self, collection: Collection) -> Result<u64>;

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Builds the composite match key of a record over the given fields.
pub(crate) fn record_key(record: &Value, fields: &[&str]) -> Result<String> {
    let mut parts = Vec::with_capacity(fields.len());
    for field in fields {
        let v = record
            .get(field)
            .ok_or_else(|| anyhow!("record is missing key field {}", field))?;
        parts.push(scalar_to_string(v));
    }
    Ok(parts.join("\u{1f}"))
}

pub(crate) fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The fields present in a record, restricted to the collection's column
/// universe and in universe order.
pub(crate) fn present_fields(collection: Collection, record: &Value) -> Vec<&'static str> {
    let obj = match record.as_object() {
        Some(obj) => obj,
        None => return Vec::new(),
    };
    collection
        .columns()
        .iter()
        .copied()
        .filter(|c| obj.contains_key(*c))
        .collect()
}
