//! Full-cycle tests against a local directory of feed archives: idempotence,
//! filingId monotonicity, cross-feed duplicate flagging, and the auto-update
//! loop around the cycle entry point.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rssdb::config::{FeedSource, SyncConfig};
use rssdb::feed::{extract_latest, ExtractOptions, XmlFeedParser};
use rssdb::filer::ProfileFetcher;
use rssdb::model::Filer;
use rssdb::store::{Collection, SqliteStore, Store};
use rssdb::sync::{AutoUpdater, SyncEngine};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct StaticProfiles;

#[async_trait]
impl ProfileFetcher for StaticProfiles {
    async fn fetch(&self, cik: &str) -> Result<Filer> {
        let name = match cik {
            "0000123456" => "ACME CORP",
            "0000654321" => "OTHER CORP",
            other => anyhow::bail!("unknown cik {}", other),
        };
        Ok(Filer {
            cik_number: cik.to_string(),
            conformed_name: Some(name.to_string()),
            former_names: Vec::new(),
            industry_code: Some("3674".to_string()),
            industry_description: None,
            state_of_incorporation: Some("DE".to_string()),
            mailing_city: None,
            mailing_state: None,
            mailing_zip: None,
            business_city: None,
            business_state: Some("NY".to_string()),
            business_zip: None,
            country: Some("US".to_string()),
        })
    }
}

fn item(company: &str, cik: &str, accession: &str, pub_date: &str) -> String {
    format!(
        r#"    <item>
      <title>{company} (10-K)</title>
      <link>https://example.invalid/{accession}-index.htm</link>
      <guid>https://example.invalid/{accession}-index.htm</guid>
      <enclosure url="https://example.invalid/{accession}-xbrl.zip" length="1024" type="application/zip"/>
      <description>10-K</description>
      <pubDate>{pub_date}</pubDate>
      <edgar:xbrlFiling>
        <edgar:companyName>{company}</edgar:companyName>
        <edgar:formType>10-K</edgar:formType>
        <edgar:filingDate>01/31/2023</edgar:filingDate>
        <edgar:cikNumber>{cik}</edgar:cikNumber>
        <edgar:accessionNumber>{accession}</edgar:accessionNumber>
        <edgar:period>20221231</edgar:period>
        <edgar:assignedSic>3674</edgar:assignedSic>
        <edgar:fiscalYearEnd>12-31</edgar:fiscalYearEnd>
        <edgar:xbrlFiles>
          <edgar:xbrlFile edgar:sequence="1" edgar:file="report.htm" edgar:type="10-K" edgar:size="2048" edgar:inlineXBRL="true" edgar:url="https://example.invalid/report.htm"/>
        </edgar:xbrlFiles>
      </edgar:xbrlFiling>
    </item>
"#
    )
}

fn feed_file(dir: &Path, name: &str, build_date: &str, items: &[String]) {
    let xml = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<rss xmlns:edgar="https://www.sec.gov/Archives/edgar" version="2.0">
  <channel>
    <title>Monthly archive</title>
    <link>https://example.invalid/monthly/</link>
    <description>Filings</description>
    <language>en-us</language>
    <lastBuildDate>{build_date}</lastBuildDate>
{items}  </channel>
</rss>"#,
        build_date = build_date,
        items = items.concat()
    );
    fs::write(dir.join(name), xml).unwrap();
}

/// January holds two filings; February repeats one accession number and adds
/// a new one, so duplicate detection has work to do.
fn write_feeds(dir: &Path) {
    feed_file(
        dir,
        "xbrlrss-2023-01.xml",
        "Wed, 01 Feb 2023 02:15:00 EST",
        &[
            // Newest first, as published.
            item(
                "OTHER CORP",
                "0000654321",
                "0001193125-23-000002",
                "Tue, 31 Jan 2023 17:00:00 EST",
            ),
            item(
                "ACME CORP",
                "0000123456",
                "0001193125-23-000001",
                "Tue, 31 Jan 2023 16:30:00 EST",
            ),
        ],
    );
    feed_file(
        dir,
        "xbrlrss-2023-02.xml",
        "Wed, 01 Mar 2023 02:15:00 EST",
        &[
            item(
                "ACME CORP",
                "0000123456",
                "0001193125-23-000003",
                "Wed, 15 Feb 2023 12:00:00 EST",
            ),
            item(
                "ACME CORP",
                "0000123456",
                "0001193125-23-000001",
                "Wed, 01 Feb 2023 09:00:00 EST",
            ),
        ],
    );
}

fn engine(store: Arc<dyn Store>, feed_dir: &Path, cache_dir: &Path) -> SyncEngine {
    let client = Client::new();
    let config = SyncConfig {
        source: FeedSource::Local(feed_dir.to_path_buf()),
        sequential: true,
        max_workers: 1,
        include_latest: false,
        get_raw_items: true,
        update_tickers: false,
        cache_dir: cache_dir.to_path_buf(),
        ..SyncConfig::default()
    };
    let parser = Arc::new(XmlFeedParser::new(
        client.clone(),
        cache_dir.to_path_buf(),
        config.user_agent.clone(),
    ));
    SyncEngine::new(store, parser, Arc::new(StaticProfiles), client, config).unwrap()
}

#[tokio::test]
async fn a_cycle_ingests_flags_duplicates_and_is_idempotent() {
    init_logging();
    let feeds = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    write_feeds(feeds.path());
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let engine = engine(Arc::clone(&store), feeds.path(), cache.path());

    let summary = engine.run_cycle().await.unwrap();
    assert_eq!(summary.feeds.inserted, 2);
    assert_eq!(summary.filings.inserted, 4);
    assert_eq!(summary.files.inserted, 4);
    assert_eq!(summary.raw_items.inserted, 4);
    assert_eq!(summary.filers.inserted, 2);
    assert!(summary.missing_ciks.is_empty());
    // The February copy of the January accession was flagged, plus its file.
    assert_eq!(summary.filings.updated, 1);
    assert_eq!(summary.files.updated, 1);

    // Ids increase chronologically within each feed.
    let january = store
        .get_by_ids(Collection::Filings, &[20230100001, 20230100002])
        .await
        .unwrap();
    assert_eq!(
        january[0].get("accessionNumber"),
        Some(&json!("0001193125-23-000001"))
    );
    assert_eq!(
        january[1].get("accessionNumber"),
        Some(&json!("0001193125-23-000002"))
    );

    // Exactly one canonical row for the repeated accession, the minimum id.
    let february = store
        .get_by_ids(Collection::Filings, &[20230200001, 20230200002])
        .await
        .unwrap();
    let dup_row = february
        .iter()
        .find(|r| r.get("accessionNumber") == Some(&json!("0001193125-23-000001")))
        .unwrap();
    assert_eq!(dup_row.get("duplicate"), Some(&json!(1)));
    assert_eq!(january[0].get("duplicate"), Some(&json!(0)));
    assert!(store.duplicate_filing_ids().await.unwrap().is_empty());
    assert!(store.last_update().await.unwrap().is_some());

    // Nothing changed remotely, so a second cycle inserts nothing.
    let again = engine.run_cycle().await.unwrap();
    assert_eq!(again.feeds.inserted, 0);
    assert_eq!(again.filings.inserted, 0);
    assert_eq!(again.files.inserted, 0);
    assert_eq!(again.filers.inserted, 0);
}

#[tokio::test]
async fn a_changed_feed_is_reprocessed_with_only_new_items() {
    init_logging();
    let feeds = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    feed_file(
        feeds.path(),
        "xbrlrss-2023-01.xml",
        "Wed, 01 Feb 2023 02:15:00 EST",
        &[item(
            "ACME CORP",
            "0000123456",
            "0001193125-23-000001",
            "Tue, 31 Jan 2023 16:30:00 EST",
        )],
    );
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let engine = engine(Arc::clone(&store), feeds.path(), cache.path());
    let first = engine.run_cycle().await.unwrap();
    assert_eq!(first.filings.inserted, 1);

    // The archive gains one item and a later build date.
    feed_file(
        feeds.path(),
        "xbrlrss-2023-01.xml",
        "Thu, 02 Feb 2023 02:15:00 EST",
        &[
            item(
                "OTHER CORP",
                "0000654321",
                "0001193125-23-000002",
                "Wed, 01 Feb 2023 10:00:00 EST",
            ),
            item(
                "ACME CORP",
                "0000123456",
                "0001193125-23-000001",
                "Tue, 31 Jan 2023 16:30:00 EST",
            ),
        ],
    );
    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.feeds.inserted, 0);
    assert_eq!(second.feeds.updated, 1);
    assert_eq!(second.filings.inserted, 1);
    // The already stored item kept its id; the new one continued the
    // sequence.
    let rows = store
        .get_by_ids(Collection::Filings, &[20230100001, 20230100002])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[1].get("accessionNumber"),
        Some(&json!("0001193125-23-000002"))
    );
}

#[tokio::test]
async fn raw_items_round_trip_through_the_store() {
    init_logging();
    let feeds = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    feed_file(
        feeds.path(),
        "xbrlrss-2023-01.xml",
        "Wed, 01 Feb 2023 02:15:00 EST",
        &[item(
            "ACME CORP",
            "0000123456",
            "0001193125-23-000001",
            "Tue, 31 Jan 2023 16:30:00 EST",
        )],
    );
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let engine = engine(Arc::clone(&store), feeds.path(), cache.path());
    engine.run_cycle().await.unwrap();
    let raw = store
        .get_by_ids(Collection::RawItems, &[20230100001])
        .await
        .unwrap();
    assert_eq!(raw.len(), 1);
    let xml = raw[0].get("rssItem").and_then(Value::as_str).unwrap();
    assert!(xml.starts_with("<item>"));
    assert!(xml.contains("0001193125-23-000001"));
}

#[tokio::test]
async fn the_latest_pseudo_feed_inserts_once_then_appends() {
    init_logging();
    let feeds = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    feed_file(
        feeds.path(),
        "xbrlrss.all.xml",
        "Wed, 15 Feb 2023 02:15:00 EST",
        &[item(
            "ACME CORP",
            "0000123456",
            "0001193125-23-000003",
            "Wed, 15 Feb 2023 01:00:00 EST",
        )],
    );
    let link = feeds.path().join("xbrlrss.all.xml");
    let link = link.to_str().unwrap();
    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    store.ensure_schema().await.unwrap();
    let parser = XmlFeedParser::new(
        Client::new(),
        cache.path().to_path_buf(),
        "test".to_string(),
    );
    let options = ExtractOptions::default();

    // First sighting in the month: the feed row itself is inserted.
    let batch = extract_latest(&store, &parser, link, &options).await.unwrap();
    let stats = store.apply_feed(&batch).await.unwrap();
    assert_eq!(stats.feeds.inserted, 1);
    assert_eq!(stats.filings.inserted, 1);

    // The pseudo-feed grows: the feed row is updated, only new accessions
    // are appended, ids continue the month's sequence.
    feed_file(
        feeds.path(),
        "xbrlrss.all.xml",
        "Wed, 15 Feb 2023 08:30:00 EST",
        &[
            item(
                "OTHER CORP",
                "0000654321",
                "0001193125-23-000004",
                "Wed, 15 Feb 2023 08:00:00 EST",
            ),
            item(
                "ACME CORP",
                "0000123456",
                "0001193125-23-000003",
                "Wed, 15 Feb 2023 01:00:00 EST",
            ),
        ],
    );
    let batch = extract_latest(&store, &parser, link, &options).await.unwrap();
    let stats = store.apply_feed(&batch).await.unwrap();
    assert_eq!(stats.feeds.inserted, 0);
    assert_eq!(stats.feeds.updated, 1);
    assert_eq!(stats.filings.inserted, 1);
    let rows = store
        .get_by_ids(Collection::Filings, &[20230200001, 20230200002])
        .await
        .unwrap();
    assert_eq!(
        rows[0].get("accessionNumber"),
        Some(&json!("0001193125-23-000003"))
    );
    assert_eq!(
        rows[1].get("accessionNumber"),
        Some(&json!("0001193125-23-000004"))
    );
}

#[tokio::test]
async fn the_auto_update_loop_drives_cycles_until_its_deadline() {
    init_logging();
    let feeds = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    write_feeds(feeds.path());
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let engine = engine(Arc::clone(&store), feeds.path(), cache.path());
    let updater = AutoUpdater::new(
        Duration::from_millis(50),
        Duration::from_millis(400),
        Duration::from_millis(10),
    );
    engine.run_auto_update(&updater).await;
    // Cycles ran and settled into an idempotent state.
    assert_eq!(store.count(Collection::Filings).await.unwrap(), 4);
    assert!(store.last_update().await.unwrap().is_some());
}

#[tokio::test]
async fn date_filters_limit_which_archives_are_ingested() {
    init_logging();
    let feeds = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    write_feeds(feeds.path());
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let client = Client::new();
    let config = SyncConfig {
        source: FeedSource::Local(feeds.path().to_path_buf()),
        sequential: true,
        max_workers: 1,
        include_latest: false,
        get_filers: false,
        update_tickers: false,
        date_to: NaiveDate::from_ymd_opt(2023, 2, 1),
        cache_dir: cache.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let parser = Arc::new(XmlFeedParser::new(
        client.clone(),
        cache.path().to_path_buf(),
        config.user_agent.clone(),
    ));
    let engine =
        SyncEngine::new(Arc::clone(&store), parser, Arc::new(StaticProfiles), client, config)
            .unwrap();
    let summary = engine.run_cycle().await.unwrap();
    // Only January's feed date falls inside the range.
    assert_eq!(summary.feeds.inserted, 1);
    assert_eq!(store.existing_feed_ids().await.unwrap(), vec![202301]);
}
