//! Runs identical operation sequences against the relational and document
//! backends and asserts identical externally visible results.

use rssdb::feed::build_feed_document;
use rssdb::store::{Collection, SledStore, SqliteStore, Store, UpsertAction};
use serde_json::{json, Value};
use tempfile::TempDir;

async fn open_stores(dir: &TempDir) -> Vec<(&'static str, Box<dyn Store>)> {
    let sqlite = SqliteStore::connect("sqlite::memory:").await.unwrap();
    let sled = SledStore::open(&dir.path().join("docs")).unwrap();
    let stores: Vec<(&'static str, Box<dyn Store>)> =
        vec![("sqlite", Box::new(sqlite)), ("sled", Box::new(sled))];
    for (_, store) in &stores {
        store.ensure_schema().await.unwrap();
    }
    stores
}

fn filing(filing_id: i64, accession: &str, cik: &str, company: &str, pub_date: &str) -> Value {
    json!({
        "filingId": filing_id,
        "feedId": filing_id / 100_000,
        "filingLink": "https://example.invalid/idx",
        "enclosureSize": 1024,
        "pubDate": pub_date,
        "companyName": company,
        "formType": "10-K",
        "inlineXBRL": 0,
        "filingDate": "2023-01-31",
        "cikNumber": cik,
        "accessionNumber": accession,
        "assignedSic": 3674,
        "duplicate": 0
    })
}

fn file(filing_id: i64, sequence: i64) -> Value {
    json!({
        "fileId": filing_id * 1_000 + sequence,
        "filingId": filing_id,
        "feedId": filing_id / 100_000,
        "sequence": sequence,
        "inlineXBRL": 0,
        "type_tag": "OTHER",
        "duplicate": 0
    })
}

#[tokio::test]
async fn inserted_rows_read_back_identically_from_both_backends() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir).await;
    let rows = vec![
        filing(
            20230100001,
            "0001193125-23-000001",
            "0000123456",
            "ACME CORP",
            "2023-01-31T16:30:00-05:00",
        ),
        filing(
            20230100002,
            "0001193125-23-000002",
            "0000654321",
            "OTHER CORP",
            "2023-01-31T17:00:00-05:00",
        ),
    ];
    let mut reads = Vec::new();
    for (name, store) in &stores {
        let stats = store
            .upsert(Collection::Filings, &rows, UpsertAction::Insert, None, None)
            .await
            .unwrap();
        assert_eq!(stats.inserted, 2, "{}", name);
        assert_eq!(stats.updated, 0, "{}", name);
        reads.push(
            store
                .get_by_ids(Collection::Filings, &[20230100001, 20230100002])
                .await
                .unwrap(),
        );
    }
    assert_eq!(reads[0], reads[1]);
    // Absent fields become null in the full column universe on both sides.
    assert_eq!(reads[0][0].get("fileNumber"), Some(&Value::Null));
}

#[tokio::test]
async fn duplicate_keys_error_on_both_backends() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir).await;
    let row = filing(
        20230100001,
        "0001193125-23-000001",
        "0000123456",
        "ACME CORP",
        "2023-01-31T16:30:00-05:00",
    );
    for (name, store) in &stores {
        store
            .upsert(
                Collection::Filings,
                std::slice::from_ref(&row),
                UpsertAction::Insert,
                None,
                None,
            )
            .await
            .unwrap();
        // Same key again.
        let again = store
            .upsert(
                Collection::Filings,
                std::slice::from_ref(&row),
                UpsertAction::Insert,
                None,
                None,
            )
            .await;
        assert!(again.is_err(), "{}: re-insert must fail", name);
        // Duplicate inside one batch.
        let fresh = filing(
            20230100009,
            "0001193125-23-000009",
            "0000123456",
            "ACME CORP",
            "2023-01-31T16:30:00-05:00",
        );
        let batch = vec![fresh.clone(), fresh];
        assert!(
            store
                .upsert(Collection::Filings, &batch, UpsertAction::Insert, None, None)
                .await
                .is_err(),
            "{}: batch-internal duplicate must fail",
            name
        );
    }
}

#[tokio::test]
async fn duplicate_detection_keeps_the_minimum_filing_id_canonical() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir).await;
    let shared = "0001193125-23-000001";
    for (name, store) in &stores {
        let rows = vec![
            filing(20230100001, shared, "0000123456", "ACME CORP", "2023-01-31T16:30:00-05:00"),
            filing(20230100050, shared, "0000123456", "ACME CORP", "2023-01-31T16:30:00-05:00"),
            filing(
                20230100002,
                "0001193125-23-000002",
                "0000654321",
                "OTHER CORP",
                "2023-01-31T17:00:00-05:00",
            ),
        ];
        store
            .upsert(Collection::Filings, &rows, UpsertAction::Insert, None, None)
            .await
            .unwrap();
        let files = vec![file(20230100050, 1), file(20230100050, 2)];
        store
            .upsert(Collection::Files, &files, UpsertAction::Insert, None, None)
            .await
            .unwrap();

        let dup_ids = store.duplicate_filing_ids().await.unwrap();
        assert_eq!(dup_ids, vec![20230100050], "{}", name);

        let flags: Vec<Value> = dup_ids
            .iter()
            .map(|id| json!({ "filingId": id, "duplicate": 1 }))
            .collect();
        let filings_updated = store
            .upsert(
                Collection::Filings,
                &flags,
                UpsertAction::Update,
                Some(&["duplicate"]),
                Some(&["filingId"]),
            )
            .await
            .unwrap();
        assert_eq!(filings_updated.updated, 1, "{}", name);
        // The flag propagates to every file of the flagged filing.
        let files_updated = store
            .upsert(
                Collection::Files,
                &flags,
                UpsertAction::Update,
                Some(&["duplicate"]),
                Some(&["filingId"]),
            )
            .await
            .unwrap();
        assert_eq!(files_updated.updated, 2, "{}", name);

        // Exactly one row per accession keeps duplicate=0 afterwards.
        assert!(store.duplicate_filing_ids().await.unwrap().is_empty(), "{}", name);
        let rows = store
            .get_by_ids(Collection::Filings, &[20230100001, 20230100050])
            .await
            .unwrap();
        assert_eq!(rows[0].get("duplicate"), Some(&json!(0)), "{}", name);
        assert_eq!(rows[1].get("duplicate"), Some(&json!(1)), "{}", name);
    }
}

#[tokio::test]
async fn feed_queries_agree_between_backends() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir).await;
    let feed = json!({
        "feedId": 202301,
        "feedMonth": "2023-01-31",
        "link": "https://example.invalid/xbrlrss-2023-01.xml",
        "lastModifiedDate": "2023-02-01T10:00:00-05:00"
    });
    let filings = vec![
        filing(20230100001, "0001193125-23-000001", "0000123456", "ACME CORP", "2023-01-31T16:30:00-05:00"),
        filing(20230100002, "0001193125-23-000002", "0000654321", "OTHER CORP", "2023-01-31T17:00:00-05:00"),
    ];
    let mut observed = Vec::new();
    for (_, store) in &stores {
        store
            .upsert(
                Collection::Feeds,
                std::slice::from_ref(&feed),
                UpsertAction::Insert,
                None,
                None,
            )
            .await
            .unwrap();
        store
            .upsert(Collection::Filings, &filings, UpsertAction::Insert, None, None)
            .await
            .unwrap();
        let mut accessions: Vec<String> = store
            .accession_numbers_for_feed(202301)
            .await
            .unwrap()
            .into_iter()
            .collect();
        accessions.sort();
        observed.push((
            store.existing_feed_ids().await.unwrap(),
            store.feed_comparison_dates().await.unwrap(),
            accessions,
            store.max_filing_id(202301).await.unwrap(),
            store.max_filing_id(209912).await.unwrap(),
            store.distinct_filing_ciks().await.unwrap(),
        ));
    }
    assert_eq!(observed[0], observed[1]);
    assert_eq!(observed[0].0, vec![202301]);
    assert_eq!(observed[0].3, Some(20230100002));
    assert_eq!(observed[0].4, None);
    assert_eq!(observed[0].5, vec!["0000123456", "0000654321"]);
}

#[tokio::test]
async fn attribute_search_agrees_between_backends_and_feeds_the_rebuilder() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir).await;
    let filings = vec![
        filing(20230100001, "0001193125-23-000001", "0000123456", "ACME CORP", "2023-01-31T16:30:00-05:00"),
        filing(20230100002, "0001193125-23-000002", "0000654321", "OTHER CORP", "2023-01-31T17:00:00-05:00"),
        filing(20230200001, "0001193125-23-000003", "0000123456", "ACME CORP", "2023-02-15T12:00:00-05:00"),
    ];
    let files = vec![file(20230100001, 1), file(20230200001, 1)];
    let mut observed = Vec::new();
    for (name, store) in &stores {
        store
            .upsert(Collection::Filings, &filings, UpsertAction::Insert, None, None)
            .await
            .unwrap();
        store
            .upsert(Collection::Files, &files, UpsertAction::Insert, None, None)
            .await
            .unwrap();
        let by_cik = store
            .search(Collection::Filings, &json!({ "cikNumber": "0000123456" }))
            .await
            .unwrap();
        let ids: Vec<i64> = by_cik
            .iter()
            .map(|r| r.get("filingId").and_then(Value::as_i64).unwrap())
            .collect();
        assert_eq!(ids, vec![20230100001, 20230200001], "{}", name);
        // Multiple criteria narrow with AND semantics.
        let narrowed = store
            .search(
                Collection::Filings,
                &json!({ "cikNumber": "0000123456", "feedId": 202301 }),
            )
            .await
            .unwrap();
        assert_eq!(narrowed.len(), 1, "{}", name);
        let by_file = store
            .search(Collection::Files, &json!({ "filingId": 20230200001_i64 }))
            .await
            .unwrap();
        assert_eq!(by_file.len(), 1, "{}", name);
        assert!(
            store.search(Collection::Filings, &json!({})).await.is_err(),
            "{}: empty criteria must fail",
            name
        );
        observed.push((by_cik, by_file));
    }
    assert_eq!(observed[0], observed[1]);
    // Search output is exactly what the document rebuilder consumes.
    let (filing_rows, file_rows) = &observed[0];
    let xml = build_feed_document(filing_rows, file_rows).unwrap();
    assert!(xml.contains("0001193125-23-000001"));
    assert!(xml.contains("0001193125-23-000003"));
    assert!(!xml.contains("0001193125-23-000002"));
}

#[tokio::test]
async fn rename_candidates_surface_former_names_newest_first() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir).await;
    let filer = json!({
        "cikNumber": "0000123456",
        "conformedName": "Old Co",
        "formerNames": [
            { "name": "Mid Co", "date": "2020-06-01" },
            { "name": "Ancient Co", "date": "2010-01-01" }
        ],
        "country": "US"
    });
    let mut per_backend = Vec::new();
    for (name, store) in &stores {
        store
            .upsert(
                Collection::Filers,
                std::slice::from_ref(&filer),
                UpsertAction::Insert,
                None,
                None,
            )
            .await
            .unwrap();
        let rows = vec![filing(
            20230100001,
            "0001193125-23-000001",
            "0000123456",
            "New Co",
            "2023-01-31T16:30:00-05:00",
        )];
        store
            .upsert(Collection::Filings, &rows, UpsertAction::Insert, None, None)
            .await
            .unwrap();
        let candidates = store.rename_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1, "{}", name);
        let candidate = &candidates[0];
        assert_eq!(candidate.company_name, "New Co");
        assert_eq!(candidate.conformed_name, "Old Co");
        let names: Vec<&str> = candidate
            .former_names
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["Mid Co", "Ancient Co"], "{}", name);
        per_backend.push(candidates);
    }
    assert_eq!(per_backend[0], per_backend[1]);
}

#[tokio::test]
async fn case_matching_names_are_not_rename_candidates() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir).await;
    let filer = json!({ "cikNumber": "0000123456", "conformedName": "ACME CORP" });
    for (name, store) in &stores {
        store
            .upsert(
                Collection::Filers,
                std::slice::from_ref(&filer),
                UpsertAction::Insert,
                None,
                None,
            )
            .await
            .unwrap();
        let rows = vec![filing(
            20230100001,
            "0001193125-23-000001",
            "0000123456",
            "Acme Corp",
            "2023-01-31T16:30:00-05:00",
        )];
        store
            .upsert(Collection::Filings, &rows, UpsertAction::Insert, None, None)
            .await
            .unwrap();
        assert!(store.rename_candidates().await.unwrap().is_empty(), "{}", name);
    }
}

#[tokio::test]
async fn sync_state_and_clear_behave_identically() {
    let dir = TempDir::new().unwrap();
    let stores = open_stores(&dir).await;
    for (name, store) in &stores {
        assert_eq!(store.last_update().await.unwrap(), None, "{}", name);
        let stamp = json!({ "id": 0, "lastUpdate": "2023-02-01T12:00:00+00:00" });
        let stats = store
            .upsert(
                Collection::SyncState,
                std::slice::from_ref(&stamp),
                UpsertAction::Update,
                Some(&["lastUpdate"]),
                Some(&["id"]),
            )
            .await
            .unwrap();
        assert_eq!(stats.updated, 1, "{}", name);
        let read = store.last_update().await.unwrap().unwrap();
        assert_eq!(read.to_rfc3339(), "2023-02-01T12:00:00+00:00");

        let mappings = vec![
            json!({ "tickerSymbol": "aapl", "cikNumber": "0000320193" }),
            json!({ "tickerSymbol": "msft", "cikNumber": "0000789019" }),
        ];
        store
            .upsert(
                Collection::TickerMapping,
                &mappings,
                UpsertAction::Insert,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(store.count(Collection::TickerMapping).await.unwrap(), 2);
        assert_eq!(
            store.clear_collection(Collection::TickerMapping).await.unwrap(),
            2,
            "{}",
            name
        );
        assert_eq!(store.count(Collection::TickerMapping).await.unwrap(), 0);
    }
}
