use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use log::debug;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{query::Query, Row, Sqlite, SqlitePool, Transaction};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use super::{
    present_fields, Collection, FeedBatch, FeedWriteStats, Store, UpsertAction, UpsertStats,
};
use crate::model::{FormerName, RenameCandidate};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS "feedsInfo" (
        "feedId" INTEGER PRIMARY KEY,
        "feedMonth" TEXT,
        "title" TEXT,
        "link" TEXT,
        "feedLink" TEXT,
        "description" TEXT,
        "language" TEXT,
        "pubDate" TEXT,
        "lastBuildDate" TEXT,
        "lastModifiedDate" TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "filingsInfo" (
        "filingId" INTEGER PRIMARY KEY,
        "feedId" INTEGER,
        "filingLink" TEXT,
        "entryPoint" TEXT,
        "enclosureUrl" TEXT,
        "enclosureSize" INTEGER,
        "pubDate" TEXT,
        "companyName" TEXT,
        "formType" TEXT,
        "inlineXBRL" INTEGER,
        "filingDate" TEXT,
        "cikNumber" TEXT,
        "accessionNumber" TEXT,
        "fileNumber" TEXT,
        "acceptanceDatetime" TEXT,
        "period" TEXT,
        "assignedSic" INTEGER,
        "assistantDirector" TEXT,
        "fiscalYearEnd" TEXT,
        "fiscalYearEndMonth" INTEGER,
        "fiscalYearEndDay" INTEGER,
        "duplicate" INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "filesInfo" (
        "fileId" INTEGER PRIMARY KEY,
        "filingId" INTEGER,
        "feedId" INTEGER,
        "accessionNumber" TEXT,
        "sequence" INTEGER,
        "file" TEXT,
        "type" TEXT,
        "size" INTEGER,
        "description" TEXT,
        "inlineXBRL" INTEGER,
        "url" TEXT,
        "type_tag" TEXT,
        "duplicate" INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "filersInfo" (
        "cikNumber" TEXT PRIMARY KEY,
        "formerNames" TEXT,
        "industry_code" TEXT,
        "industry_description" TEXT,
        "stateOfIncorporation" TEXT,
        "mailingState" TEXT,
        "mailingCity" TEXT,
        "mailingZip" TEXT,
        "conformedName" TEXT,
        "businessCity" TEXT,
        "businessState" TEXT,
        "businessZip" TEXT,
        "country" TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "rssItems" (
        "filingId" INTEGER PRIMARY KEY,
        "rssItem" TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "cikTickerMapping" (
        "tickerSymbol" TEXT PRIMARY KEY,
        "cikNumber" TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS "lastUpdate" (
        "id" INTEGER PRIMARY KEY,
        "lastUpdate" TEXT
    )"#,
    r#"CREATE VIEW IF NOT EXISTS v_duplicate_filings AS
    SELECT f."filingId" AS "filingId"
    FROM "filingsInfo" f
    JOIN (
        SELECT "accessionNumber", MIN("filingId") AS keepId
        FROM "filingsInfo"
        WHERE "duplicate" = 0 AND "accessionNumber" IS NOT NULL
        GROUP BY "accessionNumber"
        HAVING COUNT(*) > 1
    ) d ON f."accessionNumber" = d."accessionNumber" AND f."filingId" <> d.keepId
    WHERE f."duplicate" = 0"#,
    r#"INSERT OR IGNORE INTO "lastUpdate" ("id", "lastUpdate") VALUES (0, NULL)"#,
];

/// Integer-typed columns; everything else is TEXT.
fn integer_columns(collection: Collection) -> &'static [&'static str] {
    match collection {
        Collection::Feeds => &["feedId"],
        Collection::Filings => &[
            "filingId",
            "feedId",
            "enclosureSize",
            "inlineXBRL",
            "assignedSic",
            "fiscalYearEndMonth",
            "fiscalYearEndDay",
            "duplicate",
        ],
        Collection::Files => &[
            "fileId",
            "filingId",
            "feedId",
            "sequence",
            "size",
            "inlineXBRL",
            "duplicate",
        ],
        Collection::RawItems => &["filingId"],
        Collection::SyncState => &["id"],
        Collection::Filers | Collection::TickerMapping => &[],
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url`, e.g.
    /// `sqlite://rssdb.sqlite` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid sqlite url {}", url))?
            .create_if_missing(true);
        // An in-memory database exists per connection, so the pool must not
        // hand out more than one.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: Option<&Value>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        None | Some(Value::Null) => query.bind(None::<String>),
        Some(Value::Bool(b)) => query.bind(*b as i64),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64())
            }
        }
        Some(Value::String(s)) => query.bind(s.clone()),
        // Nested structures (formerNames) are stored as JSON text.
        Some(other) => query.bind(other.to_string()),
    }
}

async fn upsert_in(
    tx: &mut Transaction<'_, Sqlite>,
    collection: Collection,
    records: &[Value],
    action: UpsertAction,
    update_fields: Option<&[&str]>,
    natural_keys: Option<&[&str]>,
) -> Result<UpsertStats> {
    let mut stats = UpsertStats::default();
    if records.is_empty() {
        return Ok(stats);
    }
    let table = collection.name();
    match action {
        UpsertAction::Insert => {
            let columns = collection.columns();
            let column_list = columns
                .iter()
                .map(|c| format!("\"{}\"", c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                table, column_list, placeholders
            );
            for record in records {
                let mut query = sqlx::query(&sql);
                for column in columns {
                    query = bind_json(query, record.get(*column));
                }
                let result = query.execute(&mut **tx).await?;
                stats.inserted += result.rows_affected();
            }
        }
        UpsertAction::Update => {
            let primary = [collection.primary_field()];
            let keys: &[&str] = natural_keys.unwrap_or(&primary);
            for record in records {
                let fields: Vec<&str> = match update_fields {
                    Some(fields) => fields.to_vec(),
                    None => present_fields(collection, record),
                };
                if fields.is_empty() {
                    return Err(anyhow!("no fields to update in {}", table));
                }
                let set_list = fields
                    .iter()
                    .map(|f| format!("\"{}\" = ?", f))
                    .collect::<Vec<_>>()
                    .join(", ");
                let where_list = keys
                    .iter()
                    .map(|k| format!("\"{}\" = ?", k))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let sql = format!(
                    "UPDATE \"{}\" SET {} WHERE {}",
                    table, set_list, where_list
                );
                let mut query = sqlx::query(&sql);
                for field in &fields {
                    query = bind_json(query, record.get(*field));
                }
                for key in keys {
                    let v = record
                        .get(*key)
                        .ok_or_else(|| anyhow!("record is missing key field {}", key))?;
                    query = bind_json(query, Some(v));
                }
                let result = query.execute(&mut **tx).await?;
                stats.updated += result.rows_affected();
            }
        }
    }
    Ok(stats)
}

fn row_to_json(collection: Collection, row: &sqlx::sqlite::SqliteRow) -> Result<Value> {
    let integers = integer_columns(collection);
    let mut object = Map::new();
    for column in collection.columns() {
        let value = if integers.contains(column) {
            match row.try_get::<Option<i64>, _>(*column)? {
                Some(i) => Value::from(i),
                None => Value::Null,
            }
        } else {
            match row.try_get::<Option<String>, _>(*column)? {
                Some(s) => {
                    // formerNames round-trips as a JSON array.
                    if *column == "formerNames" {
                        serde_json::from_str(&s).unwrap_or(Value::String(s))
                    } else {
                        Value::String(s)
                    }
                }
                None => Value::Null,
            }
        };
        object.insert((*column).to_string(), value);
    }
    Ok(Value::Object(object))
}

#[async_trait]
impl Store for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert(
        &self,
        collection: Collection,
        records: &[Value],
        action: UpsertAction,
        update_fields: Option<&[&str]>,
        natural_keys: Option<&[&str]>,
    ) -> Result<UpsertStats> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        let stats = upsert_in(&mut tx, collection, records, action, update_fields, natural_keys)
            .await?;
        tx.commit().await?;
        debug!(
            "{}: inserted {} updated {}",
            collection.name(),
            stats.inserted,
            stats.updated
        );
        Ok(stats)
    }

    async fn apply_feed(&self, batch: &FeedBatch) -> Result<FeedWriteStats> {
        self.ensure_schema().await?;
        let mut stats = FeedWriteStats::default();
        // Dropping the transaction without a commit rolls everything back.
        let mut tx = self.pool.begin().await?;
        if let Some((feed, action)) = &batch.feed {
            stats.feeds = upsert_in(
                &mut tx,
                Collection::Feeds,
                std::slice::from_ref(feed),
                *action,
                None,
                None,
            )
            .await?;
        }
        stats.filings = upsert_in(
            &mut tx,
            Collection::Filings,
            &batch.filings,
            UpsertAction::Insert,
            None,
            None,
        )
        .await?;
        stats.files = upsert_in(
            &mut tx,
            Collection::Files,
            &batch.files,
            UpsertAction::Insert,
            None,
            None,
        )
        .await?;
        stats.raw_items = upsert_in(
            &mut tx,
            Collection::RawItems,
            &batch.raw_items,
            UpsertAction::Insert,
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(stats)
    }

    async fn existing_feed_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(r#"SELECT "feedId" FROM "feedsInfo" ORDER BY "feedId""#)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
    }

    async fn feed_comparison_dates(
        &self,
    ) -> Result<HashMap<i64, Option<DateTime<FixedOffset>>>> {
        let rows =
            sqlx::query(r#"SELECT "feedId", "lastModifiedDate" FROM "feedsInfo""#)
                .fetch_all(&self.pool)
                .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get(0);
            let stamp: Option<String> = row.get(1);
            let parsed = stamp.and_then(|s| DateTime::parse_from_rfc3339(&s).ok());
            map.insert(id, parsed);
        }
        Ok(map)
    }

    async fn accession_numbers_for_feed(&self, feed_id: i64) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            r#"SELECT "accessionNumber" FROM "filingsInfo"
               WHERE "feedId" = ? AND "accessionNumber" IS NOT NULL"#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    async fn max_filing_id(&self, feed_id: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"SELECT MAX("filingId") FROM "filingsInfo" WHERE "feedId" = ?"#,
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<Option<i64>, _>(0))
    }

    async fn distinct_filing_ciks(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"SELECT DISTINCT "cikNumber" FROM "filingsInfo"
               WHERE "cikNumber" IS NOT NULL ORDER BY "cikNumber""#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    async fn distinct_filer_ciks(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"SELECT DISTINCT "cikNumber" FROM "filersInfo" ORDER BY "cikNumber""#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    async fn rename_candidates(&self) -> Result<Vec<RenameCandidate>> {
        let rows = sqlx::query(
            r#"SELECT a."cikNumber", a."companyName", b."conformedName", b."formerNames", a."pubDate"
               FROM (
                   SELECT t1."cikNumber", t1."companyName", t1."pubDate"
                   FROM "filingsInfo" t1
                   JOIN (
                       SELECT "cikNumber", MAX("filingId") AS maxId
                       FROM "filingsInfo"
                       WHERE "cikNumber" IS NOT NULL
                       GROUP BY "cikNumber"
                   ) t2 ON t1."cikNumber" = t2."cikNumber" AND t1."filingId" = t2.maxId
               ) a
               JOIN "filersInfo" b ON a."cikNumber" = b."cikNumber"
               WHERE a."companyName" IS NOT NULL
                 AND b."conformedName" IS NOT NULL
                 AND lower(a."companyName") <> lower(b."conformedName")
               ORDER BY a."cikNumber""#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let former_raw: Option<String> = row.get(3);
            let former_names: Vec<FormerName> = match former_raw {
                Some(s) => serde_json::from_str(&s).unwrap_or_default(),
                None => Vec::new(),
            };
            let pub_date: Option<String> = row.get(4);
            candidates.push(RenameCandidate {
                cik_number: row.get(0),
                company_name: row.get(1),
                conformed_name: row.get(2),
                former_names,
                pub_date: pub_date.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()),
            });
        }
        Ok(candidates)
    }

    async fn duplicate_filing_ids(&self) -> Result<Vec<i64>> {
        let rows =
            sqlx::query(r#"SELECT "filingId" FROM v_duplicate_filings ORDER BY "filingId""#)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
    }

    async fn get_by_ids(&self, collection: Collection, ids: &[i64]) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Err(anyhow!("no ids to get"));
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" IN ({}) ORDER BY \"{}\"",
            collection.name(),
            collection.primary_field(),
            placeholders,
            collection.primary_field()
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|r| row_to_json(collection, r)).collect()
    }

    async fn search(&self, collection: Collection, criteria: &Value) -> Result<Vec<Value>> {
        let fields = present_fields(collection, criteria);
        if fields.is_empty() {
            return Err(anyhow!("no searchable fields for {}", collection.name()));
        }
        let where_list = fields
            .iter()
            .map(|f| format!("\"{}\" = ?", f))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE {} ORDER BY \"{}\"",
            collection.name(),
            where_list,
            collection.primary_field()
        );
        let mut query = sqlx::query(&sql);
        for field in &fields {
            query = bind_json(query, criteria.get(*field));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|r| row_to_json(collection, r)).collect()
    }

    async fn clear_collection(&self, collection: Collection) -> Result<u64> {
        let sql = format!("DELETE FROM \"{}\"", collection.name());
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, collection: Collection) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", collection.name());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(r#"SELECT "lastUpdate" FROM "lastUpdate" WHERE "id" = 0"#)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<String>, _>(0))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}
