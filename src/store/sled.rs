use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use itertools::Itertools;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::{record_key, scalar_to_string, Collection, Store, UpsertAction, UpsertStats};
use crate::model::{FormerName, RenameCandidate};

/// Document-store backend: one sled tree per collection, JSON-encoded
/// records keyed by the collection's primary field. Writes for one feed are
/// not atomically transactional across records; a partial failure surfaces
/// as an error.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("failed to open document store at {:?}", path))?;
        Ok(Self { db })
    }

    fn tree(&self, collection: Collection) -> Result<sled::Tree> {
        self.db
            .open_tree(collection.name())
            .map_err(Into::into)
    }

    fn scan(&self, collection: Collection) -> Result<Vec<Value>> {
        let tree = self.tree(collection)?;
        let mut records = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (_, bytes) = entry?;
            records.push(serde_json::from_slice(&bytes)?);
        }
        Ok(records)
    }
}

/// Restricts a record to the collection's field universe, padding absent
/// fields with null so both backends store the same document shape.
fn normalize(collection: Collection, record: &Value) -> Result<Value> {
    let obj = record
        .as_object()
        .ok_or_else(|| anyhow!("record for {} is not an object", collection.name()))?;
    let mut out = Map::new();
    for column in collection.columns() {
        out.insert(
            (*column).to_string(),
            obj.get(*column).cloned().unwrap_or(Value::Null),
        );
    }
    Ok(Value::Object(out))
}

fn get_str(record: &Value, field: &str) -> Option<String> {
    match record.get(field) {
        Some(Value::Null) | None => None,
        Some(v) => Some(scalar_to_string(v)),
    }
}

fn get_i64(record: &Value, field: &str) -> Option<i64> {
    record.get(field).and_then(Value::as_i64)
}

fn parse_date(record: &Value, field: &str) -> Option<DateTime<FixedOffset>> {
    get_str(record, field).and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
}

#[async_trait]
impl Store for SledStore {
    async fn ensure_schema(&self) -> Result<()> {
        for collection in Collection::ALL {
            let tree = self.tree(collection)?;
            if collection == Collection::SyncState && tree.is_empty() {
                let seed = serde_json::json!({ "id": 0, "lastUpdate": Value::Null });
                tree.insert(b"0", serde_json::to_vec(&seed)?)?;
            }
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
        let mut stats = UpsertStats::default();
        if records.is_empty() {
            return Ok(stats);
        }
        let tree = self.tree(collection)?;
        match action {
            UpsertAction::Insert => {
                let primary = [collection.primary_field()];
                let mut seen: HashSet<String> = HashSet::new();
                for record in records {
                    let key = record_key(record, &primary)?;
                    if !seen.insert(key.clone()) || tree.contains_key(key.as_bytes())? {
                        return Err(anyhow!(
                            "duplicate key {} in {}",
                            key,
                            collection.name()
                        ));
                    }
                    let doc = normalize(collection, record)?;
                    tree.insert(key.as_bytes(), serde_json::to_vec(&doc)?)?;
                    stats.inserted += 1;
                }
            }
            UpsertAction::Update => {
                let primary = [collection.primary_field()];
                let keys: &[&str] = natural_keys.unwrap_or(&primary);
                for record in records {
                    let fields: Vec<&str> = match update_fields {
                        Some(fields) => fields.to_vec(),
                        None => super::present_fields(collection, record),
                    };
                    if fields.is_empty() {
                        return Err(anyhow!("no fields to update in {}", collection.name()));
                    }
                    // Match on the natural key: direct lookup when it is the
                    // primary field, otherwise a filtered scan (update_many).
                    let matches: Vec<sled::IVec> = if keys == primary {
                        let key = record_key(record, keys)?;
                        tree.get(key.as_bytes())?
                            .map(|_| sled::IVec::from(key.as_bytes()))
                            .into_iter()
                            .collect()
                    } else {
                        let wanted = record_key(record, keys)?;
                        let mut found = Vec::new();
                        for entry in tree.iter() {
                            let (k, bytes) = entry?;
                            let doc: Value = serde_json::from_slice(&bytes)?;
                            if record_key(&doc, keys).map(|dk| dk == wanted).unwrap_or(false) {
                                found.push(k);
                            }
                        }
                        found
                    };
                    for key in matches {
                        let bytes = tree
                            .get(&key)?
                            .ok_or_else(|| anyhow!("document vanished during update"))?;
                        let mut doc: Value = serde_json::from_slice(&bytes)?;
                        let obj = doc
                            .as_object_mut()
                            .ok_or_else(|| anyhow!("stored document is not an object"))?;
                        for field in &fields {
                            obj.insert(
                                (*field).to_string(),
                                record.get(*field).cloned().unwrap_or(Value::Null),
                            );
                        }
                        tree.insert(&key, serde_json::to_vec(&doc)?)?;
                        stats.updated += 1;
                    }
                }
            }
        }
        tree.flush_async().await?;
        Ok(stats)
    }

    async fn existing_feed_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .scan(Collection::Feeds)?
            .iter()
            .filter_map(|r| get_i64(r, "feedId"))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn feed_comparison_dates(
        &self,
    ) -> Result<HashMap<i64, Option<DateTime<FixedOffset>>>> {
        let mut map = HashMap::new();
        for record in self.scan(Collection::Feeds)? {
            if let Some(id) = get_i64(&record, "feedId") {
                map.insert(id, parse_date(&record, "lastModifiedDate"));
            }
        }
        Ok(map)
    }

    async fn accession_numbers_for_feed(&self, feed_id: i64) -> Result<HashSet<String>> {
        Ok(self
            .scan(Collection::Filings)?
            .iter()
            .filter(|r| get_i64(r, "feedId") == Some(feed_id))
            .filter_map(|r| get_str(r, "accessionNumber"))
            .collect())
    }

    async fn max_filing_id(&self, feed_id: i64) -> Result<Option<i64>> {
        Ok(self
            .scan(Collection::Filings)?
            .iter()
            .filter(|r| get_i64(r, "feedId") == Some(feed_id))
            .filter_map(|r| get_i64(r, "filingId"))
            .max())
    }

    async fn distinct_filing_ciks(&self) -> Result<Vec<String>> {
        Ok(self
            .scan(Collection::Filings)?
            .iter()
            .filter_map(|r| get_str(r, "cikNumber"))
            .unique()
            .sorted()
            .collect())
    }

    async fn distinct_filer_ciks(&self) -> Result<Vec<String>> {
        Ok(self
            .scan(Collection::Filers)?
            .iter()
            .filter_map(|r| get_str(r, "cikNumber"))
            .unique()
            .sorted()
            .collect())
    }

    async fn rename_candidates(&self) -> Result<Vec<RenameCandidate>> {
        // Latest filing per CIK, then join against stored filers.
        let mut latest: HashMap<String, (i64, Value)> = HashMap::new();
        for record in self.scan(Collection::Filings)? {
            let cik = match get_str(&record, "cikNumber") {
                Some(cik) => cik,
                None => continue,
            };
            let id = get_i64(&record, "filingId").unwrap_or(i64::MIN);
            match latest.get(&cik) {
                Some((existing, _)) if *existing >= id => {}
                _ => {
                    latest.insert(cik, (id, record));
                }
            }
        }
        let mut filers: HashMap<String, Value> = HashMap::new();
        for record in self.scan(Collection::Filers)? {
            if let Some(cik) = get_str(&record, "cikNumber") {
                filers.insert(cik, record);
            }
        }
        let mut candidates = Vec::new();
        for (cik, (_, filing)) in latest.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            let filer = match filers.get(cik) {
                Some(filer) => filer,
                None => continue,
            };
            let company_name = match get_str(filing, "companyName") {
                Some(name) => name,
                None => continue,
            };
            let conformed_name = match get_str(filer, "conformedName") {
                Some(name) => name,
                None => continue,
            };
            if company_name.to_lowercase() == conformed_name.to_lowercase() {
                continue;
            }
            let former_names: Vec<FormerName> = filer
                .get("formerNames")
                .cloned()
                .map(|v| serde_json::from_value(v).unwrap_or_default())
                .unwrap_or_default();
            candidates.push(RenameCandidate {
                cik_number: cik.clone(),
                company_name,
                conformed_name,
                former_names,
                pub_date: parse_date(filing, "pubDate"),
            });
        }
        Ok(candidates)
    }

    async fn duplicate_filing_ids(&self) -> Result<Vec<i64>> {
        let filings = self.scan(Collection::Filings)?;
        let groups = filings
            .iter()
            .filter(|r| get_i64(r, "duplicate") == Some(0))
            .filter_map(|r| {
                let accession = get_str(r, "accessionNumber")?;
                let id = get_i64(r, "filingId")?;
                Some((accession, id))
            })
            .into_group_map();
        let mut duplicates = Vec::new();
        for (_, mut ids) in groups {
            if ids.len() > 1 {
                ids.sort_unstable();
                duplicates.extend(ids.into_iter().skip(1));
            }
        }
        duplicates.sort_unstable();
        Ok(duplicates)
    }

    async fn get_by_ids(&self, collection: Collection, ids: &[i64]) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Err(anyhow!("no ids to get"));
        }
        let tree = self.tree(collection)?;
        let mut records = Vec::new();
        for id in ids.iter().sorted() {
            if let Some(bytes) = tree.get(id.to_string().as_bytes())? {
                records.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(records)
    }

    async fn search(&self, collection: Collection, criteria: &Value) -> Result<Vec<Value>> {
        let fields = super::present_fields(collection, criteria);
        if fields.is_empty() {
            return Err(anyhow!("no searchable fields for {}", collection.name()));
        }
        let mut matches: Vec<Value> = self
            .scan(collection)?
            .into_iter()
            .filter(|record| fields.iter().all(|f| record.get(*f) == criteria.get(*f)))
            .collect();
        let primary = collection.primary_field();
        matches.sort_by(|a, b| match (get_i64(a, primary), get_i64(b, primary)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => get_str(a, primary).cmp(&get_str(b, primary)),
        });
        Ok(matches)
    }

    async fn clear_collection(&self, collection: Collection) -> Result<u64> {
        let tree = self.tree(collection)?;
        let count = tree.len() as u64;
        tree.clear()?;
        Ok(count)
    }

    async fn count(&self, collection: Collection) -> Result<u64> {
        Ok(self.tree(collection)?.len() as u64)
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>> {
        let tree = self.tree(Collection::SyncState)?;
        let record = match tree.get(b"0")? {
            Some(bytes) => serde_json::from_slice::<Value>(&bytes)?,
            None => return Ok(None),
        };
        Ok(get_str(&record, "lastUpdate")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}
