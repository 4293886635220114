use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use log::{debug, info, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use std::time::Duration;

use crate::model::{self, Filer, FormerName, RenameCandidate};
use crate::store::{Collection, Store, UpsertAction, UpsertStats};
use crate::utils::RateLimiter;

pub mod states;

/// Hard cap on concurrent profile requests; the external service allows
/// roughly ten requests per second.
pub const MAX_PROFILE_WORKERS: usize = 4;
/// CIKs are fetched and upserted in patches of this size.
pub const PATCH_SIZE: usize = 100;
const SEQUENTIAL_DELAY: Duration = Duration::from_millis(100);

const PROFILE_URL: &str =
    "https://www.sec.gov/cgi-bin/browse-edgar?CIK={cik}&action=getcompany&output=atom";

/// Fetches one registrant profile by CIK.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch(&self, cik: &str) -> Result<Filer>;
}

/// Default fetcher against the registrant directory's atom endpoint.
pub struct EdgarProfileFetcher {
    client: Client,
    user_agent: String,
    timeout: Duration,
}

impl EdgarProfileFetcher {
    pub fn new(client: Client, user_agent: String, timeout: Duration) -> Self {
        Self {
            client,
            user_agent,
            timeout,
        }
    }
}

#[async_trait]
impl ProfileFetcher for EdgarProfileFetcher {
    async fn fetch(&self, cik: &str) -> Result<Filer> {
        let url = PROFILE_URL.replace("{cik}", cik);
        let _permit = RateLimiter::sec().acquire().await;
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{} returned status {}", url, status));
        }
        let body = response.text().await?;
        parse_profile_xml(&body, cik)
    }
}

fn parse_profile_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

/// Parses a profile document into a filer record. Former names are kept
/// newest-first.
pub fn parse_profile_xml(xml: &str, requested_cik: &str) -> Result<Filer> {
    let mut reader = Reader::from_str(xml);
    let mut filer = Filer {
        cik_number: requested_cik.to_string(),
        conformed_name: None,
        former_names: Vec::new(),
        industry_code: None,
        industry_description: None,
        state_of_incorporation: None,
        mailing_city: None,
        mailing_state: None,
        mailing_zip: None,
        business_city: None,
        business_state: None,
        business_zip: None,
        country: None,
    };
    let mut address_type: Option<String> = None;
    let mut in_former_names = false;
    let mut current: Option<String> = None;
    let mut former_name_values: Vec<String> = Vec::new();
    let mut former_date_values: Vec<String> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "address" => {
                        address_type = e
                            .attributes()
                            .filter_map(|a| a.ok())
                            .find(|a| a.key.local_name().as_ref() == b"type")
                            .and_then(|a| a.unescape_value().ok())
                            .map(|v| v.into_owned());
                    }
                    "formerly-names" => in_former_names = true,
                    _ => {}
                }
                current = Some(name);
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let tag = match &current {
                    Some(tag) => tag.as_str(),
                    None => continue,
                };
                if in_former_names {
                    match tag {
                        "name" => former_name_values.push(text.to_string()),
                        "date" => former_date_values.push(text.to_string()),
                        _ => {}
                    }
                    continue;
                }
                match tag {
                    "conformed-name" => filer.conformed_name = Some(text.to_string()),
                    "cik" => filer.cik_number = text.to_string(),
                    "assigned-sic" => filer.industry_code = Some(text.to_string()),
                    "assigned-sic-desc" => {
                        filer.industry_description = Some(text.to_string())
                    }
                    "state-of-incorporation" => {
                        filer.state_of_incorporation = Some(text.to_string())
                    }
                    "city" | "state" | "zip" => match address_type.as_deref() {
                        Some("mailing") => match tag {
                            "city" => filer.mailing_city = Some(text.to_string()),
                            "state" => filer.mailing_state = Some(text.to_string()),
                            _ => filer.mailing_zip = Some(text.to_string()),
                        },
                        Some("business") => match tag {
                            "city" => filer.business_city = Some(text.to_string()),
                            "state" => filer.business_state = Some(text.to_string()),
                            _ => filer.business_zip = Some(text.to_string()),
                        },
                        _ => {}
                    },
                    _ => {}
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "address" => address_type = None,
                    "formerly-names" => in_former_names = false,
                    _ => {}
                }
                current = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if filer.conformed_name.is_none() {
        return Err(anyhow!("profile for cik {} has no company info", requested_cik));
    }
    let mut former_names: Vec<FormerName> = former_name_values
        .into_iter()
        .zip(former_date_values)
        .filter_map(|(name, date)| {
            parse_profile_date(&date).map(|date| FormerName { name, date })
        })
        .collect();
    former_names.sort_by(|a, b| b.date.cmp(&a.date));
    filer.former_names = former_names;
    filer.country = states::country_for(
        filer.business_state.as_deref(),
        filer.mailing_state.as_deref(),
    );
    Ok(filer)
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub retrieved: Vec<Filer>,
    pub missing: Vec<String>,
}

async fn fetch_round(
    fetcher: &dyn ProfileFetcher,
    ciks: &[String],
    workers: usize,
    sequential: bool,
) -> FetchOutcome {
    let mut outcome = FetchOutcome::default();
    if sequential {
        for cik in ciks {
            match fetcher.fetch(cik).await {
                Ok(filer) => outcome.retrieved.push(filer),
                Err(e) => {
                    debug!("could not retrieve cik {}: {:#}", cik, e);
                    outcome.missing.push(cik.clone());
                }
            }
            tokio::time::sleep(SEQUENTIAL_DELAY).await;
        }
        return outcome;
    }
    let cap = workers.clamp(1, MAX_PROFILE_WORKERS);
    let results: Vec<(String, Result<Filer>)> = stream::iter(ciks.iter().cloned())
        .map(|cik| async move {
            let result = fetcher.fetch(&cik).await;
            (cik, result)
        })
        .buffer_unordered(cap)
        .collect()
        .await;
    for (cik, result) in results {
        match result {
            Ok(filer) => outcome.retrieved.push(filer),
            Err(e) => {
                debug!("could not retrieve cik {}: {:#}", cik, e);
                outcome.missing.push(cik);
            }
        }
    }
    outcome
}

/// Fetches the given CIKs, then retries the whole missing set up to
/// `retries` times. Results accumulate across rounds; CIKs still missing
/// afterward are reported, never fatal.
pub async fn fetch_filers(
    fetcher: &dyn ProfileFetcher,
    ciks: &[String],
    workers: usize,
    sequential: bool,
    retries: usize,
) -> FetchOutcome {
    let mut outcome = fetch_round(fetcher, ciks, workers, sequential).await;
    let mut round = 1;
    while !outcome.missing.is_empty() && round <= retries {
        info!(
            "retrying {} missing cik(s), attempt {} of {}",
            outcome.missing.len(),
            round,
            retries
        );
        let retry = fetch_round(fetcher, &outcome.missing, workers, sequential).await;
        outcome.retrieved.extend(retry.retrieved);
        outcome.missing = retry.missing;
        round += 1;
    }
    if !outcome.missing.is_empty() {
        warn!(
            "could not retrieve {} cik(s): {:?}",
            outcome.missing.len(),
            outcome.missing
        );
    }
    outcome
}

/// The rename heuristic: refresh when the latest filing is more recent than
/// the last recorded name change, or when no former names are recorded at
/// all. Incomplete former-name histories can misfire; accepted.
pub fn needs_refresh(candidate: &RenameCandidate) -> bool {
    match candidate.former_names.first() {
        None => true,
        Some(latest) => candidate
            .pub_date
            .map_or(false, |pub_date| pub_date.date_naive() > latest.date),
    }
}

#[derive(Debug, Default)]
pub struct FilerUpdateSummary {
    pub stats: UpsertStats,
    pub missing: Vec<String>,
    pub new_ciks: usize,
    pub refreshed_ciks: usize,
}

/// Inserts profiles for newly sighted CIKs and refreshes stored ones that
/// look renamed. With `refresh_all`, every stored filer is re-fetched.
pub async fn update_filers(
    store: &dyn Store,
    fetcher: &dyn ProfileFetcher,
    workers: usize,
    sequential: bool,
    retries: usize,
    update_existing: bool,
    refresh_all: bool,
) -> Result<FilerUpdateSummary> {
    let mut summary = FilerUpdateSummary::default();
    let known: Vec<String> = store.distinct_filer_ciks().await?;
    let new_ciks: Vec<String> = {
        let known_set: std::collections::HashSet<&String> = known.iter().collect();
        store
            .distinct_filing_ciks()
            .await?
            .into_iter()
            .filter(|cik| !known_set.contains(cik))
            .collect()
    };
    summary.new_ciks = new_ciks.len();
    info!("{} new cik(s) to fetch", new_ciks.len());
    for patch in &new_ciks.iter().cloned().chunks(PATCH_SIZE) {
        let patch: Vec<String> = patch.collect();
        let outcome = fetch_filers(fetcher, &patch, workers, sequential, retries).await;
        if !outcome.retrieved.is_empty() {
            let rows = model::to_rows(&outcome.retrieved)?;
            summary.stats.merge(
                store
                    .upsert(Collection::Filers, &rows, UpsertAction::Insert, None, None)
                    .await?,
            );
        }
        summary.missing.extend(outcome.missing);
    }

    let refresh_ciks: Vec<String> = if refresh_all {
        known
    } else if update_existing {
        store
            .rename_candidates()
            .await?
            .iter()
            .filter(|c| needs_refresh(c))
            .map(|c| c.cik_number.clone())
            .collect()
    } else {
        Vec::new()
    };
    summary.refreshed_ciks = refresh_ciks.len();
    if !refresh_ciks.is_empty() {
        info!("{} stored cik(s) to refresh", refresh_ciks.len());
    }
    for patch in &refresh_ciks.iter().cloned().chunks(PATCH_SIZE) {
        let patch: Vec<String> = patch.collect();
        let outcome = fetch_filers(fetcher, &patch, workers, sequential, retries).await;
        if !outcome.retrieved.is_empty() {
            let rows = model::to_rows(&outcome.retrieved)?;
            summary.stats.merge(
                store
                    .upsert(Collection::Filers, &rows, UpsertAction::Update, None, None)
                    .await?,
            );
        }
        summary.missing.extend(outcome.missing);
    }
    Ok(summary)
}
