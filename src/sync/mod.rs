use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{SyncConfig, LATEST_FILINGS_URL};
use crate::feed::discovery::{self, FeedCandidate};
use crate::feed::extract::{self, ExtractOptions};
use crate::feed::parser::{FeedParser, XmlFeedParser};
use crate::filer::{self, EdgarProfileFetcher, ProfileFetcher};
use crate::store::{Collection, FeedWriteStats, Store, UpsertAction, UpsertStats};
use crate::tickers;
use crate::utils::RateLimiter;

pub mod scheduler;

pub use scheduler::{AutoUpdateState, AutoUpdater};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Aggregated per-entity counts and timings for one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub feeds: UpsertStats,
    pub filings: UpsertStats,
    pub files: UpsertStats,
    pub raw_items: UpsertStats,
    pub filers: UpsertStats,
    pub tickers: UpsertStats,
    pub missing_ciks: Vec<String>,
    pub elapsed: Duration,
}

impl CycleSummary {
    fn absorb_feed_stats(&mut self, stats: &FeedWriteStats) {
        self.feeds.merge(stats.feeds);
        self.filings.merge(stats.filings);
        self.files.merge(stats.files);
        self.raw_items.merge(stats.raw_items);
    }

    pub fn log(&self) {
        info!("Summary:");
        for (name, stats) in [
            ("feedsInfo", &self.feeds),
            ("filingsInfo", &self.filings),
            ("filesInfo", &self.files),
            ("rssItems", &self.raw_items),
            ("filersInfo", &self.filers),
            ("cikTickerMapping", &self.tickers),
        ] {
            info!(
                "{}: inserts {} -- updates {}",
                name, stats.inserted, stats.updated
            );
        }
        if !self.missing_ciks.is_empty() {
            info!("unretrieved cik(s): {:?}", self.missing_ciks);
        }
        info!("finished cycle in {:.3} secs", self.elapsed.as_secs_f64());
    }
}

enum WorkerEvent {
    Started { feed_id: i64 },
    Finished { feed_id: i64, filings: u64 },
    Failed { feed_id: i64 },
}

/// Drives one full synchronization cycle and hosts the pieces it composes:
/// discovery, extraction fan-out, enrichment, ticker reload, duplicate
/// detection.
pub struct SyncEngine {
    store: Arc<dyn Store>,
    parser: Arc<dyn FeedParser>,
    profiles: Arc<dyn ProfileFetcher>,
    client: Client,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        parser: Arc<dyn FeedParser>,
        profiles: Arc<dyn ProfileFetcher>,
        client: Client,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            parser,
            profiles,
            client,
            config,
        })
    }

    /// Engine with the production parser and profile fetcher.
    pub fn with_defaults(store: Arc<dyn Store>, config: SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .gzip(true)
            .build()
            .context("could not build http client")?;
        let parser = Arc::new(XmlFeedParser::new(
            client.clone(),
            config.cache_dir.clone(),
            config.user_agent.clone(),
        ));
        let profiles = Arc::new(EdgarProfileFetcher::new(
            client.clone(),
            config.user_agent.clone(),
            config.profile_timeout,
        ));
        Self::new(store, parser, profiles, client, config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            get_files: self.config.get_files,
            get_raw_items: self.config.get_raw_items,
            reload_cache: self.config.reload_cache,
        }
    }

    /// One cycle: discovery, extraction fan-out, the latest pseudo-feed,
    /// filer enrichment, ticker reload, sync-state stamp, then duplicate
    /// detection when anything feed-level was inserted.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let started = Instant::now();
        let mut summary = CycleSummary::default();
        self.store.ensure_schema().await?;

        let stored = self.store.feed_comparison_dates().await?;
        let candidates = discovery::discover(
            &self.client,
            &self.config.source,
            &self.config.user_agent,
            RateLimiter::sec(),
            &stored,
            self.config.date_from,
            self.config.date_to,
            self.config.last,
        )
        .await?;

        let feed_stats = self.fan_out(candidates).await?;
        summary.absorb_feed_stats(&feed_stats);

        // The pseudo-feed depends on whether the newest monthly feed was
        // just inserted, so it always runs after the pool drains.
        if self.config.include_latest {
            let batch = extract::extract_latest(
                self.store.as_ref(),
                self.parser.as_ref(),
                LATEST_FILINGS_URL,
                &self.extract_options(),
            )
            .await?;
            let stats = self.store.apply_feed(&batch).await?;
            summary.absorb_feed_stats(&stats);
        }

        if self.config.get_filers {
            let filers = filer::update_filers(
                self.store.as_ref(),
                self.profiles.as_ref(),
                self.config.profile_workers,
                self.config.sequential,
                self.config.profile_retries,
                self.config.update_existing_filers,
                self.config.refresh_all_filers,
            )
            .await?;
            summary.filers = filers.stats;
            summary.missing_ciks = filers.missing;
        }

        if self.config.update_tickers {
            summary.tickers = tickers::update_ticker_mappings(
                self.store.as_ref(),
                &self.client,
                &self.config.user_agent,
            )
            .await?;
        }

        let stamp: Value = json!({ "id": 0, "lastUpdate": Utc::now().to_rfc3339() });
        self.store
            .upsert(
                Collection::SyncState,
                std::slice::from_ref(&stamp),
                UpsertAction::Update,
                Some(&["lastUpdate"]),
                Some(&["id"]),
            )
            .await?;

        if summary.feeds.inserted > 0 {
            let (filings_updated, files_updated) = self.update_duplicates().await?;
            summary.filings.updated += filings_updated;
            summary.files.updated += files_updated;
        }

        summary.elapsed = started.elapsed();
        summary.log();
        Ok(summary)
    }

    /// Bounded extraction fan-out. Workers report progress over a channel to
    /// one consumer; a heartbeat task keeps emitting status while the pool is
    /// busy. All units finish before anything downstream runs; the first
    /// failure aborts the whole round.
    async fn fan_out(&self, candidates: Vec<FeedCandidate>) -> Result<FeedWriteStats> {
        let mut total = FeedWriteStats::default();
        if candidates.is_empty() {
            info!("no candidate feeds this cycle");
            return Ok(total);
        }
        let options = self.extract_options();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let consumer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    WorkerEvent::Started { feed_id } => info!("feed {}: extracting", feed_id),
                    WorkerEvent::Finished { feed_id, filings } => {
                        info!("feed {}: stored {} filing(s)", feed_id, filings)
                    }
                    WorkerEvent::Failed { feed_id } => error!("feed {}: failed", feed_id),
                }
            }
        });
        let heartbeat_token = CancellationToken::new();
        let heartbeat = {
            let token = heartbeat_token.clone();
            let pending = candidates.len();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                            info!("processing {} feed unit(s)...", pending);
                        }
                    }
                }
            })
        };

        let result = if self.config.sequential || self.config.max_workers == 1 {
            let mut stats = FeedWriteStats::default();
            for candidate in &candidates {
                let _ = event_tx.send(WorkerEvent::Started {
                    feed_id: candidate.feed_id,
                });
                match self.run_unit(candidate, &options).await {
                    Ok(unit) => {
                        let _ = event_tx.send(WorkerEvent::Finished {
                            feed_id: candidate.feed_id,
                            filings: unit.filings.inserted,
                        });
                        stats.merge(&unit);
                    }
                    Err(e) => {
                        let _ = event_tx.send(WorkerEvent::Failed {
                            feed_id: candidate.feed_id,
                        });
                        heartbeat_token.cancel();
                        drop(event_tx);
                        let _ = consumer.await;
                        let _ = heartbeat.await;
                        return Err(e);
                    }
                }
            }
            Ok(stats)
        } else {
            let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
            let mut set: JoinSet<Result<FeedWriteStats>> = JoinSet::new();
            for candidate in candidates {
                let store = Arc::clone(&self.store);
                let parser = Arc::clone(&self.parser);
                let semaphore = Arc::clone(&semaphore);
                let tx = event_tx.clone();
                let options = options;
                set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .context("worker pool closed")?;
                    let _ = tx.send(WorkerEvent::Started {
                        feed_id: candidate.feed_id,
                    });
                    let batch =
                        extract::extract_feed(store.as_ref(), parser.as_ref(), &candidate, &options)
                            .await;
                    let result = match batch {
                        Ok(batch) => store.apply_feed(&batch).await,
                        Err(e) => Err(e),
                    };
                    match &result {
                        Ok(stats) => {
                            let _ = tx.send(WorkerEvent::Finished {
                                feed_id: candidate.feed_id,
                                filings: stats.filings.inserted,
                            });
                        }
                        Err(_) => {
                            let _ = tx.send(WorkerEvent::Failed {
                                feed_id: candidate.feed_id,
                            });
                        }
                    }
                    result
                });
            }
            let mut stats = FeedWriteStats::default();
            let mut failure: Option<anyhow::Error> = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(unit)) => stats.merge(&unit),
                    Ok(Err(e)) => {
                        // Fail fast: in-flight units are discarded with the
                        // round.
                        failure = Some(e);
                        set.abort_all();
                        break;
                    }
                    Err(join_err) => {
                        failure = Some(join_err.into());
                        set.abort_all();
                        break;
                    }
                }
            }
            while set.join_next().await.is_some() {}
            match failure {
                Some(e) => Err(e),
                None => Ok(stats),
            }
        };

        heartbeat_token.cancel();
        drop(event_tx);
        let _ = consumer.await;
        let _ = heartbeat.await;
        let stats = result?;
        total.merge(&stats);
        Ok(total)
    }

    async fn run_unit(
        &self,
        candidate: &FeedCandidate,
        options: &ExtractOptions,
    ) -> Result<FeedWriteStats> {
        let batch =
            extract::extract_feed(self.store.as_ref(), self.parser.as_ref(), candidate, options)
                .await?;
        self.store.apply_feed(&batch).await
    }

    /// Recomputes duplicate flags from scratch and propagates them to the
    /// flagged filings' file records.
    async fn update_duplicates(&self) -> Result<(u64, u64)> {
        let ids = self.store.duplicate_filing_ids().await?;
        if ids.is_empty() {
            return Ok((0, 0));
        }
        info!("flagging {} duplicate filing(s)", ids.len());
        let rows: Vec<Value> = ids
            .iter()
            .map(|id| json!({ "filingId": id, "duplicate": 1 }))
            .collect();
        let filings = self
            .store
            .upsert(
                Collection::Filings,
                &rows,
                UpsertAction::Update,
                Some(&["duplicate"]),
                Some(&["filingId"]),
            )
            .await?;
        let files = self
            .store
            .upsert(
                Collection::Files,
                &rows,
                UpsertAction::Update,
                Some(&["duplicate"]),
                Some(&["filingId"]),
            )
            .await?;
        Ok((filings.updated, files.updated))
    }

    /// Runs cycles on the given scheduler until it stops. Cycle errors are
    /// logged, never propagated, so the loop survives transient failures.
    pub async fn run_auto_update(&self, updater: &AutoUpdater) {
        updater.run(|| self.run_cycle()).await;
    }
}
