use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const MONTHLY_INDEX_URL: &str = "https://www.sec.gov/Archives/edgar/monthly/";
pub const LATEST_FILINGS_URL: &str = "https://www.sec.gov/Archives/edgar/xbrlrss.all.xml";
pub const TICKER_URL: &str = "https://www.sec.gov/include/ticker.txt";
pub const USER_AGENT: &str = "software@example.com";

/// Where monthly feed archives are enumerated from.
#[derive(Debug, Clone)]
pub enum FeedSource {
    Remote(Url),
    /// Local directory of feed files, mainly for testing.
    Local(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source: FeedSource,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Only process the last N candidate feeds.
    pub last: Option<usize>,
    /// Extraction worker count; defaults to half the available cores.
    pub max_workers: usize,
    /// Force strictly sequential extraction.
    pub sequential: bool,
    pub include_latest: bool,
    pub get_files: bool,
    pub get_raw_items: bool,
    pub reload_cache: bool,
    pub get_filers: bool,
    pub update_existing_filers: bool,
    pub refresh_all_filers: bool,
    pub update_tickers: bool,
    pub profile_timeout: Duration,
    pub profile_retries: usize,
    pub profile_workers: usize,
    /// Wait between auto-update cycles.
    pub poll_interval: Duration,
    /// Total auto-update run time.
    pub run_duration: Duration,
    /// How often the waiting loop rechecks the cancellation token.
    pub cancel_check_interval: Duration,
    pub user_agent: String,
    pub cache_dir: PathBuf,
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: FeedSource::Remote(
                Url::parse(MONTHLY_INDEX_URL).expect("static URL parses"),
            ),
            date_from: None,
            date_to: None,
            last: None,
            max_workers: default_workers(),
            sequential: false,
            include_latest: true,
            get_files: true,
            get_raw_items: false,
            reload_cache: false,
            get_filers: true,
            update_existing_filers: true,
            refresh_all_filers: false,
            update_tickers: true,
            profile_timeout: Duration::from_secs(3),
            profile_retries: 3,
            profile_workers: 4,
            poll_interval: Duration::from_secs(60),
            run_duration: Duration::from_secs(3600),
            cancel_check_interval: Duration::from_secs(2),
            user_agent: USER_AGENT.to_string(),
            cache_dir: PathBuf::from("data/rssdb/cache"),
        }
    }
}

impl SyncConfig {
    /// Checked before any I/O; a bad configuration never starts a cycle.
    pub fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if to <= from {
                return Err(anyhow!(
                    "date_to ({}) must be later than date_from ({})",
                    to,
                    from
                ));
            }
        }
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be at least 1"));
        }
        if self.profile_workers == 0 {
            return Err(anyhow!("profile_workers must be at least 1"));
        }
        if self.last == Some(0) {
            return Err(anyhow!("last must be at least 1 when set"));
        }
        if self.poll_interval.is_zero() || self.cancel_check_interval.is_zero() {
            return Err(anyhow!("poll and cancel-check intervals must be non-zero"));
        }
        Ok(())
    }
}
