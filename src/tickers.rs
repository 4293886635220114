use anyhow::Result;
use itertools::Itertools;
use log::info;
use reqwest::Client;
use url::Url;

use crate::config::TICKER_URL;
use crate::model::{self, TickerMapping};
use crate::store::{Collection, Store, UpsertAction, UpsertStats};
use crate::utils::{fetch_text, RateLimiter};

/// Parses the tab-separated ticker listing, dropping blank symbols and exact
/// duplicate lines and left-padding CIKs to ten digits.
pub fn parse_ticker_listing(body: &str) -> Vec<TickerMapping> {
    body.lines()
        .filter_map(|line| {
            let (symbol, cik) = line.trim().split_once('\t')?;
            if symbol.is_empty() {
                return None;
            }
            Some(TickerMapping {
                ticker_symbol: symbol.to_string(),
                cik_number: format!("{:0>10}", cik.trim()),
            })
        })
        .unique()
        .collect()
}

/// Full drop-then-reload of the ticker mapping from the external listing.
pub async fn update_ticker_mappings(
    store: &dyn Store,
    client: &Client,
    user_agent: &str,
) -> Result<UpsertStats> {
    let url = Url::parse(TICKER_URL)?;
    let body = fetch_text(client, &url, user_agent, RateLimiter::sec()).await?;
    let mappings = parse_ticker_listing(&body);
    let cleared = store.clear_collection(Collection::TickerMapping).await?;
    let rows = model::to_rows(&mappings)?;
    let stats = store
        .upsert(
            Collection::TickerMapping,
            &rows,
            UpsertAction::Insert,
            None,
            None,
        )
        .await?;
    info!(
        "ticker mapping reloaded: {} dropped, {} inserted",
        cleared, stats.inserted
    );
    Ok(stats)
}
