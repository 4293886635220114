use anyhow::{anyhow, Result};
use log::debug;
use once_cell::sync::Lazy;
use reqwest::Client;
use std::path::Path;
use tokio::sync::{Semaphore, SemaphorePermit};
use url::Url;

static SEC_LIMITER: Lazy<RateLimiter> = Lazy::new(|| RateLimiter::new(10));

/// Caps in-flight requests against the filing host, which tolerates roughly
/// ten requests per second.
pub struct RateLimiter {
    permits: Semaphore,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Semaphore::new(max_concurrent),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.permits.acquire().await.expect("limiter closed")
    }

    /// Process-wide limiter shared by everything that talks to the host.
    pub fn sec() -> &'static RateLimiter {
        &SEC_LIMITER
    }
}

/// Fetches a URL as text, holding a rate-limiter permit for the duration of
/// the request.
pub async fn fetch_text(
    client: &Client,
    url: &Url,
    user_agent: &str,
    limiter: &RateLimiter,
) -> Result<String> {
    let _permit = limiter.acquire().await;
    debug!("GET {}", url);
    let response = client
        .get(url.as_str())
        .header(reqwest::header::USER_AGENT, user_agent)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("{} returned status {}", url, status));
    }
    Ok(response.text().await?)
}

/// Downloads a URL to a local file.
pub async fn fetch_and_save(
    client: &Client,
    url: &Url,
    path: &Path,
    user_agent: &str,
    limiter: &RateLimiter,
) -> Result<()> {
    let _permit = limiter.acquire().await;
    debug!("GET {} -> {:?}", url, path);
    let response = client
        .get(url.as_str())
        .header(reqwest::header::USER_AGENT, user_agent)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("{} returned status {}", url, status));
    }
    let content = response.bytes().await?;
    tokio::fs::write(path, &content).await?;
    Ok(())
}
