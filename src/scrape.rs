use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Anything that can hand back the raw body of a monitored page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &Url) -> Result<String>;
}

#[derive(Clone)]
pub struct ScrapeClient {
    pub(crate) http: Client,
}

impl ScrapeClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(Policy::limited(8))
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("http client init failed: {e}"))?;

        Ok(Self { http })
    }
}

#[async_trait]
impl PageSource for ScrapeClient {
    async fn fetch_page(&self, url: &Url) -> Result<String> {
        let res = self.http.get(url.clone()).send().await?;
        let status = res.status();
        if !status.is_success() {
            bail!("http status {}", status.as_u16());
        }

        let body = res.bytes().await?;
        // Decode bytes (assume utf-8)
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Delay before the attempt following `failed_attempts` failures: doubles each time.
pub fn backoff_delay(base: Duration, failed_attempts: u32) -> Duration {
    let exp = failed_attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp)
}

pub fn content_hash(body: &str) -> String {
    format!("{:x}", Sha256::digest(body.as_bytes()))
}
