//! Health checks against pipeline endpoints.
use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// Probes pipeline health check URLs.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe a single health check URL. Ok means the check passed.
    async fn check(&self, url: &str) -> Result<()>;
}

/// Health checker that performs real HTTP requests.
pub struct HttpChecker;

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self, url: &str) -> Result<()> {
        let resp = reqwest::get(url).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(anyhow!("{} returned status {}", url, resp.status()))
        }
    }
}
