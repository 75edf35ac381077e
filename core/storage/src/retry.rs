//! Backoff for transient download failures.
//!
//! The remote transport may drop connections. [`RetryingDownloader`] hides
//! short outages from the scheduler: a fetch is reported failed only after
//! its attempts are used up, and the next sweep picks the node up again.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use arborsync_common::{Node, Result};

use crate::download::{DownloadService, FetchedPayload};

/// Doubling backoff between attempts, capped at a ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Total attempts, the first one included.
    pub attempts: u32,
    /// Wait before the first retry.
    pub base: Duration,
    /// Upper bound for any single wait.
    pub ceiling: Duration,
    /// Fraction of each wait that is randomized, in `0.0..=1.0`.
    pub spread: f64,
}

impl Backoff {
    /// Backoff with `attempts` tries, starting at 500ms and capped at 30s.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            spread: 0.25,
        }
    }

    pub fn base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Randomize waits by up to `spread` of their length. Zero disables it.
    pub fn spread(mut self, spread: f64) -> Self {
        self.spread = spread.clamp(0.0, 1.0);
        self
    }

    /// Wait before retry number `retry`, counting from zero.
    pub fn wait(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let wait = self.base.saturating_mul(factor).min(self.ceiling);
        if self.spread == 0.0 {
            return wait;
        }
        // Shrink only, so the ceiling holds.
        wait.mul_f64(1.0 - self.spread * rand::random::<f64>())
    }

    /// Run `attempt` until it succeeds, fails permanently or runs out of tries.
    pub async fn run<F, Fut, T>(&self, what: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match attempt().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(what, retries = retry, "Recovered after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() || retry + 1 >= self.attempts {
                if err.is_transient() {
                    warn!(what, attempts = self.attempts, "Giving up: {}", err);
                }
                return Err(err);
            }

            let wait = self.wait(retry);
            debug!(what, retry, ?wait, "Transient failure: {}", err);
            sleep(wait).await;
            retry += 1;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Download service that retries transient failures of another one.
pub struct RetryingDownloader<D> {
    inner: D,
    backoff: Backoff,
}

impl<D: DownloadService> RetryingDownloader<D> {
    pub fn new(inner: D, backoff: Backoff) -> Self {
        Self { inner, backoff }
    }

    /// The wrapped service.
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait]
impl<D: DownloadService> DownloadService for RetryingDownloader<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self, node: &Node) -> Result<FetchedPayload> {
        let what = format!("fetch {}", node.id);
        self.backoff.run(&what, || self.inner.fetch(node)).await
    }

    async fn fetch_thumbnail(&self, node: &Node) -> Result<Option<FetchedPayload>> {
        let what = format!("thumbnail {}", node.id);
        self.backoff
            .run(&what, || self.inner.fetch_thumbnail(node))
            .await
    }
}
