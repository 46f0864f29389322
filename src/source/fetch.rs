//! Fetching raw blocklist content.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::SourceError;

/// Retrieves the raw text behind a source origin.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, origin: &str) -> Result<String, SourceError>;
}

/// Fetches `http(s)://` origins with reqwest and everything else from disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hush/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, origin: &str) -> Result<String, SourceError> {
        if origin.starts_with("http://") || origin.starts_with("https://") {
            let response = self.client.get(origin).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::Status(status.as_u16()));
            }
            return Ok(response.text().await?);
        }

        let path = origin.strip_prefix("file://").unwrap_or(origin);
        let bytes = tokio::fs::read(path).await?;
        String::from_utf8(bytes).map_err(|_| SourceError::Decode)
    }
}

/// Fetch with up to `retries` further attempts, doubling `backoff` each time.
pub async fn fetch_with_retry(
    fetcher: &dyn Fetch,
    source: &str,
    origin: &str,
    retries: u32,
    backoff: Duration,
) -> Result<String, SourceError> {
    let mut delay = backoff;
    let mut attempt = 0;

    loop {
        match fetcher.fetch(origin).await {
            Ok(content) => {
                debug!(source, attempt, bytes = content.len(), "fetched source");
                return Ok(content);
            }
            Err(e) if attempt < retries => {
                warn!(source, attempt, error = %e, "source fetch failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetch for Flaky {
        async fn fetch(&self, _origin: &str) -> Result<String, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(SourceError::Status(503))
            } else {
                Ok("ads.example.com\n".to_string())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let fetcher = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };

        let content = fetch_with_retry(&fetcher, "list", "mem://", 3, Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(content, "ads.example.com\n");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retries() {
        let fetcher = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        };

        let result = fetch_with_retry(&fetcher, "list", "mem://", 2, Duration::from_millis(100)).await;

        assert!(matches!(result, Err(SourceError::Status(503))));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reads_files() {
        let path = std::env::temp_dir().join(format!("hush-fetch-{}.txt", std::process::id()));
        tokio::fs::write(&path, "0.0.0.0 ads.example.com\n").await.unwrap();

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let plain = fetcher.fetch(path.to_str().unwrap()).await.unwrap();
        let url = fetcher
            .fetch(&format!("file://{}", path.display()))
            .await
            .unwrap();

        assert_eq!(plain, "0.0.0.0 ads.example.com\n");
        assert_eq!(plain, url);

        let missing = fetcher.fetch("/nonexistent/hush/list.txt").await;
        assert!(matches!(missing, Err(SourceError::Io(_))));

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
