//! Payload retrieval.
//!
//! Sources are fetched one at a time. A base location is either an HTTP(S)
//! URL or a local directory holding the same file names. There is no retry:
//! a failed fetch fails the tracker that asked for it.

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Fetcher settings.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout_seconds: u64,
    /// Pause inserted before every fetch except the first.
    pub pause: Duration,
    pub show_progress: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            pause: Duration::from_secs(1),
            show_progress: true,
        }
    }
}

/// Sequential payload fetcher.
pub struct Fetcher {
    options: FetchOptions,
    http_client: reqwest::Client,
    fetched: usize,
}

impl Fetcher {
    pub fn new(options: FetchOptions) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .user_agent(concat!("pollwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            options,
            http_client,
            fetched: 0,
        })
    }

    /// Number of fetches attempted so far.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    /// Fetch `file` from `base`.
    pub async fn fetch(&mut self, base: &str, file: &str) -> Result<Vec<u8>> {
        if self.fetched > 0 && !self.options.pause.is_zero() {
            tokio::time::sleep(self.options.pause).await;
        }
        self.fetched += 1;

        let location = join_location(base, file);
        let spinner = self.spinner(&location);

        let result = if is_remote(base) {
            self.fetch_remote(&location).await
        } else {
            fetch_local(Path::new(&location)).await
        };

        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }

        let payload = result?;
        info!("Fetched {} ({} bytes)", location, payload.len());
        Ok(payload)
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET {}", url);
        let response = self.http_client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow!(
                    "Request to {} timed out after {}s",
                    url,
                    self.options.timeout_seconds
                )
            } else if e.is_connect() {
                anyhow!("Cannot connect to {}", url)
            } else {
                anyhow!("Failed to fetch {}: {}", url, e)
            }
        })?;

        if !response.status().is_success() {
            return Err(anyhow!("{} returned HTTP {}", url, response.status()));
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))?;
        Ok(bytes.to_vec())
    }

    fn spinner(&self, location: &str) -> Option<ProgressBar> {
        if !self.options.show_progress {
            return None;
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("Fetching {}", location));
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    }
}

async fn fetch_local(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

fn is_remote(base: &str) -> bool {
    base.starts_with("http://") || base.starts_with("https://")
}

fn join_location(base: &str, file: &str) -> String {
    if is_remote(base) {
        format!("{}/{}", base.trim_end_matches('/'), file)
    } else {
        Path::new(base).join(file).display().to_string()
    }
}
