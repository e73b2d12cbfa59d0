use std::future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::header::{ACCEPT, REFERER};
use sha2::{Digest, Sha256};

use crate::completion::{CompletionTally, FetchOutcome};
use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::identifier::ImageId;

/// Downloads one image and writes it under the storage root
#[allow(async_fn_in_trait)]
pub trait Fetch {
    async fn fetch(&self, identifier: &ImageId) -> FetchOutcome;
}

/// Where candidate image URLs come from
pub trait ImageSource {
    fn candidates(&self) -> Vec<String>;

    fn accept(&self, _url: &str) -> bool {
        true
    }
}

/// Plain list of image URLs
#[derive(Debug, Clone, Default)]
pub struct SeedList {
    urls: Vec<String>,
}

impl SeedList {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }

    /// One URL per line, blank lines and `#` comments are ignored
    pub fn parse(text: &str) -> Self {
        let urls = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect();
        Self { urls }
    }

    pub fn extend(&mut self, other: SeedList) {
        self.urls.extend(other.urls);
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

impl ImageSource for SeedList {
    fn candidates(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn accept(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }
}

/// Fetch layer backed by `reqwest`, files land in `full/<sha256>.<ext>`
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    storage_root: PathBuf,
}

impl HttpFetcher {
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .deflate(true)
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            storage_root: config.storage_root.clone(),
        })
    }

    async fn download(&self, identifier: &ImageId) -> anyhow::Result<(PathBuf, u64)> {
        let resp = self
            .client
            .get(identifier.as_str())
            .header(ACCEPT, "image/webp,image/apng,image/*,*/*;q=0.8")
            .header(REFERER, identifier.as_str())
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;

        let relative_path = storage_path(identifier);
        let path = self.storage_root.join(&relative_path);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Couldn't create {}", dir.display()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("Couldn't write {}", path.display()))?;

        Ok((relative_path, bytes.len() as u64))
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, identifier: &ImageId) -> FetchOutcome {
        match self.download(identifier).await {
            Ok((relative_path, size)) => FetchOutcome::Downloaded {
                identifier: identifier.clone(),
                relative_path,
                file_size: Some(size),
            },
            Err(e) => FetchOutcome::Failed {
                identifier: identifier.clone(),
                reason: format!("{e:#}"),
            },
        }
    }
}

/// Relative location of an image's bytes, stable for a given identifier
pub fn storage_path(identifier: &ImageId) -> PathBuf {
    let digest = hex::encode(Sha256::digest(identifier.as_str().as_bytes()));
    let ext = identifier.extension().unwrap_or_else(|| String::from("jpg"));
    PathBuf::from("full").join(format!("{digest}.{ext}"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlTally {
    pub candidates: usize,
    /// Refused by the source
    pub rejected: usize,
    /// Already in the ledger or already queued
    pub known: usize,
    pub fetched: usize,
    pub completion: CompletionTally,
    pub interrupted: bool,
}

/// Drives candidates through the ledger filter and the rate limiter into a
/// bounded set of concurrent fetches.
///
/// Fetches run concurrently but their outcomes are all recorded from the task
/// calling [`Crawler::run`].
#[derive(Debug, Clone)]
pub struct Crawler {
    concurrent_downloads: usize,
    handle_sigint: bool,
}

impl Crawler {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            concurrent_downloads: config.concurrent_downloads.max(1),
            handle_sigint: config.handle_sigint,
        }
    }

    pub async fn run<F, S>(&self, coordinator: &mut Coordinator, fetcher: &F, source: &S) -> CrawlTally
    where
        F: Fetch,
        S: ImageSource,
    {
        let mut tally = CrawlTally::default();
        let candidates = source.candidates();
        tally.candidates = candidates.len();
        let mut candidates = candidates.into_iter();

        let handle_sigint = self.handle_sigint;
        let interrupt = async move {
            if handle_sigint {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Couldn't listen for SIGINT: {e}");
                    future::pending::<()>().await;
                }
            } else {
                future::pending::<()>().await;
            }
        };
        tokio::pin!(interrupt);

        let mut in_flight = FuturesUnordered::new();
        let mut queued: Option<ImageId> = None;
        let mut exhausted = false;
        let mut done = vec![];

        loop {
            if queued.is_none()
                && !exhausted
                && !tally.interrupted
                && in_flight.len() < self.concurrent_downloads
            {
                queued = next_candidate(coordinator, &mut candidates, source, &mut tally);
                exhausted = queued.is_none();
            }
            if queued.is_none() && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = &mut interrupt, if !tally.interrupted => {
                    log::warn!(
                        "Interrupted, waiting for {} in-flight downloads",
                        in_flight.len()
                    );
                    tally.interrupted = true;
                    queued = None;
                }
                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                    done.push(outcome);
                }
                _ = coordinator.admit(), if queued.is_some() => {
                    if let Some(identifier) = queued.take() {
                        log::info!("Queuing image for download: {identifier}");
                        tally.fetched += 1;
                        in_flight.push(async move { fetcher.fetch(&identifier).await });
                    }
                }
            }

            if !done.is_empty() {
                let completion = coordinator.record_downloads(done.drain(..));
                tally.completion += completion;
            }
        }

        log::info!(
            "Crawl done: {} candidates, {} fetched, {} already known, {} rejected",
            tally.candidates,
            tally.fetched,
            tally.known,
            tally.rejected
        );
        tally
    }
}

fn next_candidate<I, S>(
    coordinator: &mut Coordinator,
    candidates: &mut I,
    source: &S,
    tally: &mut CrawlTally,
) -> Option<ImageId>
where
    I: Iterator<Item = String>,
    S: ImageSource,
{
    for url in candidates {
        if !source.accept(&url) {
            log::debug!("Rejected candidate: {url}");
            tally.rejected += 1;
            continue;
        }
        match coordinator.should_fetch(&url) {
            Some(identifier) => return Some(identifier),
            None => tally.known += 1,
        }
    }
    None
}
