mod completion;
mod config;
mod coordinator;
mod enhance;
mod error;
mod fetch;
mod identifier;
mod ledger;
mod limiter;
mod summary;

pub use completion::{
    CompletionTally, DownloadHandler, ExemptPolicy, FetchOutcome, PendingBatch, PendingEntry,
};
pub use config::{CoordinatorConfig, EnhancerConfig, ImageFormat, RateLimit};
pub use coordinator::{Coordinator, RunReport};
pub use enhance::{EnhancementReport, EnhancementState, Enhancer};
pub use error::{Error, Result};
pub use fetch::{storage_path, CrawlTally, Crawler, Fetch, HttpFetcher, ImageSource, SeedList};
pub use identifier::ImageId;
pub use ledger::{ImageRecord, Ledger, LedgerStats, RecordPatch};
pub use limiter::RateLimiter;
pub use summary::{RunStats, RunSummary};

pub use anyhow;
