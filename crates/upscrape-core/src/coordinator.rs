use std::path::PathBuf;

use crate::completion::{CompletionTally, DownloadHandler, ExemptPolicy, FetchOutcome, PendingBatch};
use crate::config::CoordinatorConfig;
use crate::enhance::{EnhancementReport, EnhancementState, Enhancer};
use crate::error::Result;
use crate::identifier::ImageId;
use crate::ledger::{Ledger, LedgerStats};
use crate::limiter::RateLimiter;
use crate::summary::{RunStats, RunSummary};

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub enhancement: EnhancementReport,
    pub ledger: LedgerStats,
    pub summary: RunSummary,
}

/// Owns the state of a single run: ledger, pending batch, counters and
/// limiter.
///
/// Not meant for shared access, all mutations go through `&mut self` on the
/// task driving the run.
#[derive(Debug)]
pub struct Coordinator {
    ledger: Ledger,
    ledger_path: PathBuf,
    summary_path: PathBuf,
    pending: PendingBatch,
    stats: RunStats,
    limiter: RateLimiter,
    handler: DownloadHandler,
    enhancer: Enhancer,
}

impl Coordinator {
    pub fn open(config: &CoordinatorConfig) -> Result<Self> {
        let ledger_path = config.ledger_path();
        let ledger = Ledger::load(&ledger_path);
        Self::with_ledger(config, ledger)
    }

    /// Same as [`Coordinator::open`] with an already loaded ledger
    pub fn with_ledger(config: &CoordinatorConfig, ledger: Ledger) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ledger,
            ledger_path: config.ledger_path(),
            summary_path: config.summary_path(),
            pending: PendingBatch::default(),
            stats: RunStats::start(),
            limiter: RateLimiter::from_config(&config.rate_limit)?,
            handler: DownloadHandler::new(
                config.storage_root.clone(),
                ExemptPolicy::new(&config.exempt_domains),
            ),
            enhancer: Enhancer::new(config.enhancer.clone()),
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pending(&self) -> &PendingBatch {
        &self.pending
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Canonicalises a discovered URL and decides whether it must be fetched.
    ///
    /// Every call counts toward the URLs seen this run, known identifiers and
    /// identifiers already handed out in this run yield `None`.
    pub fn should_fetch(&mut self, url: &str) -> Option<ImageId> {
        let id = ImageId::new(url);
        let first_seen = self.stats.observe(&id);
        if self.ledger.contains(&id) {
            log::debug!("Skipping already downloaded image: {id}");
            None
        } else if !first_seen {
            log::debug!("Skipping image already queued in this run: {id}");
            None
        } else {
            Some(id)
        }
    }

    pub async fn admit(&mut self) {
        self.limiter.admit().await
    }

    pub fn record_downloads<I>(&mut self, outcomes: I) -> CompletionTally
    where
        I: IntoIterator<Item = FetchOutcome>,
    {
        let tally = self.handler.handle(
            outcomes,
            &mut self.ledger,
            &mut self.pending,
            &mut self.stats,
        );
        // exempt images end the run enhanced without going through the tool
        self.stats.enhanced += tally.exempt;
        tally
    }

    /// Enhances the pending batch, saves the ledger and writes the summary.
    ///
    /// The summary is written even when the ledger can't be saved, the save
    /// error is returned afterwards.
    pub async fn finish(mut self) -> Result<RunReport> {
        let enhancement = self
            .enhancer
            .enhance(&mut self.pending, &mut self.ledger)
            .await;
        self.stats.enhanced += enhancement.enhanced;
        self.stats.failed += enhancement.failed;
        if enhancement.state == EnhancementState::Failed {
            if let Some(reason) = &enhancement.reason {
                log::error!("Enhancement failed: {reason}");
            }
        }

        let saved = self.ledger.save(&self.ledger_path);

        let summary = self.stats.summarize();
        summary.log();
        if let Err(e) = summary.write(&self.summary_path) {
            log::error!("{e}");
        }

        if let Err(e) = &saved {
            log::error!("{e}");
        }
        saved?;

        Ok(RunReport {
            enhancement,
            ledger: self.ledger.stats(),
            summary,
        })
    }
}
