use std::ops::AddAssign;
use std::path::PathBuf;

use chrono::Utc;

use crate::identifier::ImageId;
use crate::ledger::{Ledger, RecordPatch};
use crate::summary::RunStats;

/// Result of fetching one image, as reported by the fetch layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded {
        identifier: ImageId,
        /// Relative to the storage root
        relative_path: PathBuf,
        file_size: Option<u64>,
    },
    Failed {
        identifier: ImageId,
        reason: String,
    },
}

impl FetchOutcome {
    pub fn identifier(&self) -> &ImageId {
        match self {
            Self::Downloaded { identifier, .. } | Self::Failed { identifier, .. } => identifier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub identifier: ImageId,
    pub path: PathBuf,
}

/// Files downloaded during this run that still await enhancement
#[derive(Debug, Clone, Default)]
pub struct PendingBatch {
    entries: Vec<PendingEntry>,
}

impl PendingBatch {
    pub fn push(&mut self, identifier: ImageId, path: PathBuf) {
        self.entries.push(PendingEntry { identifier, path });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, identifier: &ImageId) -> bool {
        self.entries.iter().any(|e| &e.identifier == identifier)
    }

    /// Empties the batch, handing its entries over
    pub fn take(&mut self) -> Vec<PendingEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// Domains whose images count as enhanced without running the upscaler
#[derive(Debug, Clone, Default)]
pub struct ExemptPolicy {
    domains: Vec<String>,
}

impl ExemptPolicy {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    pub fn is_exempt(&self, identifier: &ImageId) -> bool {
        self.domains.iter().any(|d| identifier.is_from(d))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionTally {
    /// New records, exempt ones included
    pub recorded: usize,
    /// Already in the ledger
    pub skipped: usize,
    pub exempt: usize,
    pub failed: usize,
}

impl AddAssign for CompletionTally {
    fn add_assign(&mut self, other: Self) {
        self.recorded += other.recorded;
        self.skipped += other.skipped;
        self.exempt += other.exempt;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone)]
pub struct DownloadHandler {
    storage_root: PathBuf,
    policy: ExemptPolicy,
}

impl DownloadHandler {
    pub fn new(storage_root: impl Into<PathBuf>, policy: ExemptPolicy) -> Self {
        Self {
            storage_root: storage_root.into(),
            policy,
        }
    }

    pub fn handle<I>(
        &self,
        outcomes: I,
        ledger: &mut Ledger,
        pending: &mut PendingBatch,
        stats: &mut RunStats,
    ) -> CompletionTally
    where
        I: IntoIterator<Item = FetchOutcome>,
    {
        let mut tally = CompletionTally::default();

        for outcome in outcomes {
            stats.observe(outcome.identifier());
            match outcome {
                FetchOutcome::Failed { identifier, reason } => {
                    log::warn!("Failed to download {identifier}: {reason}");
                    tally.failed += 1;
                }
                FetchOutcome::Downloaded {
                    identifier,
                    relative_path,
                    file_size,
                } => {
                    if ledger.contains(&identifier) {
                        log::debug!("Skipping previously downloaded image: {identifier}");
                        tally.skipped += 1;
                        continue;
                    }

                    let exempt = self.policy.is_exempt(&identifier);
                    if exempt {
                        log::info!("Downloaded {identifier}, exempt from enhancement");
                        tally.exempt += 1;
                    } else {
                        log::info!("Successfully downloaded new image: {identifier}");
                        pending.push(identifier.clone(), self.storage_root.join(&relative_path));
                    }

                    let domain = identifier.domain();
                    ledger.upsert(
                        identifier,
                        RecordPatch {
                            relative_path: Some(relative_path),
                            downloaded: Some(true),
                            enhanced: Some(exempt),
                            failed: Some(false),
                            download_time: Some(Utc::now()),
                            file_size,
                            domain,
                        },
                    );
                    stats.downloaded += 1;
                    tally.recorded += 1;
                }
            }
        }

        tally
    }
}
