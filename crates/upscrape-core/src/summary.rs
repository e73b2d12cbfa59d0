use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifier::ImageId;

/// Live counters of the current run
#[derive(Debug, Clone)]
pub struct RunStats {
    pub downloaded: usize,
    pub enhanced: usize,
    pub failed: usize,
    seen: HashSet<ImageId>,
    started: Instant,
    start_time: DateTime<Utc>,
}

impl RunStats {
    pub fn start() -> Self {
        Self {
            downloaded: 0,
            enhanced: 0,
            failed: 0,
            seen: HashSet::new(),
            started: Instant::now(),
            start_time: Utc::now(),
        }
    }

    /// Returns `true` the first time an identifier is seen in this run
    pub fn observe(&mut self, id: &ImageId) -> bool {
        if self.seen.contains(id) {
            false
        } else {
            self.seen.insert(id.clone())
        }
    }

    pub fn total_urls_seen(&self) -> usize {
        self.seen.len()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn summarize(&self) -> RunSummary {
        RunSummary::new(
            self.elapsed(),
            self.total_urls_seen(),
            self.downloaded,
            self.enhanced,
            self.failed,
        )
    }
}

/// Snapshot of a finished run, it never feeds back into later runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(with = "runtime")]
    pub runtime: Duration,
    pub total_urls: usize,
    pub downloaded: usize,
    pub enhanced: usize,
    pub failed: usize,
    /// Percentage of downloaded images that were enhanced
    pub success_rate: f64,
    pub avg_time_per_image: f64,
    pub timestamp: DateTime<Utc>,
}

impl RunSummary {
    pub fn new(
        runtime: Duration,
        total_urls: usize,
        downloaded: usize,
        enhanced: usize,
        failed: usize,
    ) -> Self {
        let (success_rate, avg_time_per_image) = if downloaded > 0 {
            (
                enhanced as f64 / downloaded as f64 * 100.0,
                runtime.as_secs_f64() / downloaded as f64,
            )
        } else {
            (0.0, 0.0)
        };

        Self {
            runtime,
            total_urls,
            downloaded,
            enhanced,
            failed,
            success_rate,
            avg_time_per_image,
            timestamp: Utc::now(),
        }
    }

    pub fn log(&self) {
        log::info!("Run finished. Summary:");
        log::info!("Runtime: {}", runtime::format(self.runtime));
        log::info!("Total URLs found: {}", self.total_urls);
        log::info!("Downloads: {}", self.downloaded);
        log::info!("Enhanced: {}", self.enhanced);
        log::info!("Failed: {}", self.failed);
        log::info!("Success rate: {:.2}%", self.success_rate);
        log::info!("Average time per image: {:.2} seconds", self.avg_time_per_image);
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let to_err = |source| Error::SummaryWrite {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent().filter(|d| *d != Path::new("")) {
            fs::create_dir_all(dir).map_err(to_err)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| to_err(e.into()))?;
        fs::write(path, json).map_err(to_err)
    }
}

/// `H:MM:SS.ffffff`, the layout earlier summary files used
mod runtime {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn format(d: Duration) -> String {
        let secs = d.as_secs();
        format!(
            "{}:{:02}:{:02}.{:06}",
            secs / 3600,
            secs % 3600 / 60,
            secs % 60,
            d.subsec_micros()
        )
    }

    pub fn parse(s: &str) -> Option<Duration> {
        let mut parts = s.trim().splitn(3, ':');
        let hours: u64 = parts.next()?.parse().ok()?;
        let minutes: u64 = parts.next()?.parse().ok()?;
        let rest = parts.next()?;
        let (secs, micros) = match rest.split_once('.') {
            Some((secs, frac)) => (
                secs.parse::<u64>().ok()?,
                format!("{frac:0<6}").get(..6)?.parse::<u32>().ok()?,
            ),
            None => (rest.parse::<u64>().ok()?, 0),
        };
        Some(Duration::new(hours * 3600 + minutes * 60 + secs, micros * 1000))
    }

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*d))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid runtime: {raw}")))
    }
}
