use std::collections::btree_map::{self, BTreeMap};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::identifier::ImageId;

/// Processing state of one image.
///
/// Older ledgers used `path` and `downloaded_at` and had no `downloaded`
/// flag, a record only existed once its bytes were on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(default, alias = "path")]
    pub relative_path: PathBuf,

    #[serde(default = "legacy_downloaded")]
    pub downloaded: bool,

    #[serde(default)]
    pub enhanced: bool,

    #[serde(default)]
    pub failed: bool,

    #[serde(
        default,
        alias = "downloaded_at",
        deserialize_with = "timestamp::lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub download_time: Option<DateTime<Utc>>,

    #[serde(
        default,
        deserialize_with = "timestamp::lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub enhanced_at: Option<DateTime<Utc>>,

    #[serde(
        default,
        deserialize_with = "timestamp::lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

fn legacy_downloaded() -> bool {
    true
}

/// Fields to merge into a record, `None` leaves the current value
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub relative_path: Option<PathBuf>,
    pub downloaded: Option<bool>,
    pub enhanced: Option<bool>,
    pub failed: Option<bool>,
    pub download_time: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub domain: Option<String>,
}

impl RecordPatch {
    fn apply(self, record: &mut ImageRecord) {
        if let Some(relative_path) = self.relative_path {
            record.relative_path = relative_path;
        }
        if let Some(downloaded) = self.downloaded {
            record.downloaded = downloaded;
        }
        if let Some(enhanced) = self.enhanced {
            record.enhanced = enhanced;
        }
        if let Some(failed) = self.failed {
            record.failed = failed;
        }
        if let Some(download_time) = self.download_time {
            record.download_time = Some(download_time);
        }
        if let Some(file_size) = self.file_size {
            record.file_size = Some(file_size);
        }
        if let Some(domain) = self.domain {
            record.domain = Some(domain);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total: usize,
    pub enhanced: usize,
    pub failed: usize,
}

#[derive(Serialize)]
struct LedgerFileRef<'a> {
    images: &'a BTreeMap<ImageId, ImageRecord>,
    last_updated: DateTime<Utc>,
    stats: LedgerStats,
}

#[derive(Deserialize)]
struct LedgerFile {
    #[serde(default)]
    images: BTreeMap<String, ImageRecord>,
}

/// Every image ever handled, keyed by canonical identifier.
///
/// Only [`Ledger::save`] touches the disk, all other operations are in memory.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    images: BTreeMap<ImageId, ImageRecord>,
}

impl Ledger {
    /// Never fails: a missing or unreadable ledger starts empty
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("No previous image status found at {}", path.display());
                return Self::default();
            }
            Err(e) => {
                log::warn!("Couldn't read ledger {}, starting empty: {e}", path.display());
                return Self::default();
            }
        };

        let file: LedgerFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Malformed ledger {}, starting empty: {e}", path.display());
                return Self::default();
            }
        };

        let mut images = BTreeMap::new();
        for (raw, record) in file.images {
            match images.entry(ImageId::new(&raw)) {
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(record);
                }
                btree_map::Entry::Occupied(mut entry) => {
                    log::debug!("Ledger key {raw} collapses into {}", entry.key());
                    if record.enhanced && !entry.get().enhanced {
                        entry.insert(record);
                    }
                }
            }
        }

        let ledger = Self { images };
        let stats = ledger.stats();
        log::info!(
            "Loaded status for {} images ({} enhanced, {} failed)",
            stats.total,
            stats.enhanced,
            stats.failed
        );
        ledger
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.images.contains_key(id)
    }

    pub fn get(&self, id: &ImageId) -> Option<&ImageRecord> {
        self.images.get(id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ImageId, &ImageRecord)> {
        self.images.iter()
    }

    pub fn upsert(&mut self, id: ImageId, patch: RecordPatch) {
        patch.apply(self.images.entry(id).or_default());
    }

    /// Records the outcome of an enhancement attempt.
    ///
    /// Returns `false` when the identifier is unknown.
    pub fn mark_enhanced(&mut self, id: &ImageId, success: bool) -> bool {
        let record = match self.images.get_mut(id) {
            Some(record) => record,
            None => {
                log::warn!("Cannot mark unknown image {id} as enhanced={success}");
                return false;
            }
        };

        let now = Utc::now();
        if success {
            record.enhanced = true;
            record.failed = false;
            record.enhanced_at = Some(now);
        } else {
            record.failed = true;
            record.failed_at = Some(now);
        }
        true
    }

    /// Always recomputed from the records
    pub fn stats(&self) -> LedgerStats {
        self.images.values().fold(
            LedgerStats {
                total: self.images.len(),
                ..Default::default()
            },
            |mut stats, record| {
                stats.enhanced += usize::from(record.enhanced);
                stats.failed += usize::from(record.failed);
                stats
            },
        )
    }

    /// Atomically replaces the ledger file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.write_atomic(path).map_err(|source| Error::LedgerSave {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Saved status for {} images to {}", self.len(), path.display());
        Ok(())
    }

    fn write_atomic(&self, path: &Path) -> io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if dir != Path::new("") => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let file = LedgerFileRef {
                images: &self.images,
                last_updated: Utc::now(),
                stats: self.stats(),
            };
            serde_json::to_writer_pretty(&mut writer, &file)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        if let Some(perms) = ledger_permissions(path)? {
            tmp.as_file().set_permissions(perms)?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Mode of the existing ledger, new ones are world readable
fn ledger_permissions(path: &Path) -> io::Result<Option<fs::Permissions>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.permissions())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(default_permissions()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn default_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<fs::Permissions> {
    None
}

mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Unparseable or non-string timestamps are advisory data, they become `None`
    pub fn lenient<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Ok(raw.as_str().and_then(parse))
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        // naive timestamps carry no offset, they are taken as local time
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone};

    use super::*;

    #[test]
    fn upsert_merges_fields() {
        let mut ledger = Ledger::default();
        let id = ImageId::new("https://a.com/1.jpg");
        ledger.upsert(
            id.clone(),
            RecordPatch {
                relative_path: Some("full/1.jpg".into()),
                downloaded: Some(true),
                ..Default::default()
            },
        );
        ledger.upsert(
            id.clone(),
            RecordPatch {
                file_size: Some(42),
                ..Default::default()
            },
        );

        let record = ledger.get(&id).unwrap();
        assert_eq!(PathBuf::from("full/1.jpg"), record.relative_path);
        assert!(record.downloaded);
        assert_eq!(Some(42), record.file_size);
        assert_eq!(1, ledger.len());
    }

    #[test]
    fn failure_keeps_prior_enhanced_flag() {
        let mut ledger = Ledger::default();
        let id = ImageId::new("https://a.com/1.jpg");
        ledger.upsert(id.clone(), RecordPatch::default());

        assert!(ledger.mark_enhanced(&id, false));
        let record = ledger.get(&id).unwrap();
        assert!(record.failed && !record.enhanced);
        assert!(record.failed_at.is_some());

        assert!(ledger.mark_enhanced(&id, true));
        let record = ledger.get(&id).unwrap();
        assert!(record.enhanced && !record.failed);
        assert!(record.enhanced_at.is_some());
    }

    #[test]
    fn unknown_id_not_marked() {
        let mut ledger = Ledger::default();
        assert!(!ledger.mark_enhanced(&ImageId::new("https://a.com/x.png"), true));
        assert!(ledger.is_empty());
    }

    #[test]
    fn naive_timestamps_are_read_as_local() {
        let parsed = timestamp::parse("2025-05-04T10:11:12.123456").unwrap();
        let expected = Local
            .with_ymd_and_hms(2025, 5, 4, 10, 11, 12)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(expected.timestamp(), parsed.timestamp());
        assert!(timestamp::parse("yesterday").is_none());
    }
}
