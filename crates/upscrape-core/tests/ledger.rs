use std::fs;
use std::path::PathBuf;

use upscrape_core::{Error, ImageId, Ledger, LedgerStats, RecordPatch};

fn downloaded(path: &str) -> RecordPatch {
    RecordPatch {
        relative_path: Some(path.into()),
        downloaded: Some(true),
        enhanced: Some(false),
        failed: Some(false),
        ..Default::default()
    }
}

#[test]
fn missing_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::load(dir.path().join("image_status.json"));
    assert!(ledger.is_empty());
}

#[test]
fn malformed_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image_status.json");
    fs::write(&path, "{\"images\": {\"https://a.com/1.jpg\": ").unwrap();

    let ledger = Ledger::load(&path);
    assert!(ledger.is_empty());
}

#[test]
fn file_without_images_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image_status.json");
    fs::write(&path, r#"{"last_updated": "2025-05-04T10:30:00"}"#).unwrap();

    assert!(Ledger::load(&path).is_empty());
}

#[test]
fn saved_stats_match_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("image_status.json");

    let mut ledger = Ledger::default();
    for (i, url) in ["https://a.com/1.jpg", "https://a.com/2.jpg", "https://b.com/3.jpg"]
        .iter()
        .enumerate()
    {
        ledger.upsert(ImageId::new(url), downloaded(&format!("full/{i}.jpg")));
    }
    ledger.mark_enhanced(&ImageId::new("https://a.com/1.jpg"), true);
    ledger.mark_enhanced(&ImageId::new("https://a.com/2.jpg"), false);
    ledger.save(&path).unwrap();

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let stats: LedgerStats = serde_json::from_value(json["stats"].clone()).unwrap();
    assert_eq!(
        LedgerStats {
            total: 3,
            enhanced: 1,
            failed: 1
        },
        stats
    );
    assert!(json["last_updated"].is_string());
    assert_eq!(true, json["images"]["https://a.com/1.jpg"]["enhanced"]);

    let reloaded = Ledger::load(&path);
    assert_eq!(ledger.stats(), reloaded.stats());
    assert_eq!(
        ledger.get(&ImageId::new("https://a.com/2.jpg")),
        reloaded.get(&ImageId::new("https://a.com/2.jpg"))
    );
}

#[test]
fn stats_follow_later_mutations() {
    let mut ledger = Ledger::default();
    let id = ImageId::new("https://a.com/1.jpg");
    ledger.upsert(id.clone(), downloaded("full/1.jpg"));
    assert_eq!(0, ledger.stats().failed);

    ledger.mark_enhanced(&id, false);
    assert_eq!(1, ledger.stats().failed);

    ledger.mark_enhanced(&id, true);
    assert_eq!(
        LedgerStats {
            total: 1,
            enhanced: 1,
            failed: 0
        },
        ledger.stats()
    );
}

#[test]
fn legacy_schema_is_rekeyed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image_status.json");
    fs::write(
        &path,
        r#"{
  "images": {
    "HTTPS://Example.com/a.jpg": {
      "path": "/data/downloaded_images/full/a.jpg",
      "downloaded_at": "2025-05-04T10:11:12.123456",
      "enhanced": true,
      "failed": false,
      "enhanced_at": "2025-05-04T10:20:00.000001"
    },
    "https://example.com/a.jpg#gallery": {
      "path": "/data/downloaded_images/full/a.jpg",
      "downloaded_at": "2025-05-04T10:11:12",
      "enhanced": false,
      "failed": true
    },
    "https://example.com/b.jpg": {
      "path": "/data/downloaded_images/full/b.jpg",
      "downloaded_at": "not a date",
      "enhanced": false,
      "failed": true
    }
  },
  "last_updated": "2025-05-04T10:30:00",
  "stats": {"total": 3, "enhanced": 1, "failed": 2}
}"#,
    )
    .unwrap();

    let ledger = Ledger::load(&path);
    assert_eq!(2, ledger.len());

    let a = ledger.get(&ImageId::new("https://example.com/a.jpg")).unwrap();
    assert!(a.downloaded);
    assert!(a.enhanced);
    assert_eq!(PathBuf::from("/data/downloaded_images/full/a.jpg"), a.relative_path);
    assert!(a.download_time.is_some());
    assert!(a.enhanced_at.is_some());

    let b = ledger.get(&ImageId::new("https://example.com/b.jpg")).unwrap();
    assert!(b.downloaded && b.failed && !b.enhanced);
    assert_eq!(None, b.download_time);
}

#[test]
fn save_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();
    let path = blocker.join("image_status.json");

    let mut ledger = Ledger::default();
    ledger.upsert(ImageId::new("https://a.com/1.jpg"), downloaded("full/1.jpg"));

    match ledger.save(&path) {
        Err(Error::LedgerSave { path: failed, .. }) => assert_eq!(path, failed),
        other => panic!("Expected a ledger save error, got {other:?}"),
    }
}

#[test]
fn non_string_timestamps_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image_status.json");
    fs::write(
        &path,
        r#"{"images": {
  "https://example.com/a.jpg": {
    "path": "full/a.jpg",
    "downloaded_at": 1714817472,
    "enhanced_at": null,
    "failed_at": {"when": "later"},
    "enhanced": true
  }
}}"#,
    )
    .unwrap();

    let ledger = Ledger::load(&path);
    let record = ledger.get(&ImageId::new("https://example.com/a.jpg")).unwrap();
    assert!(record.enhanced);
    assert_eq!(None, record.download_time);
    assert_eq!(None, record.enhanced_at);
    assert_eq!(None, record.failed_at);
}

#[cfg(unix)]
#[test]
fn save_keeps_file_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image_status.json");
    let mode = |path: &PathBuf| fs::metadata(path).unwrap().permissions().mode() & 0o777;

    let mut ledger = Ledger::default();
    ledger.upsert(ImageId::new("https://a.com/1.jpg"), downloaded("full/1.jpg"));
    ledger.save(&path).unwrap();
    assert_eq!(0o644, mode(&path));

    fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
    ledger.save(&path).unwrap();
    assert_eq!(0o640, mode(&path));
}
