#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use upscrape_core::{
    storage_path, CoordinatorConfig, EnhancerConfig, Fetch, FetchOutcome, ImageId,
};

pub const TOOL_NAME: &str = "waifu2x-ncnn-vulkan";

/// Records the flags it got, then copies every input file to the output dir
pub const COPYING_TOOL: &str = r#"echo "$@" > invoked.txt
cp "$2"/* "$4"/
exit 0"#;

pub const FAILING_TOOL: &str = r#"echo "$@" > invoked.txt
echo "vkCreateInstance failed" >&2
exit 1"#;

pub const HANGING_TOOL: &str = r#"echo "$@" > invoked.txt
sleep 30"#;

/// Writes an executable shell script standing in for the upscaler
#[cfg(unix)]
pub fn fake_tool(root: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let install_dir = root.join("w2x");
    fs::create_dir_all(&install_dir).unwrap();
    let exe = install_dir.join(TOOL_NAME);
    fs::write(&exe, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
    exe
}

pub fn config(root: &Path, exe: &Path) -> CoordinatorConfig {
    let mut conf = CoordinatorConfig::new(EnhancerConfig::new(exe, Duration::from_secs(10)));
    conf.storage_root = root.join("store");
    conf.handle_sigint = false;
    conf.concurrent_downloads = 2;
    conf.rate_limit.jitter_min_secs = 0.0;
    conf.rate_limit.jitter_max_secs = 0.0;
    conf
}

/// Writes the identifier as the image bytes, fails for identifiers in `missing`
pub struct FakeFetcher {
    storage_root: PathBuf,
    missing: HashSet<String>,
    calls: Mutex<Vec<ImageId>>,
}

impl FakeFetcher {
    pub fn new(conf: &CoordinatorConfig) -> Self {
        Self {
            storage_root: conf.storage_root.clone(),
            missing: HashSet::new(),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn missing(mut self, url: &str) -> Self {
        self.missing.insert(ImageId::new(url).as_str().to_string());
        self
    }

    pub fn calls(&self) -> Vec<ImageId> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetch for FakeFetcher {
    async fn fetch(&self, identifier: &ImageId) -> FetchOutcome {
        self.calls.lock().unwrap().push(identifier.clone());
        if self.missing.contains(identifier.as_str()) {
            return FetchOutcome::Failed {
                identifier: identifier.clone(),
                reason: "404 Not Found".into(),
            };
        }

        let relative_path = storage_path(identifier);
        let path = self.storage_root.join(&relative_path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, identifier.as_str()).unwrap();
        FetchOutcome::Downloaded {
            identifier: identifier.clone(),
            relative_path,
            file_size: Some(identifier.as_str().len() as u64),
        }
    }
}

pub fn read_json(path: impl AsRef<Path>) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

pub fn file_names(dir: impl AsRef<Path>) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
