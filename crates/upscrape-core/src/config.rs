use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Defaults to `image_status.json` under the storage root
    #[serde(default)]
    pub ledger_file: Option<PathBuf>,

    /// Defaults to `pipeline_stats.json` under the storage root
    #[serde(default)]
    pub summary_file: Option<PathBuf>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,

    #[serde(default = "default_handle_sigint")]
    pub handle_sigint: bool,

    #[serde(default)]
    pub rate_limit: RateLimit,

    #[serde(default)]
    pub exempt_domains: Vec<String>,

    pub enhancer: EnhancerConfig,
}

impl CoordinatorConfig {
    pub fn new(enhancer: EnhancerConfig) -> Self {
        Self {
            storage_root: default_storage_root(),
            ledger_file: None,
            summary_file: None,
            user_agent: default_user_agent(),
            concurrent_downloads: default_concurrent_downloads(),
            handle_sigint: default_handle_sigint(),
            rate_limit: RateLimit::default(),
            exempt_domains: vec![],
            enhancer,
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_file
            .clone()
            .unwrap_or_else(|| self.storage_root.join("image_status.json"))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.summary_file
            .clone()
            .unwrap_or_else(|| self.storage_root.join("pipeline_stats.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrent_downloads == 0 {
            return Err(Error::Config("concurrentDownloads must be at least 1".into()));
        }
        self.rate_limit.validate()?;
        self.enhancer.validate()
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("downloaded_images")
}

fn default_user_agent() -> String {
    String::from("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
}

fn default_concurrent_downloads() -> usize {
    1
}

fn default_handle_sigint() -> bool {
    true
}

/// Sliding window bound on outbound requests
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Random pause before each admission is recorded, `0` on both ends disables it
    #[serde(default = "default_jitter_min_secs")]
    pub jitter_min_secs: f64,

    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: f64,
}

impl RateLimit {
    pub fn max_requests(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_requests)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// `None` when disabled
    pub fn jitter(&self) -> Option<(Duration, Duration)> {
        if self.jitter_max_secs > 0.0 {
            Some((
                Duration::from_secs_f64(self.jitter_min_secs),
                Duration::from_secs_f64(self.jitter_max_secs),
            ))
        } else {
            None
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::Config("rateLimit.maxRequests must be at least 1".into()));
        }
        if self.window_secs == 0 {
            return Err(Error::Config("rateLimit.windowSecs must be at least 1".into()));
        }
        let (min, max) = (self.jitter_min_secs, self.jitter_max_secs);
        if !(min.is_finite() && max.is_finite() && 0.0 <= min && min <= max) {
            return Err(Error::Config(format!(
                "rateLimit jitter must satisfy 0 <= jitterMinSecs <= jitterMaxSecs, got {min}..{max}"
            )));
        }
        Ok(())
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            jitter_min_secs: default_jitter_min_secs(),
            jitter_max_secs: default_jitter_max_secs(),
        }
    }
}

fn default_max_requests() -> usize {
    10
}

fn default_window_secs() -> u64 {
    60
}

fn default_jitter_min_secs() -> f64 {
    0.5
}

fn default_jitter_max_secs() -> f64 {
    1.5
}

/// How to invoke the external upscaler.
///
/// `timeout_secs` has no default: a batch run must always be bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancerConfig {
    pub executable: PathBuf,

    pub timeout_secs: u64,

    #[serde(default)]
    pub input_dir: Option<PathBuf>,

    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub model_dir: Option<PathBuf>,

    #[serde(default = "default_noise_level")]
    pub noise_level: i8,

    #[serde(default = "default_scale")]
    pub scale: u32,

    #[serde(default = "default_tile_size")]
    pub tile_size: u32,

    #[serde(default = "default_gpu")]
    pub gpu: String,

    #[serde(default = "default_threads")]
    pub threads: String,

    #[serde(default = "default_format")]
    pub format: ImageFormat,

    #[serde(default = "default_verbose")]
    pub verbose: bool,
}

impl EnhancerConfig {
    pub fn new(executable: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout_secs: timeout.as_secs(),
            input_dir: None,
            output_dir: None,
            model_dir: None,
            noise_level: default_noise_level(),
            scale: default_scale(),
            tile_size: default_tile_size(),
            gpu: default_gpu(),
            threads: default_threads(),
            format: default_format(),
            verbose: default_verbose(),
        }
    }

    /// The tool's installation directory, used as its working directory
    pub fn install_dir(&self) -> PathBuf {
        match self.executable.parent() {
            Some(dir) if dir != Path::new("") => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn input_dir(&self) -> PathBuf {
        self.input_dir
            .clone()
            .unwrap_or_else(|| self.install_dir().join("input"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.install_dir().join("output"))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.install_dir().join("models-cunet"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::Config("enhancer.timeoutSecs must be at least 1".into()));
        }
        if !(-1..=3).contains(&self.noise_level) {
            return Err(Error::Config(format!(
                "enhancer.noiseLevel must be within -1..=3, got {}",
                self.noise_level
            )));
        }
        if self.scale == 0 {
            return Err(Error::Config("enhancer.scale must be at least 1".into()));
        }
        if self.tile_size == 0 {
            return Err(Error::Config("enhancer.tileSize must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_noise_level() -> i8 {
    1
}

fn default_scale() -> u32 {
    2
}

fn default_tile_size() -> u32 {
    32
}

fn default_gpu() -> String {
    String::from("auto")
}

fn default_threads() -> String {
    String::from("1:2:2")
}

fn default_format() -> ImageFormat {
    ImageFormat::Jpg
}

fn default_verbose() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ImageFormat {
    Jpg,
    Png,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }
}
