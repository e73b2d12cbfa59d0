use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use tokio::runtime;
use upscrape_core::{
    Coordinator, CoordinatorConfig, Crawler, EnhancerConfig, HttpFetcher, ImageFormat, Ledger,
    SeedList,
};

const DEFAULT_LOG_FILTER: &str = "upscrape=info,upscrape_core=info";

/// Incremental image crawler with batch upscaling
#[derive(Debug, Parser)]
#[clap(version)]
pub struct Args {
    #[clap(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[clap(name = "run")]
    Run(RunArgs),
    #[clap(name = "status")]
    Status(StatusArgs),
    #[clap(hide = true)]
    Completion,
}

/// Download new images and enhance them in one batch
#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Optional yaml configuration file
    #[clap(env = "UPSCRAPE_CONFIG", parse(from_os_str), long, short)]
    pub config: Option<PathBuf>,
    /// Image URL to consider, can be repeated
    #[clap(long = "url", short)]
    pub urls: Vec<String>,
    /// File with one image URL per line
    #[clap(parse(from_os_str), long)]
    pub seeds: Option<PathBuf>,
    /// Override the directory images and state files are written to
    #[clap(parse(from_os_str), long)]
    pub storage_root: Option<PathBuf>,
    /// Override the ledger file location
    #[clap(parse(from_os_str), long)]
    pub ledger_file: Option<PathBuf>,
    /// Override the run summary file location
    #[clap(parse(from_os_str), long)]
    pub summary_file: Option<PathBuf>,
    /// Override the upscaler executable, required without a config file
    #[clap(parse(from_os_str), long)]
    pub enhancer: Option<PathBuf>,
    /// Override the upscaler timeout in seconds, required without a config file
    #[clap(long)]
    pub enhance_timeout: Option<u64>,
    /// Override the upscaler noise level
    #[clap(long, allow_hyphen_values = true)]
    pub noise_level: Option<i8>,
    /// Override the upscaler scale factor
    #[clap(long)]
    pub scale: Option<u32>,
    /// Override the upscaler output format
    #[clap(value_enum, long)]
    pub format: Option<ImageFormat>,
    /// Override the user agent used for downloads
    #[clap(long)]
    pub user_agent: Option<String>,
    /// Override the maximum concurrent downloads
    #[clap(long)]
    pub concurrent_downloads: Option<usize>,
    /// Override the number of requests allowed per window
    #[clap(long)]
    pub max_requests: Option<usize>,
    /// Override the rate limit window in seconds
    #[clap(long)]
    pub window_secs: Option<u64>,
    /// Override the shortest random pause before each request
    #[clap(long)]
    pub jitter_min_secs: Option<f64>,
    /// Override the longest random pause before each request, 0 disables it
    #[clap(long)]
    pub jitter_max_secs: Option<f64>,
    /// Domain whose images skip enhancement, can be repeated
    #[clap(long = "exempt-domain")]
    pub exempt_domains: Vec<String>,
    /// No SIGINT handling, discovery won't stop early
    #[clap(long)]
    pub no_sigint: bool,
    /// Append logs to this file instead of stderr
    #[clap(parse(from_os_str), long, conflicts_with = "quiet")]
    pub log_file: Option<PathBuf>,
    /// When quiet no logs are outputted
    #[clap(long, short)]
    pub quiet: bool,
}

impl TryFrom<&RunArgs> for CoordinatorConfig {
    type Error = anyhow::Error;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        let mut conf = if let Some(file) = args.config.as_ref().map(File::open) {
            serde_yaml::from_reader(file?)?
        } else {
            let executable = args
                .enhancer
                .clone()
                .context("`--enhancer` is required without a config file")?;
            let timeout = args
                .enhance_timeout
                .context("`--enhance-timeout` is required without a config file")?;
            CoordinatorConfig::new(EnhancerConfig::new(
                executable,
                Duration::from_secs(timeout),
            ))
        };
        if let Some(storage_root) = &args.storage_root {
            conf.storage_root = storage_root.clone();
        }
        if let Some(ledger_file) = &args.ledger_file {
            conf.ledger_file = Some(ledger_file.clone());
        }
        if let Some(summary_file) = &args.summary_file {
            conf.summary_file = Some(summary_file.clone());
        }
        if let Some(enhancer) = &args.enhancer {
            conf.enhancer.executable = enhancer.clone();
        }
        if let Some(timeout) = args.enhance_timeout {
            conf.enhancer.timeout_secs = timeout;
        }
        if let Some(noise_level) = args.noise_level {
            conf.enhancer.noise_level = noise_level;
        }
        if let Some(scale) = args.scale {
            conf.enhancer.scale = scale;
        }
        if let Some(format) = args.format {
            conf.enhancer.format = format;
        }
        if let Some(user_agent) = &args.user_agent {
            conf.user_agent = user_agent.to_string();
        }
        if let Some(concurrent_downloads) = args.concurrent_downloads {
            conf.concurrent_downloads = concurrent_downloads;
        }
        if let Some(max_requests) = args.max_requests {
            conf.rate_limit.max_requests = max_requests;
        }
        if let Some(window_secs) = args.window_secs {
            conf.rate_limit.window_secs = window_secs;
        }
        if let Some(jitter_min_secs) = args.jitter_min_secs {
            conf.rate_limit.jitter_min_secs = jitter_min_secs;
        }
        if let Some(jitter_max_secs) = args.jitter_max_secs {
            conf.rate_limit.jitter_max_secs = jitter_max_secs;
        }
        conf.exempt_domains.extend(args.exempt_domains.iter().cloned());
        if args.no_sigint {
            conf.handle_sigint = false;
        }
        Ok(conf)
    }
}

impl RunArgs {
    fn seed_list(&self) -> anyhow::Result<SeedList> {
        let mut seeds = SeedList::new(self.urls.clone());
        if let Some(path) = &self.seeds {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Couldn't read seeds from {}", path.display()))?;
            seeds.extend(SeedList::parse(&text));
        }
        Ok(seeds)
    }
}

pub fn run(args: RunArgs) -> anyhow::Result<()> {
    let conf: CoordinatorConfig = (&args).try_into()?;
    let seeds = args.seed_list()?;
    if seeds.is_empty() {
        log::warn!("No seed URLs given, only pending work will be processed");
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(crawl_and_enhance(&conf, &seeds))
}

async fn crawl_and_enhance(conf: &CoordinatorConfig, seeds: &SeedList) -> anyhow::Result<()> {
    let mut coordinator = Coordinator::open(conf)?;
    let fetcher = HttpFetcher::new(conf)?;
    let crawl = Crawler::new(conf)
        .run(&mut coordinator, &fetcher, seeds)
        .await;
    if crawl.interrupted {
        log::warn!("Discovery stopped early, finishing with what was downloaded");
    }
    let report = coordinator.finish().await?;
    log::info!(
        "Ledger holds {} images, {} enhanced, {} failed",
        report.ledger.total,
        report.ledger.enhanced,
        report.ledger.failed
    );
    Ok(())
}

/// Print ledger stats and failed images
#[derive(Debug, clap::Args)]
pub struct StatusArgs {
    /// Optional yaml configuration file the ledger location is read from
    #[clap(env = "UPSCRAPE_CONFIG", parse(from_os_str), long, short)]
    pub config: Option<PathBuf>,
    /// Ledger file to inspect, takes precedence over the config file
    #[clap(parse(from_os_str), long)]
    pub ledger_file: Option<PathBuf>,
}

impl StatusArgs {
    fn ledger_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.ledger_file {
            return Ok(path.clone());
        }
        if let Some(file) = self.config.as_ref().map(File::open) {
            let conf: CoordinatorConfig = serde_yaml::from_reader(file?)?;
            return Ok(conf.ledger_path());
        }
        Ok(PathBuf::from("downloaded_images").join("image_status.json"))
    }
}

pub fn status(args: StatusArgs) -> anyhow::Result<()> {
    let path = args.ledger_path()?;
    let ledger = Ledger::load(&path);
    let stats = ledger.stats();

    println!("Ledger: {}", path.display());
    println!("Total: {}", stats.total);
    println!("Enhanced: {}", stats.enhanced);
    println!("Failed: {}", stats.failed);
    for (id, _) in ledger.iter().filter(|(_, record)| record.failed) {
        println!("  {id}");
    }
    Ok(())
}

fn init_logger(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER),
    );
    if let Some(path) = log_file {
        let file = open_log_file(path)
            .with_context(|| format!("Couldn't open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| *d != Path::new("")) {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Run(args) => {
            if !args.quiet {
                init_logger(args.log_file.as_deref())?;
            }
            run(args)
        }
        SubCommand::Status(args) => {
            init_logger(None)?;
            status(args)
        }
        SubCommand::Completion => {
            generate(Shell::Bash, &mut Args::command(), "upscrape", &mut io::stdout());
            Ok(())
        }
    }
}
