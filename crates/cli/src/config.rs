use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use secmeta_annotate::Flavor;

#[derive(Parser, Debug)]
#[command(name = "secmetad", version, about = "Keeps image and pod metadata in sync with a scan service")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Log filter when SECMETA_LOG is unset
    #[arg(long = "log-level", env = "SECMETA_LOG_LEVEL", global = true, default_value = "info")]
    pub log_level: String,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", env = "SECMETA_METRICS_ADDR", global = true)]
    pub metrics_addr: Option<SocketAddr>,

    /// Reconcile workers per engine
    #[arg(long = "threadiness", env = "SECMETA_THREADINESS", global = true, default_value_t = 5)]
    pub threadiness: usize,

    /// Only watch this namespace
    #[arg(long = "namespace", env = "SECMETA_NAMESPACE", global = true)]
    pub namespace: Option<String>,

    /// Scan service base URL
    #[arg(long = "scan-url", env = "SECMETA_SCAN_URL", global = true)]
    pub scan_url: Option<String>,

    #[arg(long = "annotation-interval-secs", env = "SECMETA_ANNOTATION_INTERVAL_SECS", global = true, default_value_t = 30)]
    pub annotation_interval_secs: u64,

    /// Full inventory upload period; 0 disables it
    #[arg(long = "dump-interval-mins", env = "SECMETA_DUMP_INTERVAL_MINS", global = true, default_value_t = 30)]
    pub dump_interval_mins: u64,

    #[arg(long = "http-timeout-secs", env = "SECMETA_HTTP_TIMEOUT_SECS", global = true, default_value_t = 10)]
    pub http_timeout_secs: u64,

    /// Give up when the first listing has not completed within this many seconds
    #[arg(long = "startup-timeout-secs", env = "SECMETA_STARTUP_TIMEOUT_SECS", global = true, default_value_t = 60)]
    pub startup_timeout_secs: u64,

    /// Annotation layout: platform or blackduck
    #[arg(long = "flavor", env = "SECMETA_FLAVOR", global = true, default_value = "blackduck")]
    pub flavor: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Sync OpenShift images with the scan service and annotate them
    ImageProcessor,
    /// Sync pods with the scan service and annotate them
    PodProcessor,
    /// Reconcile ScanPipeline resources
    PipelineController {
        /// YAML ScanPipelineSpec laid over the built-in defaults
        #[arg(long = "defaults-file", env = "SECMETA_DEFAULTS_FILE")]
        defaults_file: Option<PathBuf>,

        /// Requeue every pipeline this often so deleted or edited components are restored
        #[arg(long = "resync-interval-secs", env = "SECMETA_RESYNC_INTERVAL_SECS", default_value_t = 300)]
        resync_interval_secs: u64,
    },
    /// Print the ScanPipeline CustomResourceDefinition as YAML
    Crd,
}

/// Validated settings shared by every task of one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub threadiness: usize,
    pub namespace: Option<String>,
    pub scan_url: String,
    pub annotation_interval: Duration,
    pub dump_interval: Option<Duration>,
    pub http_timeout: Duration,
    pub startup_timeout: Duration,
    pub flavor: Flavor,
}

impl EngineConfig {
    pub fn from_args(args: &GlobalArgs, needs_scan_url: bool) -> Result<Self> {
        if args.threadiness == 0 {
            bail!("--threadiness must be at least 1");
        }
        if args.annotation_interval_secs == 0 {
            bail!("--annotation-interval-secs must be positive");
        }
        if args.http_timeout_secs == 0 {
            bail!("--http-timeout-secs must be positive");
        }
        if args.startup_timeout_secs == 0 {
            bail!("--startup-timeout-secs must be positive");
        }
        let scan_url = args.scan_url.clone().unwrap_or_default();
        if needs_scan_url {
            if scan_url.is_empty() {
                bail!("--scan-url is required");
            }
            if !(scan_url.starts_with("http://") || scan_url.starts_with("https://")) {
                bail!("--scan-url {scan_url:?} must be an http or https URL");
            }
        }
        let flavor: Flavor = args.flavor.parse().with_context(|| format!("--flavor {:?}", args.flavor))?;
        Ok(Self {
            threadiness: args.threadiness,
            namespace: args.namespace.clone().filter(|n| !n.is_empty()),
            scan_url,
            annotation_interval: Duration::from_secs(args.annotation_interval_secs),
            dump_interval: (args.dump_interval_mins > 0).then(|| Duration::from_secs(args.dump_interval_mins * 60)),
            http_timeout: Duration::from_secs(args.http_timeout_secs),
            startup_timeout: Duration::from_secs(args.startup_timeout_secs),
            flavor,
        })
    }
}
