//! Runner configuration.
//!
//! Parsed from the command line with environment fallbacks. [`Config`] is a
//! plain struct so tests can build one directly.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Default deadline when a request carries no timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

/// Which bundling strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BundlerMode {
    /// Overlay when the cache directory supports it, uncompressed otherwise.
    #[default]
    Auto,
    Overlay,
    Uncompressed,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// fnbox-run - run one composition function packaged as an OCI image.
///
/// Reads a RunFunctionRequest from stdin and writes a RunFunctionResponse to
/// stdout. Logs go to stderr.
#[derive(Debug, Parser)]
#[command(name = "fnbox-run")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory shared by all runs for images, layers and runtime state.
    #[arg(long, env = "FNBOX_CACHE_DIR", default_value = "/fnbox")]
    pub cache_dir: PathBuf,

    /// OCI runtime binary, e.g. crun or runc.
    #[arg(long, env = "FNBOX_RUNTIME", default_value = "crun")]
    pub runtime: PathBuf,

    /// Deadline in seconds for requests that don't set one.
    #[arg(long, env = "FNBOX_DEFAULT_TIMEOUT", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub default_timeout: u64,

    /// Bundling strategy.
    #[arg(long, env = "FNBOX_BUNDLER", value_enum, default_value_t = BundlerMode::Auto)]
    pub bundler: BundlerMode,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "FNBOX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format.
    #[arg(long, env = "FNBOX_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Resolved runner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub runtime: PathBuf,
    pub default_timeout: Duration,
    pub bundler: BundlerMode,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// A configuration with defaults for everything but the cache directory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            runtime: PathBuf::from("crun"),
            default_timeout: DEFAULT_TIMEOUT,
            bundler: BundlerMode::Auto,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            cache_dir: args.cache_dir,
            runtime: args.runtime,
            default_timeout: Duration::from_secs(args.default_timeout.max(1)),
            bundler: args.bundler,
            log_level: args.log_level,
            log_format: args.log_format,
        }
    }
}
