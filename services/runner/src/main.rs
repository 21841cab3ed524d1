//! fnbox-run - run one composition function packaged as an OCI image.
//!
//! Reads a RunFunctionRequest from stdin, pulls and bundles the image, runs it
//! under an OCI runtime, and writes the RunFunctionResponse to stdout. Logs go
//! to stderr. Exit codes: 0 on success, 124 on timeout, 125 when the function
//! fails, 1 otherwise.

use std::error::Error;
use std::process::ExitCode;

use clap::Parser;
use fnbox_runner::config::Args;
use fnbox_runner::{Config, Runner};
use tracing::{error, info};

/// Runner version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from(Args::parse());

    if let Err(e) = fnbox_runner::logging::init(&config) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(fnbox_runner::error::EXIT_FAILURE);
    }

    info!(
        version = VERSION,
        cache_dir = %config.cache_dir.display(),
        runtime = %config.runtime.display(),
        "fnbox-run starting"
    );

    let runner = Runner::new(config);
    match runner
        .run_from_streams(tokio::io::stdin(), tokio::io::stdout())
        .await
    {
        Ok(()) => {
            info!("Run completed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(kind = e.kind(), error = %e, "Run failed");
            let mut source = e.source();
            while let Some(cause) = source {
                error!(cause = %cause, "caused by");
                source = cause.source();
            }
            ExitCode::from(e.exit_code())
        }
    }
}
