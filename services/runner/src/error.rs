//! Run errors.
//!
//! Every failure of a run is one [`RunError`], naming the kind of failure and
//! wrapping the error of the step that produced it.

use fnbox_proto::EnvelopeError;
use thiserror::Error;

use crate::bundle::BundleError;
use crate::image::{PullError, ReferenceError, StoreError};
use crate::runner::Step;
use crate::runtime::RuntimeError;

/// Exit code for runs that hit their deadline, as used by `timeout(1)`.
pub const EXIT_TIMEOUT: u8 = 124;

/// Exit code for runs whose function failed.
pub const EXIT_EXECUTION: u8 = 125;

/// Exit code for every other failure.
pub const EXIT_FAILURE: u8 = 1;

/// A failed run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to read request: {0}")]
    Input(#[source] std::io::Error),

    #[error("invalid request: {0}")]
    Decode(#[from] EnvelopeError),

    #[error("invalid image reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("failed to pull image: {0}")]
    Pull(#[from] PullError),

    #[error("failed to open image cache: {0}")]
    StoreInit(#[source] StoreError),

    #[error("failed to create registry client: {0}")]
    Registry(#[source] crate::image::RegistryError),

    #[error("failed to build bundle: {0}")]
    Bundle(#[source] BundleError),

    #[error("failed to prepare runtime: {0}")]
    RuntimeSetup(#[source] RuntimeError),

    #[error("function execution failed: {0}")]
    Execution(#[source] RuntimeError),

    #[error("failed to release bundle: {0}")]
    Cleanup(#[source] BundleError),

    #[error("failed to write response: {0}")]
    Output(#[source] std::io::Error),

    #[error("deadline exceeded during {step}")]
    Timeout { step: Step },
}

impl RunError {
    /// Stable reason code for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) | Self::Decode(_) => "input",
            Self::Reference(_) => "reference",
            Self::StoreInit(_) => "store_init",
            Self::Pull(_) | Self::Registry(_) => "pull",
            Self::Bundle(_) => "bundle",
            Self::RuntimeSetup(_) => "runtime_setup",
            Self::Execution(_) => "execution",
            Self::Cleanup(_) => "cleanup",
            Self::Output(_) => "output",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Timeout { .. } => EXIT_TIMEOUT,
            Self::Execution(_) => EXIT_EXECUTION,
            _ => EXIT_FAILURE,
        }
    }

    /// Map a runtime error from the execute step.
    pub(crate) fn from_runtime(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Timeout => Self::Timeout {
                step: Step::Execute,
            },
            other => Self::Execution(other),
        }
    }
}
