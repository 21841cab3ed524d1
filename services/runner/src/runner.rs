//! The end-to-end pipeline for one run.
//!
//! ```text
//! ReadRequest -> SelectBundler -> ResolveImage -> BuildBundle
//!             -> Execute -> Cleanup -> WriteResponse
//! ```
//!
//! Steps run strictly in order and any failure ends the run. Once a bundle
//! exists it is always released, whatever happens after. One deadline, taken
//! from the request or the configured default, covers everything from image
//! resolution through execution.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fnbox_proto::v1::{RunFunctionRequest, RunFunctionResponse};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bundle::{Bundle, Bundler};
use crate::cache::CacheLayout;
use crate::config::Config;
use crate::error::RunError;
use crate::image::{CachingPuller, DigestStore, ImageReference, ImageStore, Registry, RegistryClient};
use crate::runtime::RuntimeInvoker;

/// Longest deadline a request may ask for.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Unique identifier of one run. Names the bundle directory and the
/// container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A pipeline step, for logs and timeout errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ReadRequest,
    SelectBundler,
    ResolveImage,
    BuildBundle,
    Execute,
    Cleanup,
    WriteResponse,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadRequest => "read_request",
            Self::SelectBundler => "select_bundler",
            Self::ResolveImage => "resolve_image",
            Self::BuildBundle => "build_bundle",
            Self::Execute => "execute",
            Self::Cleanup => "cleanup",
            Self::WriteResponse => "write_response",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs functions against one cache directory.
pub struct Runner {
    config: Config,
    layout: CacheLayout,
    registry: Option<Arc<dyn Registry>>,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        let layout = CacheLayout::new(&config.cache_dir);
        Self {
            config,
            layout,
            registry: None,
        }
    }

    /// Use `registry` instead of talking to real registries over HTTP.
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Read a request from `input`, run it, and write the response to
    /// `output`. Nothing is written unless the run succeeds.
    pub async fn run_from_streams<R, W>(&self, mut input: R, mut output: W) -> Result<(), RunError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut raw = Vec::new();
        input.read_to_end(&mut raw).await.map_err(RunError::Input)?;
        let request = fnbox_proto::decode_request(&raw)?;

        let response = self.run(request).await?;

        debug!(step = %Step::WriteResponse, "Writing response");
        let encoded = fnbox_proto::encode_response(&response);
        output.write_all(&encoded).await.map_err(RunError::Output)?;
        output.flush().await.map_err(RunError::Output)?;
        Ok(())
    }

    /// Run one decoded request.
    pub async fn run(&self, request: RunFunctionRequest) -> Result<RunFunctionResponse, RunError> {
        let run_id = RunId::new();
        let span = info_span!("run", run_id = %run_id, image = %request.image);
        self.run_with_id(request, run_id).instrument(span).await
    }

    async fn run_with_id(
        &self,
        request: RunFunctionRequest,
        run_id: RunId,
    ) -> Result<RunFunctionResponse, RunError> {
        let timeout = request
            .timeout()
            .unwrap_or(self.config.default_timeout)
            .min(MAX_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let reference = ImageReference::parse(&request.image)?;
        info!(
            step = %Step::ReadRequest,
            image = %reference,
            input_bytes = request.input.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Request accepted"
        );

        debug!(step = %Step::SelectBundler, "Selecting bundler");
        let bundler = Bundler::select(&self.layout, self.config.bundler);

        debug!(step = %Step::ResolveImage, "Resolving image");
        let puller = self.puller()?;
        let pull_config = request.image_pull_config.clone().unwrap_or_default();
        let image = tokio::time::timeout_at(deadline, puller.resolve(&reference, &pull_config))
            .await
            .map_err(|_| RunError::Timeout {
                step: Step::ResolveImage,
            })??;
        info!(step = %Step::ResolveImage, digest = %image.digest, layers = image.layers.len(), "Image resolved");

        debug!(step = %Step::BuildBundle, bundler = bundler.name(), "Building bundle");
        let mut bundle = bundler
            .bundle(&image, &run_id)
            .await
            .map_err(RunError::Bundle)?;

        let result = self
            .execute(&bundle, &run_id, &request.input, deadline)
            .await;

        debug!(step = %Step::Cleanup, "Releasing bundle");
        let output = settle(result, bundle.cleanup())?;

        Ok(RunFunctionResponse { output })
    }

    async fn execute(
        &self,
        bundle: &Bundle,
        run_id: &RunId,
        input: &[u8],
        deadline: Instant,
    ) -> Result<Vec<u8>, RunError> {
        // Bundling runs to completion; a deadline that passed meanwhile ends
        // the run before the function starts.
        if Instant::now() >= deadline {
            return Err(RunError::Timeout {
                step: Step::BuildBundle,
            });
        }

        let invoker = RuntimeInvoker::new(&self.config.runtime, self.layout.runtime_root());
        invoker.prepare().map_err(RunError::RuntimeSetup)?;

        info!(step = %Step::Execute, runtime = %invoker.binary().display(), "Executing function");
        invoker
            .run(bundle.path(), run_id, input, deadline)
            .await
            .map_err(RunError::from_runtime)
    }

    fn puller(&self) -> Result<CachingPuller, RunError> {
        let digests = DigestStore::open(&self.layout).map_err(RunError::StoreInit)?;
        let images = ImageStore::open(&self.layout).map_err(RunError::StoreInit)?;
        let registry: Arc<dyn Registry> = match &self.registry {
            Some(registry) => registry.clone(),
            None => Arc::new(RegistryClient::new().map_err(RunError::Registry)?),
        };
        Ok(CachingPuller::new(digests, images, registry))
    }
}

/// Combine the run's result with the bundle release. A release failure is
/// the run's error only when nothing else failed.
fn settle(
    result: Result<Vec<u8>, RunError>,
    cleanup: Result<(), crate::bundle::BundleError>,
) -> Result<Vec<u8>, RunError> {
    match (result, cleanup) {
        (result, Ok(())) => result,
        (Ok(_), Err(e)) => Err(RunError::Cleanup(e)),
        (Err(primary), Err(e)) => {
            warn!(error = %e, "Failed to release bundle after failed run");
            Err(primary)
        }
    }
}
