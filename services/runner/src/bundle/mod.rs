//! Bundles: a root filesystem plus `config.json`, ready for an OCI runtime.
//!
//! Two strategies build them:
//!
//! - [`OverlayBundler`] extracts each layer once into a shared cache and
//!   mounts a per-run overlay on top.
//! - [`UncompressedBundler`] extracts every layer into a fresh per-run tree.
//!
//! The strategy is picked once per process by [`Bundler::select`]. Either way
//! the result is a [`Bundle`] that must be released with
//! [`Bundle::cleanup`]; dropping an unreleased bundle releases it too.

mod layer;
pub mod overlay;
pub mod spec;
mod uncompressed;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::CacheLayout;
use crate::config::BundlerMode;
use crate::image::Image;
use crate::runner::RunId;

pub use overlay::OverlayBundler;
pub use spec::{Privilege, Spec};
pub use uncompressed::UncompressedBundler;

/// Errors from building or releasing a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to extract layer {digest}: {source}")]
    Extract {
        digest: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid layer digest: {0}")]
    InvalidDigest(String),

    #[error("failed to mount overlay at {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmount {path}: {source}")]
    Unmount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image defines no entrypoint or command")]
    NoCommand,

    #[error("image user {0:?} not found in the image")]
    UnknownUser(String),

    #[error("failed to encode runtime config: {0}")]
    Spec(#[source] serde_json::Error),

    #[error("bundling task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug)]
enum Backing {
    Overlay,
    Uncompressed,
}

/// A prepared bundle directory owned by one run.
#[derive(Debug)]
pub struct Bundle {
    path: PathBuf,
    rootfs: PathBuf,
    backing: Backing,
    /// Whether `rootfs` is an overlay mount that must be detached.
    mounted: bool,
    released: bool,
}

impl Bundle {
    fn overlay(path: PathBuf) -> Self {
        Self::new(path, Backing::Overlay)
    }

    fn uncompressed(path: PathBuf) -> Self {
        Self::new(path, Backing::Uncompressed)
    }

    fn new(path: PathBuf, backing: Backing) -> Self {
        Self {
            rootfs: path.join("rootfs"),
            path,
            backing,
            mounted: false,
            released: false,
        }
    }

    /// The bundle directory, passed to the runtime as `--bundle`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Release the bundle: detach the overlay, if any, and remove the
    /// bundle directory. Cached overlay layers are kept. Calling this again
    /// after it succeeded does nothing.
    pub fn cleanup(&mut self) -> Result<(), BundleError> {
        if self.released {
            return Ok(());
        }

        if self.mounted {
            overlay::unmount(&self.rootfs).map_err(|source| BundleError::Unmount {
                path: self.rootfs.clone(),
                source,
            })?;
            self.mounted = false;
        }

        layer::remove_path(&self.path)?;
        self.released = true;
        debug!(path = %self.path.display(), backing = ?self.backing, "Bundle released");
        Ok(())
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(path = %self.path.display(), error = %e, "Failed to release bundle");
        }
    }
}

/// The bundling strategy in use for this process.
#[derive(Debug, Clone)]
pub enum Bundler {
    Overlay(OverlayBundler),
    Uncompressed(UncompressedBundler),
}

impl Bundler {
    /// Pick a strategy. `Auto` prefers overlay when the cache directory
    /// supports it.
    pub fn select(layout: &CacheLayout, mode: BundlerMode) -> Self {
        let bundler = match mode {
            BundlerMode::Overlay => Self::Overlay(OverlayBundler::new(layout)),
            BundlerMode::Uncompressed => Self::Uncompressed(UncompressedBundler::new(layout)),
            BundlerMode::Auto if overlay::supported(layout) => {
                Self::Overlay(OverlayBundler::new(layout))
            }
            BundlerMode::Auto => Self::Uncompressed(UncompressedBundler::new(layout)),
        };
        info!(bundler = bundler.name(), ?mode, "Selected bundler");
        bundler
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Overlay(_) => "overlay",
            Self::Uncompressed(_) => "uncompressed",
        }
    }

    /// Build a bundle on the blocking thread pool.
    pub async fn bundle(&self, image: &Image, run_id: &RunId) -> Result<Bundle, BundleError> {
        let bundler = self.clone();
        let image = image.clone();
        let run_id = run_id.clone();
        tokio::task::spawn_blocking(move || bundler.bundle_blocking(&image, &run_id)).await?
    }

    pub fn bundle_blocking(&self, image: &Image, run_id: &RunId) -> Result<Bundle, BundleError> {
        match self {
            Self::Overlay(b) => b.bundle(image, run_id),
            Self::Uncompressed(b) => b.bundle(image, run_id),
        }
    }
}
