//! Uncompressed bundler.
//!
//! Every run gets its own full copy of the image: all layers are extracted,
//! base first, into `uncompressed/bundles/<run-id>/rootfs`. Nothing is shared
//! between runs, so this works on any filesystem.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info};

use super::layer::{extract_layer, Whiteouts};
use super::spec::{Privilege, Spec};
use super::{Bundle, BundleError};
use crate::cache::CacheLayout;
use crate::image::Image;
use crate::runner::RunId;

/// Builds bundles by extracting every layer per run.
#[derive(Debug, Clone)]
pub struct UncompressedBundler {
    bundles: PathBuf,
    privilege: Privilege,
}

impl UncompressedBundler {
    pub fn new(layout: &CacheLayout) -> Self {
        Self {
            bundles: layout.uncompressed_bundles_dir(),
            privilege: Privilege::current(),
        }
    }

    /// Build a bundle for `run_id` from `image`.
    pub fn bundle(&self, image: &Image, run_id: &RunId) -> Result<Bundle, BundleError> {
        let started = Instant::now();
        fs::create_dir_all(&self.bundles)?;
        let dir = self.bundles.join(run_id.to_string());
        fs::create_dir(&dir)?;

        let bundle = Bundle::uncompressed(dir.clone());
        fs::create_dir(bundle.rootfs())?;

        for layer in &image.layers {
            debug!(digest = %layer.digest, "Extracting layer");
            extract_layer(&layer.path, bundle.rootfs(), Whiteouts::Apply).map_err(|source| {
                BundleError::Extract {
                    digest: layer.digest.clone(),
                    source,
                }
            })?;
        }

        Spec::build(&image.config, bundle.rootfs(), self.privilege)?.write(bundle.path())?;

        info!(
            run_id = %run_id,
            layers = image.layers.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            path = %dir.display(),
            "Uncompressed bundle ready"
        );
        Ok(bundle)
    }
}
