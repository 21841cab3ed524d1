//! Overlay-caching bundler.
//!
//! Each layer is extracted once into `overlay/layers/sha256/<hex>/`, with its
//! whiteouts converted to overlayfs form, and reused read-only by every later
//! run. A run's bundle stacks those directories under a fresh upper
//! directory:
//!
//! ```text
//! overlay/bundles/<run-id>/
//!   config.json
//!   upper/   writable layer, owned by this run
//!   work/    overlayfs scratch
//!   rootfs/  the overlay mount
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::layer::{extract_layer, Whiteouts};
use super::spec::{Privilege, Spec};
use super::{Bundle, BundleError};
use crate::cache::{digest_path, CacheLayout};
use crate::image::{Image, Layer};
use crate::runner::RunId;

/// Builds bundles as overlay mounts over cached layers.
#[derive(Debug, Clone)]
pub struct OverlayBundler {
    layers: PathBuf,
    bundles: PathBuf,
    tmp: PathBuf,
    privilege: Privilege,
}

impl OverlayBundler {
    pub fn new(layout: &CacheLayout) -> Self {
        Self {
            layers: layout.overlay_layers_dir(),
            bundles: layout.overlay_bundles_dir(),
            tmp: layout.tmp_dir(),
            privilege: Privilege::current(),
        }
    }

    /// Directory of the cached, extracted layer. Present only once the layer
    /// has been fully extracted.
    pub fn layer_dir(&self, digest: &str) -> Option<PathBuf> {
        digest_path(&self.layers, digest)
    }

    /// Extract `layer` into the layer cache unless it is already there.
    ///
    /// Extraction happens in a staging directory that is renamed into place,
    /// so a concurrent run either sees the finished layer or none. When two
    /// runs race, the loser's copy is discarded.
    fn ensure_layer(&self, layer: &Layer) -> Result<PathBuf, BundleError> {
        let dest = self
            .layer_dir(&layer.digest)
            .ok_or_else(|| BundleError::InvalidDigest(layer.digest.clone()))?;
        if dest.is_dir() {
            debug!(digest = %layer.digest, "Layer already cached");
            return Ok(dest);
        }

        fs::create_dir_all(&self.tmp)?;
        let staging = tempfile::Builder::new()
            .prefix(".layer-")
            .tempdir_in(&self.tmp)?;
        extract_layer(&layer.path, staging.path(), Whiteouts::Overlay).map_err(|source| {
            BundleError::Extract {
                digest: layer.digest.clone(),
                source,
            }
        })?;
        set_mode(staging.path(), 0o755)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(staging.path(), &dest) {
            Ok(()) => info!(digest = %layer.digest, "Layer cached"),
            Err(_) if dest.is_dir() => {
                debug!(digest = %layer.digest, "Layer cached concurrently, discarding ours")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(dest)
    }

    /// Build a bundle for `run_id` from `image`.
    pub fn bundle(&self, image: &Image, run_id: &RunId) -> Result<Bundle, BundleError> {
        fs::create_dir_all(&self.bundles)?;
        let dir = self.bundles.join(run_id.to_string());
        fs::create_dir(&dir)?;

        // From here on, dropping `bundle` on error releases the directory.
        let mut bundle = Bundle::overlay(dir.clone());

        let mut lower = Vec::with_capacity(image.layers.len());
        for layer in &image.layers {
            lower.push(self.ensure_layer(layer)?);
        }
        if lower.is_empty() {
            let empty = dir.join("empty");
            fs::create_dir(&empty)?;
            lower.push(empty);
        }

        let upper = dir.join("upper");
        let work = dir.join("work");
        for d in [upper.as_path(), work.as_path(), bundle.rootfs()] {
            fs::create_dir(d)?;
        }

        // overlayfs lists the topmost lower layer first.
        lower.reverse();
        mount_overlay(&lower, &upper, &work, bundle.rootfs())?;
        bundle.mounted = true;

        Spec::build(&image.config, bundle.rootfs(), self.privilege)?.write(bundle.path())?;

        info!(
            run_id = %run_id,
            layers = image.layers.len(),
            path = %dir.display(),
            "Overlay bundle ready"
        );
        Ok(bundle)
    }
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

fn overlay_options(lower: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lowerdir = lower
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper.display(),
        work.display()
    )
}

#[cfg(target_os = "linux")]
fn mount_overlay(
    lower: &[PathBuf],
    upper: &Path,
    work: &Path,
    target: &Path,
) -> Result<(), BundleError> {
    use nix::mount::{mount, MsFlags};

    let options = overlay_options(lower, upper, work);
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| BundleError::Mount {
        path: target.to_path_buf(),
        source: io::Error::from(e),
    })
}

#[cfg(not(target_os = "linux"))]
fn mount_overlay(
    _lower: &[PathBuf],
    _upper: &Path,
    _work: &Path,
    target: &Path,
) -> Result<(), BundleError> {
    Err(BundleError::Mount {
        path: target.to_path_buf(),
        source: io::Error::new(io::ErrorKind::Unsupported, "overlayfs requires Linux"),
    })
}

/// Detach the overlay at `target`. Not being mounted is not an error.
#[cfg(target_os = "linux")]
pub(crate) fn unmount(target: &Path) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::mount::{umount2, MntFlags};

    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn unmount(_target: &Path) -> io::Result<()> {
    Ok(())
}

/// Whether overlay bundles can be built in this cache directory.
///
/// Tries the real thing in a scratch directory under the cache's `tmp/`: a
/// whiteout device, an opaque xattr and an overlay mount over them.
#[cfg(target_os = "linux")]
pub fn supported(layout: &CacheLayout) -> bool {
    match try_overlay(layout) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Overlay bundles unavailable");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn supported(_layout: &CacheLayout) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn try_overlay(layout: &CacheLayout) -> Result<(), BundleError> {
    use super::layer::make_whiteout;

    let tmp = layout.tmp_dir();
    fs::create_dir_all(&tmp)?;
    let scratch = tempfile::Builder::new()
        .prefix(".overlay-check-")
        .tempdir_in(&tmp)?;

    let lower = scratch.path().join("lower");
    let upper = scratch.path().join("upper");
    let work = scratch.path().join("work");
    let merged = scratch.path().join("merged");
    for d in [&lower, &upper, &work, &merged] {
        fs::create_dir(d)?;
    }
    fs::create_dir(lower.join("opaque"))?;
    xattr::set(lower.join("opaque"), "trusted.overlay.opaque", b"y")?;
    make_whiteout(&lower.join("gone"))?;

    mount_overlay(&[lower], &upper, &work, &merged)?;
    let hidden = !merged.join("gone").exists();
    unmount(&merged)?;

    if !hidden {
        return Err(BundleError::Mount {
            path: merged,
            source: io::Error::other("whiteout not honoured"),
        });
    }
    Ok(())
}
