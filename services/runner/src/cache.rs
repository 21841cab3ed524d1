//! On-disk layout of the shared cache directory.
//!
//! Every runner process on a host shares one cache tree:
//!
//! ```text
//! <root>/
//!   digests/                      reference -> manifest digest records
//!   images/blobs/sha256/<hex>     layer and config blobs
//!   images/manifests/sha256/<hex> raw manifests and indexes
//!   overlay/layers/sha256/<hex>/  extracted, overlay-ready layers
//!   overlay/bundles/<run-id>/     per-run overlay bundles
//!   uncompressed/bundles/<run-id>/ per-run extracted bundles
//!   tmp/                          staging area for atomic renames
//!   runtime/                      the OCI runtime's --root
//! ```
//!
//! Staging lives inside the cache root so a rename into place never crosses
//! a filesystem boundary.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Path within the cache dir that the OCI runtime uses for its `--root`.
pub const RUNTIME_ROOT: &str = "runtime";

/// Paths within a cache directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Create a layout rooted at `root`. Nothing is created on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn digests_dir(&self) -> PathBuf {
        self.root.join("digests")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("images").join("blobs")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("images").join("manifests")
    }

    pub fn overlay_layers_dir(&self) -> PathBuf {
        self.root.join("overlay").join("layers")
    }

    pub fn overlay_bundles_dir(&self) -> PathBuf {
        self.root.join("overlay").join("bundles")
    }

    pub fn uncompressed_bundles_dir(&self) -> PathBuf {
        self.root.join("uncompressed").join("bundles")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn runtime_root(&self) -> PathBuf {
        self.root.join(RUNTIME_ROOT)
    }
}

/// Write `data` to `dest` atomically.
///
/// The bytes land in a uniquely named file under `tmp_dir` first and are
/// renamed over `dest` once synced. Readers observe either the old entry, the
/// new entry, or nothing. If the write fails the staging file is removed.
pub fn write_atomic(tmp_dir: &Path, dest: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir_all(tmp_dir)?;

    let mut staged = tempfile::Builder::new()
        .prefix(".stage-")
        .tempfile_in(tmp_dir)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Hex-encoded sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Resolve a `sha256:<hex>` digest to `<dir>/sha256/<hex>`.
///
/// Returns `None` for anything that is not a well-formed sha256 digest, so a
/// hostile digest string can never address a path outside `dir`.
pub fn digest_path(dir: &Path, digest: &str) -> Option<PathBuf> {
    let hex = digest.strip_prefix("sha256:")?;
    if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    Some(dir.join("sha256").join(hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = CacheLayout::new("/fnbox");
        assert_eq!(layout.runtime_root(), PathBuf::from("/fnbox/runtime"));
        assert_eq!(layout.blobs_dir(), PathBuf::from("/fnbox/images/blobs"));
        assert_eq!(
            layout.overlay_bundles_dir(),
            PathBuf::from("/fnbox/overlay/bundles")
        );
    }

    #[test]
    fn test_digest_path() {
        let hex = "a".repeat(64);
        let path = digest_path(Path::new("/c"), &format!("sha256:{hex}")).unwrap();
        assert_eq!(path, PathBuf::from(format!("/c/sha256/{hex}")));
    }

    #[test]
    fn test_digest_path_rejects_malformed() {
        assert!(digest_path(Path::new("/c"), "sha256:abc").is_none());
        assert!(digest_path(Path::new("/c"), "sha512:abc").is_none());
        assert!(digest_path(Path::new("/c"), &format!("sha256:../{}", "a".repeat(61))).is_none());
        assert!(digest_path(Path::new("/c"), &format!("sha256:{}", "A".repeat(64))).is_none());
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_staging() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        let dest = layout.digests_dir().join("entry");

        write_atomic(&layout.tmp_dir(), &dest, b"first").unwrap();
        write_atomic(&layout.tmp_dir(), &dest, b"second").unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"second");
        assert_eq!(fs::read_dir(layout.tmp_dir()).unwrap().count(), 0);
    }

    proptest::proptest! {
        #[test]
        fn test_digest_path_stays_inside(digest in "\\PC{0,80}") {
            let dir = Path::new("/c/blobs");
            let expected = dir.join("sha256");
            if let Some(path) = digest_path(dir, &digest) {
                proptest::prop_assert_eq!(path.parent(), Some(expected.as_path()));
            }
        }

        #[test]
        fn test_digest_path_accepts_real_digests(data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let digest = format!("sha256:{}", sha256_hex(&data));
            proptest::prop_assert!(digest_path(Path::new("/c"), &digest).is_some());
        }
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
