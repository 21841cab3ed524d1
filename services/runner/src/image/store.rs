//! Content-addressed Image Store.
//!
//! Manifests and blobs live under `images/manifests` and `images/blobs`,
//! keyed by their sha256 digest. Every write is verified against the digest
//! and lands through an atomic rename, so a concurrent reader sees either a
//! complete entry or none. Reads trust what was written.
//!
//! An image is committed by writing its manifest last: `has` only reports an
//! image once the manifest and every blob it names are present.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use super::oci::{parse_manifest, ImageConfig, Manifest, ManifestKind, Platform};
use crate::cache::{digest_path, sha256_hex, write_atomic, CacheLayout};

/// Errors from the Digest Store and Image Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to initialize store at {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("not in store: {0}")]
    NotFound(String),

    #[error("corrupt manifest or config {digest}: {source}")]
    Corrupt {
        digest: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("index {0} has no manifest for this platform")]
    NoMatchingPlatform(String),
}

/// One layer of a stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub digest: String,
    pub media_type: String,
    /// Path of the stored blob.
    pub path: PathBuf,
}

/// An image read back from the store.
#[derive(Debug, Clone)]
pub struct Image {
    /// Digest the image was resolved by. For a multi-platform image this is
    /// the index digest.
    pub digest: String,
    /// Digest of the platform image manifest.
    pub manifest_digest: String,
    pub manifest: Manifest,
    pub config: ImageConfig,
    /// Layers, base layer first.
    pub layers: Vec<Layer>,
}

/// On-disk content-addressed store of manifests and blobs.
#[derive(Debug, Clone)]
pub struct ImageStore {
    blobs: PathBuf,
    manifests: PathBuf,
    tmp: PathBuf,
    platform: Platform,
}

impl ImageStore {
    /// Open the store, creating its directories if needed.
    pub fn open(layout: &CacheLayout) -> Result<Self, StoreError> {
        let store = Self {
            blobs: layout.blobs_dir(),
            manifests: layout.manifests_dir(),
            tmp: layout.tmp_dir(),
            platform: Platform::host(),
        };
        for dir in [&store.blobs, &store.manifests, &store.tmp] {
            fs::create_dir_all(dir).map_err(|source| StoreError::Init {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(store)
    }

    /// Use `platform` when following a stored index.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Whether the full image for `digest` is present: its manifest (and,
    /// for an index, the platform manifest), config and every layer blob.
    pub fn has(&self, digest: &str) -> bool {
        match self.get(digest) {
            Ok(image) => {
                self.has_blob(&image.manifest.config.digest)
                    && image.layers.iter().all(|l| l.path.is_file())
            }
            Err(_) => false,
        }
    }

    pub fn has_manifest(&self, digest: &str) -> bool {
        digest_path(&self.manifests, digest).is_some_and(|p| p.is_file())
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_some_and(|p| p.is_file())
    }

    /// Path of a blob, whether or not it is present.
    pub fn blob_path(&self, digest: &str) -> Option<PathBuf> {
        digest_path(&self.blobs, digest)
    }

    /// Store a blob after checking it against `digest`. Storing a blob that
    /// is already present is a no-op.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self
            .blob_path(digest)
            .ok_or_else(|| StoreError::InvalidDigest(digest.to_string()))?;
        verify(digest, data)?;
        if !path.is_file() {
            write_atomic(&self.tmp, &path, data)?;
            debug!(digest = %digest, size = data.len(), "Stored blob");
        }
        Ok(path)
    }

    /// Store a manifest or index after checking it against `digest`.
    ///
    /// Callers write every blob the manifest names first.
    pub fn put_manifest(&self, digest: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = digest_path(&self.manifests, digest)
            .ok_or_else(|| StoreError::InvalidDigest(digest.to_string()))?;
        verify(digest, data)?;
        parse_manifest(data).map_err(|source| StoreError::Corrupt {
            digest: digest.to_string(),
            source,
        })?;
        write_atomic(&self.tmp, &path, data)?;
        debug!(digest = %digest, "Stored manifest");
        Ok(())
    }

    /// Raw bytes of a stored manifest.
    pub fn manifest_bytes(&self, digest: &str) -> Result<Vec<u8>, StoreError> {
        let path = digest_path(&self.manifests, digest)
            .ok_or_else(|| StoreError::InvalidDigest(digest.to_string()))?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(digest.to_string()),
            _ => StoreError::Io(e),
        })
    }

    /// Read an image, following a stored index to this platform's manifest.
    pub fn get(&self, digest: &str) -> Result<Image, StoreError> {
        let (manifest_digest, manifest) = match self.read_manifest(digest)? {
            ManifestKind::Image(m) => (digest.to_string(), m),
            ManifestKind::Index(index) => {
                let child = index
                    .select(&self.platform)
                    .ok_or_else(|| StoreError::NoMatchingPlatform(digest.to_string()))?;
                match self.read_manifest(&child.digest)? {
                    ManifestKind::Image(m) => (child.digest.clone(), m),
                    ManifestKind::Index(_) => {
                        return Err(StoreError::NotFound(format!(
                            "nested index {} in {}",
                            child.digest, digest
                        )))
                    }
                }
            }
        };

        let config_digest = &manifest.config.digest;
        let config_path = self
            .blob_path(config_digest)
            .ok_or_else(|| StoreError::InvalidDigest(config_digest.clone()))?;
        let raw = fs::read(&config_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(config_digest.clone()),
            _ => StoreError::Io(e),
        })?;
        let config: ImageConfig =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                digest: config_digest.clone(),
                source,
            })?;

        let layers = manifest
            .layers
            .iter()
            .map(|d| {
                let path = self
                    .blob_path(&d.digest)
                    .ok_or_else(|| StoreError::InvalidDigest(d.digest.clone()))?;
                Ok(Layer {
                    digest: d.digest.clone(),
                    media_type: d.media_type.clone(),
                    path,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Image {
            digest: digest.to_string(),
            manifest_digest,
            manifest,
            config,
            layers,
        })
    }

    fn read_manifest(&self, digest: &str) -> Result<ManifestKind, StoreError> {
        let raw = self.manifest_bytes(digest)?;
        parse_manifest(&raw).map_err(|source| StoreError::Corrupt {
            digest: digest.to_string(),
            source,
        })
    }
}

fn verify(digest: &str, data: &[u8]) -> Result<(), StoreError> {
    let actual = format!("sha256:{}", sha256_hex(data));
    if actual != digest {
        return Err(StoreError::DigestMismatch {
            expected: digest.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn digest_of(data: &[u8]) -> String {
        format!("sha256:{}", sha256_hex(data))
    }

    /// Write a small image into `store` and return its manifest digest.
    pub(crate) fn seed_image(store: &ImageStore, layers: &[&[u8]]) -> String {
        let config = br#"{"config":{"Cmd":["/bin/fn"]}}"#;
        let config_digest = digest_of(config);
        store.put_blob(&config_digest, config).unwrap();

        let mut descriptors = Vec::new();
        for layer in layers {
            let d = digest_of(layer);
            store.put_blob(&d, layer).unwrap();
            descriptors.push(serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": d,
                "size": layer.len(),
            }));
        }
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": descriptors,
        }))
        .unwrap();
        let digest = digest_of(&manifest);
        store.put_manifest(&digest, &manifest).unwrap();
        digest
    }

    fn open() -> (tempfile::TempDir, ImageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(&CacheLayout::new(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_and_get_image() {
        let (_dir, store) = open();
        let digest = seed_image(&store, &[b"layer-one", b"layer-two"]);

        assert!(store.has(&digest));
        let image = store.get(&digest).unwrap();
        assert_eq!(image.digest, digest);
        assert_eq!(image.manifest_digest, digest);
        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.layers[0].digest, digest_of(b"layer-one"));
        assert_eq!(fs::read(&image.layers[1].path).unwrap(), b"layer-two");
        assert_eq!(
            image.config.config.unwrap().cmd,
            Some(vec!["/bin/fn".to_string()])
        );
    }

    #[test]
    fn test_put_blob_rejects_mismatch() {
        let (_dir, store) = open();
        let wrong = digest_of(b"something else");
        assert!(matches!(
            store.put_blob(&wrong, b"data"),
            Err(StoreError::DigestMismatch { .. })
        ));
        assert!(!store.has_blob(&wrong));
    }

    #[test]
    fn test_put_blob_rejects_malformed_digest() {
        let (_dir, store) = open();
        assert!(matches!(
            store.put_blob("sha256:../../etc", b"data"),
            Err(StoreError::InvalidDigest(_))
        ));
    }

    #[test]
    fn test_put_blob_twice_is_idempotent() {
        let (_dir, store) = open();
        let d = digest_of(b"same");
        let first = store.put_blob(&d, b"same").unwrap();
        let second = store.put_blob(&d, b"same").unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(first).unwrap(), b"same");
    }

    #[test]
    fn test_has_is_false_when_layer_missing() {
        let (_dir, store) = open();
        let digest = seed_image(&store, &[b"base"]);
        fs::remove_file(store.blob_path(&digest_of(b"base")).unwrap()).unwrap();
        assert!(!store.has(&digest));
    }

    #[test]
    fn test_get_missing() {
        let (_dir, store) = open();
        assert!(!store.has(&digest_of(b"nothing")));
        assert!(matches!(
            store.get(&digest_of(b"nothing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_get_follows_index() {
        let (_dir, store) = open();
        let child = seed_image(&store, &[b"amd64-layer"]);
        let platform = store.platform().clone();
        let index = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": digest_of(b"other"),
                    "size": 1,
                    "platform": {"architecture": "s390x", "os": "linux"},
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": child,
                    "size": 1,
                    "platform": {"architecture": platform.architecture, "os": "linux"},
                },
            ],
        }))
        .unwrap();
        let index_digest = digest_of(&index);
        store.put_manifest(&index_digest, &index).unwrap();

        let image = store.get(&index_digest).unwrap();
        assert_eq!(image.digest, index_digest);
        assert_eq!(image.manifest_digest, child);
        assert!(store.has(&index_digest));
    }
}
