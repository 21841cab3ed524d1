//! Caching image puller.
//!
//! Resolves a reference to a stored [`Image`], consulting the Digest Store
//! and Image Store before the registry:
//!
//! 1. A digest reference whose image is stored is returned without any
//!    network call.
//! 2. A tag reference is revalidated with a manifest digest check. If the
//!    current digest is already stored nothing is downloaded.
//! 3. Otherwise the manifest is fetched and every blob not yet in the store
//!    is downloaded. Blobs shared between images are fetched once.
//! 4. The manifest is stored last, then the Digest Store is updated.
//!
//! The pull policy can skip the registry: `IfNotPresent` serves a tag from a
//! known digest record, `Never` serves only from the cache.

use std::sync::Arc;
use std::time::Instant;

use fnbox_proto::v1::{ImagePullConfig, ImagePullPolicy};
use thiserror::Error;
use tracing::{debug, info};

use super::auth::{AuthError, Credentials};
use super::digest_store::DigestStore;
use super::oci::{parse_manifest, ManifestKind, Registry, RegistryError};
use super::reference::ImageReference;
use super::store::{Image, ImageStore, StoreError};

/// Errors from image resolution.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid pull credentials: {0}")]
    Auth(#[from] AuthError),

    #[error("image {0} is not cached and the pull policy forbids pulling")]
    NotCached(String),

    #[error("image {0} has no manifest for this platform")]
    NoMatchingPlatform(String),

    #[error("invalid manifest {digest}: {source}")]
    InvalidManifest {
        digest: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported manifest {0}: nested index")]
    UnsupportedManifest(String),
}

/// Resolves references to stored images.
pub struct CachingPuller {
    digests: DigestStore,
    images: ImageStore,
    registry: Arc<dyn Registry>,
}

impl CachingPuller {
    pub fn new(digests: DigestStore, images: ImageStore, registry: Arc<dyn Registry>) -> Self {
        Self {
            digests,
            images,
            registry,
        }
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    /// Resolve `reference` to a stored image, pulling it if needed.
    pub async fn resolve(
        &self,
        reference: &ImageReference,
        config: &ImagePullConfig,
    ) -> Result<Image, PullError> {
        let policy = config.pull_policy();

        if let Some(digest) = reference.digest() {
            if self.images.has(digest) {
                debug!(image = %reference, "Image present, skipping registry");
                return Ok(self.images.get(digest)?);
            }
            if policy == ImagePullPolicy::Never {
                return Err(PullError::NotCached(reference.to_string()));
            }
            let creds = Credentials::from_pull_auth(config.auth.as_ref())?;
            self.pull(reference, digest, &creds).await?;
            return Ok(self.images.get(digest)?);
        }

        let recorded = self.digests.get(reference)?;
        let present = recorded.as_deref().filter(|d| self.images.has(d));

        match (policy, present) {
            (ImagePullPolicy::Never | ImagePullPolicy::IfNotPresent, Some(digest)) => {
                debug!(image = %reference, digest = %digest, ?policy, "Serving recorded digest");
                return Ok(self.images.get(digest)?);
            }
            (ImagePullPolicy::Never, None) => {
                return Err(PullError::NotCached(reference.to_string()));
            }
            _ => {}
        }

        let creds = Credentials::from_pull_auth(config.auth.as_ref())?;
        let current = self.registry.manifest_digest(reference, &creds).await?;

        if self.images.has(&current) {
            debug!(image = %reference, digest = %current, "Current digest already stored");
        } else {
            if let Some(previous) = &recorded {
                info!(image = %reference, previous = %previous, current = %current, "Tag moved");
            }
            self.pull(reference, &current, &creds).await?;
        }

        if recorded.as_deref() != Some(current.as_str()) {
            self.digests.put(reference, &current)?;
        }

        Ok(self.images.get(&current)?)
    }

    /// Pull the manifest `digest` and everything it names into the store.
    async fn pull(
        &self,
        reference: &ImageReference,
        digest: &str,
        creds: &Credentials,
    ) -> Result<(), PullError> {
        let started = Instant::now();
        info!(image = %reference, digest = %digest, "Pulling image");

        let raw = self.registry.fetch_manifest(reference, digest, creds).await?;
        let fetched = match self.parse(digest, &raw)? {
            ManifestKind::Image(_) => self.pull_image(reference, digest, &raw, creds).await?,
            ManifestKind::Index(index) => {
                let child = index
                    .select(self.images.platform())
                    .ok_or_else(|| PullError::NoMatchingPlatform(reference.to_string()))?;
                debug!(index = %digest, manifest = %child.digest, "Selected platform manifest");

                let child_raw = self
                    .registry
                    .fetch_manifest(reference, &child.digest, creds)
                    .await?;
                if let ManifestKind::Index(_) = self.parse(&child.digest, &child_raw)? {
                    return Err(PullError::UnsupportedManifest(child.digest.clone()));
                }
                let fetched = self
                    .pull_image(reference, &child.digest, &child_raw, creds)
                    .await?;
                self.images.put_manifest(digest, &raw)?;
                fetched
            }
        };

        info!(
            image = %reference,
            digest = %digest,
            blobs_fetched = fetched,
            duration_ms = started.elapsed().as_millis() as u64,
            "Image pulled"
        );
        Ok(())
    }

    /// Fetch the config and layers of an image manifest, then commit the
    /// manifest. Returns the number of blobs downloaded.
    async fn pull_image(
        &self,
        reference: &ImageReference,
        digest: &str,
        raw: &[u8],
        creds: &Credentials,
    ) -> Result<usize, PullError> {
        let ManifestKind::Image(manifest) = self.parse(digest, raw)? else {
            return Err(PullError::UnsupportedManifest(digest.to_string()));
        };

        let mut fetched = 0;
        let blobs = std::iter::once(&manifest.config).chain(manifest.layers.iter());
        for blob in blobs {
            if self.images.has_blob(&blob.digest) {
                debug!(digest = %blob.digest, "Blob already stored");
                continue;
            }
            let data = self
                .registry
                .fetch_blob(reference, &blob.digest, creds)
                .await?;
            self.images.put_blob(&blob.digest, &data)?;
            fetched += 1;
        }

        self.images.put_manifest(digest, raw)?;
        Ok(fetched)
    }

    fn parse(&self, digest: &str, raw: &[u8]) -> Result<ManifestKind, PullError> {
        parse_manifest(raw).map_err(|source| PullError::InvalidManifest {
            digest: digest.to_string(),
            source,
        })
    }
}
