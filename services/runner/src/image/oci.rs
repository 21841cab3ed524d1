//! OCI registry client and image format types.
//!
//! This module implements the parts of the OCI Distribution Specification
//! the puller needs: resolving a reference to a manifest digest, fetching
//! manifests (image manifests and indexes), and fetching blobs.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::auth::{fetch_token, AuthError, Challenge, Credentials};
use super::reference::ImageReference;
use crate::cache::sha256_hex;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Header carrying the canonical manifest digest.
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("authentication required for {0}")]
    AuthRequired(String),

    #[error("access denied for {0}")]
    Denied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

/// The operations the caching puller needs from a registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a reference to its current manifest digest.
    async fn manifest_digest(
        &self,
        image: &ImageReference,
        creds: &Credentials,
    ) -> Result<String, RegistryError>;

    /// Fetch a manifest or index by tag or digest.
    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        identifier: &str,
        creds: &Credentials,
    ) -> Result<Bytes, RegistryError>;

    /// Fetch a blob by digest.
    async fn fetch_blob(
        &self,
        image: &ImageReference,
        digest: &str,
        creds: &Credentials,
    ) -> Result<Bytes, RegistryError>;
}

/// OCI Distribution client.
pub struct RegistryClient {
    client: Client,
    /// Bearer tokens keyed by registry and repository.
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    /// Create a new registry client.
    ///
    /// There is no overall request timeout: the run's deadline bounds every
    /// registry call.
    pub fn new() -> Result<Self, RegistryError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("fnbox/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn token_key(image: &ImageReference) -> String {
        format!("{}/{}", image.registry(), image.repository())
    }

    /// Send a request, answering at most one auth challenge.
    async fn send(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        image: &ImageReference,
        creds: &Credentials,
    ) -> Result<Response, RegistryError> {
        let key = Self::token_key(image);
        let mut basic = false;
        let mut retried = false;

        loop {
            let mut req = self.client.request(method.clone(), url);
            if let Some(accept) = accept {
                req = req.header(ACCEPT, accept);
            }

            let token = match creds {
                Credentials::RegistryToken(t) => Some(t.clone()),
                _ => self.tokens.lock().await.get(&key).cloned(),
            };
            req = match token {
                Some(token) => req.bearer_auth(token),
                None if basic => creds.apply_basic(req),
                None => req,
            };

            let response = req.send().await?;
            if retried
                || response.status() != StatusCode::UNAUTHORIZED
                || matches!(creds, Credentials::RegistryToken(_))
            {
                return Ok(response);
            }

            let Some(header) = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(response);
            };

            match Challenge::parse(header)? {
                Challenge::Basic => basic = true,
                Challenge::Bearer {
                    realm,
                    service,
                    scope,
                } => {
                    let scope = scope
                        .unwrap_or_else(|| format!("repository:{}:pull", image.repository()));
                    let token = fetch_token(
                        &self.client,
                        &realm,
                        service.as_deref(),
                        Some(&scope),
                        creds,
                    )
                    .await?;
                    self.tokens.lock().await.insert(key.clone(), token);
                }
            }
            retried = true;
            debug!(url = %url, "Retrying after auth challenge");
        }
    }

    fn check_status(response: &Response, what: &str) -> Result<(), RegistryError> {
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(what.to_string())),
            StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired(what.to_string())),
            StatusCode::FORBIDDEN => Err(RegistryError::Denied(what.to_string())),
            status => Err(RegistryError::Status {
                status,
                url: response.url().to_string(),
            }),
        }
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn manifest_digest(
        &self,
        image: &ImageReference,
        creds: &Credentials,
    ) -> Result<String, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            image.registry_url(),
            image.repository(),
            image.identifier()
        );

        debug!(url = %url, "Resolving manifest digest");

        let response = self
            .send(Method::HEAD, &url, Some(MANIFEST_ACCEPT), image, creds)
            .await?;

        // Some registries don't answer HEAD, or omit the digest header. Fall
        // back to fetching the manifest and hashing it.
        if response.status().is_success() {
            if let Some(digest) = response
                .headers()
                .get(DOCKER_CONTENT_DIGEST)
                .and_then(|v| v.to_str().ok())
                .filter(|d| d.starts_with("sha256:"))
            {
                return Ok(digest.to_string());
            }
        } else if response.status() != StatusCode::METHOD_NOT_ALLOWED {
            Self::check_status(&response, &image.to_string())?;
        }

        let body = self
            .fetch_manifest(image, image.identifier(), creds)
            .await?;
        Ok(format!("sha256:{}", sha256_hex(&body)))
    }

    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        identifier: &str,
        creds: &Credentials,
    ) -> Result<Bytes, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            image.registry_url(),
            image.repository(),
            identifier
        );

        debug!(url = %url, "Pulling manifest");

        let response = self
            .send(Method::GET, &url, Some(MANIFEST_ACCEPT), image, creds)
            .await?;
        Self::check_status(&response, &format!("{}/{}", image.repository(), identifier))?;
        let body = response.bytes().await?;

        if identifier.starts_with("sha256:") {
            let computed = format!("sha256:{}", sha256_hex(&body));
            if computed != identifier {
                return Err(RegistryError::DigestMismatch {
                    expected: identifier.to_string(),
                    actual: computed,
                });
            }
        }

        Ok(body)
    }

    async fn fetch_blob(
        &self,
        image: &ImageReference,
        digest: &str,
        creds: &Credentials,
    ) -> Result<Bytes, RegistryError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            image.registry_url(),
            image.repository(),
            digest
        );

        debug!(url = %url, "Pulling blob");

        let response = self.send(Method::GET, &url, None, image, creds).await?;
        Self::check_status(&response, digest)?;
        let body = response.bytes().await?;

        info!(digest = %digest, size = body.len(), "Blob downloaded");

        Ok(body)
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    /// Platform, for index entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Target platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// The platform of the running host, in OCI terms.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

/// OCI image manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, base layer first.
    pub layers: Vec<Descriptor>,
}

/// OCI image index or Docker manifest list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl Index {
    /// Pick the entry for `platform`. An entry without a platform matches
    /// only when it is the sole entry.
    pub fn select(&self, platform: &Platform) -> Option<&Descriptor> {
        let matching = |d: &&Descriptor| {
            d.platform.as_ref().is_some_and(|p| {
                p.os == platform.os
                    && p.architecture == platform.architecture
                    && (platform.variant.is_none() || p.variant == platform.variant)
            })
        };
        self.manifests.iter().find(matching).or_else(|| {
            match self.manifests.as_slice() {
                [only] if only.platform.is_none() => Some(only),
                _ => None,
            }
        })
    }
}

/// A stored manifest, either an image manifest or an index.
#[derive(Debug, Clone)]
pub enum ManifestKind {
    Image(Manifest),
    Index(Index),
}

/// Parse raw manifest bytes, telling image manifests and indexes apart by
/// media type or, when absent, by shape.
pub fn parse_manifest(data: &[u8]) -> Result<ManifestKind, serde_json::Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Shape {
        #[serde(default)]
        media_type: Option<String>,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
    }

    let shape: Shape = serde_json::from_slice(data)?;
    let is_index = match shape.media_type.as_deref() {
        Some(MEDIA_TYPE_OCI_INDEX) | Some(MEDIA_TYPE_DOCKER_LIST) => true,
        Some(_) => false,
        None => shape.manifests.is_some(),
    };

    if is_index {
        Ok(ManifestKind::Index(serde_json::from_slice(data)?))
    } else {
        Ok(ManifestKind::Image(serde_json::from_slice(data)?))
    }
}

/// Image configuration blob. Only the fields that shape the run are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: Option<ContainerConfig>,
}

/// The `config` section of an image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}
