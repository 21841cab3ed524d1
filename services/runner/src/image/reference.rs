//! Image reference parsing.
//!
//! A reference names a registry, a repository, and either a mutable tag or an
//! immutable digest:
//!
//! - `alpine` -> `registry-1.docker.io/library/alpine:latest`
//! - `ghcr.io/org/fn:v1` -> `ghcr.io/org/fn:v1`
//! - `localhost:5000/fn@sha256:...` -> digest-qualified
//!
//! A reference carrying both a tag and a digest (`fn:v1@sha256:...`) is
//! treated as digest-qualified; the tag is informational only.

use std::fmt;

use thiserror::Error;

/// Registry used when a reference names none.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Tag used when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Errors from reference parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("image reference is empty")]
    Empty,

    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),
}

/// The version part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    Tag(String),
    Digest(String),
}

/// A parsed, normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    version: Version,
}

impl ImageReference {
    /// Parse a reference string.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (rest, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (s, None),
        };

        // A colon after the last slash separates a tag; any earlier colon is
        // a registry port.
        let last_slash = rest.rfind('/');
        let (name, tag) = match rest.rfind(':') {
            Some(i) if last_slash.is_none_or(|slash| i > slash) => {
                (&rest[..i], Some(&rest[i + 1..]))
            }
            _ => (rest, None),
        };

        let (registry, repository) = split_registry(name);
        validate_repository(&repository)?;

        let version = match (digest, tag) {
            (Some(digest), _) => {
                validate_digest(digest)?;
                Version::Digest(digest.to_string())
            }
            (None, Some(tag)) => {
                validate_tag(tag)?;
                Version::Tag(tag.to_string())
            }
            (None, None) => Version::Tag(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            version,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// The digest, if this reference is digest-qualified.
    pub fn digest(&self) -> Option<&str> {
        match &self.version {
            Version::Digest(d) => Some(d),
            Version::Tag(_) => None,
        }
    }

    /// The tag or digest, as used in a manifest URL.
    pub fn identifier(&self) -> &str {
        match &self.version {
            Version::Tag(t) => t,
            Version::Digest(d) => d,
        }
    }

    /// Base URL of the registry's distribution API.
    ///
    /// Loopback registries are spoken to over plain HTTP; everything else
    /// over HTTPS.
    pub fn registry_url(&self) -> String {
        let host = self
            .registry
            .rsplit_once(':')
            .map(|(host, _port)| host)
            .unwrap_or(&self.registry);
        let scheme = match host {
            "localhost" | "127.0.0.1" | "[::1]" => "http",
            _ => "https",
        };
        format!("{}://{}", scheme, self.registry)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Version::Tag(t) => write!(f, "{}/{}:{}", self.registry, self.repository, t),
            Version::Digest(d) => write!(f, "{}/{}@{}", self.registry, self.repository, d),
        }
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn split_registry(name: &str) -> (String, String) {
    match name.split_once('/') {
        None => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            match first {
                "docker.io" | "index.docker.io" | DEFAULT_REGISTRY => {
                    let repo = if rest.contains('/') {
                        rest.to_string()
                    } else {
                        format!("library/{rest}")
                    };
                    (DEFAULT_REGISTRY.to_string(), repo)
                }
                _ => (first.to_string(), rest.to_string()),
            }
        }
        Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    }
}

fn validate_repository(repo: &str) -> Result<(), ReferenceError> {
    let valid_component = |c: &str| {
        !c.is_empty()
            && c.bytes()
                .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-'))
            && c.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric())
    };
    if repo.is_empty() || !repo.split('/').all(valid_component) {
        return Err(ReferenceError::InvalidRepository(repo.to_string()));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if !valid {
        return Err(ReferenceError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<(), ReferenceError> {
    let valid = digest.strip_prefix("sha256:").is_some_and(|hex| {
        hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    });
    if !valid {
        return Err(ReferenceError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}
