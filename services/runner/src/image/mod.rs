//! OCI image resolution and caching.
//!
//! This module handles:
//! - Parsing image references
//! - Talking to registries (manifest digest checks, manifest and blob fetches)
//! - The Digest Store (reference -> last seen manifest digest)
//! - The Image Store (content-addressed manifests and blobs)
//! - The caching puller that ties them together

pub mod auth;
mod digest_store;
pub mod oci;
mod puller;
pub mod reference;
mod store;

pub use auth::Credentials;
pub use digest_store::DigestStore;
pub use oci::{ImageConfig, Platform, Registry, RegistryClient, RegistryError};
pub use puller::{CachingPuller, PullError};
pub use reference::{ImageReference, ReferenceError};
pub use store::{Image, ImageStore, Layer, StoreError};

#[cfg(test)]
pub(crate) use puller::tests::FakeRegistry;
#[cfg(test)]
pub(crate) use store::tests as store_tests;
