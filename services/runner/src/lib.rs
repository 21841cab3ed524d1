//! fnbox function runner library.
//!
//! Runs one composition function packaged as an OCI image. A run is a single
//! short-lived process: it reads a request envelope from stdin, pulls and
//! bundles the image, executes the bundle through an external OCI runtime
//! under a deadline, and writes the function's output to stdout.
//!
//! ## Pipeline
//!
//! ```text
//! ReadRequest -> SelectBundler -> ResolveImage -> BuildBundle
//!             -> Execute -> Cleanup -> WriteResponse
//! ```
//!
//! Any number of runner processes may share one cache directory. Every
//! durable cache entry is written to a staging path and renamed into place,
//! so concurrent runs see either a complete entry or none at all.
//!
//! ## Modules
//!
//! - `image`: references, the registry client, the digest and image stores,
//!   and the caching puller
//! - `bundle`: overlay and uncompressed bundlers and the `Bundle` they produce
//! - `runtime`: invocation of the external OCI runtime
//! - `runner`: the end-to-end pipeline

pub mod bundle;
pub mod cache;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod runner;
pub mod runtime;

pub use config::{BundlerMode, Config, LogFormat};
pub use error::RunError;
pub use runner::{RunId, Runner};
