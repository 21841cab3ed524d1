//! # fnbox-proto
//!
//! The binary envelope exchanged between a caller and `fnbox-run`.
//!
//! A caller writes one protobuf-encoded [`v1::RunFunctionRequest`] to the
//! runner's stdin. On success the runner writes one protobuf-encoded
//! [`v1::RunFunctionResponse`] to stdout and exits zero. On failure nothing is
//! written to stdout.
//!
//! The messages are declared with `prost` derives rather than generated from
//! `.proto` files, so the crate builds without `protoc`.

mod envelope;
pub mod v1;

pub use envelope::{decode_request, decode_response, encode_response, EnvelopeError};
