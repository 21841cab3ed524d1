//! Decoding and encoding of the stdin/stdout envelope.

use prost::Message;
use thiserror::Error;

use crate::v1::{RunFunctionRequest, RunFunctionResponse};

/// Errors from envelope decoding.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// No bytes were supplied.
    #[error("envelope is empty")]
    Empty,

    /// The bytes are not a valid protobuf message.
    #[error("malformed envelope: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The request decoded but names no image.
    #[error("request does not name an image")]
    MissingImage,
}

/// Decode a request read from stdin.
///
/// An empty buffer is rejected: a request must at least name an image.
pub fn decode_request(buf: &[u8]) -> Result<RunFunctionRequest, EnvelopeError> {
    if buf.is_empty() {
        return Err(EnvelopeError::Empty);
    }
    let req = RunFunctionRequest::decode(buf)?;
    if req.image.trim().is_empty() {
        return Err(EnvelopeError::MissingImage);
    }
    Ok(req)
}

/// Encode a response for stdout.
pub fn encode_response(rsp: &RunFunctionResponse) -> Vec<u8> {
    rsp.encode_to_vec()
}

/// Decode a response. Used by callers reading the runner's stdout.
pub fn decode_response(buf: &[u8]) -> Result<RunFunctionResponse, EnvelopeError> {
    Ok(RunFunctionResponse::decode(buf)?)
}
