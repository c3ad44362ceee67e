//! Request/response seams between callers and the dispatch engine.
//!
//! The core moves opaque payload bytes; what those bytes mean belongs to the
//! protocol and the caller. `RequestBody` produces the serialized request,
//! `ResponseSink` consumes the response payload, and both stay object-safe so
//! a Controller can carry them untyped.

use std::sync::Mutex;

use crate::errors::{EncodeError, ResponseError};

/// Identifies the remote method being called.
///
/// Protocols that address calls some other way (ESP message ids, plain URLs)
/// run with no descriptor at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    full_name: String,
}

impl MethodDescriptor {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }
}

/// A request message the protocol can serialize.
pub trait RequestBody: Send + Sync {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError>;
}

impl RequestBody for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

/// Caller-provided destination for the response payload.
///
/// `fill` runs on whichever task completes the call, so implementations use
/// interior mutability. Returning `ResponseError::App` marks the call as an
/// application-level failure; `ResponseError::Parse` as a framework one.
pub trait ResponseSink: Send + Sync {
    fn fill(&self, payload: &[u8]) -> Result<(), ResponseError>;
}

/// A sink that just keeps the raw payload for the caller to pick up.
#[derive(Default)]
pub struct BufferResponse {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl BufferResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// The payload, if the call completed successfully.
    pub fn take(&self) -> Option<Vec<u8>> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl ResponseSink for BufferResponse {
    fn fill(&self, payload: &[u8]) -> Result<(), ResponseError> {
        *self.bytes.lock().unwrap_or_else(|e| e.into_inner()) = Some(payload.to_vec());
        Ok(())
    }
}
