//! Protocol descriptors and the process-wide protocol registry.
//!
//! A protocol contributes four client-side operations: serializing the
//! caller's request, packing the serialized bytes into a wire frame for one
//! attempt, naming the method for tracing, and (optionally) parsing addresses
//! in a protocol-specific syntax. The registry maps a [`ProtocolId`] to its
//! descriptor; a channel resolves the descriptor once at init and never
//! consults the registry again.

use std::sync::{Arc, OnceLock, RwLock};

use crate::auth::Authenticator;
use crate::correlation::CallId;
use crate::endpoint::Endpoint;
use crate::errors::EncodeError;
use crate::message::{MethodDescriptor, RequestBody};
use crate::options::ConnectionType;
use crate::transport::encode_frame;

/// Identifier selecting a wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolId(&'static str);

impl ProtocolId {
    pub const UNKNOWN: ProtocolId = ProtocolId("unknown");
    /// The framework's native protocol.
    pub const STD: ProtocolId = ProtocolId("std");
    /// ESP, a credential-prefixed message protocol.
    pub const ESP: ProtocolId = ProtocolId("esp");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Per-attempt inputs to `pack_request`.
pub struct PackContext<'a> {
    /// Correlation id of this attempt (base id plus the attempt's version).
    pub correlation_id: CallId,
    pub method: Option<&'a MethodDescriptor>,
    pub auth: Option<&'a Arc<dyn Authenticator>>,
    pub log_id: u64,
}

pub type SerializeRequestFn = fn(&dyn RequestBody, &mut Vec<u8>) -> Result<(), EncodeError>;
pub type PackRequestFn = fn(&mut Vec<u8>, &[u8], &PackContext<'_>) -> Result<(), EncodeError>;
pub type GetMethodNameFn = fn(Option<&MethodDescriptor>) -> String;
pub type ParseServerAddressFn = fn(&str) -> Option<Endpoint>;

/// A protocol's client-side operation vector.
#[derive(Clone)]
pub struct Protocol {
    pub id: ProtocolId,
    pub support_client: bool,
    /// Bitmask of [`ConnectionType`] bits this protocol can run over.
    pub supported_connection_type: u8,
    pub serialize_request: SerializeRequestFn,
    pub pack_request: PackRequestFn,
    pub get_method_name: Option<GetMethodNameFn>,
    pub parse_server_address: Option<ParseServerAddressFn>,
}

/// Registering a protocol under a name that is already taken.
#[derive(Debug)]
pub struct DuplicateProtocol(pub ProtocolId);

impl std::fmt::Display for DuplicateProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol {} is already registered", self.0)
    }
}

impl std::error::Error for DuplicateProtocol {}

fn registry() -> &'static RwLock<Vec<Protocol>> {
    static REGISTRY: OnceLock<RwLock<Vec<Protocol>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Vec::new()))
}

/// Add a protocol to the process-wide table.
///
/// Registration order fixes each protocol's messenger index, which channels
/// cache as their `preferred_index`.
pub fn register_protocol(protocol: Protocol) -> Result<(), DuplicateProtocol> {
    let mut table = registry().write().unwrap_or_else(|e| e.into_inner());
    if table.iter().any(|p| p.id == protocol.id) {
        return Err(DuplicateProtocol(protocol.id));
    }
    table.push(protocol);
    Ok(())
}

pub fn find_protocol(id: ProtocolId) -> Option<Protocol> {
    let table = registry().read().unwrap_or_else(|e| e.into_inner());
    table.iter().find(|p| p.id == id).cloned()
}

/// Index of the protocol in the messenger's table, or -1 when unknown.
pub fn find_protocol_index(id: ProtocolId) -> i32 {
    let table = registry().read().unwrap_or_else(|e| e.into_inner());
    table
        .iter()
        .position(|p| p.id == id)
        .map(|i| i as i32)
        .unwrap_or(-1)
}

// ============================================================================
// Built-in descriptors
// ============================================================================

fn serialize_verbatim(request: &dyn RequestBody, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
    request.serialize(buf)
}

fn pack_std(
    out: &mut Vec<u8>,
    serialized: &[u8],
    ctx: &PackContext<'_>,
) -> Result<(), EncodeError> {
    encode_frame(out, ctx.correlation_id, serialized);
    Ok(())
}

fn pack_esp(
    out: &mut Vec<u8>,
    serialized: &[u8],
    ctx: &PackContext<'_>,
) -> Result<(), EncodeError> {
    let credential = match ctx.auth {
        Some(auth) => auth.generate_credential()?,
        None => Vec::new(),
    };
    let mut payload = Vec::with_capacity(4 + credential.len() + serialized.len());
    payload.extend_from_slice(&(credential.len() as u32).to_be_bytes());
    payload.extend_from_slice(&credential);
    payload.extend_from_slice(serialized);
    encode_frame(out, ctx.correlation_id, &payload);
    Ok(())
}

fn esp_method_name(method: Option<&MethodDescriptor>) -> String {
    match method {
        Some(m) => m.full_name().to_string(),
        None => "esp-msg".to_string(),
    }
}

/// Register the built-in protocols. Called once from global init.
pub(crate) fn register_builtin_protocols() {
    let _ = register_protocol(Protocol {
        id: ProtocolId::STD,
        support_client: true,
        supported_connection_type: ConnectionType::Single.bit()
            | ConnectionType::Pooled.bit()
            | ConnectionType::Short.bit(),
        serialize_request: serialize_verbatim,
        pack_request: pack_std,
        get_method_name: None,
        parse_server_address: None,
    });
    let _ = register_protocol(Protocol {
        id: ProtocolId::ESP,
        support_client: true,
        supported_connection_type: ConnectionType::Pooled.bit() | ConnectionType::Short.bit(),
        serialize_request: serialize_verbatim,
        pack_request: pack_esp,
        get_method_name: Some(esp_method_name),
        parse_server_address: None,
    });
}
