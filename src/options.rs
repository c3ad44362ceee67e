//! Channel options and per-call override sentinels.

use std::sync::Arc;

use crate::auth::Authenticator;
use crate::endpoint::Endpoint;
use crate::errors::ErrorCode;
use crate::protocol::ProtocolId;

/// Sentinel meaning "inherit this option from the Channel".
///
/// Controllers start every overridable option at this value; `call_method`
/// replaces it with the Channel's setting if the caller never touched it.
pub const UNSET_MAGIC_NUM: i32 = -123_456_789;

/// Transport-sharing discipline for a channel's connections.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Unresolved; channel init picks the first type the protocol supports.
    Unknown = 0,
    /// One shared connection, requests pipelined on it.
    Single = 1,
    /// A pool of connections per endpoint.
    Pooled = 2,
    /// A fresh connection per call.
    Short = 4,
}

impl ConnectionType {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionType::Unknown => "unknown",
            ConnectionType::Single => "single",
            ConnectionType::Pooled => "pooled",
            ConnectionType::Short => "short",
        }
    }

    /// Bit for membership tests against a protocol's support mask.
    pub fn bit(self) -> u8 {
        self as u8
    }

    pub fn supported_by(self, mask: u8) -> bool {
        self.bit() & mask != 0
    }
}

/// A connection type parsed from configuration text.
///
/// Parsing an unrecognized string yields `Unknown` plus a sticky error flag;
/// channel init logs the auto-picked type when the flag is set, so a typo in
/// config is visible instead of silently becoming a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveConnectionType {
    ty: ConnectionType,
    has_error: bool,
}

impl AdaptiveConnectionType {
    pub fn new(ty: ConnectionType) -> Self {
        Self {
            ty,
            has_error: false,
        }
    }

    /// Parse `""`, `"single"`, `"pooled"` or `"short"`. Anything else is
    /// `Unknown` with the error flag set.
    pub fn parse(text: &str) -> Self {
        match text {
            "" => Self::new(ConnectionType::Unknown),
            "single" => Self::new(ConnectionType::Single),
            "pooled" => Self::new(ConnectionType::Pooled),
            "short" => Self::new(ConnectionType::Short),
            _ => Self {
                ty: ConnectionType::Unknown,
                has_error: true,
            },
        }
    }

    pub fn get(self) -> ConnectionType {
        self.ty
    }

    pub fn has_error(self) -> bool {
        self.has_error
    }

    /// Assigning a concrete type clears any earlier parse error.
    pub fn set(&mut self, ty: ConnectionType) {
        self.ty = ty;
        self.has_error = false;
    }
}

impl Default for AdaptiveConnectionType {
    fn default() -> Self {
        Self::new(ConnectionType::Unknown)
    }
}

impl From<ConnectionType> for AdaptiveConnectionType {
    fn from(ty: ConnectionType) -> Self {
        Self::new(ty)
    }
}

/// Decides whether a failed attempt is re-issued.
///
/// Installed through [`ChannelOptions::retry_policy`]; absent means the
/// default policy ([`ErrorCode::retriable_by_default`]).
pub trait RetryPolicy: Send + Sync {
    fn do_retry(&self, error: ErrorCode) -> bool;
}

/// Filters servers produced by a naming service before they reach the
/// load balancer.
pub trait ServerFilter: Send + Sync {
    fn accept(&self, server: &Endpoint) -> bool;
}

/// Configuration copied into a Channel at init.
///
/// All durations are milliseconds. A negative `timeout_ms` means no deadline;
/// a negative `backup_request_ms` disables hedged attempts.
#[derive(Clone)]
pub struct ChannelOptions {
    /// Per-attempt connection deadline.
    pub connect_timeout_ms: i32,
    /// Total deadline per call; `< 0` means infinite.
    pub timeout_ms: i32,
    /// Delay before launching a hedged second attempt; `< 0` disables.
    pub backup_request_ms: i32,
    /// Retries on top of the initial attempt.
    pub max_retry: i32,
    /// Wire protocol selector.
    pub protocol: ProtocolId,
    /// Transport-sharing discipline; `Unknown` auto-picks at init.
    pub connection_type: AdaptiveConnectionType,
    /// Tolerate a naming service that starts with zero servers.
    pub succeed_without_server: bool,
    /// Log when the above tolerance kicks in.
    pub log_succeed_without_server: bool,
    /// Request authenticator; ESP installs a global default when absent.
    pub auth: Option<Arc<dyn Authenticator>>,
    /// Retry-decision hook; absent means the default policy.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    /// Naming-service server filter.
    pub ns_filter: Option<Arc<dyn ServerFilter>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 200,
            timeout_ms: 500,
            backup_request_ms: -1,
            max_retry: 3,
            protocol: ProtocolId::STD,
            connection_type: AdaptiveConnectionType::default(),
            succeed_without_server: true,
            log_succeed_without_server: true,
            auth: None,
            retry_policy: None,
            ns_filter: None,
        }
    }
}
