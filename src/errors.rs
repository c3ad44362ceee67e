//! Error taxonomy for channels and calls.
//!
//! Two layers: [`InitError`] covers channel construction (synchronous, no
//! call was attempted), and [`ErrorCode`] is the stable per-call code that
//! ends up on the [`Controller`](crate::Controller) for every completed call.

use crate::options::ConnectionType;
use crate::protocol::ProtocolId;

/// Stable per-call error code, surfaced on the Controller.
///
/// `Ok` means the call succeeded. `BackupRequest` never reaches the caller:
/// it is a control code consumed by the correlation slot's error handler to
/// launch a hedged attempt.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,

    // Usage errors: reported synchronously, no attempt was made.
    InvalidOptions = 1001,
    InvalidAddress = 1002,
    InvalidPort = 1003,
    ProtocolUnsupported = 1004,
    ConnectionTypeUnsupported = 1005,
    /// The Controller was reused without `reset()` after its slot died.
    UsageAfterDestroy = 1006,

    // Capacity errors.
    TooManyUserCode = 1101,

    // Deadline errors.
    Timeout = 1201,

    // Control codes, never terminal.
    BackupRequest = 1202,

    // Cancellation.
    Cancelled = 1203,

    // Transport errors, propagated from issuing an attempt.
    NoServer = 1301,
    ConnectFailed = 1302,
    WriteFailed = 1303,
    ConnectionClosed = 1304,
    ParseFailed = 1305,
    SerializeFailed = 1306,

    // Framework-internal failures (timer arming, task spawning).
    Internal = 1401,

    // Application error carried in the response payload.
    AppError = 1501,
}

impl ErrorCode {
    /// Raw numeric code, for feedback records and logs.
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Whether the default retry policy re-issues after this error.
    ///
    /// Only attempt-level transport failures qualify; deadline, cancellation
    /// and usage errors are always final.
    pub fn retriable_by_default(self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectFailed | ErrorCode::WriteFailed | ErrorCode::ConnectionClosed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::InvalidOptions => "invalid channel options",
            ErrorCode::InvalidAddress => "invalid server address",
            ErrorCode::InvalidPort => "invalid port",
            ErrorCode::ProtocolUnsupported => "protocol not supported",
            ErrorCode::ConnectionTypeUnsupported => "connection type not supported",
            ErrorCode::UsageAfterDestroy => "controller used after its call id was destroyed",
            ErrorCode::TooManyUserCode => "too many user callbacks in flight",
            ErrorCode::Timeout => "rpc timed out",
            ErrorCode::BackupRequest => "backup request triggered",
            ErrorCode::Cancelled => "rpc cancelled",
            ErrorCode::NoServer => "no server available",
            ErrorCode::ConnectFailed => "connect failed",
            ErrorCode::WriteFailed => "write failed",
            ErrorCode::ConnectionClosed => "connection closed before response",
            ErrorCode::ParseFailed => "response parse failed",
            ErrorCode::SerializeFailed => "request serialization failed",
            ErrorCode::Internal => "internal framework error",
            ErrorCode::AppError => "application error",
        };
        f.write_str(text)
    }
}

/// Error from one of the `Channel::init*` constructors.
///
/// No attempt is made, and no process-global state is left behind: a failed
/// init holds no socket-map reference and no balancer.
#[derive(Debug)]
pub enum InitError {
    /// The address string could not be parsed as endpoint or hostname.
    InvalidAddress(String),
    /// Port outside `[0, 65535]`.
    InvalidPort(i32),
    /// The protocol is unknown or lacks client support.
    ProtocolUnsupported(ProtocolId),
    /// An explicitly chosen connection type is outside the protocol's mask.
    ConnectionTypeUnsupported {
        protocol: ProtocolId,
        requested: ConnectionType,
    },
    /// Endpoint could not be interned into the socket map.
    SocketMapInsertFailed(String),
    /// No load balancer registered under the requested name.
    BalancerUnknown(String),
    /// The naming service could not produce a server set.
    NamingFailed(String),
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitError::InvalidAddress(addr) => write!(f, "invalid address `{addr}'"),
            InitError::InvalidPort(port) => write!(f, "invalid port={port}"),
            InitError::ProtocolUnsupported(id) => {
                write!(f, "channel does not support protocol={id}")
            }
            InitError::ConnectionTypeUnsupported {
                protocol,
                requested,
            } => write!(
                f,
                "{protocol} does not support connection_type={}",
                requested.name()
            ),
            InitError::SocketMapInsertFailed(detail) => {
                write!(f, "fail to insert into socket map: {detail}")
            }
            InitError::BalancerUnknown(name) => write!(f, "unknown load balancer `{name}'"),
            InitError::NamingFailed(detail) => write!(f, "naming service failed: {detail}"),
        }
    }
}

impl std::error::Error for InitError {}

/// Failure to serialize or pack a request.
#[derive(Debug)]
pub struct EncodeError {
    message: String,
}

impl EncodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encode error: {}", self.message)
    }
}

impl std::error::Error for EncodeError {}

/// Outcome of handing a response payload to the caller's sink.
///
/// `App` is a well-formed payload carrying an application-level failure;
/// `Parse` means the payload itself was unusable.
#[derive(Debug)]
pub enum ResponseError {
    App { code: i32, message: String },
    Parse(String),
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseError::App { code, message } => {
                write!(f, "application error {code}: {message}")
            }
            ResponseError::Parse(detail) => write!(f, "parse error: {detail}"),
        }
    }
}

impl std::error::Error for ResponseError {}
