#![deny(unsafe_code)]

//! Client-side RPC channel core.
//!
//! A [`Channel`] is the durable, thread-safe handle through which callers
//! issue RPCs to a single server or a load-balanced server set. The crate
//! covers the call-dispatch engine: correlation slots with version ranges,
//! a timer service driving deadlines and backup (hedged) requests, retry
//! accounting, socket interning, and orderly resource release on every exit
//! path. Wire protocols, socket I/O details and balancing algorithms plug in
//! through the descriptors and traits re-exported below.
//!
//! ```ignore
//! let channel = Channel::init("127.0.0.1:9000", Some(&options))?;
//! let cntl = Controller::new();
//! let response = Arc::new(BufferResponse::new());
//! channel
//!     .call_method(Some(&method), &cntl, &request, Some(response.clone()), None)
//!     .await;
//! if cntl.failed() {
//!     eprintln!("rpc failed: {}", cntl.error_text());
//! }
//! ```

mod auth;
mod balancer;
mod channel;
mod controller;
mod correlation;
mod endpoint;
mod errors;
mod global;
mod message;
mod options;
mod protocol;
mod runtime;
mod socket;
mod socket_map;
mod timer;
mod transport;
mod usercode;

pub use auth::{Authenticator, global_esp_authenticator};
pub use balancer::{
    CallInfo, LoadBalancer, LoadBalancerWithNaming, NamingError, NamingService,
    NamingServiceOptions, SelectIn, SelectOut, register_load_balancer, register_naming_service,
};
pub use channel::Channel;
pub use controller::{
    CallSender, Controller, DoneCallback, INVALID_STREAM_ID, StreamId, start_cancel,
};
pub use correlation::{CallId, INVALID_CALL_ID};
pub use endpoint::{
    Endpoint, hostname2endpoint, hostname2endpoint_with_port, str2endpoint,
    str2endpoint_with_port,
};
pub use errors::{EncodeError, ErrorCode, InitError, ResponseError};
pub use global::global_initialize_or_die;
pub use message::{BufferResponse, MethodDescriptor, RequestBody, ResponseSink};
pub use options::{
    AdaptiveConnectionType, ChannelOptions, ConnectionType, RetryPolicy, ServerFilter,
    UNSET_MAGIC_NUM,
};
pub use protocol::{
    DuplicateProtocol, GetMethodNameFn, PackContext, PackRequestFn, ParseServerAddressFn,
    Protocol, ProtocolId, SerializeRequestFn, find_protocol, register_protocol,
};
pub use runtime::AbortHandle;
pub use socket::{INVALID_SOCKET_ID, Socket, SocketId, address as socket_address};
pub use socket_map::{insert as socket_map_insert, ref_count as socket_map_ref_count,
    remove as socket_map_remove};
pub use timer::{INVALID_TIMER_ID, TimerId, monotonic_us, timer_service};
pub use transport::{
    IssueOptions, Messenger, StreamMessenger, deliver_error, deliver_response, install_messenger,
};
pub use usercode::set_usercode_limit;
