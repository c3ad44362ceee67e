//! The user-facing Channel and its call-dispatch engine.
//!
//! A Channel binds a caller to one server endpoint or to a load-balanced
//! server set, resolves a protocol descriptor once at init, and drives every
//! `call_method` through the same machinery: lock the correlation slot with
//! a version range sized to the retry budget, arm the backup-request or
//! timeout timer, issue the first attempt, and either return (asynchronous,
//! `done` present) or join the slot (synchronous).

use std::sync::Arc;

use tracing::{debug, error};

use crate::auth::global_esp_authenticator;
use crate::balancer::{CallInfo, LoadBalancerWithNaming, NamingServiceOptions, SelectIn};
use crate::controller::{Controller, DoneCallback, INVALID_STREAM_ID, run_done_by_state};
use crate::correlation::{CallId, registry};
use crate::endpoint::{self, Endpoint};
use crate::errors::{ErrorCode, InitError};
use crate::global::global_initialize_or_die;
use crate::message::{MethodDescriptor, RequestBody, ResponseSink};
use crate::options::{ChannelOptions, ConnectionType, UNSET_MAGIC_NUM};
use crate::protocol::{Protocol, ProtocolId, find_protocol, find_protocol_index};
use crate::socket::{self, INVALID_SOCKET_ID, SocketId};
use crate::socket_map;
use crate::timer::{monotonic_us, timer_service};
use crate::transport::messenger;

/// Timer callback: the call's total deadline elapsed.
pub(crate) fn handle_timeout(id: CallId) {
    registry().post_error(id, ErrorCode::Timeout);
}

/// Timer callback: time to launch a hedged second attempt.
pub(crate) fn handle_backup_request(id: CallId) {
    registry().post_error(id, ErrorCode::BackupRequest);
}

/// A client channel to one server or a load-balanced server set.
///
/// Channels are immutable after init and safe to share across tasks; all
/// per-call mutability lives on the [`Controller`].
pub struct Channel {
    options: ChannelOptions,
    protocol: Protocol,
    preferred_index: i32,
    server_address: Option<Endpoint>,
    server_id: SocketId,
    lb: Option<Arc<LoadBalancerWithNaming>>,
    messenger: Arc<dyn crate::transport::Messenger>,
}

impl Channel {
    /// Connect to a single server given as `"ip:port"`, `"[v6]:port"`,
    /// `"host:port"`, or whatever the protocol's own parser accepts.
    pub fn init(
        server_addr_and_port: &str,
        options: Option<&ChannelOptions>,
    ) -> Result<Self, InitError> {
        global_initialize_or_die();
        let protocol_id = options.map(|o| o.protocol).unwrap_or(ProtocolId::STD);
        let custom_parse = find_protocol(protocol_id).and_then(|p| p.parse_server_address);
        let point = if let Some(parse) = custom_parse {
            match parse(server_addr_and_port) {
                Some(point) => point,
                None => {
                    error!(address = server_addr_and_port, "fail to parse address");
                    return Err(InitError::InvalidAddress(server_addr_and_port.to_string()));
                }
            }
        } else {
            match endpoint::str2endpoint(server_addr_and_port)
                .or_else(|| endpoint::hostname2endpoint(server_addr_and_port))
            {
                Some(point) => point,
                None => {
                    // Many users call the wrong init; say so to save
                    // troubleshooting time.
                    if server_addr_and_port.contains("://") {
                        error!(
                            address = server_addr_and_port,
                            "invalid address; use init_naming(naming_service_url, \
                             load_balancer_name, options) instead"
                        );
                    } else {
                        error!(address = server_addr_and_port, "invalid address");
                    }
                    return Err(InitError::InvalidAddress(server_addr_and_port.to_string()));
                }
            }
        };
        Self::init_endpoint(point, options)
    }

    /// Connect to a single server with the host and port given separately.
    pub fn init_host_port(
        server_addr: &str,
        port: i32,
        options: Option<&ChannelOptions>,
    ) -> Result<Self, InitError> {
        global_initialize_or_die();
        if !(0..=65535).contains(&port) {
            error!(port, "invalid port");
            return Err(InitError::InvalidPort(port));
        }
        let port = port as u16;
        let protocol_id = options.map(|o| o.protocol).unwrap_or(ProtocolId::STD);
        let custom_parse = find_protocol(protocol_id).and_then(|p| p.parse_server_address);
        let point = if let Some(parse) = custom_parse {
            match parse(server_addr) {
                Some(point) => Endpoint::new(point.ip(), port),
                None => {
                    error!(address = server_addr, "fail to parse address");
                    return Err(InitError::InvalidAddress(server_addr.to_string()));
                }
            }
        } else {
            match endpoint::str2endpoint_with_port(server_addr, port)
                .or_else(|| endpoint::hostname2endpoint_with_port(server_addr, port))
            {
                Some(point) => point,
                None => {
                    error!(address = server_addr, "invalid address");
                    return Err(InitError::InvalidAddress(server_addr.to_string()));
                }
            }
        };
        Self::init_endpoint(point, options)
    }

    /// Connect to a single server. The canonical form: every other
    /// single-server init funnels here.
    pub fn init_endpoint(
        server_addr_and_port: Endpoint,
        options: Option<&ChannelOptions>,
    ) -> Result<Self, InitError> {
        global_initialize_or_die();
        let (options, protocol, preferred_index) = init_channel_options(options)?;
        let server_id = socket_map::insert(server_addr_and_port);
        Ok(Self {
            options,
            protocol,
            preferred_index,
            server_address: Some(server_addr_and_port),
            server_id,
            lb: None,
            messenger: messenger(),
        })
    }

    /// Subscribe to a naming service (`scheme://service`) and balance over
    /// its servers with the named algorithm. An empty `load_balancer_name`
    /// degrades to single-server init on `naming_service_url`.
    pub fn init_naming(
        naming_service_url: &str,
        load_balancer_name: &str,
        options: Option<&ChannelOptions>,
    ) -> Result<Self, InitError> {
        if load_balancer_name.is_empty() {
            // Treat the url as an ordinary server address.
            return Self::init(naming_service_url, options);
        }
        global_initialize_or_die();
        let (options, protocol, preferred_index) = init_channel_options(options)?;
        let ns_opts = NamingServiceOptions {
            succeed_without_server: options.succeed_without_server,
            log_succeed_without_server: options.log_succeed_without_server,
        };
        let lb = LoadBalancerWithNaming::init(
            naming_service_url,
            load_balancer_name,
            options.ns_filter.clone(),
            &ns_opts,
        )?;
        Ok(Self {
            options,
            protocol,
            preferred_index,
            server_address: None,
            server_id: INVALID_SOCKET_ID,
            lb: Some(lb),
            messenger: messenger(),
        })
    }

    fn single_server(&self) -> bool {
        self.server_id != INVALID_SOCKET_ID
    }

    pub(crate) fn options(&self) -> &ChannelOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // Call dispatch
    // ------------------------------------------------------------------

    /// Issue one RPC. Asynchronous iff `done` is present; otherwise the
    /// future resolves when the call reaches a terminal state.
    ///
    /// Exactly one of three things happens on every path: the call succeeds,
    /// an application error lands on the controller, or a framework error
    /// lands on the controller. `done` runs exactly once; in synchronous
    /// mode completion is signalled by this future resolving instead.
    pub async fn call_method(
        &self,
        method: Option<&MethodDescriptor>,
        cntl: &Controller,
        request: &dyn RequestBody,
        response: Option<Arc<dyn ResponseSink>>,
        done: Option<DoneCallback>,
    ) {
        let start_send_real_us = monotonic_us();
        let shared = cntl.shared().clone();
        let sync_mode = done.is_none();
        shared.allow_done_inline();

        // Normalize the retry budget first: it sizes the version range.
        {
            let mut st = shared.state();
            st.begin_time_us = start_send_real_us;
            if st.max_retry == UNSET_MAGIC_NUM {
                st.max_retry = self.options.max_retry;
            }
            if st.max_retry < 0 {
                st.max_retry = 0;
            }
            st.retry_policy = self.options.retry_policy.clone();
        }

        let correlation_id = cntl.call_id();
        let range = 2 + shared.state().max_retry as u32;
        if registry()
            .lock_and_reset_range(correlation_id, range)
            .await
            .is_err()
        {
            // Most likely a controller reused without reset(); stay quiet
            // about cancellation, which is common.
            if cntl.error_code() != ErrorCode::Cancelled {
                cntl.set_failed(
                    ErrorCode::UsageAfterDestroy,
                    format!(
                        "call_id={} was destroyed before call_method(), did you \
                         forget to reset() the controller?",
                        correlation_id.value()
                    ),
                );
            }
            run_done_by_state(&shared, done);
            shared.revoke_done_inline();
            return;
        }

        // Client span, when a subscriber cares and no composed sender owns
        // the call.
        if !cntl.has_sender() {
            let method_name = match self.protocol.get_method_name {
                Some(get_method_name) => get_method_name(method),
                None => match method {
                    Some(m) => m.full_name().to_string(),
                    None => "null-method".to_string(),
                },
            };
            let span = tracing::debug_span!(
                "rpc_call",
                method = %method_name,
                log_id = cntl.log_id(),
                protocol = %self.options.protocol,
                call_id = correlation_id.value(),
            );
            if !span.is_disabled() {
                shared.state().span = Some(span);
            }
        }

        // Resolve remaining options and bind channel state to the call.
        let done_present = {
            let mut st = shared.state();
            if st.timeout_ms == UNSET_MAGIC_NUM {
                st.timeout_ms = self.options.timeout_ms;
            }
            // Connections are shared across channels, so a per-call connect
            // timeout would be meaningless; always take the channel's.
            st.connect_timeout_ms = self.options.connect_timeout_ms;
            if st.backup_request_ms == UNSET_MAGIC_NUM {
                st.backup_request_ms = self.options.backup_request_ms;
            }
            if st.connection_type == ConnectionType::Unknown {
                st.connection_type = self.options.connection_type.get();
            }
            st.response = response;
            st.done = done;
            st.pack_request = Some(self.protocol.pack_request);
            st.method = method.cloned();
            st.auth = self.options.auth.clone();
            if self.single_server() {
                st.single_server_id = self.server_id;
                st.remote_side = self.server_address;
            }
            st.request_protocol = self.options.protocol;
            st.preferred_index = self.preferred_index;
            // Share the balancer with the controller for per-attempt
            // selection; released when the call ends.
            st.lb = self.lb.clone();
            st.messenger = Some(self.messenger.clone());
            st.done.is_some()
        };

        if crate::usercode::usercode_constrained()
            && done_present
            && crate::usercode::too_many_user_code()
        {
            shared.handle_send_failed(
                correlation_id,
                ErrorCode::TooManyUserCode,
                "too many user code to run when usercode is constrained".to_string(),
            );
            shared.revoke_done_inline();
            return;
        }

        let mut request_buf = Vec::new();
        if let Err(e) = (self.protocol.serialize_request)(request, &mut request_buf) {
            shared.handle_send_failed(correlation_id, ErrorCode::SerializeFailed, e.to_string());
            shared.revoke_done_inline();
            return;
        }
        shared.state().request_buf = request_buf;

        {
            let mut st = shared.state();
            if st.request_stream != INVALID_STREAM_ID {
                // Retries and hedging are not supported for streamed calls.
                st.max_retry = 0;
                st.backup_request_ms = -1;
            }
        }

        // Arm timers: backup-request when hedging fits under the deadline,
        // plain timeout otherwise, nothing when the call is unbounded.
        {
            let mut st = shared.state();
            let timeout_ms = st.timeout_ms;
            let backup_ms = st.backup_request_ms;
            let base_id = st.call_id;
            if backup_ms >= 0 && (timeout_ms < 0 || backup_ms < timeout_ms) {
                st.abstime_us = if timeout_ms < 0 {
                    -1
                } else {
                    i64::from(timeout_ms) * 1000 + start_send_real_us
                };
                let deadline_us = i64::from(backup_ms) * 1000 + start_send_real_us;
                match timer_service().add_at(deadline_us, move || handle_backup_request(base_id))
                {
                    Ok(timer_id) => st.timeout_id = timer_id,
                    Err(code) => {
                        drop(st);
                        shared.handle_send_failed(
                            correlation_id,
                            code,
                            "fail to add timer for backup request".to_string(),
                        );
                        shared.revoke_done_inline();
                        return;
                    }
                }
            } else if timeout_ms >= 0 {
                st.abstime_us = i64::from(timeout_ms) * 1000 + start_send_real_us;
                let deadline_us = st.abstime_us;
                match timer_service().add_at(deadline_us, move || handle_timeout(base_id)) {
                    Ok(timer_id) => st.timeout_id = timer_id,
                    Err(code) => {
                        drop(st);
                        shared.handle_send_failed(
                            correlation_id,
                            code,
                            "fail to add timer for timeout".to_string(),
                        );
                        shared.revoke_done_inline();
                        return;
                    }
                }
            } else {
                st.abstime_us = -1;
            }
        }

        match shared.issue_attempt() {
            Ok(()) => registry().unlock(correlation_id),
            Err((code, text)) => {
                shared.handle_send_failed(correlation_id, code, text);
                shared.revoke_done_inline();
                return;
            }
        }

        if sync_mode {
            // Wait for the completion path to destroy the slot.
            registry().join(correlation_id).await;
            debug!(
                call_id = correlation_id.value(),
                latency_us = cntl.latency_us(),
                "synchronous call joined"
            );
        }
        shared.revoke_done_inline();
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// `"Channel[<endpoint-or-balancer>]"`.
    pub fn describe(&self) -> String {
        self.to_string()
    }

    /// The balancer's aggregate weight; 0 in single-server mode.
    pub fn weight(&self) -> i32 {
        self.lb.as_ref().map(|lb| lb.weight()).unwrap_or(0)
    }

    /// Single-server: succeeds iff the socket is addressable and healthy.
    /// Balanced: performs a dry selection; a requested feedback is answered
    /// with a synthetic cancellation so the balancer's stats stay clean.
    pub fn check_health(&self) -> Result<(), ErrorCode> {
        match &self.lb {
            None => {
                let socket = socket::address(self.server_id).ok_or(ErrorCode::ConnectFailed)?;
                if socket.is_failed() {
                    Err(ErrorCode::ConnectFailed)
                } else {
                    Ok(())
                }
            }
            Some(lb) => {
                let out = lb.select_server(&SelectIn {
                    begin_time_us: 0,
                    request_code: None,
                    excluded: &[],
                })?;
                if out.need_feedback {
                    lb.feedback(&CallInfo {
                        server_id: out.socket,
                        error_code: ErrorCode::Cancelled,
                        begin_time_us: 0,
                    });
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel[")?;
        match (&self.server_address, &self.lb) {
            (Some(endpoint), _) => write!(f, "{endpoint}")?,
            (None, Some(lb)) => write!(f, "{}", lb.describe())?,
            (None, None) => write!(f, "uninitialized")?,
        }
        write!(f, "]")
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(endpoint) = self.server_address {
            if self.server_id != INVALID_SOCKET_ID {
                socket_map::remove(endpoint);
            }
        }
    }
}

/// Resolve user options against the protocol registry.
fn init_channel_options(
    user: Option<&ChannelOptions>,
) -> Result<(ChannelOptions, Protocol, i32), InitError> {
    let mut options = user.cloned().unwrap_or_default();

    let Some(protocol) = find_protocol(options.protocol).filter(|p| p.support_client) else {
        if options.protocol == ProtocolId::UNKNOWN {
            error!("unknown protocol");
        } else {
            error!(protocol = %options.protocol, "channel does not support protocol");
        }
        return Err(InitError::ProtocolUnsupported(options.protocol));
    };

    if options.connection_type.get() == ConnectionType::Unknown {
        // Remember the parse error before assignments clear it.
        let had_error = options.connection_type.has_error();
        let picked = [
            ConnectionType::Single,
            ConnectionType::Pooled,
            ConnectionType::Short,
        ]
        .into_iter()
        .find(|ty| ty.supported_by(protocol.supported_connection_type))
        .unwrap_or(ConnectionType::Short);
        options.connection_type.set(picked);
        if had_error {
            error!(
                connection_type = picked.name(),
                protocol = %options.protocol,
                "channel chose connection type for protocol"
            );
        }
    } else if !options
        .connection_type
        .get()
        .supported_by(protocol.supported_connection_type)
    {
        error!(
            protocol = %options.protocol,
            connection_type = options.connection_type.get().name(),
            "protocol does not support connection type"
        );
        return Err(InitError::ConnectionTypeUnsupported {
            protocol: options.protocol,
            requested: options.connection_type.get(),
        });
    }

    let preferred_index = find_protocol_index(options.protocol);
    if preferred_index < 0 {
        error!(protocol = %options.protocol, "fail to get index for protocol");
        return Err(InitError::ProtocolUnsupported(options.protocol));
    }

    if options.protocol == ProtocolId::ESP && options.auth.is_none() {
        options.auth = Some(global_esp_authenticator());
    }

    Ok((options, protocol, preferred_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::loopback;
    use crate::options::AdaptiveConnectionType;

    #[test]
    fn init_resolves_std_defaults() {
        let channel = Channel::init("127.0.0.1:3101", None).unwrap();
        assert_eq!(
            channel.options().connection_type.get(),
            ConnectionType::Single
        );
        assert!(channel.preferred_index >= 0);
        assert_eq!(socket_map::ref_count(loopback(3101)), 1);
        assert_eq!(channel.weight(), 0);
        drop(channel);
        assert_eq!(socket_map::ref_count(loopback(3101)), 0);
    }

    #[test]
    fn describe_contains_the_endpoint() {
        let ep = loopback(3102);
        let channel = Channel::init_endpoint(ep, None).unwrap();
        assert!(channel.describe().contains("127.0.0.1:3102"));
        assert!(channel.describe().starts_with("Channel["));
    }

    #[test]
    fn init_rejects_naming_urls_with_a_hint() {
        let err = Channel::init("list://127.0.0.1:3103", None).unwrap_err();
        assert!(matches!(err, InitError::InvalidAddress(_)));
    }

    #[test]
    fn init_host_port_validates_the_port() {
        assert!(matches!(
            Channel::init_host_port("127.0.0.1", 65536, None),
            Err(InitError::InvalidPort(65536))
        ));
        assert!(matches!(
            Channel::init_host_port("127.0.0.1", -1, None),
            Err(InitError::InvalidPort(-1))
        ));
        let channel = Channel::init_host_port("127.0.0.1", 3104, None).unwrap();
        assert_eq!(channel.server_address, Some(loopback(3104)));
    }

    #[test]
    fn unknown_protocol_fails_init() {
        let mut opts = ChannelOptions::default();
        opts.protocol = ProtocolId::UNKNOWN;
        assert!(matches!(
            Channel::init("127.0.0.1:3105", Some(&opts)),
            Err(InitError::ProtocolUnsupported(_))
        ));
    }

    #[test]
    fn esp_installs_the_global_authenticator() {
        global_initialize_or_die();
        let mut opts = ChannelOptions::default();
        opts.protocol = ProtocolId::ESP;
        let (resolved, _, _) = init_channel_options(Some(&opts)).unwrap();
        let auth = resolved.auth.expect("esp should default its authenticator");
        assert_eq!(auth.generate_credential().unwrap(), b"ESPA");
        // ESP cannot run on a single shared connection; auto-pick skips it.
        assert_eq!(resolved.connection_type.get(), ConnectionType::Pooled);
    }

    #[test]
    fn explicit_connection_type_must_be_supported() {
        global_initialize_or_die();
        let mut opts = ChannelOptions::default();
        opts.protocol = ProtocolId::ESP;
        opts.connection_type = AdaptiveConnectionType::new(ConnectionType::Single);
        assert!(matches!(
            init_channel_options(Some(&opts)),
            Err(InitError::ConnectionTypeUnsupported { .. })
        ));
    }

    #[test]
    fn connection_type_parse_error_still_auto_picks() {
        global_initialize_or_die();
        let mut opts = ChannelOptions::default();
        opts.connection_type = AdaptiveConnectionType::parse("sinlge");
        let (resolved, _, _) = init_channel_options(Some(&opts)).unwrap();
        assert_eq!(resolved.connection_type.get(), ConnectionType::Single);
        assert!(!resolved.connection_type.has_error());
    }

    #[test]
    fn init_naming_with_empty_balancer_degrades_to_single_server() {
        let direct = Channel::init("127.0.0.1:3106", None).unwrap();
        let via_naming = Channel::init_naming("127.0.0.1:3106", "", None).unwrap();
        assert_eq!(direct.describe(), via_naming.describe());
        assert_eq!(socket_map::ref_count(loopback(3106)), 2);
    }
}
