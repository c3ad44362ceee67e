//! Per-call context and the attempt state machine.
//!
//! A [`Controller`] is the caller's handle on one RPC: option overrides go in
//! before dispatch, the outcome comes out after. Internally it is the
//! correlation slot's event handler — every completion path (response frame,
//! transport error, timeout timer, backup timer, cancellation) funnels into
//! [`SlotHandler::on_slot_event`] with the slot's logical lock held, which is
//! what serializes retries, hedged attempts and terminal completion against
//! each other.
//!
//! Version bookkeeping: the base version (carried by `call_id`) belongs to
//! control postings — timers and cancellation. Attempt `k` runs as version
//! `base + 1 + k`. A transport completion is acted on only if its version is
//! the current attempt or a still-unfinished backup predecessor; anything
//! else is stale and ignored.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error};

use crate::auth::Authenticator;
use crate::balancer::{CallInfo, LoadBalancerWithNaming, SelectIn};
use crate::correlation::{CallId, INVALID_CALL_ID, SlotEvent, SlotHandler, registry};
use crate::endpoint::Endpoint;
use crate::errors::{ErrorCode, ResponseError};
use crate::message::{MethodDescriptor, ResponseSink};
use crate::options::{ConnectionType, RetryPolicy, UNSET_MAGIC_NUM};
use crate::protocol::{PackContext, PackRequestFn, ProtocolId};
use crate::runtime;
use crate::socket::{self, INVALID_SOCKET_ID, SocketId};
use crate::timer::{INVALID_TIMER_ID, TimerId, monotonic_us, timer_service};
use crate::transport::{IssueOptions, Messenger};
use crate::usercode;

/// Completion callback for asynchronous calls.
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of an attached request stream.
pub type StreamId = u64;

/// Sentinel for "no request stream".
pub const INVALID_STREAM_ID: StreamId = u64::MAX;

/// Hook held by composed channels that route calls through this controller;
/// notified once when the call reaches a terminal state.
pub trait CallSender: Send + Sync {
    fn on_call_end(&self, error: ErrorCode);
}

// run_done_state: a one-shot token deciding where `done` may execute.
const RUN_DONE_IDLE: u8 = 0;
const CAN_RUN_DONE: u8 = 1;
const DID_RUN_DONE: u8 = 2;

pub(crate) struct CallState {
    /// Base correlation id of the current call (re-created by `reset`).
    pub(crate) call_id: CallId,

    // Per-call overrides; UNSET_MAGIC_NUM (or Unknown) means "inherit".
    pub(crate) timeout_ms: i32,
    pub(crate) backup_request_ms: i32,
    pub(crate) max_retry: i32,
    pub(crate) connect_timeout_ms: i32,
    pub(crate) connection_type: ConnectionType,
    pub(crate) log_id: u64,
    pub(crate) request_code: Option<u64>,

    // Bound from the Channel at dispatch time.
    pub(crate) method: Option<MethodDescriptor>,
    pub(crate) auth: Option<Arc<dyn Authenticator>>,
    pub(crate) pack_request: Option<PackRequestFn>,
    pub(crate) request_protocol: ProtocolId,
    pub(crate) preferred_index: i32,
    pub(crate) request_buf: Vec<u8>,
    pub(crate) response: Option<Arc<dyn ResponseSink>>,
    pub(crate) done: Option<DoneCallback>,
    pub(crate) single_server_id: SocketId,
    pub(crate) remote_side: Option<Endpoint>,
    pub(crate) lb: Option<Arc<LoadBalancerWithNaming>>,
    pub(crate) messenger: Option<Arc<dyn Messenger>>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) sender: Option<Arc<dyn CallSender>>,
    pub(crate) request_stream: StreamId,

    // Timers and deadlines, in monotonic microseconds.
    pub(crate) timeout_id: TimerId,
    pub(crate) abstime_us: i64,
    pub(crate) begin_time_us: i64,
    pub(crate) end_time_us: i64,

    pub(crate) span: Option<tracing::Span>,

    // Attempt machine.
    pub(crate) attempts_issued: u32,
    pub(crate) current_version: u32,
    pub(crate) unfinished_version: Option<u32>,
    pub(crate) tried_servers: Vec<SocketId>,
    pub(crate) current_selection: Option<(SocketId, bool)>,
    pub(crate) unfinished_selection: Option<(SocketId, bool)>,

    // Outcome.
    pub(crate) error_code: ErrorCode,
    pub(crate) error_text: String,
    pub(crate) failed_inline: bool,
    pub(crate) completed: bool,
}

impl CallState {
    fn fresh(call_id: CallId) -> Self {
        Self {
            call_id,
            timeout_ms: UNSET_MAGIC_NUM,
            backup_request_ms: UNSET_MAGIC_NUM,
            max_retry: UNSET_MAGIC_NUM,
            connect_timeout_ms: UNSET_MAGIC_NUM,
            connection_type: ConnectionType::Unknown,
            log_id: 0,
            request_code: None,
            method: None,
            auth: None,
            pack_request: None,
            request_protocol: ProtocolId::UNKNOWN,
            preferred_index: -1,
            request_buf: Vec::new(),
            response: None,
            done: None,
            single_server_id: INVALID_SOCKET_ID,
            remote_side: None,
            lb: None,
            messenger: None,
            retry_policy: None,
            sender: None,
            request_stream: INVALID_STREAM_ID,
            timeout_id: INVALID_TIMER_ID,
            abstime_us: -1,
            begin_time_us: 0,
            end_time_us: 0,
            span: None,
            attempts_issued: 0,
            current_version: 0,
            unfinished_version: None,
            tried_servers: Vec::new(),
            current_selection: None,
            unfinished_selection: None,
            error_code: ErrorCode::Ok,
            error_text: String::new(),
            failed_inline: false,
            completed: false,
        }
    }
}

pub(crate) struct ControllerShared {
    state: Mutex<CallState>,
    run_done_state: AtomicU8,
    /// Live `Controller` handles; the last one to drop tears the slot down.
    handles: AtomicUsize,
}

impl ControllerShared {
    pub(crate) fn state(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allow `done` to run inline on the thread currently inside
    /// `call_method`.
    pub(crate) fn allow_done_inline(&self) {
        self.run_done_state.store(CAN_RUN_DONE, Ordering::Release);
    }

    /// The inline window closed (call_method returned to its caller).
    pub(crate) fn revoke_done_inline(&self) {
        let _ = self.run_done_state.compare_exchange(
            CAN_RUN_DONE,
            RUN_DONE_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    // ------------------------------------------------------------------
    // Attempt issuing
    // ------------------------------------------------------------------

    /// Select a server, pack the request and hand it to the messenger as a
    /// fresh attempt. Consumes one version from the locked range.
    pub(crate) fn issue_attempt(&self) -> Result<(), (ErrorCode, String)> {
        let mut st = self.state();
        let (server_id, need_feedback) = if st.single_server_id != INVALID_SOCKET_ID {
            (st.single_server_id, false)
        } else {
            let lb = st
                .lb
                .clone()
                .ok_or((ErrorCode::NoServer, "no server target".to_string()))?;
            let input = SelectIn {
                begin_time_us: st.begin_time_us,
                request_code: st.request_code,
                excluded: &st.tried_servers,
            };
            let out = lb
                .select_server(&input)
                .map_err(|code| (code, "fail to select server".to_string()))?;
            (out.socket, out.need_feedback)
        };
        let Some(sock) = socket::address(server_id) else {
            return Err((
                ErrorCode::ConnectFailed,
                format!("socket {server_id} is gone"),
            ));
        };

        let version = st.call_id.version() + 1 + st.attempts_issued;
        st.attempts_issued += 1;
        st.current_version = version;
        st.tried_servers.push(server_id);
        st.current_selection = Some((server_id, need_feedback));
        st.remote_side = Some(sock.remote_side());

        let attempt_id = st.call_id.with_version(version);
        let pack = st
            .pack_request
            .ok_or((ErrorCode::Internal, "no pack_request".to_string()))?;
        let ctx = PackContext {
            correlation_id: attempt_id,
            method: st.method.as_ref(),
            auth: st.auth.as_ref(),
            log_id: st.log_id,
        };
        let mut packed = Vec::new();
        pack(&mut packed, &st.request_buf, &ctx)
            .map_err(|e| (ErrorCode::SerializeFailed, e.to_string()))?;

        let messenger = st
            .messenger
            .clone()
            .ok_or((ErrorCode::Internal, "no messenger".to_string()))?;
        let issue_opts = IssueOptions {
            abstime_us: st.abstime_us,
            connect_timeout_ms: st.connect_timeout_ms,
            connection_type: st.connection_type,
        };
        debug!(
            call_id = st.call_id.value(),
            version,
            server = %sock.remote_side(),
            "issuing attempt"
        );
        drop(st);
        messenger.issue(sock, packed, attempt_id, issue_opts);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Slot event handling (runs with the slot's logical lock held)
    // ------------------------------------------------------------------

    fn handle_backup_trigger(&self, id: CallId) {
        let mut st = self.state();
        // The backup timer just fired; its table entry is gone.
        st.timeout_id = INVALID_TIMER_ID;

        // Arm the timeout for the remaining budget before hedging.
        if st.abstime_us >= 0 {
            let base_id = st.call_id;
            match timer_service().add_at(st.abstime_us, move || {
                crate::channel::handle_timeout(base_id)
            }) {
                Ok(timer_id) => st.timeout_id = timer_id,
                Err(code) => {
                    drop(st);
                    self.finish(id, code, "fail to add timer after backup request".to_string());
                    return;
                }
            }
        }

        if st.attempts_issued > st.max_retry.max(0) as u32 {
            // No version budget left for a hedged attempt; keep waiting on
            // the one in flight.
            drop(st);
            registry().unlock(id);
            return;
        }

        st.unfinished_version = Some(st.current_version);
        st.unfinished_selection = st.current_selection.take();
        debug!(call_id = st.call_id.value(), "launching backup request");
        drop(st);

        match self.issue_attempt() {
            Ok(()) => registry().unlock(id),
            Err((code, text)) => self.handle_attempt_failure(id, code, text),
        }
    }

    /// An attempt failed before it reached the messenger; treat it like a
    /// transport failure of the current attempt.
    fn handle_attempt_failure(&self, id: CallId, code: ErrorCode, text: String) {
        let version = self.state().current_version;
        self.handle_error(id, code, version, text);
    }

    fn handle_error(&self, id: CallId, code: ErrorCode, version: u32, text: String) {
        // Control codes apply to the whole call, regardless of attempt.
        if matches!(code, ErrorCode::Timeout | ErrorCode::Cancelled) {
            self.finish(id, code, text);
            return;
        }

        let mut st = self.state();
        if st.unfinished_version == Some(version) {
            // The hedged predecessor died; the current attempt is still out.
            st.unfinished_version = None;
            st.unfinished_selection = None;
            drop(st);
            registry().unlock(id);
            return;
        }
        if version != st.current_version {
            debug!(
                call_id = st.call_id.value(),
                version, "ignoring completion of a stale attempt"
            );
            drop(st);
            registry().unlock(id);
            return;
        }

        let retriable = match &st.retry_policy {
            Some(policy) => policy.do_retry(code),
            None => code.retriable_by_default(),
        };
        let budget_left = st.attempts_issued <= st.max_retry.max(0) as u32;
        let deadline_ok = st.abstime_us < 0 || monotonic_us() < st.abstime_us;

        if retriable && budget_left && deadline_ok {
            debug!(
                call_id = st.call_id.value(),
                attempt = st.attempts_issued,
                %code,
                "retrying after attempt failure"
            );
            drop(st);
            match self.issue_attempt() {
                Ok(()) => registry().unlock(id),
                Err((next_code, next_text)) => {
                    self.handle_attempt_failure(id, next_code, next_text)
                }
            }
            return;
        }

        if let Some(unfinished) = st.unfinished_version {
            // The current attempt is dead but its predecessor may still
            // answer; promote it and keep waiting.
            st.current_version = unfinished;
            st.current_selection = st.unfinished_selection.take();
            st.unfinished_version = None;
            drop(st);
            registry().unlock(id);
            return;
        }

        drop(st);
        self.finish(id, code, text);
    }

    fn handle_response(&self, id: CallId, version: u32, payload: Vec<u8>) {
        let sink = {
            let mut st = self.state();
            if version == st.current_version {
                // current_selection already set
            } else if st.unfinished_version == Some(version) {
                st.current_selection = st.unfinished_selection.take();
            } else {
                debug!(
                    call_id = st.call_id.value(),
                    version, "ignoring response from a stale attempt"
                );
                drop(st);
                registry().unlock(id);
                return;
            }
            st.response.clone()
        };

        // Run the sink without the state lock: it is caller code.
        let outcome = match &sink {
            Some(sink) => sink.fill(&payload),
            None => Ok(()),
        };
        match outcome {
            Ok(()) => self.finish(id, ErrorCode::Ok, String::new()),
            Err(ResponseError::App { code, message }) => self.finish(
                id,
                ErrorCode::AppError,
                format!("application error {code}: {message}"),
            ),
            Err(ResponseError::Parse(detail)) => {
                self.finish(id, ErrorCode::ParseFailed, detail)
            }
        }
    }

    /// Pre-send failure: record the error and complete without issuing.
    pub(crate) fn handle_send_failed(&self, id: CallId, code: ErrorCode, text: String) {
        self.state().failed_inline = true;
        self.finish(id, code, text);
    }

    /// Terminal completion: exactly one per call. Cancels the pending timer,
    /// feeds the balancer back, releases shared references, destroys the
    /// slot (waking `join`) and dispatches `done`.
    fn finish(&self, id: CallId, code: ErrorCode, text: String) {
        let (done, sender, feedback) = {
            let mut st = self.state();
            if st.completed {
                drop(st);
                registry().unlock(id);
                return;
            }
            st.completed = true;
            st.error_code = code;
            st.error_text = text;
            st.end_time_us = monotonic_us();

            if st.timeout_id != INVALID_TIMER_ID {
                timer_service().cancel(st.timeout_id);
                st.timeout_id = INVALID_TIMER_ID;
            }

            let feedback = match (st.lb.take(), st.current_selection) {
                (Some(lb), Some((server_id, true))) => Some((
                    lb,
                    CallInfo {
                        server_id,
                        error_code: code,
                        begin_time_us: st.begin_time_us,
                    },
                )),
                _ => None,
            };

            if let Some(span) = st.span.take() {
                if code != ErrorCode::Ok {
                    span.in_scope(|| {
                        debug!(error_code = code.value(), error = %code, "call failed")
                    });
                }
            }

            st.messenger = None;
            (st.done.take(), st.sender.take(), feedback)
        };

        if let Some((lb, info)) = feedback {
            lb.feedback(&info);
        }
        if let Some(sender) = sender {
            sender.on_call_end(code);
        }
        registry().unlock_and_destroy(id);
        run_done_by_state(self, done);
    }
}

impl SlotHandler for ControllerShared {
    fn on_slot_event(&self, id: CallId, event: SlotEvent) {
        {
            let st = self.state();
            // Events for a slot this controller abandoned (reset mid-flight):
            // retire the old slot and move on.
            if st.call_id.value() >> 32 != id.value() >> 32 {
                drop(st);
                registry().unlock_and_destroy(id);
                return;
            }
            if st.completed {
                drop(st);
                registry().unlock(id);
                return;
            }
        }
        match event {
            SlotEvent::Error {
                code: ErrorCode::BackupRequest,
                ..
            } => self.handle_backup_trigger(id),
            SlotEvent::Error { code, version } => {
                self.handle_error(id, code, version, code.to_string())
            }
            SlotEvent::Response { version, payload } => {
                self.handle_response(id, version, payload)
            }
        }
    }
}

/// Run `done` inline when the completing thread is still inside
/// `call_method`, otherwise on a fresh task so the caller's completion code
/// never re-enters the completing thread's stack.
pub(crate) fn run_done_by_state(shared: &ControllerShared, done: Option<DoneCallback>) {
    let Some(done) = done else {
        return;
    };
    if shared
        .run_done_state
        .compare_exchange(CAN_RUN_DONE, DID_RUN_DONE, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        done();
    } else {
        run_done_in_another_task(done);
    }
}

fn run_done_in_another_task(done: DoneCallback) {
    if runtime::runtime_available() {
        runtime::spawn(async move {
            let _guard = usercode::UsercodeGuard::enter();
            done();
        });
    } else {
        error!("fail to spawn task for done, running inline");
        done();
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Mutable per-call context exchanged between the caller and the framework.
///
/// Cheap to clone; clones share the same call. Typical asynchronous use
/// clones the controller into the `done` callback to inspect the outcome.
/// After a call completes, `reset()` makes the controller usable again.
pub struct Controller {
    shared: Arc<ControllerShared>,
}

impl Clone for Controller {
    fn clone(&self) -> Self {
        self.shared.handles.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        let shared = Arc::new(ControllerShared {
            state: Mutex::new(CallState::fresh(INVALID_CALL_ID)),
            run_done_state: AtomicU8::new(RUN_DONE_IDLE),
            handles: AtomicUsize::new(1),
        });
        let call_id = registry().create(shared.clone());
        shared.state().call_id = call_id;
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<ControllerShared> {
        &self.shared
    }

    /// The base correlation id of the current call.
    pub fn call_id(&self) -> CallId {
        self.shared.state().call_id
    }

    /// Make the controller reusable: drops all per-call state and allocates
    /// a fresh correlation slot.
    pub fn reset(&self) {
        let old = {
            let st = self.shared.state();
            st.call_id
        };
        registry().destroy_if_idle(old);
        *self.shared.state() = CallState::fresh(INVALID_CALL_ID);
        self.shared.run_done_state.store(RUN_DONE_IDLE, Ordering::Release);
        let call_id = registry().create(self.shared.clone());
        self.shared.state().call_id = call_id;
    }

    // ------------------------------------------------------------------
    // Per-call overrides
    // ------------------------------------------------------------------

    pub fn set_timeout_ms(&self, timeout_ms: i32) {
        self.shared.state().timeout_ms = timeout_ms;
    }

    pub fn timeout_ms(&self) -> i32 {
        self.shared.state().timeout_ms
    }

    pub fn set_backup_request_ms(&self, backup_request_ms: i32) {
        self.shared.state().backup_request_ms = backup_request_ms;
    }

    pub fn backup_request_ms(&self) -> i32 {
        self.shared.state().backup_request_ms
    }

    pub fn set_max_retry(&self, max_retry: i32) {
        self.shared.state().max_retry = max_retry;
    }

    pub fn max_retry(&self) -> i32 {
        self.shared.state().max_retry
    }

    pub fn set_connection_type(&self, connection_type: ConnectionType) {
        self.shared.state().connection_type = connection_type;
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.shared.state().connection_type
    }

    /// Always mirrors the channel's setting; per-call overrides would be
    /// meaningless because connections are shared across channels.
    pub fn connect_timeout_ms(&self) -> i32 {
        self.shared.state().connect_timeout_ms
    }

    pub fn set_log_id(&self, log_id: u64) {
        self.shared.state().log_id = log_id;
    }

    pub fn log_id(&self) -> u64 {
        self.shared.state().log_id
    }

    pub fn set_request_code(&self, request_code: u64) {
        self.shared.state().request_code = Some(request_code);
    }

    /// Attach a request stream. Streamed calls cannot retry or hedge.
    pub fn set_request_stream(&self, stream: StreamId) {
        self.shared.state().request_stream = stream;
    }

    pub fn set_sender(&self, sender: Arc<dyn CallSender>) {
        self.shared.state().sender = Some(sender);
    }

    pub(crate) fn has_sender(&self) -> bool {
        self.shared.state().sender.is_some()
    }

    // ------------------------------------------------------------------
    // Outcome
    // ------------------------------------------------------------------

    pub fn failed(&self) -> bool {
        self.shared.state().error_code != ErrorCode::Ok
    }

    pub fn error_code(&self) -> ErrorCode {
        self.shared.state().error_code
    }

    pub fn error_text(&self) -> String {
        self.shared.state().error_text.clone()
    }

    /// Whether the failure was recorded before anything was sent.
    pub fn failed_inline(&self) -> bool {
        self.shared.state().failed_inline
    }

    /// The server the (last) attempt talked to.
    pub fn remote_side(&self) -> Option<Endpoint> {
        self.shared.state().remote_side
    }

    pub fn latency_us(&self) -> i64 {
        let st = self.shared.state();
        if st.end_time_us > 0 {
            st.end_time_us - st.begin_time_us
        } else {
            0
        }
    }

    /// How many attempts the last call issued.
    pub fn attempts_issued(&self) -> u32 {
        self.shared.state().attempts_issued
    }

    /// Protocol the last call was dispatched with.
    pub fn request_protocol(&self) -> ProtocolId {
        self.shared.state().request_protocol
    }

    /// The channel's index into the messenger's protocol table.
    pub fn preferred_index(&self) -> i32 {
        self.shared.state().preferred_index
    }

    pub(crate) fn set_failed(&self, code: ErrorCode, text: String) {
        let mut st = self.shared.state();
        st.error_code = code;
        st.error_text = text;
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.shared.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let call_id = self.shared.state().call_id;
        if call_id != INVALID_CALL_ID && !registry().destroy_if_idle(call_id) {
            // A call is in flight with nobody left to observe it; cancel so
            // every resource is still released through the normal path.
            start_cancel(call_id);
        }
    }
}

/// Cancel the call identified by `id`. Safe to race with any completion:
/// cancellation of a finished call is a no-op.
pub fn start_cancel(id: CallId) {
    registry().post_error(id, ErrorCode::Cancelled);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_controller_has_unset_overrides() {
        let cntl = Controller::new();
        assert_eq!(cntl.timeout_ms(), UNSET_MAGIC_NUM);
        assert_eq!(cntl.max_retry(), UNSET_MAGIC_NUM);
        assert_eq!(cntl.backup_request_ms(), UNSET_MAGIC_NUM);
        assert_eq!(cntl.connection_type(), ConnectionType::Unknown);
        assert_eq!(cntl.error_code(), ErrorCode::Ok);
        assert!(!cntl.failed());
    }

    #[test]
    fn reset_allocates_a_new_slot() {
        let cntl = Controller::new();
        let first = cntl.call_id();
        cntl.set_timeout_ms(50);
        cntl.reset();
        assert_ne!(cntl.call_id(), first);
        assert_eq!(cntl.timeout_ms(), UNSET_MAGIC_NUM);
    }

    #[test]
    fn clones_share_the_call() {
        let cntl = Controller::new();
        let clone = cntl.clone();
        assert_eq!(cntl.call_id(), clone.call_id());
        clone.set_log_id(42);
        assert_eq!(cntl.log_id(), 42);
    }

    #[tokio::test]
    async fn done_runs_inline_only_inside_the_window() {
        use std::sync::atomic::AtomicBool;
        let shared = Controller::new();
        let ran = Arc::new(AtomicBool::new(false));

        // Window open: runs inline.
        shared.shared().allow_done_inline();
        let ran2 = ran.clone();
        run_done_by_state(
            shared.shared(),
            Some(Box::new(move || ran2.store(true, Ordering::SeqCst))),
        );
        assert!(ran.load(Ordering::SeqCst));

        // Window consumed: second dispatch goes to a task.
        let ran3 = Arc::new(AtomicBool::new(false));
        let ran4 = ran3.clone();
        run_done_by_state(
            shared.shared(),
            Some(Box::new(move || ran4.store(true, Ordering::SeqCst))),
        );
        assert!(!ran3.load(Ordering::SeqCst));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ran3.load(Ordering::SeqCst));
    }
}
