//! The messenger contract and the default stream transport.
//!
//! `call_method` hands each packed attempt to a [`Messenger`]; the messenger
//! owns connections and delivers the outcome — response payload, write
//! failure, connect failure, connection death — to the correlation registry.
//! Which of the three connection disciplines applies (`SINGLE`, `POOLED`,
//! `SHORT`) is the messenger's business; the dispatch engine only forwards
//! the resolved connection type.
//!
//! Frames are length-prefixed: a 4-byte magic, the 8-byte correlation id of
//! the attempt, a 4-byte payload length, then the payload. The server echoes
//! the correlation id on its response frame, which is what lets a pipelined
//! `SINGLE` connection demultiplex.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use crate::correlation::{CallId, registry};
use crate::errors::ErrorCode;
use crate::options::ConnectionType;
use crate::runtime;
use crate::socket::{Socket, SocketId};
use crate::timer::{instant_at_us, monotonic_us};

const FRAME_MAGIC: &[u8; 4] = b"HWSR";
const FRAME_HEADER_LEN: usize = 16;
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Idle pooled connections kept per endpoint.
const POOL_KEEP: usize = 32;

// ============================================================================
// Frame codec
// ============================================================================

pub(crate) fn encode_frame(out: &mut Vec<u8>, id: CallId, payload: &[u8]) {
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(&id.value().to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Decode one complete frame from `buf`. Used by tests and mock servers.
pub(crate) fn decode_frame(buf: &[u8]) -> Option<(CallId, Vec<u8>)> {
    if buf.len() < FRAME_HEADER_LEN || &buf[0..4] != FRAME_MAGIC {
        return None;
    }
    let id = u64::from_be_bytes(buf[4..12].try_into().ok()?);
    let len = u32::from_be_bytes(buf[12..16].try_into().ok()?) as usize;
    if buf.len() < FRAME_HEADER_LEN + len {
        return None;
    }
    Some((
        CallId::from_value(id),
        buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec(),
    ))
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(CallId, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if &header[0..4] != FRAME_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame magic"));
    }
    let id = u64::from_be_bytes(header[4..12].try_into().expect("sized slice"));
    let len = u32::from_be_bytes(header[12..16].try_into().expect("sized slice"));
    if len > MAX_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    wire_spy("<--", id, &payload);
    Ok((CallId::from_value(id), payload))
}

fn wire_spy(direction: &str, id: u64, payload: &[u8]) {
    static ENABLED: OnceLock<AtomicBool> = OnceLock::new();
    let enabled = ENABLED.get_or_init(|| {
        AtomicBool::new(std::env::var("HAWSER_WIRE_SPY").is_ok())
    });
    if enabled.load(Ordering::Relaxed) {
        eprintln!(
            "[WIRE] {direction} id={id} {} bytes: {:02x?}",
            payload.len(),
            &payload[..payload.len().min(64)]
        );
    }
}

// ============================================================================
// Messenger contract
// ============================================================================

/// Per-attempt parameters the messenger needs.
#[derive(Debug, Clone, Copy)]
pub struct IssueOptions {
    /// Absolute call deadline in monotonic microseconds; -1 means none.
    pub abstime_us: i64,
    /// Per-attempt connect budget, truncated by `abstime_us`.
    pub connect_timeout_ms: i32,
    pub connection_type: ConnectionType,
}

impl IssueOptions {
    /// The instant by which a connect must finish.
    fn connect_deadline(&self) -> std::time::Instant {
        let connect_us = monotonic_us() + i64::from(self.connect_timeout_ms.max(0)) * 1000;
        let deadline_us = if self.abstime_us >= 0 {
            connect_us.min(self.abstime_us)
        } else {
            connect_us
        };
        instant_at_us(deadline_us)
    }
}

/// Writes packed attempts and feeds their outcomes back to the correlation
/// registry.
pub trait Messenger: Send + Sync {
    fn issue(&self, socket: Arc<Socket>, packed: Vec<u8>, id: CallId, opts: IssueOptions);
}

/// Deliver a response payload for the attempt identified by `id`.
///
/// For messenger implementations: stale ids (an attempt that was retried
/// past, a call that already completed) are dropped silently.
pub fn deliver_response(id: CallId, payload: Vec<u8>) {
    registry().post_response(id, payload);
}

/// Deliver an attempt-level failure for `id`. Same staleness rules as
/// [`deliver_response`].
pub fn deliver_error(id: CallId, code: ErrorCode) {
    registry().post_error(id, code);
}

fn messenger_slot() -> &'static OnceLock<Arc<dyn Messenger>> {
    static SLOT: OnceLock<Arc<dyn Messenger>> = OnceLock::new();
    &SLOT
}

/// Install the process-wide messenger. The first installation wins; returns
/// false if one was already in place.
pub fn install_messenger(messenger: Arc<dyn Messenger>) -> bool {
    messenger_slot().set(messenger).is_ok()
}

/// The process-wide messenger, defaulting to the stream transport.
pub(crate) fn messenger() -> Arc<dyn Messenger> {
    messenger_slot()
        .get_or_init(|| Arc::new(StreamMessenger::new()))
        .clone()
}

// ============================================================================
// Default stream transport
// ============================================================================

/// TCP messenger with per-connection-type reuse.
pub struct StreamMessenger {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    singles: Mutex<HashMap<SocketId, Arc<SingleConn>>>,
    pools: Mutex<HashMap<SocketId, Arc<Pool>>>,
}

impl StreamMessenger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StreamInner {
                singles: Mutex::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for StreamMessenger {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamInner {
    fn singles(&self) -> MutexGuard<'_, HashMap<SocketId, Arc<SingleConn>>> {
        self.singles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<SocketId, Arc<Pool>>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn connect(socket: &Socket, opts: &IssueOptions) -> Result<TcpStream, ErrorCode> {
    let deadline = opts.connect_deadline();
    let addr = socket.remote_side().to_socket_addr();
    match tokio::time::timeout_at(deadline.into(), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            socket.revive();
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(error)) => {
            debug!(%error, endpoint = %socket.remote_side(), "connect failed");
            socket.set_failed();
            Err(ErrorCode::ConnectFailed)
        }
        Err(_) => {
            debug!(endpoint = %socket.remote_side(), "connect timed out");
            socket.set_failed();
            Err(ErrorCode::ConnectFailed)
        }
    }
}

/// Run `future` until the call deadline; `None` means the budget elapsed and
/// the attempt was abandoned (the timeout timer owns reporting it).
async fn until_deadline<T>(
    abstime_us: i64,
    future: impl std::future::Future<Output = T>,
) -> Option<T> {
    if abstime_us < 0 {
        Some(future.await)
    } else {
        tokio::time::timeout_at(instant_at_us(abstime_us).into(), future)
            .await
            .ok()
    }
}

impl Messenger for StreamMessenger {
    fn issue(&self, socket: Arc<Socket>, packed: Vec<u8>, id: CallId, opts: IssueOptions) {
        wire_spy("-->", id.value(), &packed);
        let inner = self.inner.clone();
        runtime::spawn(async move {
            match opts.connection_type {
                ConnectionType::Single => {
                    StreamInner::issue_single(inner.clone(), socket, packed, id, opts).await
                }
                ConnectionType::Pooled => inner.issue_pooled(socket, packed, id, opts).await,
                _ => inner.issue_short(socket, packed, id, opts).await,
            }
        });
    }
}

impl StreamInner {
    async fn issue_short(&self, socket: Arc<Socket>, packed: Vec<u8>, id: CallId, opts: IssueOptions) {
        let mut stream = match connect(&socket, &opts).await {
            Ok(stream) => stream,
            Err(code) => return deliver_error(id, code),
        };
        if stream.write_all(&packed).await.is_err() {
            socket.set_failed();
            return deliver_error(id, ErrorCode::WriteFailed);
        }
        match until_deadline(opts.abstime_us, read_frame(&mut stream)).await {
            Some(Ok((response_id, payload))) => deliver_response(response_id, payload),
            Some(Err(error)) => {
                debug!(%error, "short connection died before response");
                deliver_error(id, ErrorCode::ConnectionClosed);
            }
            None => { /* deadline elapsed; the timeout timer reports it */ }
        }
    }

    async fn issue_pooled(&self, socket: Arc<Socket>, packed: Vec<u8>, id: CallId, opts: IssueOptions) {
        let pool = self
            .pools()
            .entry(socket.id())
            .or_insert_with(|| Arc::new(Pool::default()))
            .clone();
        let mut stream = match pool.take() {
            Some(stream) => stream,
            None => match connect(&socket, &opts).await {
                Ok(stream) => stream,
                Err(code) => return deliver_error(id, code),
            },
        };
        if stream.write_all(&packed).await.is_err() {
            socket.set_failed();
            return deliver_error(id, ErrorCode::WriteFailed);
        }
        match until_deadline(opts.abstime_us, read_frame(&mut stream)).await {
            Some(Ok((response_id, payload))) => {
                pool.put(stream);
                deliver_response(response_id, payload);
            }
            Some(Err(error)) => {
                debug!(%error, "pooled connection died before response");
                deliver_error(id, ErrorCode::ConnectionClosed);
            }
            None => { /* deadline elapsed; connection is discarded */ }
        }
    }

    async fn issue_single(
        this: Arc<Self>,
        socket: Arc<Socket>,
        packed: Vec<u8>,
        id: CallId,
        opts: IssueOptions,
    ) {
        let conn = match Self::single_conn(&this, &socket, &opts).await {
            Ok(conn) => conn,
            Err(code) => return deliver_error(id, code),
        };
        conn.pending().insert(id.value());
        let write_ok = {
            let mut writer = conn.writer.lock().await;
            writer.write_all(&packed).await.is_ok()
        };
        if !write_ok {
            conn.pending().remove(&id.value());
            socket.set_failed();
            this.singles().remove(&socket.id());
            deliver_error(id, ErrorCode::WriteFailed);
        }
        // The shared reader task posts the response (or the connection's
        // death) for every pending id.
    }

    async fn single_conn(
        this: &Arc<Self>,
        socket: &Arc<Socket>,
        opts: &IssueOptions,
    ) -> Result<Arc<SingleConn>, ErrorCode> {
        if let Some(conn) = this.singles().get(&socket.id()).cloned() {
            return Ok(conn);
        }
        let stream = connect(socket, opts).await?;
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(SingleConn {
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashSet::new()),
        });
        let conn = {
            let mut singles = this.singles();
            match singles.get(&socket.id()) {
                // Lost the connect race; use the winner and drop ours.
                Some(existing) => existing.clone(),
                None => {
                    singles.insert(socket.id(), conn.clone());
                    spawn_single_reader(
                        this.clone(),
                        socket.clone(),
                        conn.clone(),
                        read_half,
                    );
                    conn
                }
            }
        };
        Ok(conn)
    }
}

struct SingleConn {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Correlation ids written but not yet answered.
    pending: Mutex<HashSet<u64>>,
}

impl SingleConn {
    fn pending(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn spawn_single_reader(
    inner: Arc<StreamInner>,
    socket: Arc<Socket>,
    conn: Arc<SingleConn>,
    mut reader: OwnedReadHalf,
) {
    runtime::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok((response_id, payload)) => {
                    conn.pending().remove(&response_id.value());
                    deliver_response(response_id, payload);
                }
                Err(error) => {
                    warn!(%error, endpoint = %socket.remote_side(), "shared connection died");
                    socket.set_failed();
                    inner.singles().remove(&socket.id());
                    for pending in conn.pending().drain() {
                        deliver_error(
                            CallId::from_value(pending),
                            ErrorCode::ConnectionClosed,
                        );
                    }
                    return;
                }
            }
        }
    });
}

#[derive(Default)]
struct Pool {
    idle: Mutex<Vec<TcpStream>>,
}

impl Pool {
    fn take(&self) -> Option<TcpStream> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    fn put(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < POOL_KEEP {
            idle.push(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_codec_round_trips() {
        let id = CallId::from_value(0x1122_3344_5566_7788);
        let mut buf = Vec::new();
        encode_frame(&mut buf, id, b"hello");
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 5);

        let (decoded_id, payload) = decode_frame(&buf).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn decode_rejects_bad_magic_and_short_frames() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, CallId::from_value(1), b"abc");
        assert!(decode_frame(&buf[..FRAME_HEADER_LEN + 2]).is_none());
        buf[0] = b'X';
        assert!(decode_frame(&buf).is_none());
    }

    #[tokio::test]
    async fn read_frame_round_trips_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut buf = Vec::new();
        encode_frame(&mut buf, CallId::from_value(42), b"ping");
        client.write_all(&buf).await.unwrap();

        let (id, payload) = read_frame(&mut server).await.unwrap();
        assert_eq!(id.value(), 42);
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut header = Vec::new();
        header.extend_from_slice(FRAME_MAGIC);
        header.extend_from_slice(&1u64.to_be_bytes());
        header.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        tokio::spawn(async move {
            let _ = client.write_all(&header).await;
        });
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
