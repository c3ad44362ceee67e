//! Socket identities and the process-wide socket table.
//!
//! A `Socket` here is the *identity* of a connection target, not the
//! connection itself: endpoint, health bit, and a stable id other components
//! (socket map, load balancers, controllers) pass around. Live connections
//! hang off the messenger, keyed by `SocketId`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::endpoint::Endpoint;

/// Stable identifier of a socket. Never reused within a process.
pub type SocketId = u64;

/// Sentinel for "no socket".
pub const INVALID_SOCKET_ID: SocketId = u64::MAX;

/// One connection target.
pub struct Socket {
    id: SocketId,
    remote_side: Endpoint,
    failed: AtomicBool,
}

impl Socket {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn remote_side(&self) -> Endpoint {
        self.remote_side
    }

    /// Mark the socket unhealthy. Set by the messenger when a connection to
    /// this target dies; cleared on the next successful connect.
    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn revive(&self) {
        self.failed.store(false, Ordering::Relaxed);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

struct SocketTable {
    sockets: Mutex<HashMap<SocketId, Arc<Socket>>>,
    next_id: AtomicU64,
}

fn table() -> &'static SocketTable {
    static TABLE: OnceLock<SocketTable> = OnceLock::new();
    TABLE.get_or_init(|| SocketTable {
        sockets: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
    })
}

/// Create a socket for `endpoint` and register it in the table.
pub(crate) fn create(endpoint: Endpoint) -> SocketId {
    let t = table();
    let id = t.next_id.fetch_add(1, Ordering::Relaxed);
    let socket = Arc::new(Socket {
        id,
        remote_side: endpoint,
        failed: AtomicBool::new(false),
    });
    t.sockets
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, socket);
    id
}

/// Look up a live socket by id.
pub fn address(id: SocketId) -> Option<Arc<Socket>> {
    if id == INVALID_SOCKET_ID {
        return None;
    }
    table()
        .sockets
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&id)
        .cloned()
}

/// Drop a socket from the table. Outstanding `Arc`s stay valid; new lookups
/// fail.
pub(crate) fn remove(id: SocketId) {
    table()
        .sockets
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);
}
