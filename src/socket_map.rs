//! Reference-counted interning of endpoints into sockets.
//!
//! Channels (and naming-service balancers) that target the same endpoint
//! share one socket. Insertion bumps a per-endpoint count; removal drops it
//! and tears the socket down when the last holder leaves.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::socket::{self, SocketId};

struct MapEntry {
    id: SocketId,
    ref_count: usize,
}

fn map() -> &'static Mutex<HashMap<Endpoint, MapEntry>> {
    static MAP: OnceLock<Mutex<HashMap<Endpoint, MapEntry>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Intern `endpoint`, returning the shared socket id.
pub fn insert(endpoint: Endpoint) -> SocketId {
    let mut m = map().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = m.get_mut(&endpoint) {
        entry.ref_count += 1;
        return entry.id;
    }
    let id = socket::create(endpoint);
    debug!(%endpoint, socket_id = id, "socket map interned endpoint");
    m.insert(endpoint, MapEntry { id, ref_count: 1 });
    id
}

/// Release one reference on `endpoint`. The socket is destroyed when the
/// count reaches zero. Removing an endpoint that is not interned is a no-op.
pub fn remove(endpoint: Endpoint) {
    let mut m = map().lock().unwrap_or_else(|e| e.into_inner());
    let Some(entry) = m.get_mut(&endpoint) else {
        return;
    };
    entry.ref_count -= 1;
    if entry.ref_count == 0 {
        let id = entry.id;
        m.remove(&endpoint);
        socket::remove(id);
        debug!(%endpoint, socket_id = id, "socket map dropped endpoint");
    }
}

/// Current reference count for `endpoint`; 0 when not interned.
pub fn ref_count(endpoint: Endpoint) -> usize {
    map()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&endpoint)
        .map(|entry| entry.ref_count)
        .unwrap_or(0)
}
