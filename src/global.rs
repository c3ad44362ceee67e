//! Process-global initialization.
//!
//! Registries and services are lazy singletons; this entry point warms them
//! exactly once so every `Channel::init*` sees the built-in protocols and
//! naming services without ordering concerns. Safe (and cheap) to call any
//! number of times.

use std::sync::OnceLock;

use tracing::debug;

use crate::balancer::register_builtin_naming_services;
use crate::protocol::register_builtin_protocols;
use crate::timer::monotonic_us;

/// Initialize all process-global state the channel core relies on.
pub fn global_initialize_or_die() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        // Anchor the monotonic clock before anything computes deadlines.
        let _ = monotonic_us();
        register_builtin_protocols();
        register_builtin_naming_services();
        debug!("global channel state initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolId, find_protocol};

    #[test]
    fn initialization_is_idempotent() {
        global_initialize_or_die();
        global_initialize_or_die();
        assert!(find_protocol(ProtocolId::STD).is_some());
        assert!(find_protocol(ProtocolId::ESP).is_some());
    }
}
