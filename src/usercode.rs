//! Admission control for user completion callbacks.
//!
//! When a deployment constrains user code to a bounded worker budget, a burst
//! of asynchronous calls can pile up more `done` callbacks than the budget
//! can drain. Rather than queue unboundedly, `call_method` refuses new
//! asynchronous calls up front with `TooManyUserCode` while the gauge is
//! saturated. Unconstrained processes (the default) never hit this path.

use std::sync::atomic::{AtomicI64, Ordering};

static USERCODE_LIMIT: AtomicI64 = AtomicI64::new(0);
static USERCODE_INFLIGHT: AtomicI64 = AtomicI64::new(0);

/// Constrain concurrently running user callbacks to `limit`. Zero removes
/// the constraint.
pub fn set_usercode_limit(limit: usize) {
    USERCODE_LIMIT.store(limit as i64, Ordering::Relaxed);
}

/// Whether a user-callback ceiling is configured.
pub(crate) fn usercode_constrained() -> bool {
    USERCODE_LIMIT.load(Ordering::Relaxed) > 0
}

/// Whether the ceiling is currently saturated.
pub(crate) fn too_many_user_code() -> bool {
    let limit = USERCODE_LIMIT.load(Ordering::Relaxed);
    limit > 0 && USERCODE_INFLIGHT.load(Ordering::Relaxed) >= limit
}

/// RAII increment of the in-flight gauge around one user callback.
pub(crate) struct UsercodeGuard;

impl UsercodeGuard {
    pub(crate) fn enter() -> Self {
        USERCODE_INFLIGHT.fetch_add(1, Ordering::Relaxed);
        UsercodeGuard
    }
}

impl Drop for UsercodeGuard {
    fn drop(&mut self) {
        USERCODE_INFLIGHT.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_guards() {
        assert!(!usercode_constrained());
        assert!(!too_many_user_code());

        set_usercode_limit(2);
        let a = UsercodeGuard::enter();
        assert!(!too_many_user_code());
        let b = UsercodeGuard::enter();
        assert!(too_many_user_code());
        drop(a);
        assert!(!too_many_user_code());
        drop(b);
        set_usercode_limit(0);
        assert!(!usercode_constrained());
    }
}
