//! Correlation-id registry: versioned slots joining asynchronous completions.
//!
//! Every call owns one slot for its lifetime. A [`CallId`] addresses a slot
//! plus a version within it; dispatch reserves the version range
//! `[base, base + 2 + max_retry)` so the base id stays valid for timers while
//! each attempt gets its own version for transport completions. Postings
//! against versions outside the live range, or against a destroyed slot, are
//! no-ops — that is what makes stale timers and stale responses harmless.
//!
//! The slot also carries the call's logical lock: events arriving while the
//! slot is locked queue up and are replayed, one at a time, as the holder
//! unlocks. The handler runs with the lock held and must finish by calling
//! [`CorrelationRegistry::unlock`] or
//! [`CorrelationRegistry::unlock_and_destroy`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use slab::Slab;
use tokio::sync::Notify;
use tracing::debug;

use crate::errors::ErrorCode;

/// 64-bit token addressing a correlation slot plus a version within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId {
    value: u64,
}

/// Sentinel for "no call".
pub const INVALID_CALL_ID: CallId = CallId { value: 0 };

impl CallId {
    pub(crate) fn from_value(value: u64) -> Self {
        Self { value }
    }

    pub fn value(self) -> u64 {
        self.value
    }

    fn slot(self) -> Option<usize> {
        let key = self.value >> 32;
        if key == 0 { None } else { Some(key as usize - 1) }
    }

    pub(crate) fn version(self) -> u32 {
        self.value as u32
    }

    /// Same slot, different version: the id of one attempt.
    pub(crate) fn with_version(self, version: u32) -> Self {
        Self {
            value: (self.value & !0xffff_ffff) | u64::from(version),
        }
    }

    fn compose(key: usize, version: u32) -> Self {
        Self {
            value: ((key as u64 + 1) << 32) | u64::from(version),
        }
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Completion or control event delivered through a slot.
pub(crate) enum SlotEvent {
    /// An error posted against `version` (timers post against the base).
    Error { code: ErrorCode, version: u32 },
    /// A response payload from the attempt that ran as `version`.
    Response { version: u32, payload: Vec<u8> },
}

/// Receives slot events with the slot's logical lock held.
pub(crate) trait SlotHandler: Send + Sync {
    fn on_slot_event(&self, id: CallId, event: SlotEvent);
}

struct SlotState {
    /// First valid version; the base id carries it.
    base: u32,
    /// One past the last reserved version.
    range_end: u32,
    locked: bool,
    destroyed: bool,
    pending: VecDeque<SlotEvent>,
    handler: Option<Arc<dyn SlotHandler>>,
}

impl SlotState {
    fn accepts(&self, version: u32) -> bool {
        !self.destroyed && version >= self.base && version < self.range_end
    }
}

struct SlotShared {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl SlotShared {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RegistryInner {
    slots: Slab<Arc<SlotShared>>,
    /// Version floor per slab key, kept across reuse so a recycled key can
    /// never resurrect an old call's ids.
    next_versions: Vec<u32>,
}

/// Locking a slot that has been destroyed (or was never created).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct InvalidCallId;

pub(crate) struct CorrelationRegistry {
    inner: Mutex<RegistryInner>,
}

pub(crate) fn registry() -> &'static CorrelationRegistry {
    static REGISTRY: OnceLock<CorrelationRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| CorrelationRegistry {
        inner: Mutex::new(RegistryInner {
            slots: Slab::new(),
            next_versions: Vec::new(),
        }),
    })
}

impl CorrelationRegistry {
    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, id: CallId) -> Option<Arc<SlotShared>> {
        let key = id.slot()?;
        self.inner().slots.get(key).cloned()
    }

    /// Allocate a slot for a new call. The returned id carries the base
    /// version.
    pub(crate) fn create(&self, handler: Arc<dyn SlotHandler>) -> CallId {
        let mut inner = self.inner();
        let entry = inner.slots.vacant_entry();
        let key = entry.key();
        entry.insert(Arc::new(SlotShared {
            state: Mutex::new(SlotState {
                base: 0, // patched below once next_versions is sized
                range_end: 0,
                locked: false,
                destroyed: false,
                pending: VecDeque::new(),
                handler: Some(handler),
            }),
            notify: Notify::new(),
        }));
        if inner.next_versions.len() <= key {
            inner.next_versions.resize(key + 1, 1);
        }
        let base = inner.next_versions[key].max(1);
        let slot = inner.slots[key].clone();
        drop(inner);
        {
            let mut st = slot.state();
            st.base = base;
            st.range_end = base + 1;
        }
        CallId::compose(key, base)
    }

    /// Take the slot's lock and reserve `range` versions starting at the
    /// base. Waits if another holder has the lock; fails if the slot is gone.
    pub(crate) async fn lock_and_reset_range(
        &self,
        id: CallId,
        range: u32,
    ) -> Result<(), InvalidCallId> {
        loop {
            let Some(slot) = self.get(id) else {
                return Err(InvalidCallId);
            };
            let notified = slot.notify.notified();
            {
                let mut st = slot.state();
                if !st.accepts(id.version()) {
                    return Err(InvalidCallId);
                }
                if !st.locked {
                    st.locked = true;
                    st.range_end = st.base + range.max(1);
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Post an error against `id`'s version. Runs the handler immediately
    /// when the slot is unlocked, queues otherwise, drops silently when the
    /// version is dead.
    pub(crate) fn post_error(&self, id: CallId, code: ErrorCode) {
        self.post(
            id,
            SlotEvent::Error {
                code,
                version: id.version(),
            },
        );
    }

    /// Post a response payload from the attempt identified by `id`.
    pub(crate) fn post_response(&self, id: CallId, payload: Vec<u8>) {
        self.post(
            id,
            SlotEvent::Response {
                version: id.version(),
                payload,
            },
        );
    }

    fn post(&self, id: CallId, event: SlotEvent) {
        let Some(slot) = self.get(id) else {
            debug!(call_id = id.value(), "dropping event for missing slot");
            return;
        };
        let handler = {
            let mut st = slot.state();
            if !st.accepts(id.version()) {
                debug!(call_id = id.value(), "dropping event for dead version");
                return;
            }
            if st.locked {
                st.pending.push_back(event);
                return;
            }
            st.locked = true;
            st.handler.clone()
        };
        match handler {
            Some(h) => h.on_slot_event(id, event),
            None => self.unlock(id),
        }
    }

    /// Release the logical lock, replaying the next queued event if any.
    pub(crate) fn unlock(&self, id: CallId) {
        let Some(slot) = self.get(id) else {
            return;
        };
        let next = {
            let mut st = slot.state();
            if st.destroyed {
                None
            } else {
                match st.pending.pop_front() {
                    Some(event) => Some((event, st.handler.clone())),
                    None => {
                        st.locked = false;
                        None
                    }
                }
            }
        };
        match next {
            Some((event, Some(h))) => h.on_slot_event(id, event),
            Some((_, None)) => self.unlock(id),
            None => slot.notify.notify_waiters(),
        }
    }

    /// Terminal release: wakes joiners, drops the handler, retires every
    /// version the call ever reserved.
    pub(crate) fn unlock_and_destroy(&self, id: CallId) {
        let Some(key) = id.slot() else {
            return;
        };
        let slot = {
            let mut inner = self.inner();
            let Some(slot) = inner.slots.get(key).cloned() else {
                return;
            };
            let retired_end = {
                let mut st = slot.state();
                if !st.accepts(id.version()) {
                    return;
                }
                st.destroyed = true;
                st.locked = false;
                st.pending.clear();
                st.handler = None;
                st.range_end
            };
            inner.slots.remove(key);
            inner.next_versions[key] = retired_end;
            slot
        };
        slot.notify.notify_waiters();
    }

    /// Destroy the slot only if no call is in flight on it. Used when a
    /// Controller is reset or dropped without (or after) a dispatch.
    pub(crate) fn destroy_if_idle(&self, id: CallId) -> bool {
        let Some(key) = id.slot() else {
            return false;
        };
        let slot = {
            let mut inner = self.inner();
            let Some(slot) = inner.slots.get(key).cloned() else {
                return false;
            };
            let retired_end = {
                let mut st = slot.state();
                if !st.accepts(id.version()) || st.locked {
                    return false;
                }
                st.destroyed = true;
                st.pending.clear();
                st.handler = None;
                st.range_end
            };
            inner.slots.remove(key);
            inner.next_versions[key] = retired_end;
            slot
        };
        slot.notify.notify_waiters();
        true
    }

    /// Wait until the call completes (its slot is destroyed).
    pub(crate) async fn join(&self, id: CallId) {
        loop {
            let Some(slot) = self.get(id) else {
                return;
            };
            let notified = slot.notify.notified();
            {
                let st = slot.state();
                if st.destroyed || id.version() < st.base {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that records codes and immediately releases the lock,
    /// destroying the slot on the first terminal error.
    struct Recorder {
        codes: Mutex<Vec<ErrorCode>>,
        destroy_on_error: bool,
        events: AtomicUsize,
    }

    impl Recorder {
        fn new(destroy_on_error: bool) -> Arc<Self> {
            Arc::new(Self {
                codes: Mutex::new(Vec::new()),
                destroy_on_error,
                events: AtomicUsize::new(0),
            })
        }
    }

    impl SlotHandler for Recorder {
        fn on_slot_event(&self, id: CallId, event: SlotEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
            match event {
                SlotEvent::Error { code, .. } => {
                    self.codes.lock().unwrap().push(code);
                    if self.destroy_on_error {
                        registry().unlock_and_destroy(id);
                    } else {
                        registry().unlock(id);
                    }
                }
                SlotEvent::Response { .. } => registry().unlock_and_destroy(id),
            }
        }
    }

    #[tokio::test]
    async fn lock_reserves_a_version_range() {
        let handler = Recorder::new(false);
        let id = registry().create(handler.clone());
        registry().lock_and_reset_range(id, 5).await.unwrap();

        // Versions inside the range are accepted (queued while locked).
        registry().post_error(id.with_version(id.version() + 4), ErrorCode::Cancelled);
        // Versions outside are dropped.
        registry().post_error(id.with_version(id.version() + 5), ErrorCode::Cancelled);

        registry().unlock(id);
        assert_eq!(handler.events.load(Ordering::SeqCst), 1);
        registry().unlock_and_destroy(id);
    }

    #[tokio::test]
    async fn destroyed_slot_rejects_lock() {
        let handler = Recorder::new(true);
        let id = registry().create(handler);
        registry().lock_and_reset_range(id, 2).await.unwrap();
        registry().unlock_and_destroy(id);

        assert_eq!(
            registry().lock_and_reset_range(id, 2).await,
            Err(InvalidCallId)
        );
        // Posting against a destroyed slot is a silent no-op.
        registry().post_error(id, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn queued_events_replay_on_unlock() {
        let handler = Recorder::new(false);
        let id = registry().create(handler.clone());
        registry().lock_and_reset_range(id, 3).await.unwrap();

        registry().post_error(id, ErrorCode::Timeout);
        registry().post_error(id, ErrorCode::Cancelled);
        assert_eq!(handler.events.load(Ordering::SeqCst), 0);

        registry().unlock(id);
        assert_eq!(handler.events.load(Ordering::SeqCst), 2);
        assert_eq!(
            *handler.codes.lock().unwrap(),
            vec![ErrorCode::Timeout, ErrorCode::Cancelled]
        );
        registry().unlock_and_destroy(id);
    }

    #[tokio::test]
    async fn join_wakes_on_destroy() {
        let handler = Recorder::new(true);
        let id = registry().create(handler);
        registry().lock_and_reset_range(id, 2).await.unwrap();

        let waiter = tokio::spawn(async move { registry().join(id).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        registry().post_error(id, ErrorCode::Timeout);
        registry().unlock(id); // replays the queued error; handler destroys
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("join should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn recycled_slot_key_rejects_old_ids() {
        let handler = Recorder::new(true);
        let id = registry().create(handler.clone());
        registry().lock_and_reset_range(id, 4).await.unwrap();
        registry().unlock_and_destroy(id);

        // Allocate until the key is reused; old versions must stay dead.
        for _ in 0..8 {
            let fresh = registry().create(Recorder::new(true));
            assert_ne!(fresh, id);
            registry().destroy_if_idle(fresh);
        }
        registry().post_error(id, ErrorCode::Timeout);
        assert_eq!(handler.events.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn destroy_if_idle_respects_the_lock() {
        let handler = Recorder::new(false);
        let id = registry().create(handler);
        registry().lock_and_reset_range(id, 2).await.unwrap();
        assert!(!registry().destroy_if_idle(id));
        registry().unlock(id);
        assert!(registry().destroy_if_idle(id));
    }
}
