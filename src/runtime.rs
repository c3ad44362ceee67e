//! Task and timer shims over tokio.
//!
//! Call sites never reach for `tokio::spawn` or `tokio::time` directly; task
//! plumbing goes through this module so cancellable work gets a uniform
//! abort handle and so the few places that need "is a runtime even here?"
//! checks have one answer.

use std::future::Future;
use std::time::{Duration, Instant};

/// Handle to a spawned background task that can be aborted.
pub struct AbortHandle {
    inner: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle").finish_non_exhaustive()
    }
}

impl AbortHandle {
    /// Abort the task. Returns true if it had not already finished.
    pub fn abort(&self) -> bool {
        let was_finished = self.inner.is_finished();
        self.inner.abort();
        !was_finished
    }
}

/// Spawn a background task on the current runtime.
pub(crate) fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

/// Spawn a background task and keep an abort handle to it.
pub(crate) fn spawn_with_abort<F>(future: F) -> AbortHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    AbortHandle {
        inner: tokio::spawn(future),
    }
}

/// Whether a tokio runtime is reachable from the calling thread.
///
/// Spawning without one panics, so anything that arms timers from possibly
/// non-runtime threads checks first and reports the failure instead.
pub(crate) fn runtime_available() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

pub(crate) async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
}

#[allow(dead_code)]
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}
