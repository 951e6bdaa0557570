//! Scheduled callbacks
//!
//! A cancellable timer that invokes a closure once after a delay, and can be
//! rescheduled in place: rescheduling cancels the pending callback and arms
//! a new one atomically. Callbacks run on the runtime and may reschedule
//! their own key for a follow-up tick.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub(crate) struct SchedKey {
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl SchedKey {
    /// An unarmed key.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    /// Arm a key with a callback firing after `delay`.
    pub fn schedule(f: impl FnOnce() + Send + 'static, delay: Duration) -> Self {
        let key = Self::new();
        key.reschedule(f, delay);
        key
    }

    /// Replace the pending callback: the old one is cancelled, the new one
    /// fires after `delay`.
    pub fn reschedule(&self, f: impl FnOnce() + Send + 'static, delay: Duration) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        if let Some(old) = self.pending.lock().replace(handle) {
            old.abort();
        }
    }

    /// Drop the pending callback, if any. Idempotent.
    pub fn cancel(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SchedKey {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _key = SchedKey::schedule(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let key = SchedKey::schedule(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(30),
        );
        key.cancel();
        key.cancel(); // idempotent
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_pending() {
        let hits = Arc::new(AtomicUsize::new(0));
        let key = SchedKey::new();
        for _ in 0..5 {
            let h = hits.clone();
            key.reschedule(
                move || {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(30),
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Only the last scheduling survives.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_may_rearm_its_key() {
        let hits = Arc::new(AtomicUsize::new(0));
        let key = Arc::new(SchedKey::new());
        let h = hits.clone();
        let k = key.clone();
        key.reschedule(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
                let h2 = h.clone();
                k.reschedule(
                    move || {
                        h2.fetch_add(1, Ordering::SeqCst);
                    },
                    Duration::from_millis(10),
                );
            },
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
