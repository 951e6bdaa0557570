//! Wait object: a one-shot resettable event with a deadline
//!
//! Readers park on it until data arrives or the deadline fires. Touching
//! stores a generation value and wakes at most one waiter; deadlines are
//! absolute instants, and an unset deadline means "never".

use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    generation: u64,
    deadline: Option<Instant>,
}

pub(crate) struct WaitObject {
    state: Mutex<State>,
    notify: Notify,
}

impl WaitObject {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Record an event and wake at most one waiter. The permit is retained
    /// if nobody is parked yet, so a touch racing a waiter is never lost.
    pub fn touch(&self) {
        self.state.lock().generation += 1;
        self.notify.notify_one();
    }

    /// Replace the deadline. Parked waiters are woken so they can re-read
    /// it; a deadline already in the past makes them report a timeout.
    pub fn set_wait_deadline(&self, deadline: Option<Instant>) {
        self.state.lock().deadline = deadline;
        self.notify.notify_waiters();
    }

    /// Whether the deadline has passed.
    pub fn is_timedout(&self) -> bool {
        self.state
            .lock()
            .deadline
            .is_some_and(|d| d <= Instant::now())
    }

    /// Park until touched or until the deadline fires.
    ///
    /// Returns the generation observed and `true`, or the entry generation
    /// and `false` if the deadline fired first. Wakes may be spurious (a
    /// deadline being replaced wakes waiters so they pick it up); callers
    /// re-check their own state and park again.
    pub async fn wait(&self) -> (u64, bool) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register as a waiter before reading state, so a deadline change
        // between the two cannot slip by unseen.
        notified.as_mut().enable();

        let deadline = self.state.lock().deadline;
        match deadline {
            Some(d) => {
                if d <= Instant::now() {
                    return (self.state.lock().generation, false);
                }
                if tokio::time::timeout_at(d.into(), notified).await.is_err() {
                    return (self.state.lock().generation, false);
                }
            }
            None => notified.await,
        }

        // Woken. A deadline forced into the past (how close() evicts
        // readers) reports as a timeout; everything else as a wake.
        let s = self.state.lock();
        match s.deadline {
            Some(d) if d <= Instant::now() => (s.generation, false),
            _ => (s.generation, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_touch_wakes_waiter() {
        let w = Arc::new(WaitObject::new());
        let waiter = {
            let w = w.clone();
            tokio::spawn(async move { w.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        w.touch();
        let (_, ontime) = waiter.await.unwrap();
        assert!(ontime);
    }

    #[tokio::test]
    async fn test_touch_before_wait_is_not_lost() {
        let w = WaitObject::new();
        w.touch();
        let (generation, ontime) = w.wait().await;
        assert!(ontime);
        assert_eq!(generation, 1);
    }

    #[tokio::test]
    async fn test_deadline_fires() {
        let w = WaitObject::new();
        w.set_wait_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let start = Instant::now();
        let (_, ontime) = w.wait().await;
        assert!(!ontime);
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert!(w.is_timedout());
    }

    #[tokio::test]
    async fn test_deadline_change_wakes_parked_waiter() {
        let w = Arc::new(WaitObject::new());
        let waiter = {
            let w = w.clone();
            tokio::spawn(async move { w.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Forcing the deadline into the past is how close() evicts readers.
        w.set_wait_deadline(Some(Instant::now()));
        let (_, ontime) = waiter.await.unwrap();
        assert!(!ontime);
    }

    #[tokio::test]
    async fn test_no_deadline_means_never() {
        let w = WaitObject::new();
        assert!(!w.is_timedout());
        let timed = tokio::time::timeout(Duration::from_millis(50), w.wait()).await;
        assert!(timed.is_err());
    }
}
