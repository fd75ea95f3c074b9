//! Clock abstraction
//!
//! Automations schedule their timers through a `Clock` so tests can
//! drive time deterministically: production uses the wall clock and
//! tokio timers, tests inject a `MockClock` whose `advance` fires every
//! due callback before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

/// Callback fired when a timer elapses
pub type TimerCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

/// Time source plus one-shot timer scheduling
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Schedule `callback` to run once after `delay`
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

/// Handle to a scheduled timer; cancellation is best-effort
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        // A dropped handle does not cancel its timer; the owner must
        // call cancel explicitly. Detach the task.
        self.task.take();
    }
}

/// Wall-clock implementation backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                callback().await;
            }
        });

        TimerHandle {
            cancelled,
            task: Some(task),
        }
    }
}

struct MockTimer {
    deadline: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

struct MockClockInner {
    now: DateTime<Utc>,
    timers: Vec<MockTimer>,
}

/// Controllable clock for tests
///
/// `advance` moves time forward and awaits every non-cancelled callback
/// whose deadline has passed, in deadline order, before returning.
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<Mutex<MockClockInner>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClockInner {
                now: Utc::now(),
                timers: Vec::new(),
            })),
        }
    }

    pub async fn advance(&self, delta: Duration) {
        let target = {
            let inner = self.inner.lock().unwrap();
            inner.now + to_chrono(delta)
        };

        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();
                inner.timers.retain(|t| !t.cancelled.load(Ordering::SeqCst));

                let next = inner
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| t.deadline)
                    .map(|(i, _)| i);

                match next {
                    Some(i) => {
                        let timer = inner.timers.remove(i);
                        inner.now = inner.now.max(timer.deadline);
                        Some(timer)
                    }
                    None => {
                        inner.now = target;
                        None
                    }
                }
            };

            match due {
                Some(timer) => (timer.callback)().await,
                None => return,
            }
        }
    }

    #[cfg(test)]
    fn pending_timers(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().now
    }

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock().unwrap();
        let deadline = inner.now + to_chrono(delay);
        inner.timers.push(MockTimer {
            deadline,
            cancelled: cancelled.clone(),
            callback,
        });

        TimerHandle {
            cancelled,
            task: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn advance_fires_due_timers() {
        let clock = MockClock::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let _timer = clock.after(Duration::from_secs(1), counting_callback(&fired));

        clock.advance(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_timers_do_not_fire() {
        let clock = MockClock::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = clock.after(Duration::from_secs(1), counting_callback(&fired));
        timer.cancel();

        clock.advance(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test]
    async fn timers_fire_in_deadline_order() {
        let clock = MockClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, secs) in [("slow", 3u64), ("fast", 1), ("medium", 2)] {
            let order = order.clone();
            let _ = clock.after(
                Duration::from_secs(secs),
                Box::new(move || {
                    Box::pin(async move {
                        order.lock().unwrap().push(label);
                    })
                }),
            );
        }

        clock.advance(Duration::from_secs(5)).await;
        assert_eq!(*order.lock().unwrap(), vec!["fast", "medium", "slow"]);
    }

    #[tokio::test]
    async fn now_tracks_advances() {
        let clock = MockClock::new();
        let before = clock.now();

        clock.advance(Duration::from_secs(90)).await;
        assert_eq!((clock.now() - before).num_seconds(), 90);
    }

    #[tokio::test]
    async fn system_clock_fires() {
        let clock = SystemClock;
        let fired = Arc::new(AtomicUsize::new(0));

        let _timer = clock.after(Duration::from_millis(10), counting_callback(&fired));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
