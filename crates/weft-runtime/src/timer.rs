//! Timer manager
//!
//! Millisecond one-shot and recurring timers on a monotonic clock, kept in
//! an ordered map so the earliest deadline is O(log n) to find. Expiry is
//! driven externally: the owner calls `next_timeout` to bound its wait and
//! `collect_expired` afterwards to harvest callbacks, which it runs on its
//! own scheduler. The manager itself never executes callbacks.
//!
//! Recurring timers re-arm from the old deadline, not from "now", so their
//! long-run rate does not drift with collection latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Shared, immutable timer callback. Cloned once per firing.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// If the clock appears to have moved backwards by more than this, assume
/// rollover and flush every pending timer.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Monotonic milliseconds since an arbitrary epoch.
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Opaque handle for cancelling or rescheduling a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct TimerEntry {
    period_ms: u64,
    recurring: bool,
    cb: TimerCallback,
}

#[derive(Default)]
struct TimerInner {
    /// Keyed by (deadline, id); the id tiebreaks equal deadlines.
    timers: BTreeMap<(u64, u64), TimerEntry>,
    /// id -> current deadline, for O(log n) cancel/reschedule by handle.
    deadlines: HashMap<u64, u64>,
    /// Last observed clock, for rollover detection.
    previous_now: u64,
    /// Set when a front insertion has been signalled but not yet consumed
    /// by `next_timeout`; suppresses duplicate wakeups.
    front_signalled: bool,
}

pub struct TimerManager {
    inner: RwLock<TimerInner>,
    /// Invoked (outside the lock) when a new earliest deadline appears, so
    /// a sleeping owner can shorten its wait.
    front_waker: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
    next_id: AtomicU64,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            inner: RwLock::new(TimerInner {
                previous_now: now_ms(),
                ..TimerInner::default()
            }),
            front_waker: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Install the hook run when a newly added timer becomes the earliest.
    pub fn set_front_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self
            .front_waker
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(waker));
    }

    /// Arm a timer `delay_ms` from now. Recurring timers fire every
    /// `delay_ms` until cancelled.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> TimerHandle {
        self.add_timer_arc(delay_ms, Arc::new(cb), recurring)
    }

    /// Like `add_timer`, but the callback only runs while `cond` is still
    /// upgradable; once the tracked value is dropped, firings are no-ops.
    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> TimerHandle {
        let wrapped: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer_arc(delay_ms, wrapped, recurring)
    }

    fn add_timer_arc(&self, delay_ms: u64, cb: TimerCallback, recurring: bool) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = now_ms().saturating_add(delay_ms);
        let at_front = self.insert(
            id,
            deadline,
            TimerEntry {
                period_ms: delay_ms,
                recurring,
                cb,
            },
        );
        if at_front {
            self.wake_front();
        }
        TimerHandle(id)
    }

    /// Insert and report whether this entry became the new earliest (and
    /// the owner has not already been signalled).
    fn insert(&self, id: u64, deadline: u64, entry: TimerEntry) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.timers.insert((deadline, id), entry);
        inner.deadlines.insert(id, deadline);
        let at_front =
            inner.timers.keys().next() == Some(&(deadline, id)) && !inner.front_signalled;
        if at_front {
            inner.front_signalled = true;
        }
        at_front
    }

    fn wake_front(&self) {
        let waker = self.front_waker.read().unwrap_or_else(|e| e.into_inner());
        if let Some(w) = waker.as_ref() {
            w();
        }
    }

    /// Cancel a timer. Returns false if it already fired (non-recurring)
    /// or was already cancelled. Idempotent.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.deadlines.remove(&handle.0) {
            Some(deadline) => inner.timers.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    /// Push a live timer's deadline out to now + its period. Returns false
    /// if the timer is gone.
    pub fn refresh(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(&deadline) = inner.deadlines.get(&handle.0) else {
            return false;
        };
        let Some(entry) = inner.timers.remove(&(deadline, handle.0)) else {
            return false;
        };
        let new_deadline = now_ms().saturating_add(entry.period_ms);
        inner.deadlines.insert(handle.0, new_deadline);
        inner.timers.insert((new_deadline, handle.0), entry);
        // Deadline only moves later, so no front wakeup is needed.
        true
    }

    /// Change a timer's period and re-arm it, from now (`from_now`) or
    /// from its original start point. Returns false if the timer is gone.
    pub fn reset(&self, handle: TimerHandle, period_ms: u64, from_now: bool) -> bool {
        let at_front;
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let Some(&deadline) = inner.deadlines.get(&handle.0) else {
                return false;
            };
            if period_ms == inner.timers[&(deadline, handle.0)].period_ms && !from_now {
                return true;
            }
            let Some(mut entry) = inner.timers.remove(&(deadline, handle.0)) else {
                return false;
            };
            let start = if from_now {
                now_ms()
            } else {
                deadline.saturating_sub(entry.period_ms)
            };
            entry.period_ms = period_ms;
            let new_deadline = start.saturating_add(period_ms);
            inner.deadlines.insert(handle.0, new_deadline);
            inner.timers.insert((new_deadline, handle.0), entry);
            at_front = inner.timers.keys().next() == Some(&(new_deadline, handle.0))
                && !inner.front_signalled;
            if at_front {
                inner.front_signalled = true;
            }
        }
        if at_front {
            self.wake_front();
        }
        true
    }

    /// Milliseconds until the earliest deadline: `None` when no timers are
    /// armed, `Some(0)` when one is already overdue.
    ///
    /// Also re-arms the front-waker edge, so the next earlier insertion
    /// signals again.
    pub fn next_timeout(&self) -> Option<u64> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.front_signalled = false;
        let (&(deadline, _), _) = inner.timers.iter().next()?;
        Some(deadline.saturating_sub(now_ms()))
    }

    pub fn has_timers(&self) -> bool {
        !self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .timers
            .is_empty()
    }

    /// Harvest the callbacks of every expired timer into `out`, in
    /// deadline order. Recurring timers are re-armed at old deadline plus
    /// period. Never yields a timer whose deadline is in the future,
    /// except after clock rollover, when everything is flushed.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let rollover =
            now < inner.previous_now && inner.previous_now - now > ROLLOVER_THRESHOLD_MS;
        inner.previous_now = now;

        if inner.timers.is_empty() {
            return;
        }
        if !rollover {
            if let Some((&(deadline, _), _)) = inner.timers.iter().next() {
                if deadline > now {
                    return;
                }
            }
        }

        let split_key = if rollover {
            (u64::MAX, u64::MAX)
        } else {
            (now + 1, 0)
        };
        let remaining = inner.timers.split_off(&split_key);
        let expired = std::mem::replace(&mut inner.timers, remaining);

        for ((deadline, id), entry) in expired {
            inner.deadlines.remove(&id);
            out.push(entry.cb.clone());
            if entry.recurring {
                let next = deadline.saturating_add(entry.period_ms);
                inner.deadlines.insert(id, next);
                inner.timers.insert((next, id), entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn drain(mgr: &TimerManager) -> usize {
        let mut cbs = Vec::new();
        mgr.collect_expired(&mut cbs);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn test_overdue_timer_fires() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.add_timer(0, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, false);
        assert_eq!(mgr.next_timeout(), Some(0));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timers());
        assert_eq!(mgr.next_timeout(), None);
    }

    #[test]
    fn test_future_timer_does_not_fire() {
        let mgr = TimerManager::new();
        mgr.add_timer(60_000, || {}, false);
        assert_eq!(drain(&mgr), 0);
        assert!(mgr.has_timers());
        let t = mgr.next_timeout().unwrap();
        assert!(t > 0 && t <= 60_000);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mgr = TimerManager::new();
        let handle = mgr.add_timer(60_000, || {}, false);
        assert!(mgr.cancel(handle));
        assert!(!mgr.cancel(handle));
        assert_eq!(drain(&mgr), 0);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in 0..3 {
            let o = order.clone();
            mgr.add_timer(0, move || {
                o.lock().unwrap().push(tag);
            }, false);
        }
        assert_eq!(drain(&mgr), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_recurring_rearms_from_old_deadline() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.add_timer(10, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, true);
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert_eq!(drain(&mgr), 1);
        // Re-armed at old deadline + 10, i.e. ~5ms out, not ~10ms.
        assert!(mgr.has_timers());
        let t = mgr.next_timeout().unwrap();
        assert!(t <= 10, "next timeout {} should not drift", t);
    }

    #[test]
    fn test_conditional_timer_skips_dead_token() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let live = Arc::new(());
        let h = hits.clone();
        mgr.add_conditional_timer(0, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, Arc::downgrade(&live), false);

        let dead = Arc::new(());
        let weak_dead = Arc::downgrade(&dead);
        drop(dead);
        let h = hits.clone();
        mgr.add_conditional_timer(0, move || {
            h.fetch_add(10, Ordering::SeqCst);
        }, weak_dead, false);

        assert_eq!(drain(&mgr), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_front_waker_fires_on_earlier_insert() {
        let mgr = TimerManager::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = wakes.clone();
        mgr.set_front_waker(move || {
            w.fetch_add(1, Ordering::SeqCst);
        });

        mgr.add_timer(60_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        // Not the new front: no signal.
        mgr.add_timer(120_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        // New front, but the previous signal was never consumed.
        mgr.add_timer(30_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        // Consuming re-arms the edge.
        let _ = mgr.next_timeout();
        mgr.add_timer(10_000, || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let handle = mgr.add_timer(20, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(mgr.refresh(handle));
        let t = mgr.next_timeout().unwrap();
        assert!(t > 10, "refresh should restart the full period, got {}", t);
    }

    #[test]
    fn test_reset_changes_period() {
        let mgr = TimerManager::new();
        let handle = mgr.add_timer(60_000, || {}, false);
        assert!(mgr.reset(handle, 0, true));
        assert_eq!(mgr.next_timeout(), Some(0));
        assert_eq!(drain(&mgr), 1);
        assert!(!mgr.reset(handle, 5, true));
    }
}
