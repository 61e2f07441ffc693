// src/reactor/timer.rs - Timer handles and the ordered timer index
//
// A timer is a shared entity: the caller holds one reference for the
// handle's lifetime, the loop holds one only while the timer sits in the
// index. next_ms == 0 encodes "not scheduled / currently firing"; a timer
// that reschedules itself from inside its own callback therefore suppresses
// the automatic repeat for that tick.
//
// All index mutation is funneled through posted tasks so only the loop
// thread ever touches the BTreeMap.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::reactor::event_loop::{EventLoop, LoopInner};

pub(crate) type TimerCallback = Box<dyn FnMut(u64) + Send>;

pub(crate) struct TimerInner {
    /// Index tie-break, assigned on each insertion.
    seq: AtomicU64,
    /// Scheduled fire time in ms since epoch; 0 = unscheduled/firing.
    next_ms: AtomicU64,
    /// 0 = one-shot.
    repeat_ms: AtomicU64,
    callback: Mutex<TimerCallback>,
    /// Non-owning back-reference; dead once the loop is gone.
    loop_ref: Weak<LoopInner>,
}

impl TimerInner {
    pub fn new(loop_ref: Weak<LoopInner>, repeat_ms: u64, callback: TimerCallback) -> Self {
        Self {
            seq: AtomicU64::new(0),
            next_ms: AtomicU64::new(0),
            repeat_ms: AtomicU64::new(repeat_ms),
            callback: Mutex::new(callback),
            loop_ref,
        }
    }

    pub fn next_ms(&self) -> u64 {
        self.next_ms.load(Ordering::Relaxed)
    }

    pub fn repeat_ms(&self) -> u64 {
        self.repeat_ms.load(Ordering::Relaxed)
    }

    /// Mark as firing/unscheduled before the callback runs.
    pub fn clear_next(&self) {
        self.next_ms.store(0, Ordering::Relaxed);
    }

    /// Invoke the callback on the loop thread.
    pub fn fire(&self, now_ms: u64) {
        let mut callback = self.callback.lock();
        (&mut *callback)(now_ms);
    }
}

/// Handle to a loop timer. Cloning shares the same underlying timer.
///
/// All methods are callable from any thread; scheduling mutations are
/// applied on the loop thread.
#[derive(Clone)]
pub struct Timer {
    pub(crate) inner: Arc<TimerInner>,
}

impl Timer {
    /// Stop the timer: clears the repeat period and removes any pending
    /// schedule. The handle stays usable with [`again`](Self::again).
    pub fn cancel(&self) {
        let Some(lp) = self.inner.loop_ref.upgrade() else {
            return;
        };
        let timer = self.inner.clone();
        let queue_owner = lp.clone();
        let _ = EventLoop::from_inner(lp).post(move |_| {
            timer.repeat_ms.store(0, Ordering::Relaxed);
            queue_owner.timers.lock().remove(&timer);
        });
    }

    /// Reschedule the next fire at `now + delay`, replacing any pending
    /// schedule. The repeat period, if any, resumes after that fire. Called
    /// from inside the timer's own callback this overrides the automatic
    /// repeat for the current tick.
    pub fn again(&self, delay: Duration) {
        let Some(lp) = self.inner.loop_ref.upgrade() else {
            return;
        };
        let event_loop = EventLoop::from_inner(lp.clone());
        let next_ms = event_loop.now() + delay.as_millis() as u64;
        let timer = self.inner.clone();
        let _ = event_loop.post(move |_| {
            let mut queue = lp.timers.lock();
            queue.remove(&timer);
            queue.insert(next_ms, &timer);
        });
    }

    /// True while the timer sits in the loop's index.
    pub fn is_scheduled(&self) -> bool {
        self.inner.next_ms() != 0
    }
}

/// Ordered timer index. Keyed by fire time with an insertion sequence as
/// tie-break so equal deadlines fire in insertion order.
pub(crate) struct TimerQueue {
    entries: BTreeMap<(u64, u64), Arc<TimerInner>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Schedule `timer` at `at_ms`. The timer must not already be indexed.
    pub fn insert(&mut self, at_ms: u64, timer: &Arc<TimerInner>) {
        debug_assert_eq!(timer.next_ms(), 0, "timer already scheduled");
        // 0 is the "unscheduled" sentinel, never a valid deadline.
        let at_ms = at_ms.max(1);
        self.next_seq += 1;
        timer.seq.store(self.next_seq, Ordering::Relaxed);
        timer.next_ms.store(at_ms, Ordering::Relaxed);
        self.entries.insert((at_ms, self.next_seq), timer.clone());
    }

    /// Remove `timer` from the index if scheduled. Leaves the repeat
    /// period untouched.
    pub fn remove(&mut self, timer: &Arc<TimerInner>) {
        let next_ms = timer.next_ms();
        if next_ms == 0 {
            return;
        }
        self.entries
            .remove(&(next_ms, timer.seq.load(Ordering::Relaxed)));
        timer.clear_next();
    }

    /// Earliest scheduled fire time, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|&(ms, _)| ms)
    }

    /// Pop every timer due at or before `now`, in deadline order. Popped
    /// timers leave the index with `next_ms` cleared.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<Arc<TimerInner>> {
        let mut due = Vec::new();
        while let Some((&(ms, seq), _)) = self.entries.iter().next() {
            if ms > now_ms {
                break;
            }
            if let Some(timer) = self.entries.remove(&(ms, seq)) {
                timer.clear_next();
                due.push(timer);
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(repeat_ms: u64) -> Arc<TimerInner> {
        Arc::new(TimerInner::new(Weak::new(), repeat_ms, Box::new(|_| {})))
    }

    #[test]
    fn test_insert_and_pop_in_order() {
        let mut queue = TimerQueue::new();
        let a = detached(0);
        let b = detached(0);
        let c = detached(0);

        queue.insert(300, &a);
        queue.insert(100, &b);
        queue.insert(200, &c);
        assert_eq!(queue.next_deadline(), Some(100));

        let due = queue.pop_due(250);
        assert_eq!(due.len(), 2);
        assert!(Arc::ptr_eq(&due[0], &b));
        assert!(Arc::ptr_eq(&due[1], &c));
        assert_eq!(queue.next_deadline(), Some(300));

        // Popped timers are unscheduled.
        assert_eq!(b.next_ms(), 0);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mut queue = TimerQueue::new();
        let a = detached(0);
        let b = detached(0);

        queue.insert(100, &a);
        queue.insert(100, &b);

        let due = queue.pop_due(100);
        assert_eq!(due.len(), 2);
        assert!(Arc::ptr_eq(&due[0], &a));
        assert!(Arc::ptr_eq(&due[1], &b));
    }

    #[test]
    fn test_remove_unschedules() {
        let mut queue = TimerQueue::new();
        let a = detached(500);

        queue.insert(100, &a);
        assert_eq!(queue.len(), 1);

        queue.remove(&a);
        assert_eq!(queue.len(), 0);
        assert_eq!(a.next_ms(), 0);
        // Repeat period survives a remove.
        assert_eq!(a.repeat_ms(), 500);

        // Removing an unscheduled timer is a no-op.
        queue.remove(&a);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_deadline_is_clamped() {
        let mut queue = TimerQueue::new();
        let a = detached(0);
        queue.insert(0, &a);
        // Never stored as the sentinel.
        assert_eq!(a.next_ms(), 1);
        assert_eq!(queue.pop_due(1).len(), 1);
    }
}
