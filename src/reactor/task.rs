// src/reactor/task.rs - Deferred tasks and their completion handles
//
// A task is a closure plus a single-shot completion channel. The loop (or
// the posting thread itself, when it already is the loop thread) runs the
// closure and resolves the completion afterwards. Panics are caught at the
// task boundary so one bad closure cannot take the loop down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, Result};

pub(crate) struct Task {
    func: Box<dyn FnOnce(u64) + Send>,
    done: Sender<Result<()>>,
}

impl Task {
    /// Build a task and the handle its poster can wait on.
    pub fn new<F>(func: F) -> (Self, TaskHandle)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let (done, rx) = bounded(1);
        (
            Task {
                func: Box::new(func),
                done,
            },
            TaskHandle { rx },
        )
    }

    /// Run the closure with the loop's current time and resolve the
    /// completion. A send failure just means nobody kept the handle.
    pub fn run(self, now_ms: u64) {
        let func = self.func;
        let outcome = catch_unwind(AssertUnwindSafe(move || func(now_ms)))
            .map_err(|_| Error::TaskPanicked);
        let _ = self.done.send(outcome);
    }
}

/// Single-shot wait handle returned by [`EventLoop::post`].
///
/// [`EventLoop::post`]: crate::EventLoop::post
pub struct TaskHandle {
    rx: Receiver<Result<()>>,
}

impl TaskHandle {
    /// Block until the task has run on the loop thread.
    ///
    /// Returns [`Error::TaskPanicked`] if the closure panicked and
    /// [`Error::TaskAbandoned`] if the loop stopped without draining it.
    pub fn wait(self) -> Result<()> {
        self.rx.recv().unwrap_or(Err(Error::TaskAbandoned))
    }

    /// Like [`wait`](Self::wait) with an upper bound on the blocking time.
    pub fn wait_timeout(self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(Error::TaskWaitTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::TaskAbandoned),
        }
    }

    /// Non-blocking check; true once the completion has been resolved.
    pub fn is_done(&self) -> bool {
        !self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_run_resolves_completion() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let (task, handle) = Task::new(move |now| seen2.store(now, Ordering::Relaxed));

        task.run(1234);
        assert_eq!(seen.load(Ordering::Relaxed), 1234);
        assert!(handle.wait().is_ok());
    }

    #[test]
    fn test_panic_is_contained() {
        let (task, handle) = Task::new(|_| panic!("boom"));
        task.run(0);
        assert!(matches!(handle.wait(), Err(Error::TaskPanicked)));
    }

    #[test]
    fn test_dropped_task_abandons_handle() {
        let (task, handle) = Task::new(|_| {});
        drop(task);
        assert!(matches!(handle.wait(), Err(Error::TaskAbandoned)));
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let (_task, handle) = Task::new(|_| {});
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(10)),
            Err(Error::TaskWaitTimeout)
        ));
    }
}
