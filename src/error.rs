// src/error.rs - Crate-wide error type
//
// All fallible public operations return `crate::error::Result`. Transient
// I/O conditions (EAGAIN, short reads, backpressure drops) are handled
// inside the loop and never surface here.

use thiserror::Error;

/// Errors surfaced by the event loop and its handles.
#[derive(Error, Debug)]
pub enum Error {
    /// `start*` was called while the loop was already running.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// A posted task closure panicked; the loop itself keeps running.
    #[error("task closure panicked")]
    TaskPanicked,

    /// The loop was stopped before the task was drained.
    #[error("task abandoned before completion")]
    TaskAbandoned,

    /// Waiting on a task completion timed out.
    #[error("timed out waiting for task completion")]
    TaskWaitTimeout,

    /// Updating the loop thread's CPU affinity failed.
    #[error("failed to set thread affinity: {0}")]
    Affinity(std::io::Error),

    /// Wakeup-channel creation, socket setup, or thread spawn failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
