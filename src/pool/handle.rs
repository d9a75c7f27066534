//! Result handles for submitted tasks
//!
//! A [`TaskHandle`] is the receiving half of a oneshot channel that the
//! worker completes once the task has run. It can be consumed exactly once,
//! either by blocking with [`TaskHandle::wait`] or by awaiting it.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Why a task did not produce a value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The task returned an error
    #[error("task failed: {0}")]
    Failed(String),

    /// The task panicked; the worker caught it and kept running
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was dropped without reporting a result
    #[error("task abandoned before completion")]
    Abandoned,
}

/// What a task handle resolves to
pub type TaskOutcome<T> = std::result::Result<T, TaskFailure>;

/// Handle to the eventual result of a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: u64,
    receiver: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: u64, receiver: oneshot::Receiver<TaskOutcome<T>>) -> Self {
        Self { id, receiver }
    }

    /// Submission sequence number of the task
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the current thread until the task has finished
    ///
    /// Must not be called from inside an async runtime; await the handle
    /// there instead.
    pub fn wait(self) -> TaskOutcome<T> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(TaskFailure::Abandoned))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = TaskOutcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskFailure::Abandoned)))
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
