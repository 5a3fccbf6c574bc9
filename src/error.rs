use crate::task::Task;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while setting up or running a dispatch.
#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("Failed loading lines from {path:?}, does it exist? ({source})")]
  Load {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Queue '{0}' was closed, cannot accept more tasks")]
  QueueClosed(&'static str),

  #[error("Dispatcher is shutting down or already shut down")]
  ShuttingDown,
}

/// Failure reported by a [`Processor`](crate::Processor) for one task.
///
/// The variant also decides what happens to the resource the worker was using.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
  /// The resource was throttled. It is parked as rate-limited and comes back
  /// after `retry_after`, or the configured cooldown when `None`.
  #[error("Resource is rate limited")]
  RateLimited { retry_after: Option<Duration> },

  /// Processing failed; the resource is retired from the pool.
  #[error("Processing failed: {0}")]
  Failed(String),
}

impl ProcessError {
  pub fn failed(reason: impl Into<String>) -> Self {
    ProcessError::Failed(reason.into())
  }

  pub fn rate_limited() -> Self {
    ProcessError::RateLimited { retry_after: None }
  }
}

/// Returned by [`QueueProducer::try_push`](crate::QueueProducer::try_push).
/// The task is handed back so the caller decides whether it is lost.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TryPushError {
  #[error("Queue is full")]
  Full(Task),

  #[error("Queue is closed")]
  Closed(Task),
}

impl TryPushError {
  pub fn into_task(self) -> Task {
    match self {
      TryPushError::Full(task) | TryPushError::Closed(task) => task,
    }
  }
}
