use crate::error::ProcessError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// One unit of work. The payload is opaque to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
  data: String,
}

impl Task {
  pub fn new(data: impl Into<String>) -> Self {
    Self { data: data.into() }
  }

  pub fn data(&self) -> &str {
    &self.data
  }

  pub fn into_inner(self) -> String {
    self.data
  }
}

impl fmt::Display for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.data)
  }
}

impl From<String> for Task {
  fn from(data: String) -> Self {
    Self { data }
  }
}

impl From<&str> for Task {
  fn from(data: &str) -> Self {
    Self::new(data)
  }
}

/// The future a [`Processor`] returns for a single task.
/// It must be `Send` and `'static` so workers can drive it on any runtime thread.
pub type ProcessFuture = Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send + 'static>>;

/// Performs the actual work for a task using the resource a worker holds.
///
/// The dispatcher treats the call as opaque: it applies no timeout and never
/// retries on its own, beyond moving a failed task to the retry queue.
/// A processor that panics is treated like one returning [`ProcessError::Failed`].
pub trait Processor: Send + Sync + 'static {
  fn process(&self, task: &Task, resource: &str) -> ProcessFuture;
}

impl<F, Fut> Processor for F
where
  F: Fn(Task, String) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
{
  fn process(&self, task: &Task, resource: &str) -> ProcessFuture {
    Box::pin(self(task.clone(), resource.to_string()))
  }
}
