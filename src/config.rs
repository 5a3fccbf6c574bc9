use std::io::{self, BufRead, Write};
use std::time::Duration;

use tracing::error;

/// Worker count used when the requested value is missing or unusable.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Settings for one [`WorkerSupervisor`](crate::WorkerSupervisor) run.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
  /// Requested concurrency. The run never uses more workers than the pool has resources.
  pub worker_count: usize,
  /// How long a failed task waits before redelivery.
  pub retry_delay: Duration,
  /// Cooldown for a rate-limited resource when the processor gives none.
  pub rate_limit_cooldown: Duration,
  /// Task queue capacity. Defaults to the batch size.
  pub task_queue_capacity: Option<usize>,
  /// Retry queue capacity. Defaults to the batch size.
  pub retry_queue_capacity: Option<usize>,
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      worker_count: DEFAULT_WORKER_COUNT,
      retry_delay: Duration::from_secs(2),
      rate_limit_cooldown: Duration::from_secs(60),
      task_queue_capacity: None,
      retry_queue_capacity: None,
    }
  }
}

impl DispatchConfig {
  pub fn with_worker_count(mut self, worker_count: usize) -> Self {
    self.worker_count = worker_count;
    self
  }

  pub fn with_retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
    self.rate_limit_cooldown = cooldown;
    self
  }

  pub fn with_task_queue_capacity(mut self, capacity: usize) -> Self {
    self.task_queue_capacity = Some(capacity);
    self
  }

  pub fn with_retry_queue_capacity(mut self, capacity: usize) -> Self {
    self.retry_queue_capacity = Some(capacity);
    self
  }
}

/// Parses a worker count. Anything that is not a positive integer becomes
/// [`DEFAULT_WORKER_COUNT`].
pub fn parse_worker_count(input: &str) -> usize {
  match input.trim().parse::<usize>() {
    Ok(count) if count > 0 => count,
    _ => {
      error!(input = %input.trim(), "Invalid number, defaulting to {} workers.", DEFAULT_WORKER_COUNT);
      DEFAULT_WORKER_COUNT
    }
  }
}

/// Asks for the worker count on `writer` and reads one line from `reader`.
pub fn prompt_worker_count<R: BufRead, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<usize> {
  write!(writer, "Enter max number of workers: ")?;
  writer.flush()?;

  let mut line = String::new();
  reader.read_line(&mut line)?;
  Ok(parse_worker_count(&line))
}
