use crate::error::TryPushError;
use crate::ledger::WorkLedger;
use crate::task::Task;
use crate::task_queue::{QueueConsumer, QueueProducer};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the retry dispatcher did over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryStats {
  /// Tasks put back on the task queue.
  pub redelivered: usize,
  /// Tasks permanently dropped because the task queue had no room.
  pub dropped: Vec<Task>,
  /// Tasks taken off the retry queue but still waiting out their delay at shutdown.
  pub abandoned: Vec<Task>,
}

/// Moves failed tasks from the retry queue back onto the task queue.
///
/// Each task waits `delay` before redelivery. Redelivery never waits for
/// space: if the task queue is full the task is dropped and reported. There is
/// no bound on how often a task comes back.
pub(crate) struct RetryDispatcher {
  retries: QueueConsumer,
  tasks: QueueProducer,
  delay: Duration,
  ledger: Arc<WorkLedger>,
  shutdown_token: CancellationToken,
}

impl RetryDispatcher {
  pub(crate) fn new(
    retries: QueueConsumer,
    tasks: QueueProducer,
    delay: Duration,
    ledger: Arc<WorkLedger>,
    shutdown_token: CancellationToken,
  ) -> Self {
    Self {
      retries,
      tasks,
      delay,
      ledger,
      shutdown_token,
    }
  }

  pub(crate) async fn run(self) -> RetryStats {
    debug!(delay = ?self.delay, "Retry dispatcher started.");
    let mut stats = RetryStats::default();

    loop {
      let task = tokio::select! {
        biased;
        _ = self.shutdown_token.cancelled() => break,
        received = self.retries.pop() => match received {
          Ok(task) => task,
          Err(_) => {
            debug!("Retry queue closed. Retry dispatcher stopping.");
            break;
          }
        },
      };

      tokio::select! {
        biased;
        _ = self.shutdown_token.cancelled() => {
          stats.abandoned.push(task);
          break;
        }
        _ = tokio::time::sleep(self.delay) => {}
      }

      match self.tasks.try_push(task).await {
        Ok(()) => {
          stats.redelivered += 1;
          debug!(queued = self.tasks.len(), "Redelivered failed task to the task queue.");
        }
        Err(TryPushError::Full(task)) => {
          warn!(task = %task, "Task queue full, dropping task.");
          self.ledger.settle_one();
          stats.dropped.push(task);
        }
        Err(TryPushError::Closed(task)) => {
          warn!(task = %task, "Task queue closed, dropping task.");
          self.ledger.settle_one();
          stats.dropped.push(task);
        }
      }
    }

    info!(
      redelivered = stats.redelivered,
      dropped = stats.dropped.len(),
      abandoned = stats.abandoned.len(),
      "Retry dispatcher stopped."
    );
    stats
  }
}
