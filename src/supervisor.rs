use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::ledger::WorkLedger;
use crate::resource_pool::ResourcePool;
use crate::retry::{RetryDispatcher, RetryStats};
use crate::task::{Processor, Task};
use crate::task_queue::{QueueProducer, TaskQueue};
use crate::worker::{Worker, WorkerContext, WorkerOutcome, WorkerReport};

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Outcome of one [`WorkerSupervisor::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
  pub total_tasks: usize,
  /// One entry per worker that was started, ordered by worker id.
  pub workers: Vec<WorkerReport>,
  pub retry: RetryStats,
  /// Tasks neither processed nor dropped when the run ended.
  pub unsettled: usize,
}

impl RunReport {
  pub fn processed(&self) -> usize {
    self.workers.iter().map(|w| w.processed).sum()
  }

  pub fn failures(&self) -> usize {
    self.workers.iter().map(|w| w.failed).sum()
  }

  /// `true` when every task was processed or dropped.
  pub fn is_drained(&self) -> bool {
    self.unsettled == 0
  }

  pub fn workers_with(&self, outcome: &WorkerOutcome) -> usize {
    self.workers.iter().filter(|w| &w.outcome == outcome).count()
  }
}

/// Runs a batch of tasks over workers that each hold one resource from a shared pool.
///
/// Worker count is the smaller of the configured concurrency and the pool
/// size; if the pool runs dry while starting workers, the run goes ahead with
/// fewer. A run ends when every worker has stopped, either because all work
/// settled or because it failed and found no replacement resource.
pub struct WorkerSupervisor {
  name: Arc<String>,
  config: DispatchConfig,
  pool: Arc<ResourcePool>,
  processor: Arc<dyn Processor>,
  tokio_handle: TokioHandle,
  bindings: Arc<DashMap<usize, String>>,
  shutdown_token: CancellationToken,
}

impl WorkerSupervisor {
  pub fn new(
    name: &str,
    pool: Arc<ResourcePool>,
    processor: impl Processor,
    config: DispatchConfig,
    tokio_handle: TokioHandle,
  ) -> Self {
    Self {
      name: Arc::new(name.to_string()),
      config,
      pool,
      processor: Arc::new(processor),
      tokio_handle,
      bindings: Arc::new(DashMap::new()),
      shutdown_token: CancellationToken::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn config(&self) -> &DispatchConfig {
    &self.config
  }

  pub fn pool(&self) -> &Arc<ResourcePool> {
    &self.pool
  }

  /// How many workers a run would start right now.
  pub fn worker_limit(&self) -> usize {
    self.config.worker_count.min(self.pool.len())
  }

  /// Which worker currently holds which resource, ordered by worker id.
  pub fn active_bindings(&self) -> Vec<(usize, String)> {
    let mut bindings: Vec<(usize, String)> = self
      .bindings
      .iter()
      .map(|entry| (*entry.key(), entry.value().clone()))
      .collect();
    bindings.sort();
    bindings
  }

  /// Stops the current run. Workers finish the task in hand, then stop.
  pub fn shutdown(&self) {
    if !self.shutdown_token.is_cancelled() {
      info!(name = %*self.name, "Shutdown requested.");
      self.shutdown_token.cancel();
    }
  }

  pub fn is_shut_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Processes `tasks` and waits until every worker has stopped.
  pub async fn run(&self, tasks: Vec<Task>) -> Result<RunReport, DispatchError> {
    if self.shutdown_token.is_cancelled() {
      warn!(name = %*self.name, "Run requested on a supervisor that is shut down.");
      return Err(DispatchError::ShuttingDown);
    }

    let total_tasks = tasks.len();
    if total_tasks == 0 {
      info!(name = %*self.name, "No tasks to process.");
      return Ok(RunReport {
        total_tasks,
        workers: Vec::new(),
        retry: RetryStats::default(),
        unsettled: 0,
      });
    }

    let run_token = self.shutdown_token.child_token();
    let ledger = Arc::new(WorkLedger::new(total_tasks));
    let task_capacity = self.config.task_queue_capacity.unwrap_or(total_tasks);
    let retry_capacity = self.config.retry_queue_capacity.unwrap_or(total_tasks);
    let (task_tx, task_rx) = TaskQueue::new("tasks", task_capacity).split();
    let (retry_tx, retry_rx) = TaskQueue::new("retries", retry_capacity).split();

    let task_closer = task_tx.clone();
    let retry_closer = retry_tx.clone();

    let feeder_handle = self.tokio_handle.spawn(
      Self::feed_tasks(task_tx.clone(), tasks, run_token.clone())
        .instrument(info_span!("task_feeder", name = %*self.name)),
    );

    let dispatcher = RetryDispatcher::new(retry_rx, task_tx, self.config.retry_delay, ledger.clone(), run_token.clone());
    let dispatcher_handle = self
      .tokio_handle
      .spawn(dispatcher.run().instrument(info_span!("retry_dispatcher", name = %*self.name)));

    let worker_limit = self.worker_limit();
    info!(name = %*self.name, worker_count = worker_limit, total_tasks, "Set config.");

    let ctx = WorkerContext {
      pool: self.pool.clone(),
      tasks: task_rx,
      retries: retry_tx,
      processor: self.processor.clone(),
      ledger: ledger.clone(),
      bindings: self.bindings.clone(),
      rate_limit_cooldown: self.config.rate_limit_cooldown,
      shutdown_token: run_token.clone(),
    };

    let mut worker_ids = Vec::with_capacity(worker_limit);
    let mut worker_handles = Vec::with_capacity(worker_limit);
    for worker_id in 0..worker_limit {
      let acquired = tokio::select! {
        biased;
        _ = run_token.cancelled() => None,
        acquired = self.pool.acquire() => acquired,
      };
      let Some(resource) = acquired else {
        warn!(name = %*self.name, started = worker_id, requested = worker_limit, "No resource for another worker, starting fewer workers.");
        break;
      };

      let worker = Worker::new(worker_id, resource, ctx.clone());
      worker_ids.push(worker_id);
      worker_handles.push(
        self
          .tokio_handle
          .spawn(worker.run().instrument(info_span!("worker", name = %*self.name, worker_id))),
      );
    }
    drop(ctx);

    if worker_handles.is_empty() {
      error!(name = %*self.name, "Could not start any worker, the resource pool is exhausted.");
    }

    let mut workers = Vec::with_capacity(worker_handles.len());
    for (worker_id, joined) in worker_ids.into_iter().zip(join_all(worker_handles).await) {
      match joined {
        Ok(report) => workers.push(report),
        Err(join_error) => {
          error!(name = %*self.name, worker_id, "Worker crashed: {:?}", join_error);
          self.bindings.remove(&worker_id);
          workers.push(WorkerReport {
            worker_id,
            outcome: WorkerOutcome::Errored(join_error.to_string()),
            processed: 0,
            failed: 0,
            resources: Vec::new(),
          });
        }
      }
    }

    // Every worker is gone; nothing will consume what the feeder or dispatcher produce.
    task_closer.close();
    retry_closer.close();
    run_token.cancel();
    if let Err(join_error) = feeder_handle.await {
      error!(name = %*self.name, "Error joining task feeder: {:?}", join_error);
    }
    let retry = match dispatcher_handle.await {
      Ok(stats) => stats,
      Err(join_error) => {
        error!(name = %*self.name, "Error joining retry dispatcher: {:?}", join_error);
        RetryStats::default()
      }
    };

    let report = RunReport {
      total_tasks,
      workers,
      retry,
      unsettled: ledger.outstanding(),
    };
    info!(
      name = %*self.name,
      processed = report.processed(),
      failures = report.failures(),
      dropped = report.retry.dropped.len(),
      unsettled = report.unsettled,
      "All tasks were processed or all workers were stopped."
    );
    Ok(report)
  }

  async fn feed_tasks(tasks_tx: QueueProducer, tasks: Vec<Task>, run_token: CancellationToken) {
    let total = tasks.len();
    for (queued, task) in tasks.into_iter().enumerate() {
      if let Err(push_error) = tasks_tx.push(task, &run_token).await {
        debug!(queued, total, %push_error, "Task feeder stopped early.");
        return;
      }
    }
    trace!(total, "All tasks queued.");
  }
}

impl Drop for WorkerSupervisor {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      trace!(name = %*self.name, "WorkerSupervisor dropped. Signalling any running workers to stop.");
      self.shutdown_token.cancel();
    }
  }
}
