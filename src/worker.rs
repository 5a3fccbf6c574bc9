use crate::error::ProcessError;
use crate::ledger::WorkLedger;
use crate::resource_pool::ResourcePool;
use crate::task::{Processor, Task};
use crate::task_queue::{QueueConsumer, QueueProducer};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
  /// Every task was processed or dropped; nothing left to wait for.
  Drained,
  /// A task failed and no replacement resource could be acquired.
  ResourceExhausted,
  /// The run was shut down.
  Shutdown,
  /// The worker itself crashed.
  Errored(String),
}

/// What a single worker did over its lifetime.
#[derive(Debug, Clone)]
pub struct WorkerReport {
  pub worker_id: usize,
  pub outcome: WorkerOutcome,
  pub processed: usize,
  pub failed: usize,
  /// Every resource the worker was bound to, in order.
  pub resources: Vec<String>,
}

/// Shared handles every worker of a run needs.
#[derive(Clone)]
pub(crate) struct WorkerContext {
  pub(crate) pool: Arc<ResourcePool>,
  pub(crate) tasks: QueueConsumer,
  pub(crate) retries: QueueProducer,
  pub(crate) processor: Arc<dyn Processor>,
  pub(crate) ledger: Arc<WorkLedger>,
  pub(crate) bindings: Arc<DashMap<usize, String>>,
  pub(crate) rate_limit_cooldown: Duration,
  pub(crate) shutdown_token: CancellationToken,
}

pub(crate) struct Worker {
  id: usize,
  resource: String,
  holding: bool,
  processed: usize,
  failed: usize,
  resources: Vec<String>,
  ctx: WorkerContext,
}

impl Worker {
  pub(crate) fn new(id: usize, resource: String, ctx: WorkerContext) -> Self {
    Self {
      id,
      resources: vec![resource.clone()],
      resource,
      holding: true,
      processed: 0,
      failed: 0,
      ctx,
    }
  }

  pub(crate) async fn run(mut self) -> WorkerReport {
    self.ctx.bindings.insert(self.id, self.resource.clone());
    debug!(worker_id = self.id, resource = %self.resource, "Worker started.");

    let outcome = loop {
      let task = tokio::select! {
        biased;
        _ = self.ctx.shutdown_token.cancelled() => break WorkerOutcome::Shutdown,
        _ = self.ctx.ledger.settled_token().cancelled() => break WorkerOutcome::Drained,
        received = self.ctx.tasks.pop() => match received {
          Ok(task) => task,
          Err(_) => break WorkerOutcome::Drained,
        },
      };

      let error = match self.process(&task).await {
        Ok(()) => {
          self.processed += 1;
          self.ctx.ledger.settle_one();
          continue;
        }
        Err(error) => error,
      };

      self.failed += 1;
      error!(worker_id = self.id, resource = %self.resource, %task, %error, "Failed processing task.");
      self.give_up_resource(&error);

      if let Err(push_error) = self.ctx.retries.push(task, &self.ctx.shutdown_token).await {
        warn!(worker_id = self.id, %push_error, "Could not move failed task to the retry queue.");
        break WorkerOutcome::Shutdown;
      }

      let replacement = tokio::select! {
        biased;
        _ = self.ctx.shutdown_token.cancelled() => break WorkerOutcome::Shutdown,
        acquired = self.ctx.pool.acquire() => acquired,
      };
      match replacement {
        Some(resource) => {
          info!(worker_id = self.id, old = %self.resource, new = %resource, "Switched to replacement resource.");
          self.bind(resource);
        }
        None => {
          error!(worker_id = self.id, "No more resources left to switch, stopping worker.");
          break WorkerOutcome::ResourceExhausted;
        }
      }
    };

    if self.holding {
      self.ctx.pool.release(&self.resource);
    }
    self.ctx.bindings.remove(&self.id);
    debug!(worker_id = self.id, ?outcome, processed = self.processed, failed = self.failed, "Worker stopped.");

    WorkerReport {
      worker_id: self.id,
      outcome,
      processed: self.processed,
      failed: self.failed,
      resources: self.resources,
    }
  }

  async fn process(&self, task: &Task) -> Result<(), ProcessError> {
    info!(worker_id = self.id, resource = %self.resource, %task, "Processing task.");
    let future = self.ctx.processor.process(task, &self.resource);
    match AssertUnwindSafe(future).catch_unwind().await {
      Ok(result) => result,
      Err(_panic_payload) => {
        error!(worker_id = self.id, resource = %self.resource, %task, "Processor panicked.");
        Err(ProcessError::failed("processor panicked"))
      }
    }
  }

  /// Hands the current resource back according to how processing failed.
  fn give_up_resource(&mut self, error: &ProcessError) {
    match error {
      ProcessError::RateLimited { retry_after } => {
        let delay = retry_after.unwrap_or(self.ctx.rate_limit_cooldown);
        self.ctx.pool.release_after_delay(&self.resource, delay);
      }
      ProcessError::Failed(_) => {
        self.ctx.pool.remove(&self.resource);
      }
    }
    self.holding = false;
    self.ctx.bindings.remove(&self.id);
  }

  fn bind(&mut self, resource: String) {
    self.ctx.bindings.insert(self.id, resource.clone());
    self.resources.push(resource.clone());
    self.resource = resource;
    self.holding = true;
  }
}
