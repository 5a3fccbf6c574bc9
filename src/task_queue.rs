use crate::error::{DispatchError, TryPushError};
use crate::task::Task;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

/// A task paired with the capacity permit it holds.
///
/// The permit is released when the message is dropped, which happens right
/// after a consumer has received it. A queue slot is therefore only freed once
/// the task has been fully dequeued.
struct QueueMessage {
  task: Task,
  _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for QueueMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueMessage")
      .field("task", &self.task.data())
      .finish_non_exhaustive()
  }
}

/// A bounded, multi-producer, multi-consumer FIFO of tasks.
///
/// Capacity is enforced by a semaphore gate on top of an unbounded
/// `fibre::mpsc` channel. Ordinary pushes wait for a free slot; [`QueueProducer::try_push`]
/// never waits and hands the task back instead.
pub struct TaskQueue {
  name: &'static str,
  capacity: usize,
  tx: AsyncSender<QueueMessage>,
  rx: AsyncReceiver<QueueMessage>,
  gate: Arc<Semaphore>,
}

impl TaskQueue {
  /// Creates a queue holding at most `capacity` tasks (at least one).
  pub fn new(name: &'static str, capacity: usize) -> Self {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::unbounded_async();
    Self {
      name,
      capacity,
      tx,
      rx,
      gate: Arc::new(Semaphore::new(capacity)),
    }
  }

  /// Splits the queue into its producer and consumer halves. Both can be cloned.
  pub fn split(self) -> (QueueProducer, QueueConsumer) {
    (
      QueueProducer {
        name: self.name,
        capacity: self.capacity,
        tx: self.tx,
        gate: self.gate,
      },
      QueueConsumer {
        name: self.name,
        rx: Arc::new(AsyncMutex::new(self.rx)),
      },
    )
  }
}

/// The producer half of a [`TaskQueue`].
#[derive(Clone)]
pub struct QueueProducer {
  name: &'static str,
  capacity: usize,
  tx: AsyncSender<QueueMessage>,
  gate: Arc<Semaphore>,
}

/// The consumer half of a [`TaskQueue`]. Clones share one receiver, so each
/// task is delivered to exactly one consumer.
#[derive(Clone)]
pub struct QueueConsumer {
  name: &'static str,
  rx: Arc<AsyncMutex<AsyncReceiver<QueueMessage>>>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("name", &self.name)
      .field("len", &self.len())
      .field("capacity", &self.capacity)
      .field("free_slots", &self.free_slots())
      .finish_non_exhaustive()
  }
}

impl fmt::Debug for QueueConsumer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer").field("name", &self.name).finish_non_exhaustive()
  }
}

impl QueueProducer {
  /// Pushes a task, waiting for a free slot while the queue is full.
  ///
  /// Gives up with [`DispatchError::ShuttingDown`] if `shutdown_token` fires
  /// while waiting.
  pub async fn push(&self, task: Task, shutdown_token: &CancellationToken) -> Result<(), DispatchError> {
    if shutdown_token.is_cancelled() {
      return Err(DispatchError::ShuttingDown);
    }
    if self.tx.is_closed() {
      return Err(DispatchError::QueueClosed(self.name));
    }

    let permit = tokio::select! {
      biased;
      _ = shutdown_token.cancelled() => return Err(DispatchError::ShuttingDown),
      acquired = self.gate.clone().acquire_owned() => {
        acquired.map_err(|_| DispatchError::QueueClosed(self.name))?
      }
    };

    // The permit travels with the message; if the send fails it is dropped
    // together with the message and the slot is freed.
    let message = QueueMessage { task, _permit: permit };
    self
      .tx
      .send(message)
      .await
      .map_err(|_| DispatchError::QueueClosed(self.name))
  }

  /// Pushes a task only if a slot is free right now.
  pub async fn try_push(&self, task: Task) -> Result<(), TryPushError> {
    if self.tx.is_closed() {
      return Err(TryPushError::Closed(task));
    }

    let permit = match self.gate.clone().try_acquire_owned() {
      Ok(permit) => permit,
      Err(TryAcquireError::NoPermits) => return Err(TryPushError::Full(task)),
      Err(TryAcquireError::Closed) => return Err(TryPushError::Closed(task)),
    };

    let returned = task.clone();
    let message = QueueMessage { task, _permit: permit };
    match self.tx.send(message).await {
      Ok(()) => Ok(()),
      Err(_) => Err(TryPushError::Closed(returned)),
    }
  }

  /// Closes the sending side. Consumers drain what is left and then see
  /// `RecvError::Disconnected`.
  pub fn close(&self) {
    let _ = self.tx.close();
  }

  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Number of tasks currently waiting in the queue.
  pub fn len(&self) -> usize {
    self.tx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Slots that a push could take right now.
  pub fn free_slots(&self) -> usize {
    self.gate.available_permits()
  }
}

impl QueueConsumer {
  /// Receives the next task, waiting while the queue is empty.
  ///
  /// The capacity permit inside the message is dropped here, freeing a slot.
  pub async fn pop(&self) -> Result<Task, RecvError> {
    let rx = self.rx.lock().await;
    match rx.recv().await {
      Ok(message) => Ok(message.task),
      Err(e) => Err(e),
    }
  }
}
