//! A Tokio-based worker pool that spreads a batch of tasks across workers,
//! each holding one exclusive resource (a proxy, an API key, an endpoint)
//! drawn from a shared pool that shrinks on failure and throttles on rate limits.

mod config;
mod error;
mod input;
mod ledger;
mod release_queue;
mod resource_pool;
mod retry;
mod supervisor;
mod task;
mod task_queue;
mod worker;

pub use config::{parse_worker_count, prompt_worker_count, DispatchConfig, DEFAULT_WORKER_COUNT};
pub use error::{DispatchError, ProcessError, TryPushError};
pub use input::load_lines;
pub use resource_pool::{Acquire, PoolOptions, ResourcePool, ResourceState, ScanPolicy};
pub use retry::RetryStats;
pub use supervisor::{RunReport, WorkerSupervisor};
pub use task::{ProcessFuture, Processor, Task};
pub use task_queue::{QueueConsumer, QueueProducer, TaskQueue};
pub use worker::{WorkerOutcome, WorkerReport};
