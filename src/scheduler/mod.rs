//! Priority task queue and the workers that drain it.
//!
//! - **TaskQueue**: priority lists, scheduled retries and a dead-letter list
//!   over a pluggable [`QueueBackend`]
//! - **WorkerPool**: workers dispatching tasks to [`TaskHandler`]s
//! - **Task**: unit of work with priority, retry budget and status
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │ (engine/CLI) │
//!                      └──────┬───────┘
//!                             │ enqueue
//!          ┌──────────────────▼──────────────────┐
//!          │  critical │ high │ normal │ low     │◄── promote due
//!          └──────────────────┬──────────────────┘    scheduled ids
//!                             │ dequeue
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └─── complete / fail (retry or dead letter) ───┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use case_orchestrator::scheduler::{TaskQueue, TaskPriority, Payload};
//! use std::time::Duration;
//!
//! let queue = TaskQueue::connect("redis://localhost:6379", "cases").await?;
//! let task = queue
//!     .enqueue("notify", Payload::new(), TaskPriority::High, None, 3)
//!     .await?;
//!
//! if let Some(task) = queue.dequeue(Duration::from_secs(1)).await? {
//!     queue.complete(&task.task_id, None).await?;
//! }
//! ```

pub mod backend;
pub mod queue;
pub mod task;
pub mod worker_pool;

pub use backend::{MemoryBackend, QueueBackend, RedisBackend};
pub use queue::{FailOutcome, QueueStats, TaskQueue};
pub use task::{Payload, Task, TaskPriority, TaskStatus, DEFAULT_MAX_RETRIES};
pub use worker_pool::{
    HandlerRegistry, PermanentFailure, PoolError, PoolStats, TaskHandler, WorkerPool,
    WorkerPoolConfig,
};
