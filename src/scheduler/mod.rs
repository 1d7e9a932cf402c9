//! Bounded concurrency scheduling of task units.
//!
//! - **TaskQueue**: in-process FIFO queue of pending task units
//! - **WorkerPool**: fixed number of workers pulling from the queue
//! - **TaskHandler**: the work done for each task unit
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Orchestrator │
//!                      └──────┬───────┘
//!                             │ run_all(tasks)
//!                      ┌──────▼───────┐
//!                      │  TaskQueue   │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker W│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use itextmine::scheduler::{WorkerPool, WorkerPoolConfig};
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new(10))?;
//! let stats = pool.run_all(tasks, Arc::new(runner)).await;
//! assert_eq!(stats.total_processed() + stats.tasks_skipped, stats.submitted);
//! ```

pub mod worker_pool;

pub use worker_pool::{
    PoolError, PoolStats, TaskHandler, TaskQueue, WorkerPool, WorkerPoolConfig,
};
