//! Task execution scheduling: a bounded worker pool and cancellation.
//!
//! - **WorkerPool**: fixed number of workers draining one phase of tasks
//! - **CancelSignal**: operator interrupt shared by every part of a cycle
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Coordinator  │
//!                      │ (one phase)  │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │  Job queue   │
//!                      │   (mpsc)     │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                      ┌──────▼───────┐
//!                      │Result channel│
//!                      └──────────────┘
//! ```

pub mod cancel;
pub mod worker_pool;

pub use cancel::{install_signal_handlers, CancelSignal, Interrupted};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
