//! Task Queue Module
//!
//! Everything between a batch of decoded tasks and the user code that runs them.
//!
//! ## Architecture Overview
//! 1. **Registration**: Executors are registered per `(queue, task type)` on the `TaskQueueManager`,
//!    together with their dispatch policy (`multiple`, `parallel`, `store_on_failure`, retry policy).
//! 2. **Dispatch**: A queue backend hands batches to a `BatchProcessor`; the `TaskHandler` is the
//!    standard one and settles every task as executed, failed, ignored or handed off.
//! 3. **Handoff**: Long-running work can be moved to the bounded `AsyncTaskManager`.
//! 4. **Persistence**: Transitions go through the `TaskStorage` adapter when one is attached.
//!
//! ## Submodules
//! - **`types`**: Task model, statuses, policies and batch outcomes.
//! - **`storage`**: `TaskStorage` contract and the in-memory adapter.
//! - **`registry`**: `TaskQueueManager`.
//! - **`handler`**: `BatchProcessor`, `TaskHandler` and the `TaskActions` settlement handle.
//! - **`async_tasks`**: `AsyncTaskManager`.
//! - **`notify`**: Guarded operator notifications.
//! - **`backend`**: The `Queue` contract, `MemoryQueue` and `StorageQueue`.

pub mod async_tasks;
pub mod backend;
pub mod handler;
pub mod notify;
pub mod registry;
pub mod storage;
pub mod types;
