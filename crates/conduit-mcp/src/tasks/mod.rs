//! Asynchronous task tracking.
//!
//! A task is a long-running operation with an id, a bounded lifecycle and a
//! time to live. [`TaskManager`] owns them, [`TaskHandle`] is the producer's
//! side, and [`TaskService`] exposes them over the `tasks/*` methods.
//!
//! ```text
//!            ┌──────────────► input_required
//!            │                  │      │
//!   working ─┤◄─────────────────┘      │
//!            ├──► completed            │
//!            ├──► failed               │
//!            └──► canceled ◄───────────┘
//! ```

mod manager;
mod service;
mod types;

pub(crate) use manager::deadline_after;
pub use manager::{
    DEFAULT_PAGE_SIZE, MSG_CANCELED, MSG_COMPLETED, MSG_SHUTDOWN, MSG_WORKING, TaskHandle,
    TaskManager, TaskManagerConfig,
};
pub use service::{DEFAULT_RESULT_TIMEOUT, TaskService, to_rpc_error};
pub use types::{
    ListTasksParams, ListTasksResult, TaskEnvelope, TaskIdParams, TaskMetadata, TaskOutcome,
    TaskRequest, TaskSnapshot, TaskStats, TaskStatus,
};
