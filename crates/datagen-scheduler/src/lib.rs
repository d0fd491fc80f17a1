//! `datagen-scheduler`: recurring data-generation tasks with SQLite
//! persistence.
//!
//! # Overview
//!
//! Tasks live in the `scheduled_tasks` table and every run leaves a row in
//! `task_execution_logs`. The [`service::SchedulerService`] keeps one armed
//! timer per schedulable task in the [`registry::JobRegistry`]. When a timer
//! expires the fire goes through the [`coordinator::ExecutionCoordinator`],
//! which runs at most one execution per task on a bounded worker pool. The
//! [`pipeline::ExecutionPipeline`] generates the batch, hands it to the
//! [`output::OutputDispatcher`] and records the outcome together with the
//! next fire time.
//!
//! All task mutations go through [`lifecycle::TaskLifecycle`].
//!
//! # Output sinks
//!
//! | Kind      | Behaviour                                                   |
//! |-----------|-------------------------------------------------------------|
//! | `none`    | Nothing is delivered                                        |
//! | `webhook` | JSON envelope over HTTP, optionally HMAC-SHA256 signed      |
//! | `storage` | Rendered export written under the storage directory         |
//! | `email`   | Accepted but not delivered; recorded as `skipped`           |

pub mod coordinator;
pub mod cron;
pub mod db;
pub mod error;
pub mod job_store;
pub mod lifecycle;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;

pub use coordinator::{Admission, Trigger};
pub use error::{Result, SchedulerError};
pub use lifecycle::TaskLifecycle;
pub use service::{ArmBasis, SchedulerService};
pub use store::TaskStore;
pub use types::{
    ExecutionLog, ExecutionStatus, NewTask, OutputSpec, OutputStatus, ScheduledTask, TaskFilter,
    TaskStats, TaskStatus, TaskUpdate,
};
