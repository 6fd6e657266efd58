//! `jobkeeper-scheduler`: durable job scheduling for a cluster of
//! identical instances.
//!
//! # Overview
//!
//! Every instance accepts job registrations and persists them through a
//! [`repository::JobRepository`]. Exactly one instance at a time holds the
//! heartbeat lease managed by [`leader::LeaderElector`]; only that instance
//! runs the [`scheduler::JobScheduler`] dispatch loop, which claims due jobs
//! and hands them to a [`executor::JobExecutor`].
//!
//! # Triggers
//!
//! | Variant              | Behaviour                                          |
//! |----------------------|----------------------------------------------------|
//! | `PointInTimeTrigger` | Single fire at an absolute instant                 |
//! | `SimpleTimerTrigger` | Start time plus `repeatCount` periods, optional end |
//! | `IntervalTrigger`    | Every N milliseconds, optionally limited           |
//!
//! # Job lifecycle
//!
//! ```text
//! SCHEDULED ──► EXECUTING ──► SCHEDULED (more fires) / EXECUTED
//!     ▲              │
//!     └── RETRY ◄────┴──► ERROR (retries exhausted)
//! any non-terminal ──► CANCELED
//! ```

pub mod db;
pub mod error;
pub mod executor;
pub mod leader;
pub mod recipient;
pub mod repository;
pub mod scheduler;
pub mod trigger;
pub mod types;

pub use error::{ExecutionError, Result, SchedulerError};
pub use executor::{ExecutionResult, HttpJobExecutor, JobExecutor};
pub use leader::{LeaderElector, LeaderState};
pub use recipient::{HttpRecipient, Recipient, SinkRecipient};
pub use repository::{JobRepository, MemoryJobRepository, SqliteJobRepository};
pub use scheduler::JobScheduler;
pub use trigger::Trigger;
pub use types::{Job, JobDescription, JobStatus, JobStatusEvent, LeaseRecord, TimeUnit};
