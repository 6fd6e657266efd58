//! Storage seam shared by every instance of a cluster.
//!
//! Leadership correctness rests on [`JobRepository::get_and_update_lease`]
//! being a true atomic compare-and-set against the backing store.

mod memory;
mod sqlite;

pub use memory::MemoryJobRepository;
pub use sqlite::SqliteJobRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Job, JobStatus, LeaseRecord};

/// Read-modify-write callback. Receives the stored value (`None` when absent)
/// and returns the replacement, or `None` to leave the store untouched.
/// May be invoked while the store holds a lock, so it must not block.
pub type Update<'a, T> = &'a (dyn Fn(Option<T>) -> Option<T> + Send + Sync);

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Insert or replace a job record.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Atomically apply `update` to the job stored under `id`.
    ///
    /// Returns whatever `update` returned, i.e. the new record or `None` when
    /// nothing was written.
    async fn update_job(&self, id: &str, update: Update<'_, Job>) -> Result<Option<Job>>;

    /// Returns true when a record was removed.
    async fn delete_job(&self, id: &str) -> Result<bool>;

    /// Jobs in one of `statuses` whose due instant lies in `[from, to]`,
    /// earliest first, higher priority first among equals.
    async fn find_due(
        &self,
        statuses: &[JobStatus],
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>>;

    async fn get_lease(&self, id: &str) -> Result<Option<LeaseRecord>>;

    /// Atomically apply `update` to the lease stored under `id`, in a single
    /// transaction against the store.
    async fn get_and_update_lease(
        &self,
        id: &str,
        update: Update<'_, LeaseRecord>,
    ) -> Result<Option<LeaseRecord>>;

    /// Renew the lease if `token` still holds it. `None` means the lease was
    /// lost or never existed.
    async fn heartbeat(
        &self,
        id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>> {
        self.get_and_update_lease(id, &|current: Option<LeaseRecord>| {
            current
                .filter(|lease| lease.is_held_by(token))
                .map(|lease| LeaseRecord {
                    last_heartbeat: Some(now),
                    ..lease
                })
        })
        .await
    }
}
