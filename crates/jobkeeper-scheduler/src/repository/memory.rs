use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};

use super::{JobRepository, Update};
use crate::error::Result;
use crate::types::{Job, JobStatus, LeaseRecord};

/// In-process repository. Atomicity comes from DashMap's per-key entry lock,
/// so it is only shared by the tasks of one process.
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: DashMap<String, Job>,
    leases: DashMap<String, LeaseRecord>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Run `update` under the entry lock for `key`.
fn apply<T: Clone>(map: &DashMap<String, T>, key: &str, update: Update<'_, T>) -> Option<T> {
    match map.entry(key.to_string()) {
        Entry::Occupied(mut entry) => {
            let next = update(Some(entry.get().clone()));
            if let Some(ref value) = next {
                entry.insert(value.clone());
            }
            next
        }
        Entry::Vacant(entry) => {
            let next = update(None);
            if let Some(ref value) = next {
                entry.insert(value.clone());
            }
            next
        }
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, id: &str, update: Update<'_, Job>) -> Result<Option<Job>> {
        Ok(apply(&self.jobs, id, update))
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        Ok(self.jobs.remove(id).is_some())
    }

    async fn find_due(
        &self,
        statuses: &[JobStatus],
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let mut due: Vec<(DateTime<Utc>, Job)> = self
            .jobs
            .iter()
            .filter(|entry| statuses.contains(&entry.status))
            .filter_map(|entry| {
                let at = entry.due_at()?;
                let in_range = at <= to && from.map_or(true, |from| at >= from);
                in_range.then(|| (at, entry.value().clone()))
            })
            .collect();
        due.sort_by(|(a_at, a), (b_at, b)| a_at.cmp(b_at).then(b.priority.cmp(&a.priority)));
        Ok(due.into_iter().take(limit).map(|(_, job)| job).collect())
    }

    async fn get_lease(&self, id: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.leases.get(id).map(|entry| entry.value().clone()))
    }

    async fn get_and_update_lease(
        &self,
        id: &str,
        update: Update<'_, LeaseRecord>,
    ) -> Result<Option<LeaseRecord>> {
        Ok(apply(&self.leases, id, update))
    }
}
