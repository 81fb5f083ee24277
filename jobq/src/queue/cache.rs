//! Read-through cache of loaded jobs.

use dashmap::DashMap;

use crate::Result;
use crate::database::repositories::JobRepository;
use crate::domain::{Job, JobId};

/// Thread-safe cache of jobs keyed by id.
///
/// Entries are snapshots; anything that changes a job's row must
/// [`invalidate`](Self::invalidate) it or insert the new snapshot.
#[derive(Debug, Default)]
pub struct JobCache {
    jobs: DashMap<JobId, Job>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|entry| entry.value().clone())
    }

    /// Cached snapshot, or load it from `repo` and cache it.
    pub async fn get_or_load(&self, repo: &dyn JobRepository, id: JobId) -> Result<Job> {
        if let Some(job) = self.get(id) {
            return Ok(job);
        }
        let job = repo.get_job(id).await?;
        self.jobs.insert(id, job.clone());
        Ok(job)
    }

    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    /// Drop a cached job.
    pub fn invalidate(&self, id: JobId) {
        self.jobs.remove(&id);
    }

    pub fn invalidate_all(&self) {
        self.jobs.clear();
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobState, create_test_job};

    #[test]
    fn test_insert_get_invalidate() {
        let cache = JobCache::new();
        cache.insert(create_test_job(1, JobState::Pending));
        cache.insert(create_test_job(2, JobState::Pending));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(JobId(1)).map(|j| j.id), Some(JobId(1)));

        cache.invalidate(JobId(1));
        assert!(!cache.contains(JobId(1)));
        assert!(cache.get(JobId(1)).is_none());

        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
