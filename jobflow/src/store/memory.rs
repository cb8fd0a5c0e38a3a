//! In-memory job store.

use super::DurableStore;
use crate::core::{Job, JobId};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Inner {
    /// Each job keeps the sequence number of its first insert for tie-breaking.
    jobs: HashMap<JobId, (u64, Job)>,
    next_seq: u64,
}

/// Process-local store, ordered by creation time then insertion order.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryJobStore {
    async fn fetch_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().jobs.get(&id).map(|(_, job)| job.clone()))
    }

    async fn fetch_all_sorted_by_creation(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock();
        let mut entries: Vec<&(u64, Job)> = inner.jobs.values().collect();
        entries.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at().cmp(&b.created_at()).then(seq_a.cmp(seq_b))
        });
        Ok(entries.into_iter().map(|(_, job)| job.clone()).collect())
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let existing = inner.jobs.get(&job.id()).map(|(seq, _)| *seq);
        let seq = match existing {
            Some(seq) => seq,
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        inner.jobs.insert(job.id(), (seq, job.clone()));
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.inner.lock().jobs.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_save_fetch_delete() {
        let store = InMemoryJobStore::new();
        let job = Job::new("meal_plan", Vec::new(), None);

        store.save(&job).await.unwrap();
        assert_eq!(store.fetch_by_id(job.id()).await.unwrap(), Some(job.clone()));

        assert!(store.delete(job.id()).await.unwrap());
        assert!(!store.delete(job.id()).await.unwrap());
        assert!(store.fetch_by_id(job.id()).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sorted_by_creation_with_stable_ties() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        let late = Job::new("k", Vec::new(), None).with_created_at(t0 + Duration::seconds(5));
        let tie_a = Job::new("k", Vec::new(), None).with_created_at(t0);
        let tie_b = Job::new("k", Vec::new(), None).with_created_at(t0);

        store.save(&late).await.unwrap();
        store.save(&tie_a).await.unwrap();
        store.save(&tie_b).await.unwrap();
        // Updating a record keeps its original insertion rank.
        store.save(&tie_a).await.unwrap();

        let ids: Vec<JobId> = store
            .fetch_all_sorted_by_creation()
            .await
            .unwrap()
            .iter()
            .map(Job::id)
            .collect();
        assert_eq!(ids, vec![tie_a.id(), tie_b.id(), late.id()]);
    }
}
