//! JSON-file job store.
//!
//! One document per job, named `<job id>.json`, inside a single directory.
//! Writes go to a temporary sibling first and are renamed into place so a
//! crash mid-write never leaves a truncated record behind.

use super::DurableStore;
use crate::core::{Job, JobId};
use crate::errors::StoreError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

const RECORD_EXTENSION: &str = "json";

/// Durable store backed by a directory of JSON documents.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    async fn read_record(path: &Path) -> Result<Option<Job>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn fetch_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Self::read_record(&self.record_path(id)).await
    }

    async fn fetch_all_sorted_by_creation(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }
        jobs.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(&b.id())));
        Ok(jobs)
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.record_path(job.id());
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        let bytes = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
