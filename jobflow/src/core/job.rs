//! The persisted job record.

use super::{JobId, JobStatus, OwnerId, Progress};
use crate::errors::{JobflowError, ProgressError};
use crate::utils::{now_utc, strictly_after, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A persisted unit of generation work.
///
/// Invariants, upheld by the transition methods:
/// - `result` is set iff the status is `Completed`.
/// - `failure_reason` is set iff the status is `Failed`.
/// - `progress_checkpoint` is only ever set while `Pending` or `Running`.
/// - Terminal jobs are never mutated again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    created_at: Timestamp,
    status: JobStatus,
    job_kind: String,
    #[serde(with = "base64_bytes")]
    input_parameters: Vec<u8>,
    #[serde(default, with = "base64_opt_bytes")]
    result: Option<Vec<u8>>,
    #[serde(default)]
    failure_reason: Option<String>,
    #[serde(default, with = "base64_opt_bytes")]
    progress_checkpoint: Option<Vec<u8>>,
    #[serde(default)]
    owner_ref: Option<OwnerId>,
}

impl Job {
    /// Creates a new pending job stamped with the current time.
    #[must_use]
    pub fn new(
        job_kind: impl Into<String>,
        input_parameters: Vec<u8>,
        owner_ref: Option<OwnerId>,
    ) -> Self {
        Self {
            id: JobId::new(),
            created_at: now_utc(),
            status: JobStatus::Pending,
            job_kind: job_kind.into(),
            input_parameters,
            result: None,
            failure_reason: None,
            progress_checkpoint: None,
            owner_ref,
        }
    }

    /// Overrides the creation timestamp (the FIFO sort key).
    #[must_use]
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns the job id.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Returns the tag that selects the pipeline for this job.
    #[must_use]
    pub fn job_kind(&self) -> &str {
        &self.job_kind
    }

    /// Returns the raw input parameters.
    #[must_use]
    pub fn input_parameters(&self) -> &[u8] {
        &self.input_parameters
    }

    /// Decodes the input parameters as JSON.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.input_parameters)
    }

    /// Returns the result bytes of a completed job.
    #[must_use]
    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    /// Returns the failure reason of a failed job.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Returns the serialized progress of an incomplete run.
    #[must_use]
    pub fn progress_checkpoint(&self) -> Option<&[u8]> {
        self.progress_checkpoint.as_deref()
    }

    /// Decodes the stored checkpoint, or returns an empty progress record.
    pub fn progress(&self) -> Result<Progress, ProgressError> {
        match &self.progress_checkpoint {
            Some(bytes) => Progress::decode(bytes),
            None => Ok(Progress::new()),
        }
    }

    /// Returns the owning entity, if it still exists.
    #[must_use]
    pub fn owner_ref(&self) -> Option<&OwnerId> {
        self.owner_ref.as_ref()
    }

    /// Returns true if the job is owned by `owner`.
    #[must_use]
    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        self.owner_ref.as_ref() == Some(owner)
    }

    fn transition(&mut self, next: JobStatus, operation: &'static str) -> Result<(), JobflowError> {
        if !self.status.can_transition_to(next) {
            return Err(JobflowError::invalid_state(self.id, self.status, operation));
        }
        self.status = next;
        Ok(())
    }

    /// `Pending -> Running`.
    pub fn mark_running(&mut self) -> Result<(), JobflowError> {
        self.transition(JobStatus::Running, "start")
    }

    /// Replaces the checkpoint of a running job.
    pub fn store_checkpoint(&mut self, progress: &Progress) -> Result<(), JobflowError> {
        if self.status != JobStatus::Running {
            return Err(JobflowError::invalid_state(self.id, self.status, "checkpoint"));
        }
        let bytes = progress
            .encode()
            .map_err(|e| JobflowError::Serialization(e.to_string()))?;
        self.progress_checkpoint = Some(bytes);
        Ok(())
    }

    /// `Running -> Completed`, clearing the checkpoint.
    pub fn complete(&mut self, result: Vec<u8>) -> Result<(), JobflowError> {
        self.transition(JobStatus::Completed, "complete")?;
        self.result = Some(result);
        self.failure_reason = None;
        self.progress_checkpoint = None;
        Ok(())
    }

    /// `Running -> Failed`, clearing the checkpoint.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), JobflowError> {
        self.transition(JobStatus::Failed, "fail")?;
        self.failure_reason = Some(reason.into());
        self.result = None;
        self.progress_checkpoint = None;
        Ok(())
    }

    /// `Running -> Pending`, keeping the checkpoint for a later resume.
    ///
    /// Used for preemption by `prioritize` and for crash recovery.
    pub fn reset_preserving_progress(&mut self) -> Result<(), JobflowError> {
        self.transition(JobStatus::Pending, "requeue")
    }

    /// Back to `Pending` with no checkpoint, re-queued behind every job
    /// submitted so far.
    pub fn reset_discarding_progress(&mut self) -> Result<(), JobflowError> {
        self.transition(JobStatus::Pending, "pause")?;
        self.progress_checkpoint = None;
        self.created_at = strictly_after(self.created_at);
        Ok(())
    }

    /// Nulls the owner reference after the owning entity was deleted.
    pub fn detach_owner(&mut self) {
        self.owner_ref = None;
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
