//! Test assertions for job records.

use crate::core::{Job, JobStatus};

/// Asserts that the job has the expected status.
pub fn assert_job_status(job: &Job, expected: JobStatus) {
    assert_eq!(
        job.status(),
        expected,
        "Expected job {} to be {expected}, got {} (failure: {:?})",
        job.id(),
        job.status(),
        job.failure_reason()
    );
}

/// Asserts that the job completed and upholds the completed invariants.
pub fn assert_job_completed(job: &Job) {
    assert_job_status(job, JobStatus::Completed);
    assert!(job.result().is_some(), "Completed job {} has no result", job.id());
    assert!(job.failure_reason().is_none());
    assert!(job.progress_checkpoint().is_none());
}

/// Asserts that the job failed with a reason containing `needle`.
pub fn assert_job_failed_with(job: &Job, needle: &str) {
    assert_job_status(job, JobStatus::Failed);
    let reason = job.failure_reason().unwrap_or_default();
    assert!(
        reason.contains(needle),
        "Expected failure reason of job {} to contain '{needle}', got '{reason}'",
        job.id()
    );
    assert!(job.result().is_none());
    assert!(job.progress_checkpoint().is_none());
}

/// Asserts exactly which stages the job's checkpoint holds.
pub fn assert_checkpoint_stages(job: &Job, expected: &[&str]) {
    let progress = job
        .progress()
        .unwrap_or_else(|e| panic!("Checkpoint of job {} is unreadable: {e}", job.id()));
    let stages: Vec<&str> = progress.completed_stages().collect();
    let mut expected = expected.to_vec();
    expected.sort_unstable();
    assert_eq!(stages, expected, "Unexpected checkpoint of job {}", job.id());
}
