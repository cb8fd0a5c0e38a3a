//! Testing utilities for jobflow schedulers and pipelines.
//!
//! This module provides:
//! - A scripted generation service and gated, recording stages
//! - A store wrapper with injectable save failures
//! - Polling helpers and assertions for job records

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_checkpoint_stages, assert_job_completed, assert_job_failed_with, assert_job_status,
};
pub use fixtures::{linear_pipeline, wait_for_running, wait_for_status, wait_until_idle};
pub use mocks::{
    FlakyStore, RecordedExecution, RecordingStage, ScriptedGenerationService, StageGate,
};
