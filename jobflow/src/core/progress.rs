//! Per-run progress checkpoint.
//!
//! Progress maps a stage name to the output that stage already produced
//! for the current run. It is append-only within a run and is persisted
//! after every completed stage, so a resumed run only recomputes from the
//! first stage that has no entry.
//!
//! The persisted form is a tagged envelope keyed by `schema`. Each stage
//! output is stored as its own JSON value, so adding a stage to a pipeline
//! never changes how the outputs of the other stages are encoded.

use crate::errors::{OutputConflictError, ProgressError};
use crate::utils::{now_utc, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema tag written by this build.
pub const PROGRESS_SCHEMA: &str = "v1";

/// One completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage output.
    pub output: serde_json::Value,
    /// When the stage completed.
    pub completed_at: Timestamp,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "schema")]
enum PersistedProgress {
    #[serde(rename = "v1")]
    V1 { stages: BTreeMap<String, StageRecord> },
}

/// Outputs of the stages completed so far in one job's current run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    stages: BTreeMap<String, StageRecord>,
}

impl Progress {
    /// Creates an empty progress record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no stage has completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the number of completed stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if `stage` already has an output.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    /// Returns the raw output of `stage`.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&serde_json::Value> {
        self.stages.get(stage).map(|record| &record.output)
    }

    /// Decodes the output of `stage` into its typed form.
    ///
    /// Returns `Ok(None)` when the stage has not completed.
    pub fn get_typed<T: DeserializeOwned>(&self, stage: &str) -> Result<Option<T>, ProgressError> {
        self.get(stage)
            .map(|value| {
                T::deserialize(value).map_err(|e| {
                    ProgressError::Decode(format!("output of stage '{stage}': {e}"))
                })
            })
            .transpose()
    }

    /// Returns the names of the completed stages.
    pub fn completed_stages(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    /// Appends the output of `stage`.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::Conflict` if the stage already has an output.
    pub fn record(&mut self, stage: &str, output: serde_json::Value) -> Result<(), ProgressError> {
        if self.stages.contains_key(stage) {
            return Err(OutputConflictError::new(stage, "stage output already recorded").into());
        }
        self.stages.insert(
            stage.to_string(),
            StageRecord {
                output,
                completed_at: now_utc(),
            },
        );
        Ok(())
    }

    /// Appends a typed output of `stage`.
    pub fn record_typed<T: Serialize>(
        &mut self,
        stage: &str,
        output: &T,
    ) -> Result<(), ProgressError> {
        let value = serde_json::to_value(output).map_err(|e| ProgressError::Encode {
            stage: stage.to_string(),
            message: e.to_string(),
        })?;
        self.record(stage, value)
    }

    /// Serializes the progress into its persisted envelope.
    pub fn encode(&self) -> Result<Vec<u8>, ProgressError> {
        let envelope = PersistedProgress::V1 {
            stages: self.stages.clone(),
        };
        serde_json::to_vec(&envelope).map_err(|e| ProgressError::Encode {
            stage: "*".to_string(),
            message: e.to_string(),
        })
    }

    /// Deserializes a persisted envelope.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSchema` for envelopes written by a newer build and
    /// `Decode` for anything unreadable.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProgressError> {
        let raw: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| ProgressError::Decode(e.to_string()))?;

        match raw.get("schema").and_then(serde_json::Value::as_str) {
            Some(PROGRESS_SCHEMA) => {}
            Some(other) => return Err(ProgressError::UnsupportedSchema(other.to_string())),
            None => return Err(ProgressError::Decode("missing schema tag".to_string())),
        }

        let PersistedProgress::V1 { stages } =
            serde_json::from_value(raw).map_err(|e| ProgressError::Decode(e.to_string()))?;
        Ok(Self { stages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Outline {
        days: Vec<String>,
    }

    #[test]
    fn test_record_and_get_typed() {
        let mut progress = Progress::new();
        let outline = Outline {
            days: vec!["mon".into(), "tue".into()],
        };
        progress.record_typed("outline", &outline).unwrap();

        assert!(progress.contains("outline"));
        assert_eq!(progress.get_typed::<Outline>("outline").unwrap(), Some(outline));
        assert_eq!(progress.get_typed::<Outline>("missing").unwrap(), None);
    }

    #[test]
    fn test_record_is_append_only() {
        let mut progress = Progress::new();
        progress.record("a", serde_json::json!(1)).unwrap();
        let err = progress.record("a", serde_json::json!(2)).unwrap_err();

        assert!(matches!(err, ProgressError::Conflict(_)));
        assert_eq!(progress.get("a"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_encode_envelope_shape() {
        let mut progress = Progress::new();
        progress.record("a", serde_json::json!({"k": "v"})).unwrap();

        let bytes = progress.encode().unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["schema"], "v1");
        assert_eq!(raw["stages"]["a"]["output"]["k"], "v");

        assert_eq!(Progress::decode(&bytes).unwrap(), progress);
    }

    #[test]
    fn test_decode_rejects_unknown_schema() {
        let bytes = br#"{"schema":"v9","stages":{}}"#;
        assert_eq!(
            Progress::decode(bytes),
            Err(ProgressError::UnsupportedSchema("v9".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Progress::decode(b"not json"), Err(ProgressError::Decode(_))));
        assert!(matches!(Progress::decode(b"{}"), Err(ProgressError::Decode(_))));
    }

    #[test]
    fn test_typed_decode_mismatch() {
        let mut progress = Progress::new();
        progress.record("outline", serde_json::json!(42)).unwrap();
        assert!(progress.get_typed::<Outline>("outline").is_err());
    }
}
