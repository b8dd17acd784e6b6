//! Error taxonomy for a pipeline cycle.
//!
//! `Retrieval` and `Configuration` abort a cycle before any subject is
//! processed. Every other kind is scoped to a single subject and is caught
//! at the subject boundary.

use crate::models::SubjectId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model request timed out after {0:?}")]
    Timeout(Duration),

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("model transport failed: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to retrieve conversation turns: {0}")]
    Retrieval(String),

    #[error("insight extraction failed for subject {subject_id}: {reason}")]
    Extraction { subject_id: SubjectId, reason: String },

    #[error(
        "persistence failed for subject {subject_id} after {written} rows: {reason}"
    )]
    Persistence {
        subject_id: SubjectId,
        written: usize,
        reason: String,
    },

    /// A prompt write failure. Reported under the `persistence` kind.
    #[error("failed to activate a new prompt version for subject {subject_id}: {reason}")]
    Activation { subject_id: SubjectId, reason: String },

    #[error("prompt optimization failed for subject {subject_id}: {reason}")]
    Optimization { subject_id: SubjectId, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Fatal errors end the whole cycle; the rest only skip one subject.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Retrieval(_) | PipelineError::Configuration(_)
        )
    }

    pub fn subject_id(&self) -> Option<SubjectId> {
        match self {
            PipelineError::Extraction { subject_id, .. }
            | PipelineError::Persistence { subject_id, .. }
            | PipelineError::Activation { subject_id, .. }
            | PipelineError::Optimization { subject_id, .. } => {
                Some(*subject_id)
            }
            PipelineError::Retrieval(_) | PipelineError::Configuration(_) => {
                None
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Retrieval(_) => "retrieval",
            PipelineError::Extraction { .. } => "extraction",
            PipelineError::Persistence { .. }
            | PipelineError::Activation { .. } => "persistence",
            PipelineError::Optimization { .. } => "optimization",
            PipelineError::Configuration(_) => "configuration",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_are_retrieval_and_configuration() {
        assert!(PipelineError::Retrieval("down".into()).is_fatal());
        assert!(PipelineError::Configuration("missing".into()).is_fatal());
        assert!(!PipelineError::Extraction {
            subject_id: 1,
            reason: "bad json".into()
        }
        .is_fatal());
        assert!(!PipelineError::Optimization {
            subject_id: 1,
            reason: "timeout".into()
        }
        .is_fatal());
    }

    #[test]
    fn persistence_error_reports_written_prefix() {
        let err = PipelineError::Persistence {
            subject_id: 7,
            written: 2,
            reason: "disk full".into(),
        };
        assert_eq!(err.subject_id(), Some(7));
        assert_eq!(err.kind(), "persistence");
        assert_eq!(
            err.to_string(),
            "persistence failed for subject 7 after 2 rows: disk full"
        );
    }

    #[test]
    fn activation_error_names_the_prompt_write() {
        let err = PipelineError::Activation {
            subject_id: 3,
            reason: "database is locked".into(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.subject_id(), Some(3));
        assert_eq!(err.kind(), "persistence");
        assert_eq!(
            err.to_string(),
            "failed to activate a new prompt version for subject 3: database is locked"
        );
    }
}
