use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort processing of a single sheet. Format-validation
/// findings and detection anomalies are reported as data, never as errors.
#[derive(Debug, Error)]
pub enum OmrError {
    #[error("could not read sheet image: {0}")]
    UnreadableImage(String),

    #[error("answer key file not found: {0}")]
    AnswerKeyNotFound(PathBuf),

    #[error("malformed answer key: {0}")]
    MalformedAnswerKey(String),

    #[error("scoring rule for '{subject}' has max_score {max_score} below min_score {min_score}")]
    InvalidRuleBounds {
        subject: String,
        max_score: f64,
        min_score: f64,
    },

    #[error("answer key question {question} in '{subject}' cannot be matched by 1-based question numbering")]
    UncoverableQuestion { subject: String, question: u32 },

    #[error("processing cancelled")]
    Cancelled,
}

impl OmrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OmrError::UnreadableImage(_)
            | OmrError::AnswerKeyNotFound(_)
            | OmrError::MalformedAnswerKey(_) => ErrorKind::InputError,
            OmrError::InvalidRuleBounds { .. } | OmrError::UncoverableQuestion { .. } => {
                ErrorKind::ScoringInconsistency
            }
            OmrError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputError,
    ScoringInconsistency,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(
            OmrError::UnreadableImage("x".to_string()).kind(),
            ErrorKind::InputError
        );
        assert_eq!(
            OmrError::MalformedAnswerKey("bad json".to_string()).kind(),
            ErrorKind::InputError
        );
        assert_eq!(
            OmrError::InvalidRuleBounds {
                subject: "math".to_string(),
                max_score: 1.0,
                min_score: 2.0,
            }
            .kind(),
            ErrorKind::ScoringInconsistency
        );
        assert_eq!(OmrError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
