use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::error::OmrError;

/// Point values applied to one subject's questions, with score bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringRule {
    pub correct_points: f64,
    pub incorrect_penalty: f64,
    pub unanswered_penalty: f64,
    pub max_score: f64,
    pub min_score: f64,
}

impl Default for ScoringRule {
    fn default() -> Self {
        Self {
            correct_points: 1.0,
            incorrect_penalty: 0.0,
            unanswered_penalty: 0.0,
            max_score: 20.0,
            min_score: 0.0,
        }
    }
}

/// A scoring-rule entry as it appears in the answer-key document. Missing
/// fields fall back per-field to the hardcoded defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialScoringRule {
    pub correct_points: Option<f64>,
    pub incorrect_penalty: Option<f64>,
    pub unanswered_penalty: Option<f64>,
    pub max_score: Option<f64>,
    pub min_score: Option<f64>,
}

impl PartialScoringRule {
    fn resolve(&self) -> ScoringRule {
        let defaults = ScoringRule::default();
        ScoringRule {
            correct_points: self.correct_points.unwrap_or(defaults.correct_points),
            incorrect_penalty: self.incorrect_penalty.unwrap_or(defaults.incorrect_penalty),
            unanswered_penalty: self
                .unanswered_penalty
                .unwrap_or(defaults.unanswered_penalty),
            max_score: self.max_score.unwrap_or(defaults.max_score),
            min_score: self.min_score.unwrap_or(defaults.min_score),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExamInfo {
    pub exam_id: String,
    pub exam_name: String,
}

/// Ground-truth answers and scoring rules for one exam. Immutable once
/// loaded; a batch shares one instance by reference across all sheets.
/// Subjects are kept in a `BTreeMap` so scoring iterates them in a stable
/// order.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerKey {
    pub exam_info: ExamInfo,
    pub answer_key: BTreeMap<String, BTreeMap<u32, String>>,
    #[serde(default)]
    pub scoring_rules: BTreeMap<String, PartialScoringRule>,
}

impl AnswerKey {
    pub fn load(path: &Path) -> Result<Self, OmrError> {
        let text = fs::read_to_string(path)
            .map_err(|_| OmrError::AnswerKeyNotFound(path.to_path_buf()))?;
        let key = Self::from_json(&text)?;
        info!(
            "loaded answer key for exam '{}' ({} subjects, {} questions)",
            key.exam_info.exam_name,
            key.answer_key.len(),
            key.total_questions()
        );
        Ok(key)
    }

    pub fn from_json(text: &str) -> Result<Self, OmrError> {
        serde_json::from_str(text).map_err(|e| OmrError::MalformedAnswerKey(e.to_string()))
    }

    /// Resolves the scoring rule for a subject: the subject's own entry,
    /// else the `"default"` entry, else the hardcoded defaults, merged
    /// field by field.
    pub fn rule_for(&self, subject: &str) -> ScoringRule {
        self.scoring_rules
            .get(subject)
            .or_else(|| self.scoring_rules.get("default"))
            .map(PartialScoringRule::resolve)
            .unwrap_or_default()
    }

    pub fn total_questions(&self) -> usize {
        self.answer_key.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "exam_info": {"exam_id": "midterm-1", "exam_name": "Midterm"},
        "answer_key": {
            "math": {"1": "A", "2": "B"},
            "physics": {"3": "C"}
        },
        "scoring_rules": {
            "math": {"correct_points": 2.0, "max_score": 40.0},
            "default": {"incorrect_penalty": 0.25}
        }
    }"#;

    #[test]
    fn parses_the_document_schema() {
        let key = AnswerKey::from_json(SAMPLE).unwrap();
        assert_eq!(key.exam_info.exam_id, "midterm-1");
        assert_eq!(key.answer_key["math"][&1], "A");
        assert_eq!(key.answer_key["physics"][&3], "C");
        assert_eq!(key.total_questions(), 3);
    }

    #[test]
    fn subject_rule_merges_with_hardcoded_defaults() {
        let key = AnswerKey::from_json(SAMPLE).unwrap();
        let rule = key.rule_for("math");
        assert_eq!(rule.correct_points, 2.0);
        assert_eq!(rule.max_score, 40.0);
        // Unspecified fields keep the hardcoded defaults, not the
        // "default" entry's.
        assert_eq!(rule.incorrect_penalty, 0.0);
        assert_eq!(rule.min_score, 0.0);
    }

    #[test]
    fn missing_subject_falls_back_to_default_entry_then_hardcoded() {
        let key = AnswerKey::from_json(SAMPLE).unwrap();
        let rule = key.rule_for("physics");
        assert_eq!(rule.incorrect_penalty, 0.25);
        assert_eq!(rule.correct_points, 1.0);
        assert_eq!(rule.max_score, 20.0);

        let no_rules = AnswerKey::from_json(
            r#"{"exam_info": {"exam_id": "x", "exam_name": "X"},
                "answer_key": {"s": {"1": "A"}}}"#,
        )
        .unwrap();
        assert_eq!(no_rules.rule_for("s"), ScoringRule::default());
    }

    #[test]
    fn malformed_json_is_an_input_error() {
        let err = AnswerKey::from_json("{not json").unwrap_err();
        assert!(matches!(err, OmrError::MalformedAnswerKey(_)));

        let err = AnswerKey::from_json(
            r#"{"exam_info": {"exam_id": "x", "exam_name": "X"},
                "answer_key": {"s": {"one": "A"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, OmrError::MalformedAnswerKey(_)));
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let err = AnswerKey::load(Path::new("/nonexistent/key.json")).unwrap_err();
        assert!(matches!(err, OmrError::AnswerKeyNotFound(_)));
    }
}
