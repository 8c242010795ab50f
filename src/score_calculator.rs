use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use log::info;
use logging_timer::time;
use serde::{Deserialize, Serialize};

use crate::answer_key::{AnswerKey, ScoringRule};
use crate::error::OmrError;

/// Descending grade boundaries; the first boundary not exceeding a
/// percentage wins.
const GRADE_BOUNDARIES: [(&str, f64); 11] = [
    ("A+", 95.0),
    ("A", 90.0),
    ("A-", 85.0),
    ("B+", 80.0),
    ("B", 75.0),
    ("B-", 70.0),
    ("C+", 65.0),
    ("C", 60.0),
    ("C-", 55.0),
    ("D", 50.0),
    ("F", 0.0),
];

pub fn grade_for(percentage: f64) -> &'static str {
    for (grade, boundary) in GRADE_BOUNDARIES {
        if percentage >= boundary {
            return grade;
        }
    }
    "F"
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_number: u32,
    pub subject: String,
    pub correct_answer: String,
    pub student_answer: Option<char>,
    pub is_correct: bool,
    pub points_earned: f64,
    pub confidence: f64,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectResult {
    pub subject_name: String,
    pub total_questions: usize,
    pub correct_answers: usize,
    pub incorrect_answers: usize,
    pub unanswered: usize,
    pub raw_score: f64,
    pub percentage: f64,
    pub grade: String,
    pub question_results: Vec<QuestionResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceMetrics {
    pub average_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub low_confidence_count: usize,
    pub high_confidence_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallResult {
    pub student_id: Option<String>,
    pub exam_id: String,
    pub total_questions: usize,
    pub total_correct: usize,
    pub total_incorrect: usize,
    pub total_unanswered: usize,
    pub overall_score: f64,
    pub overall_percentage: f64,
    pub overall_grade: String,
    pub subject_results: Vec<SubjectResult>,
    pub confidence_metrics: ConfidenceMetrics,
    pub processing_notes: Vec<String>,
}

/// Scores detected answers against an answer key: per-question points with
/// confidence-aware penalties, per-subject clamping and grading, overall
/// aggregation and diagnostics.
pub struct ScoreCalculator;

impl ScoreCalculator {
    pub fn new() -> Self {
        Self
    }

    #[time]
    pub fn score(
        &self,
        key: &AnswerKey,
        detected_answers: &BTreeMap<u32, Option<char>>,
        confidences: &BTreeMap<u32, f64>,
        student_id: Option<&str>,
    ) -> Result<OverallResult, OmrError> {
        let mut subject_results = Vec::with_capacity(key.answer_key.len());
        let mut total_questions = 0;
        let mut total_correct = 0;
        let mut total_incorrect = 0;
        let mut total_unanswered = 0;
        let mut total_points = 0.0;
        let mut max_possible_points = 0.0;

        for (subject_name, subject_answers) in &key.answer_key {
            let rule = key.rule_for(subject_name);
            if rule.max_score < rule.min_score {
                return Err(OmrError::InvalidRuleBounds {
                    subject: subject_name.clone(),
                    max_score: rule.max_score,
                    min_score: rule.min_score,
                });
            }
            if let Some(question) = subject_answers.keys().find(|q| **q == 0) {
                return Err(OmrError::UncoverableQuestion {
                    subject: subject_name.clone(),
                    question: *question,
                });
            }

            let subject_result = score_subject(
                subject_name,
                subject_answers,
                &rule,
                detected_answers,
                confidences,
            );
            total_questions += subject_result.total_questions;
            total_correct += subject_result.correct_answers;
            total_incorrect += subject_result.incorrect_answers;
            total_unanswered += subject_result.unanswered;
            total_points += subject_result.raw_score;
            max_possible_points += rule.max_score;
            subject_results.push(subject_result);
        }

        let overall_percentage = if max_possible_points > 0.0 {
            total_points / max_possible_points * 100.0
        } else {
            0.0
        };
        let overall_grade = grade_for(overall_percentage).to_string();
        let confidence_metrics = confidence_metrics(confidences);
        let processing_notes =
            processing_notes(&subject_results, &confidence_metrics, total_questions);

        info!(
            "score calculation complete: {:.1}% ({})",
            overall_percentage, overall_grade
        );
        Ok(OverallResult {
            student_id: student_id.map(String::from),
            exam_id: key.exam_info.exam_id.clone(),
            total_questions,
            total_correct,
            total_incorrect,
            total_unanswered,
            overall_score: total_points,
            overall_percentage,
            overall_grade,
            subject_results,
            confidence_metrics,
            processing_notes,
        })
    }

    pub fn export_json(&self, result: &OverallResult, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(result)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)?;
        info!("results exported to JSON: {}", path.display());
        Ok(())
    }

    pub fn export_csv(&self, result: &OverallResult, path: &Path) -> io::Result<()> {
        fs::write(path, render_csv(result))?;
        info!("results exported to CSV: {}", path.display());
        Ok(())
    }
}

impl Default for ScoreCalculator {
    fn default() -> Self {
        Self::new()
    }
}

fn score_subject(
    subject_name: &str,
    subject_answers: &BTreeMap<u32, String>,
    rule: &ScoringRule,
    detected_answers: &BTreeMap<u32, Option<char>>,
    confidences: &BTreeMap<u32, f64>,
) -> SubjectResult {
    let mut question_results = Vec::with_capacity(subject_answers.len());
    let mut total_points = 0.0;
    let mut correct_count = 0;
    let mut incorrect_count = 0;
    let mut unanswered_count = 0;

    for (question_number, correct_answer) in subject_answers {
        let student_answer = detected_answers.get(question_number).copied().flatten();
        let confidence = confidences.get(question_number).copied().unwrap_or(1.0);

        let (points, is_correct, notes) =
            score_question(correct_answer, student_answer, rule, confidence);
        total_points += points;

        match (student_answer, is_correct) {
            (None, _) => unanswered_count += 1,
            (Some(_), true) => correct_count += 1,
            (Some(_), false) => incorrect_count += 1,
        }

        question_results.push(QuestionResult {
            question_number: *question_number,
            subject: subject_name.to_string(),
            correct_answer: correct_answer.clone(),
            student_answer,
            is_correct,
            points_earned: points,
            confidence,
            notes,
        });
    }

    let raw_score = total_points.clamp(rule.min_score, rule.max_score);
    let percentage = if rule.max_score > 0.0 {
        raw_score / rule.max_score * 100.0
    } else {
        0.0
    };

    SubjectResult {
        subject_name: subject_name.to_string(),
        total_questions: subject_answers.len(),
        correct_answers: correct_count,
        incorrect_answers: incorrect_count,
        unanswered: unanswered_count,
        raw_score,
        percentage,
        grade: grade_for(percentage).to_string(),
        question_results,
    }
}

fn score_question(
    correct_answer: &str,
    student_answer: Option<char>,
    rule: &ScoringRule,
    confidence: f64,
) -> (f64, bool, Vec<String>) {
    let mut notes = Vec::new();

    let (mut points, is_correct) = match student_answer {
        None => {
            notes.push("Question not answered".to_string());
            (-rule.unanswered_penalty, false)
        }
        Some(letter) if letter.to_string().eq_ignore_ascii_case(correct_answer) => {
            if confidence < 0.8 {
                notes.push(format!("Low confidence detection ({confidence:.2})"));
            }
            (rule.correct_points, true)
        }
        Some(letter) => {
            notes.push(format!(
                "Incorrect answer: {letter} (correct: {correct_answer})"
            ));
            (-rule.incorrect_penalty, false)
        }
    };

    // Very low detection confidence halves the points either way.
    if confidence < 0.5 && student_answer.is_some() {
        points *= 0.5;
        notes.push("Score reduced due to low detection confidence".to_string());
    }

    (points, is_correct, notes)
}

fn confidence_metrics(confidences: &BTreeMap<u32, f64>) -> ConfidenceMetrics {
    if confidences.is_empty() {
        return ConfidenceMetrics::default();
    }
    let values: Vec<f64> = confidences.values().copied().collect();
    ConfidenceMetrics {
        average_confidence: values.iter().sum::<f64>() / values.len() as f64,
        min_confidence: values.iter().copied().fold(f64::INFINITY, f64::min),
        max_confidence: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        low_confidence_count: values.iter().filter(|v| **v < 0.7).count(),
        high_confidence_count: values.iter().filter(|v| **v >= 0.9).count(),
    }
}

fn processing_notes(
    subject_results: &[SubjectResult],
    metrics: &ConfidenceMetrics,
    total_questions: usize,
) -> Vec<String> {
    let mut notes = Vec::new();

    if metrics.low_confidence_count > 0 {
        notes.push(format!(
            "{} questions had low confidence detection",
            metrics.low_confidence_count
        ));
    }

    for subject in subject_results {
        if subject.total_questions > 0
            && subject.unanswered as f64 / subject.total_questions as f64 > 0.2
        {
            notes.push(format!(
                "{}: {} questions unanswered",
                subject.subject_name, subject.unanswered
            ));
        }
    }

    let total_answered: usize = subject_results
        .iter()
        .map(|s| s.correct_answers + s.incorrect_answers)
        .sum();
    if (total_answered as f64) < total_questions as f64 * 0.8 {
        notes.push("Many questions were not answered - check image quality".to_string());
    }

    let low_performing = subject_results
        .iter()
        .filter(|s| s.percentage < 40.0)
        .count();
    if low_performing * 2 > subject_results.len() {
        notes.push("Multiple subjects show low performance - verify answer key alignment".to_string());
    }

    notes
}

/// Flattened per-question rows: one line per question across all subjects.
pub fn render_csv(result: &OverallResult) -> String {
    let mut out = String::from(
        "Question,Subject,CorrectAnswer,StudentAnswer,IsCorrect,PointsEarned,Confidence,Notes\n",
    );
    for subject in &result.subject_results {
        for question in &subject.question_results {
            let student = question
                .student_answer
                .map(|c| c.to_string())
                .unwrap_or_default();
            let row = [
                question.question_number.to_string(),
                question.subject.clone(),
                question.correct_answer.clone(),
                student,
                question.is_correct.to_string(),
                question.points_earned.to_string(),
                format!("{:.3}", question.confidence),
                question.notes.join("; "),
            ];
            let escaped: Vec<String> = row.iter().map(|field| csv_escape(field)).collect();
            out.push_str(&escaped.join(","));
            out.push('\n');
        }
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::answer_key::AnswerKey;

    fn key_json(subjects: &[(&str, &[(u32, &str)])], rules: &str) -> String {
        let answer_key: Vec<String> = subjects
            .iter()
            .map(|(name, questions)| {
                let entries: Vec<String> = questions
                    .iter()
                    .map(|(q, a)| format!("\"{q}\": \"{a}\""))
                    .collect();
                format!("\"{name}\": {{{}}}", entries.join(", "))
            })
            .collect();
        format!(
            r#"{{"exam_info": {{"exam_id": "exam-1", "exam_name": "Exam"}},
                "answer_key": {{{}}},
                "scoring_rules": {rules}}}"#,
            answer_key.join(", ")
        )
    }

    fn perfect_detection(
        key: &AnswerKey,
    ) -> (BTreeMap<u32, Option<char>>, BTreeMap<u32, f64>) {
        let mut answers = BTreeMap::new();
        let mut confidences = BTreeMap::new();
        for questions in key.answer_key.values() {
            for (question, correct) in questions {
                answers.insert(*question, correct.chars().next());
                confidences.insert(*question, 1.0);
            }
        }
        (answers, confidences)
    }

    #[test]
    fn perfect_sheet_scores_one_hundred_percent() {
        let subjects: Vec<(String, Vec<(u32, &str)>)> = (0u32..5)
            .map(|s| {
                let name = format!("subject{s}");
                let questions = (1u32..=20).map(|q| (s * 20 + q, "A")).collect();
                (name, questions)
            })
            .collect();
        let borrowed: Vec<(&str, &[(u32, &str)])> = subjects
            .iter()
            .map(|(name, questions)| (name.as_str(), questions.as_slice()))
            .collect();
        let key = AnswerKey::from_json(&key_json(&borrowed, "{}")).unwrap();
        let (answers, confidences) = perfect_detection(&key);

        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, Some("student-1"))
            .unwrap();

        assert_eq!(result.total_questions, 100);
        assert_eq!(result.total_correct, 100);
        assert!((result.overall_percentage - 100.0).abs() < 1e-9);
        assert_eq!(result.overall_grade, "A+");
        for subject in &result.subject_results {
            assert_eq!(subject.grade, "A+");
            assert!((subject.raw_score - 20.0).abs() < 1e-9);
        }
    }

    #[test]
    fn unanswered_question_takes_the_penalty() {
        let key = AnswerKey::from_json(&key_json(
            &[("math", &[(1, "A")])],
            r#"{"math": {"unanswered_penalty": 0.5}}"#,
        ))
        .unwrap();
        let mut answers = BTreeMap::new();
        answers.insert(1, None);
        let mut confidences = BTreeMap::new();
        confidences.insert(1, 0.0);

        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, None)
            .unwrap();
        let question = &result.subject_results[0].question_results[0];

        assert_eq!(question.student_answer, None);
        assert!(!question.is_correct);
        assert!((question.points_earned + 0.5).abs() < 1e-9);
        assert_eq!(result.total_unanswered, 1);
    }

    #[test]
    fn correct_answers_match_case_insensitively() {
        let key = AnswerKey::from_json(&key_json(&[("math", &[(1, "a")])], "{}")).unwrap();
        let mut answers = BTreeMap::new();
        answers.insert(1, Some('A'));
        let mut confidences = BTreeMap::new();
        confidences.insert(1, 1.0);

        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, None)
            .unwrap();
        assert!(result.subject_results[0].question_results[0].is_correct);
    }

    #[test]
    fn very_low_confidence_halves_the_points_even_when_correct() {
        let key = AnswerKey::from_json(&key_json(
            &[("math", &[(1, "B"), (2, "C")])],
            r#"{"math": {"correct_points": 2.0, "incorrect_penalty": 1.0}}"#,
        ))
        .unwrap();
        let mut answers = BTreeMap::new();
        answers.insert(1, Some('B'));
        answers.insert(2, Some('A'));
        let mut confidences = BTreeMap::new();
        confidences.insert(1, 0.4);
        confidences.insert(2, 0.4);

        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, None)
            .unwrap();
        let questions = &result.subject_results[0].question_results;

        assert!((questions[0].points_earned - 1.0).abs() < 1e-9);
        assert!(questions[0]
            .notes
            .iter()
            .any(|n| n.contains("Low confidence detection")));
        assert!(questions[0]
            .notes
            .iter()
            .any(|n| n.contains("Score reduced")));
        assert!((questions[1].points_earned + 0.5).abs() < 1e-9);
    }

    #[test]
    fn subject_scores_clamp_to_rule_bounds() {
        let key = AnswerKey::from_json(&key_json(
            &[("math", &[(1, "A"), (2, "A"), (3, "A")])],
            r#"{"math": {"incorrect_penalty": 5.0, "min_score": 0.0, "max_score": 2.0}}"#,
        ))
        .unwrap();

        // All wrong: sum −15, clamps to min_score.
        let mut answers = BTreeMap::new();
        let mut confidences = BTreeMap::new();
        for q in 1..=3 {
            answers.insert(q, Some('B'));
            confidences.insert(q, 1.0);
        }
        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, None)
            .unwrap();
        assert_eq!(result.subject_results[0].raw_score, 0.0);

        // All right: sum 3, clamps to max_score.
        for q in 1..=3 {
            answers.insert(q, Some('A'));
        }
        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, None)
            .unwrap();
        assert_eq!(result.subject_results[0].raw_score, 2.0);
    }

    #[test]
    fn invalid_rule_bounds_fail_loudly() {
        let key = AnswerKey::from_json(&key_json(
            &[("math", &[(1, "A")])],
            r#"{"math": {"min_score": 10.0, "max_score": 5.0}}"#,
        ))
        .unwrap();
        let err = ScoreCalculator::new()
            .score(&key, &BTreeMap::new(), &BTreeMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, OmrError::InvalidRuleBounds { .. }));
    }

    #[test]
    fn question_zero_is_uncoverable() {
        let key = AnswerKey::from_json(&key_json(&[("math", &[(0, "A")])], "{}")).unwrap();
        let err = ScoreCalculator::new()
            .score(&key, &BTreeMap::new(), &BTreeMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, OmrError::UncoverableQuestion { .. }));
    }

    #[test]
    fn grade_table_boundaries() {
        assert_eq!(grade_for(100.0), "A+");
        assert_eq!(grade_for(95.0), "A+");
        assert_eq!(grade_for(94.999), "A");
        assert_eq!(grade_for(72.5), "B-");
        assert_eq!(grade_for(50.0), "D");
        assert_eq!(grade_for(49.999), "F");
        assert_eq!(grade_for(0.0), "F");
        assert_eq!(grade_for(-10.0), "F");
    }

    #[test]
    fn confidence_metrics_count_extremes() {
        let mut confidences = BTreeMap::new();
        for (q, c) in [(1, 0.5), (2, 0.95), (3, 0.9), (4, 0.85)] {
            confidences.insert(q, c);
        }
        let metrics = confidence_metrics(&confidences);
        assert!((metrics.average_confidence - 0.8).abs() < 1e-9);
        assert_eq!(metrics.min_confidence, 0.5);
        assert_eq!(metrics.max_confidence, 0.95);
        assert_eq!(metrics.low_confidence_count, 1);
        assert_eq!(metrics.high_confidence_count, 2);
    }

    #[test]
    fn diagnostics_flag_sparse_and_misaligned_sheets() {
        let key = AnswerKey::from_json(&key_json(
            &[
                ("math", &[(1, "A"), (2, "A"), (3, "A"), (4, "A"), (5, "A")]),
                ("physics", &[(6, "B"), (7, "B")]),
            ],
            "{}",
        ))
        .unwrap();
        let mut answers = BTreeMap::new();
        let mut confidences = BTreeMap::new();
        // Everything wrong or missing: both subjects under 40%, most
        // questions unanswered.
        for q in 1..=7 {
            answers.insert(q, None);
            confidences.insert(q, 0.0);
        }
        answers.insert(1, Some('B'));
        confidences.insert(1, 1.0);

        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, None)
            .unwrap();
        let notes = &result.processing_notes;
        assert!(notes.iter().any(|n| n.contains("low confidence detection")));
        assert!(notes.iter().any(|n| n.contains("questions unanswered")));
        assert!(notes.iter().any(|n| n.contains("check image quality")));
        assert!(notes.iter().any(|n| n.contains("verify answer key alignment")));
    }

    #[test]
    fn json_export_round_trips_every_scoring_field() {
        let key = AnswerKey::from_json(&key_json(
            &[("math", &[(1, "A"), (2, "B")])],
            r#"{"math": {"incorrect_penalty": 0.25}}"#,
        ))
        .unwrap();
        let mut answers = BTreeMap::new();
        answers.insert(1, Some('A'));
        answers.insert(2, Some('C'));
        let mut confidences = BTreeMap::new();
        confidences.insert(1, 0.95);
        confidences.insert(2, 0.45);

        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, Some("s-42"))
            .unwrap();
        let json = serde_json::to_string_pretty(&result).unwrap();
        let reparsed: OverallResult = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed, result);
    }

    #[test]
    fn csv_has_one_row_per_question() {
        let key = AnswerKey::from_json(&key_json(
            &[("math", &[(1, "A"), (2, "B")]), ("physics", &[(3, "C")])],
            "{}",
        ))
        .unwrap();
        let (answers, confidences) = perfect_detection(&key);
        let result = ScoreCalculator::new()
            .score(&key, &answers, &confidences, None)
            .unwrap();

        let csv = render_csv(&result);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 1 + result.total_questions);
        assert_eq!(
            lines[0],
            "Question,Subject,CorrectAnswer,StudentAnswer,IsCorrect,PointsEarned,Confidence,Notes"
        );
        assert!(lines[1].starts_with("1,math,A,A,true,1,1.000"));
    }

    #[test]
    fn csv_quotes_fields_containing_separators() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    proptest! {
        #[test]
        fn grades_are_monotonic(a in -20.0f64..120.0, b in -20.0f64..120.0) {
            let rank = |grade: &str| {
                GRADE_BOUNDARIES
                    .iter()
                    .position(|(g, _)| *g == grade)
                    .unwrap()
            };
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            // Lower rank index means a better grade.
            prop_assert!(rank(grade_for(high)) <= rank(grade_for(low)));
        }

        #[test]
        fn clamped_subject_scores_respect_bounds(
            outcomes in proptest::collection::vec(0u8..3, 1..30),
            penalty in 0.0f64..5.0,
        ) {
            let mut rule = ScoringRule::default();
            rule.incorrect_penalty = penalty;
            rule.unanswered_penalty = penalty / 2.0;

            let mut subject_answers = BTreeMap::new();
            let mut answers = BTreeMap::new();
            let mut confidences = BTreeMap::new();
            for (i, outcome) in outcomes.iter().enumerate() {
                let question = i as u32 + 1;
                subject_answers.insert(question, "A".to_string());
                let detected = match outcome {
                    0 => Some('A'),
                    1 => Some('B'),
                    _ => None,
                };
                answers.insert(question, detected);
                confidences.insert(question, 1.0);
            }

            let result = score_subject("s", &subject_answers, &rule, &answers, &confidences);
            prop_assert!(result.raw_score >= rule.min_score);
            prop_assert!(result.raw_score <= rule.max_score);
        }
    }
}
