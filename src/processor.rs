use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use log::{error, info, warn};
use logging_timer::time;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::answer_key::AnswerKey;
use crate::bubble_detector::{BubbleDetector, BubbleDetectorConfig};
use crate::debug::ImageDebugWriter;
use crate::error::{ErrorKind, OmrError};
use crate::image_processor::{ImageProcessor, ImageProcessorConfig};
use crate::score_calculator::{OverallResult, ScoreCalculator};
use crate::template_matcher::{FormatReport, TemplateMatcher, TemplateMatcherConfig};

/// One immutable configuration value for the whole pipeline, passed to each
/// component at construction. No global state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OmrConfig {
    pub image_processor: ImageProcessorConfig,
    pub template_matcher: TemplateMatcherConfig,
    pub bubble_detector: BubbleDetectorConfig,
    /// Sheet layout: how many questions sit side by side in one bubble row.
    pub questions_per_row: usize,
    pub options_per_question: usize,
    /// Write intermediate debug images next to each input file.
    pub debug: bool,
}

impl Default for OmrConfig {
    fn default() -> Self {
        Self {
            image_processor: ImageProcessorConfig::default(),
            template_matcher: TemplateMatcherConfig::default(),
            bubble_detector: BubbleDetectorConfig::default(),
            questions_per_row: 5,
            options_per_question: 4,
            debug: false,
        }
    }
}

/// Cooperative cancellation flag, checked at stage boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Load,
    Validate,
    Normalize,
    Detect,
    Score,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub total_bubbles: usize,
    pub rows_detected: usize,
    pub questions_answered: usize,
    pub questions_unanswered: usize,
    pub average_confidence: f64,
}

/// Terminal state of one sheet: either a full scored result or a structured
/// failure. Nothing in between is ever surfaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SheetOutcome {
    Completed {
        validation: FormatReport,
        orientation_degrees: f64,
        detection: DetectionSummary,
        scoring: OverallResult,
        answers: BTreeMap<u32, Option<char>>,
        confidences: BTreeMap<u32, f64>,
        notes: Vec<String>,
    },
    Failed {
        stage: ProcessingStage,
        kind: ErrorKind,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetReport {
    pub image_path: PathBuf,
    pub student_id: Option<String>,
    pub processing_time_seconds: f64,
    pub outcome: SheetOutcome,
}

impl SheetReport {
    /// The explicit success flag callers must branch on before trusting a
    /// score.
    pub fn success(&self) -> bool {
        matches!(self.outcome, SheetOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_sheets: usize,
    pub successful_processing: usize,
    pub failed_processing: usize,
    pub success_rate: f64,
    pub reports: Vec<SheetReport>,
    pub statistics: ProcessingStatistics,
}

/// Running counters over processed sheets, with an incremental mean of
/// processing time. An explicit value: updated by a single owner or merged
/// after the fact, never shared mutably.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatistics {
    pub total_processed: usize,
    pub successful_processing: usize,
    pub failed_processing: usize,
    pub average_processing_time_seconds: f64,
}

impl ProcessingStatistics {
    /// One update per completed sheet, success or failure.
    pub fn record(&mut self, seconds: f64, success: bool) {
        self.total_processed += 1;
        if success {
            self.successful_processing += 1;
        } else {
            self.failed_processing += 1;
        }
        let n = self.total_processed as f64;
        self.average_processing_time_seconds =
            (self.average_processing_time_seconds * (n - 1.0) + seconds) / n;
    }

    pub fn merge(&mut self, other: &ProcessingStatistics) {
        let total = self.total_processed + other.total_processed;
        if total == 0 {
            return;
        }
        self.average_processing_time_seconds = (self.average_processing_time_seconds
            * self.total_processed as f64
            + other.average_processing_time_seconds * other.total_processed as f64)
            / total as f64;
        self.total_processed = total;
        self.successful_processing += other.successful_processing;
        self.failed_processing += other.failed_processing;
    }
}

pub fn load_sheet_image(path: &Path) -> Result<DynamicImage, OmrError> {
    image::open(path)
        .map_err(|e| OmrError::UnreadableImage(format!("{}: {}", path.display(), e)))
}

#[allow(dead_code)]
pub fn load_sheet_image_from_bytes(bytes: &[u8]) -> Result<DynamicImage, OmrError> {
    image::load_from_memory(bytes)
        .map_err(|e| OmrError::UnreadableImage(format!("in-memory buffer: {e}")))
}

/// Sequences the pipeline for one sheet or a batch: Load → Validate
/// (advisory) → Normalize → Detect → Score, collapsing to a structured
/// failure from any stage. One sheet's failure never aborts a batch.
pub struct OmrProcessor {
    config: OmrConfig,
    image_processor: ImageProcessor,
    template_matcher: TemplateMatcher,
    bubble_detector: BubbleDetector,
    score_calculator: ScoreCalculator,
}

impl OmrProcessor {
    pub fn new(config: OmrConfig) -> Self {
        Self {
            config,
            image_processor: ImageProcessor::new(config.image_processor),
            template_matcher: TemplateMatcher::new(config.template_matcher),
            bubble_detector: BubbleDetector::new(config.bubble_detector),
            score_calculator: ScoreCalculator::new(),
        }
    }

    pub fn process_sheet(
        &self,
        image_path: &Path,
        key: &AnswerKey,
        student_id: Option<&str>,
    ) -> SheetReport {
        self.process_sheet_with_cancel(image_path, key, student_id, &CancelToken::new())
    }

    #[time]
    pub fn process_sheet_with_cancel(
        &self,
        image_path: &Path,
        key: &AnswerKey,
        student_id: Option<&str>,
        cancel: &CancelToken,
    ) -> SheetReport {
        let start = Instant::now();
        info!("processing sheet {}", image_path.display());

        let outcome = match self.run_pipeline(image_path, key, student_id, cancel) {
            Ok(outcome) => outcome,
            Err((stage, e)) => {
                error!("sheet {} failed at {:?}: {}", image_path.display(), stage, e);
                SheetOutcome::Failed {
                    stage,
                    kind: e.kind(),
                    error: e.to_string(),
                }
            }
        };

        SheetReport {
            image_path: image_path.to_path_buf(),
            student_id: student_id.map(String::from),
            processing_time_seconds: start.elapsed().as_secs_f64(),
            outcome,
        }
    }

    fn run_pipeline(
        &self,
        image_path: &Path,
        key: &AnswerKey,
        student_id: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<SheetOutcome, (ProcessingStage, OmrError)> {
        ensure_active(cancel, ProcessingStage::Load)?;
        let image = load_sheet_image(image_path).map_err(|e| (ProcessingStage::Load, e))?;
        let gray = image.to_luma8();

        ensure_active(cancel, ProcessingStage::Validate)?;
        let validation = self.template_matcher.validate_format(&gray);
        if !validation.is_valid {
            warn!("sheet format validation failed: {:?}", validation.issues);
        }
        let orientation_degrees = self.template_matcher.estimate_orientation(&gray);

        ensure_active(cancel, ProcessingStage::Normalize)?;
        let debug_writer = if self.config.debug {
            ImageDebugWriter::new(image_path.to_path_buf())
        } else {
            ImageDebugWriter::disabled()
        };
        let normalized = self.image_processor.normalize(&image, &debug_writer);

        ensure_active(cancel, ProcessingStage::Detect)?;
        let detection = self.bubble_detector.detect(
            &normalized,
            self.config.questions_per_row,
            self.config.options_per_question,
            &debug_writer,
        );
        if debug_writer.is_enabled() {
            let regions = self.template_matcher.detect_answer_regions(
                &normalized,
                key.total_questions() as u32,
                self.config.questions_per_row as u32,
            );
            debug_writer.write_region_overlay("regions", &normalized, &regions);
            debug_writer.write_gray(
                "student_info",
                &self.template_matcher.student_info_region(&normalized),
            );
        }

        ensure_active(cancel, ProcessingStage::Score)?;
        let scoring = self
            .score_calculator
            .score(key, &detection.answers, &detection.confidences, student_id)
            .map_err(|e| (ProcessingStage::Score, e))?;

        let questions_answered = detection.answers.values().filter(|a| a.is_some()).count();
        let summary = DetectionSummary {
            total_bubbles: detection.total_bubbles,
            rows_detected: detection.rows_detected,
            questions_answered,
            questions_unanswered: detection.answers.len() - questions_answered,
            average_confidence: if detection.confidences.is_empty() {
                0.0
            } else {
                detection.confidences.values().sum::<f64>() / detection.confidences.len() as f64
            },
        };
        let mut notes = detection.notes;
        notes.extend(validation.issues.iter().cloned());

        Ok(SheetOutcome::Completed {
            validation,
            orientation_degrees,
            detection: summary,
            scoring,
            answers: detection.answers,
            confidences: detection.confidences,
            notes,
        })
    }

    /// Sheets are independent: they share only the read-only answer key, so
    /// the batch fans out on rayon and folds statistics afterwards through
    /// this single owner.
    #[time]
    pub fn process_batch(
        &self,
        image_paths: &[PathBuf],
        key: &AnswerKey,
        student_ids: Option<&[String]>,
    ) -> BatchSummary {
        info!("starting batch processing of {} sheets", image_paths.len());
        if let Some(ids) = student_ids {
            if ids.len() != image_paths.len() {
                warn!(
                    "{} student ids for {} sheets, matching by index",
                    ids.len(),
                    image_paths.len()
                );
            }
        }

        let reports: Vec<SheetReport> = image_paths
            .par_iter()
            .enumerate()
            .map(|(i, path)| {
                let student_id = student_ids.and_then(|ids| ids.get(i)).map(String::as_str);
                self.process_sheet(path, key, student_id)
            })
            .collect();

        let mut statistics = ProcessingStatistics::default();
        for report in &reports {
            statistics.record(report.processing_time_seconds, report.success());
        }

        let total_sheets = reports.len();
        let successful_processing = statistics.successful_processing;
        let failed_processing = statistics.failed_processing;
        let success_rate = if total_sheets > 0 {
            successful_processing as f64 / total_sheets as f64 * 100.0
        } else {
            0.0
        };
        info!(
            "batch processing completed: {}/{} successful",
            successful_processing, total_sheets
        );

        BatchSummary {
            total_sheets,
            successful_processing,
            failed_processing,
            success_rate,
            reports,
            statistics,
        }
    }

    /// Writes the scoring exports (JSON and CSV) plus the full sheet report
    /// into `dir`. A side effect performed after scoring, never interleaved
    /// with detection.
    pub fn write_sheet_exports(&self, report: &SheetReport, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let stem = report
            .image_path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();

        if let SheetOutcome::Completed { scoring, .. } = &report.outcome {
            self.score_calculator
                .export_json(scoring, &dir.join(format!("{stem}_results.json")))?;
            self.score_calculator
                .export_csv(scoring, &dir.join(format!("{stem}_results.csv")))?;
        }

        let json = serde_json::to_string_pretty(report)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(format!("{stem}_report.json")), json)
    }

    pub fn write_batch_exports(&self, summary: &BatchSummary, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        for report in &summary.reports {
            self.write_sheet_exports(report, dir)?;
        }
        let json = serde_json::to_string_pretty(summary)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let path = dir.join("batch_summary.json");
        fs::write(&path, json)?;
        info!("batch summary saved to {}", path.display());
        Ok(())
    }
}

fn ensure_active(
    cancel: &CancelToken,
    stage: ProcessingStage,
) -> Result<(), (ProcessingStage, OmrError)> {
    if cancel.is_cancelled() {
        Err((stage, OmrError::Cancelled))
    } else {
        Ok(())
    }
}
