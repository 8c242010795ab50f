use std::cmp::Ordering;

use image::GrayImage;
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use log::{info, warn};
use logging_timer::time;
use serde::{Deserialize, Serialize};

use crate::image_utils::{intensity_stddev, invert, laplacian_variance, BLACK, WHITE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateMatcherConfig {
    /// Minimum normalized cross-correlation for an alignment-mark hit.
    pub match_threshold: f32,
    /// Side length of the synthetic filled-square mark template; also the
    /// non-maximum-suppression distance.
    pub mark_size: u32,
    pub expected_marks: usize,
    /// Overall confidence below this fails format validation.
    pub min_confidence: f64,
}

impl Default for TemplateMatcherConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.7,
            mark_size: 15,
            expected_marks: 4,
            min_confidence: 0.6,
        }
    }
}

/// An alignment-mark detection: the matched template window's top-left
/// corner and its correlation score. Transient, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentMark {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub confidence: f64,
}

/// Nominal pixel region holding one question's bubbles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnswerRegion {
    pub question_number: u32,
    pub row: u32,
    pub column: u32,
    pub rect: Rect,
}

/// Locates printed alignment marks by correlation and judges whether a sheet
/// matches the supported format. Findings are advisory: validation lowers a
/// confidence scalar and lists issues, it never aborts processing.
pub struct TemplateMatcher {
    config: TemplateMatcherConfig,
}

impl TemplateMatcher {
    pub fn new(config: TemplateMatcherConfig) -> Self {
        Self { config }
    }

    fn alignment_template(&self) -> GrayImage {
        let size = self.config.mark_size;
        let mut template = GrayImage::from_pixel(size, size, BLACK);
        draw_filled_rect_mut(
            &mut template,
            Rect::at(2, 2).of_size(size - 4, size - 4),
            WHITE,
        );
        template
    }

    /// Correlates the ink-inverted sheet against the filled-square template
    /// and collapses clustered hits with non-maximum suppression.
    #[time]
    pub fn find_alignment_marks(&self, image: &GrayImage) -> Vec<AlignmentMark> {
        let size = self.config.mark_size;
        if image.width() < size || image.height() < size {
            return Vec::new();
        }

        let inverted = invert(image);
        let template = self.alignment_template();
        let scores = match_template(
            &inverted,
            &template,
            MatchTemplateMethod::CrossCorrelationNormalized,
        );

        let mut candidates = Vec::new();
        for (x, y, pixel) in scores.enumerate_pixels() {
            let score = pixel.0[0];
            if score >= self.config.match_threshold {
                candidates.push(AlignmentMark { x, y, score });
            }
        }

        let marks = non_max_suppression(candidates, f64::from(size));
        info!("found {} alignment marks", marks.len());
        marks
    }

    /// Angle of the top edge of the sheet, from the two topmost alignment
    /// marks, folded into [−45°, 45°). Fewer than two marks means the
    /// orientation cannot be estimated and defaults to 0.
    pub fn estimate_orientation(&self, image: &GrayImage) -> f64 {
        let mut marks = self.find_alignment_marks(image);
        if marks.len() < 2 {
            warn!("insufficient alignment marks for orientation estimate");
            return 0.0;
        }
        marks.sort_by_key(|m| (m.y, m.x));

        let (first, second) = (marks[0], marks[1]);
        let dx = f64::from(second.x) - f64::from(first.x);
        let dy = f64::from(second.y) - f64::from(first.y);
        let mut angle = dy.atan2(dx).to_degrees();
        while angle >= 45.0 {
            angle -= 90.0;
        }
        while angle < -45.0 {
            angle += 90.0;
        }
        angle
    }

    /// Nominal answer-region layout: the middle 60% of the height by the
    /// middle 80% of the width, subdivided evenly. Purely fractional, used
    /// when alignment marks cannot drive the geometry.
    pub fn detect_answer_regions(
        &self,
        image: &GrayImage,
        num_questions: u32,
        questions_per_row: u32,
    ) -> Vec<AnswerRegion> {
        if num_questions == 0 || questions_per_row == 0 {
            return Vec::new();
        }
        let (width, height) = image.dimensions();
        let num_rows = (num_questions + questions_per_row - 1) / questions_per_row;

        let start_y = (f64::from(height) * 0.2) as i32;
        let end_y = (f64::from(height) * 0.8) as i32;
        let start_x = (f64::from(width) * 0.1) as i32;
        let end_x = (f64::from(width) * 0.9) as i32;
        let row_height = ((end_y - start_y) as u32 / num_rows).max(1);
        let question_width = ((end_x - start_x) as u32 / questions_per_row).max(1);

        let mut regions = Vec::with_capacity(num_questions as usize);
        'rows: for row in 0..num_rows {
            for column in 0..questions_per_row {
                let question_number = row * questions_per_row + column + 1;
                if question_number > num_questions {
                    break 'rows;
                }
                let x = start_x + (column * question_width) as i32;
                let y = start_y + (row * row_height) as i32;
                regions.push(AnswerRegion {
                    question_number,
                    row,
                    column,
                    rect: Rect::at(x, y).of_size(question_width, row_height),
                });
            }
        }
        regions
    }

    /// Validates the sheet against the expected format: aspect ratio, mark
    /// count, contrast, and sharpness each multiply an independent penalty
    /// into one confidence scalar. Every failing check is listed.
    #[time]
    pub fn validate_format(&self, image: &GrayImage) -> FormatReport {
        let mut issues = Vec::new();
        let mut confidence = 1.0f64;

        let (width, height) = image.dimensions();
        let aspect_ratio = f64::from(width) / f64::from(height);
        if !(0.5..=1.2).contains(&aspect_ratio) {
            issues.push(format!("unusual aspect ratio: {aspect_ratio:.2}"));
            confidence *= 0.8;
        }

        let marks = self.find_alignment_marks(image);
        if marks.len() < self.config.expected_marks {
            issues.push(format!(
                "found {} alignment marks, expected {}",
                marks.len(),
                self.config.expected_marks
            ));
            confidence *= 0.7;
        }

        let stddev = intensity_stddev(image);
        if stddev < 30.0 {
            issues.push("low image contrast detected".to_string());
            confidence *= 0.9;
        }

        let sharpness = laplacian_variance(image);
        if sharpness < 100.0 {
            issues.push("image appears blurry".to_string());
            confidence *= 0.8;
        }

        let is_valid = confidence >= self.config.min_confidence;
        if issues.is_empty() {
            info!("sheet format validation passed");
        } else {
            warn!("sheet validation issues: {issues:?}");
        }
        FormatReport {
            is_valid,
            issues,
            confidence,
        }
    }

    /// The student-information band across the top 15% of the sheet.
    pub fn student_info_region(&self, image: &GrayImage) -> GrayImage {
        let (width, height) = image.dimensions();
        let band = (height * 15 / 100).max(1);
        image::imageops::crop_imm(image, 0, 0, width, band).to_image()
    }
}

/// Greedy non-maximum suppression: accept candidates in descending score
/// order, rejecting any within `min_distance` of an accepted point.
pub fn non_max_suppression(
    mut candidates: Vec<AlignmentMark>,
    min_distance: f64,
) -> Vec<AlignmentMark> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<AlignmentMark> = Vec::new();
    for candidate in candidates {
        let far_enough = kept.iter().all(|k| {
            let dx = f64::from(candidate.x) - f64::from(k.x);
            let dy = f64::from(candidate.y) - f64::from(k.y);
            (dx * dx + dy * dy).sqrt() >= min_distance
        });
        if far_enough {
            kept.push(candidate);
        }
    }
    kept
}
