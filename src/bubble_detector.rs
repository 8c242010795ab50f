use std::collections::BTreeMap;

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::adaptive_threshold;
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{close, open};
use imageproc::point::Point;
use imageproc::rect::Rect;
use log::{debug, info};
use logging_timer::time;
use serde::{Deserialize, Serialize};

use crate::debug::ImageDebugWriter;
use crate::geometry::{circularity, contour_area, contour_bounding_rect, contour_perimeter};
use crate::image_utils::{invert, WHITE};

const BLUR_SIGMA: f32 = 1.0;
const THRESHOLD_BLOCK_RADIUS: u32 = 5;
/// Confidence multiplier applied when several bubbles are marked for one
/// question.
const MULTI_MARK_PENALTY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BubbleDetectorConfig {
    /// Contour area bounds for a plausible bubble.
    pub min_bubble_area: f64,
    pub max_bubble_area: f64,
    /// Minimum fill fraction to classify a bubble as marked.
    pub fill_threshold: f64,
    /// Allowed deviation of the bounding-box aspect ratio from 1.0.
    pub aspect_ratio_tolerance: f64,
    pub min_circularity: f64,
    /// Vertical distance (pixels) within which bubbles belong to one row.
    pub row_tolerance: i32,
}

impl Default for BubbleDetectorConfig {
    fn default() -> Self {
        Self {
            min_bubble_area: 100.0,
            max_bubble_area: 2000.0,
            fill_threshold: 0.6,
            aspect_ratio_tolerance: 0.3,
            min_circularity: 0.3,
            row_tolerance: 20,
        }
    }
}

/// A bubble-shaped contour with its fill state. Created per detection pass
/// and discarded once answers are extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct BubbleCandidate {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub area: f64,
    pub fill_fraction: f64,
    pub filled: bool,
}

/// Detected answers keyed by question number, with per-question confidence
/// and detection diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub answers: BTreeMap<u32, Option<char>>,
    pub confidences: BTreeMap<u32, f64>,
    pub total_bubbles: usize,
    pub rows_detected: usize,
    pub multi_marked: usize,
    pub unanswered: usize,
    pub notes: Vec<String>,
}

/// Finds answer bubbles in a normalized sheet and resolves them to one
/// detected answer per question. Anomalies (no bubbles, several marks,
/// unanswered questions) are diagnostics, never errors.
pub struct BubbleDetector {
    config: BubbleDetectorConfig,
}

impl BubbleDetector {
    pub fn new(config: BubbleDetectorConfig) -> Self {
        Self { config }
    }

    #[time]
    pub fn detect(
        &self,
        image: &GrayImage,
        questions_per_row: usize,
        options_per_question: usize,
        debug_writer: &ImageDebugWriter,
    ) -> DetectionReport {
        info!("starting bubble detection");

        let binary = self.binarize(image);
        debug_writer.write_gray("binarized", &binary);

        let candidates = self.find_bubble_candidates(image, &binary);
        info!("found {} bubble candidates", candidates.len());

        let rows = group_into_rows(candidates, self.config.row_tolerance);
        debug!("grouped bubbles into {} rows", rows.len());
        debug_writer.write_bubble_overlay("bubbles", image, &rows);

        let report = extract_answers(&rows, questions_per_row, options_per_question);
        info!("detection complete: {} questions processed", report.answers.len());
        report
    }

    /// Adaptive binarization with ink as foreground, followed by a
    /// morphological close and open to drop speckle.
    pub fn binarize(&self, image: &GrayImage) -> GrayImage {
        let blurred = gaussian_blur_f32(image, BLUR_SIGMA);
        let binary = invert(&adaptive_threshold(&blurred, THRESHOLD_BLOCK_RADIUS));
        open(&close(&binary, Norm::LInf, 1), Norm::LInf, 1)
    }

    pub fn find_bubble_candidates(
        &self,
        image: &GrayImage,
        binary: &GrayImage,
    ) -> Vec<BubbleCandidate> {
        let contours: Vec<Contour<i32>> = find_contours(binary);

        let mut candidates = Vec::new();
        for contour in &contours {
            if contour.border_type != BorderType::Outer || contour.parent.is_some() {
                continue;
            }

            let area = contour_area(&contour.points);
            if area < self.config.min_bubble_area || area > self.config.max_bubble_area {
                continue;
            }

            let bounds = contour_bounding_rect(&contour.points);
            let aspect_ratio = f64::from(bounds.width()) / f64::from(bounds.height());
            if (aspect_ratio - 1.0).abs() > self.config.aspect_ratio_tolerance {
                continue;
            }

            let perimeter = contour_perimeter(&contour.points);
            if circularity(area, perimeter) < self.config.min_circularity {
                continue;
            }

            let fill_fraction = fill_fraction(image, &contour.points, bounds);
            let candidate = BubbleCandidate {
                x: bounds.left(),
                y: bounds.top(),
                width: bounds.width(),
                height: bounds.height(),
                area,
                fill_fraction,
                filled: fill_fraction >= self.config.fill_threshold,
            };
            debug!(
                "bubble candidate at ({}, {}) area {:.0} fill {:.2}",
                candidate.x, candidate.y, candidate.area, candidate.fill_fraction
            );
            candidates.push(candidate);
        }
        candidates
    }
}

/// Mean darkness of the contour-masked region of the grayscale image:
/// `1 − mean_intensity/255`.
fn fill_fraction(image: &GrayImage, points: &[Point<i32>], bounds: Rect) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }

    let shifted: Vec<Point<i32>> = points
        .iter()
        .map(|p| Point::new(p.x - bounds.left(), p.y - bounds.top()))
        .collect();
    let polygon = if shifted.first() == shifted.last() {
        &shifted[..shifted.len() - 1]
    } else {
        &shifted[..]
    };
    if polygon.len() < 3 {
        return 0.0;
    }

    let mut mask = GrayImage::new(bounds.width(), bounds.height());
    draw_polygon_mut(&mut mask, polygon, WHITE);

    let mut sum = 0u64;
    let mut count = 0u64;
    for (x, y, mask_pixel) in mask.enumerate_pixels() {
        if mask_pixel.0[0] == 0 {
            continue;
        }
        let ix = (bounds.left() + x as i32) as u32;
        let iy = (bounds.top() + y as i32) as u32;
        sum += u64::from(image.get_pixel(ix, iy).0[0]);
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    1.0 - (sum as f64 / count as f64) / 255.0
}

/// Groups candidates into horizontal bands: sorted by y, a new row starts
/// whenever a candidate strays from the row's reference y by more than the
/// tolerance. Rows are sorted by x internally.
pub fn group_into_rows(
    mut candidates: Vec<BubbleCandidate>,
    row_tolerance: i32,
) -> Vec<Vec<BubbleCandidate>> {
    if candidates.is_empty() {
        return Vec::new();
    }
    candidates.sort_by_key(|c| c.y);

    let mut rows = Vec::new();
    let mut current = vec![candidates[0].clone()];
    let mut reference_y = candidates[0].y;

    for candidate in candidates.into_iter().skip(1) {
        if (candidate.y - reference_y).abs() <= row_tolerance {
            current.push(candidate);
        } else {
            current.sort_by_key(|c| c.x);
            rows.push(current);
            reference_y = candidate.y;
            current = vec![candidate];
        }
    }
    current.sort_by_key(|c| c.x);
    rows.push(current);
    rows
}

/// Partitions each row evenly into question groups and resolves each group
/// to a detected answer. Rows whose length is not an exact multiple of
/// `questions_per_row` have their trailing bubbles dropped, with a
/// diagnostic note.
pub fn extract_answers(
    rows: &[Vec<BubbleCandidate>],
    questions_per_row: usize,
    options_per_question: usize,
) -> DetectionReport {
    let mut report = DetectionReport {
        total_bubbles: rows.iter().map(Vec::len).sum(),
        rows_detected: rows.len(),
        ..DetectionReport::default()
    };
    if questions_per_row == 0 {
        report.notes.push("questions_per_row is zero, nothing to extract".to_string());
        return report;
    }

    for (row_index, row) in rows.iter().enumerate() {
        let bubbles_per_question = row.len() / questions_per_row;
        let remainder = row.len() % questions_per_row;
        if remainder != 0 {
            report.notes.push(format!(
                "row {}: {} trailing bubble(s) ignored by even partitioning",
                row_index + 1,
                remainder
            ));
        }

        for question_index in 0..questions_per_row {
            let question = (row_index * questions_per_row + question_index + 1) as u32;
            let start = question_index * bubbles_per_question;
            let group = &row[start..start + bubbles_per_question];
            if !group.is_empty() && group.len() != options_per_question {
                report.notes.push(format!(
                    "question {}: expected {} options, found {}",
                    question,
                    options_per_question,
                    group.len()
                ));
            }

            let filled: Vec<(usize, &BubbleCandidate)> = group
                .iter()
                .enumerate()
                .filter(|(_, bubble)| bubble.filled)
                .collect();

            match filled.as_slice() {
                [] => {
                    report.answers.insert(question, None);
                    report.confidences.insert(question, 0.0);
                    report.unanswered += 1;
                }
                [(index, bubble)] => {
                    report.answers.insert(question, Some(option_letter(*index)));
                    report.confidences.insert(question, bubble.fill_fraction);
                }
                _ => {
                    let (index, bubble) = filled
                        .iter()
                        .max_by(|a, b| {
                            a.1.fill_fraction
                                .partial_cmp(&b.1.fill_fraction)
                                .expect("fill fractions are finite")
                        })
                        .expect("at least two filled bubbles");
                    report.answers.insert(question, Some(option_letter(*index)));
                    report
                        .confidences
                        .insert(question, bubble.fill_fraction * MULTI_MARK_PENALTY);
                    report.multi_marked += 1;
                }
            }
        }
    }

    if report.total_bubbles == 0 {
        report
            .notes
            .push("no bubbles detected - check image quality".to_string());
    }
    if report.multi_marked > 0 {
        report
            .notes
            .push(format!("{} questions had multiple marks", report.multi_marked));
    }
    if report.unanswered > 0 {
        report
            .notes
            .push(format!("{} questions were not answered", report.unanswered));
    }
    report
}

fn option_letter(index: usize) -> char {
    (b'A' + (index as u8).min(25)) as char
}

#[cfg(test)]
mod tests {
    use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};

    use super::*;
    use crate::image_utils::BLACK;

    fn bubble(x: i32, y: i32, fill_fraction: f64) -> BubbleCandidate {
        BubbleCandidate {
            x,
            y,
            width: 24,
            height: 24,
            area: 450.0,
            fill_fraction,
            filled: fill_fraction >= 0.6,
        }
    }

    #[test]
    fn single_mark_keeps_its_raw_fill_as_confidence() {
        let rows = vec![vec![
            bubble(0, 0, 0.1),
            bubble(40, 0, 0.2),
            bubble(80, 0, 0.9),
            bubble(120, 0, 0.15),
        ]];
        let report = extract_answers(&rows, 1, 4);
        assert_eq!(report.answers[&1], Some('C'));
        assert!((report.confidences[&1] - 0.9).abs() < 1e-9);
        assert_eq!(report.unanswered, 0);
        assert_eq!(report.multi_marked, 0);
    }

    #[test]
    fn competing_marks_resolve_to_the_darker_bubble_with_a_penalty() {
        let rows = vec![vec![
            bubble(0, 0, 0.2),
            bubble(40, 0, 0.9),
            bubble(80, 0, 0.1),
            bubble(120, 0, 0.7),
        ]];
        let report = extract_answers(&rows, 1, 4);
        assert_eq!(report.answers[&1], Some('B'));
        assert!((report.confidences[&1] - 0.72).abs() < 1e-9);
        assert_eq!(report.multi_marked, 1);
        assert!(report
            .notes
            .iter()
            .any(|n| n.contains("multiple marks")));
    }

    #[test]
    fn empty_group_reports_no_answer_with_zero_confidence() {
        let rows = vec![vec![
            bubble(0, 0, 0.1),
            bubble(40, 0, 0.2),
            bubble(80, 0, 0.3),
            bubble(120, 0, 0.15),
        ]];
        let report = extract_answers(&rows, 1, 4);
        assert_eq!(report.answers[&1], None);
        assert_eq!(report.confidences[&1], 0.0);
        assert_eq!(report.unanswered, 1);
    }

    #[test]
    fn uneven_rows_drop_trailing_bubbles_with_a_note() {
        let mut row = Vec::new();
        for i in 0..9 {
            row.push(bubble(i * 40, 0, if i == 0 { 0.9 } else { 0.1 }));
        }
        let report = extract_answers(&[row], 2, 4);
        assert_eq!(report.answers.len(), 2);
        assert_eq!(report.answers[&1], Some('A'));
        assert!(report.notes.iter().any(|n| n.contains("trailing bubble")));
    }

    #[test]
    fn rows_split_on_vertical_distance_and_sort_by_x() {
        let candidates = vec![
            bubble(80, 12, 0.0),
            bubble(40, 10, 0.0),
            bubble(0, 40, 0.0),
        ];
        let rows = group_into_rows(candidates, 20);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[0][0].x, 40);
        assert_eq!(rows[0][1].x, 80);
        assert_eq!(rows[1][0].x, 0);
    }

    fn draw_answer_row(image: &mut GrayImage, centers: &[(i32, bool)], cy: i32) {
        for &(cx, filled) in centers {
            if filled {
                draw_filled_circle_mut(image, (cx, cy), 14, BLACK);
            } else {
                draw_hollow_circle_mut(image, (cx, cy), 14, BLACK);
                draw_hollow_circle_mut(image, (cx, cy), 13, BLACK);
            }
        }
    }

    #[test]
    fn detects_marked_options_on_a_synthetic_sheet() {
        let mut image = GrayImage::from_pixel(400, 120, WHITE);
        draw_answer_row(
            &mut image,
            &[
                (40, false),
                (80, true),
                (120, false),
                (160, false),
                (240, true),
                (280, false),
                (320, false),
                (360, false),
            ],
            60,
        );

        let detector = BubbleDetector::new(BubbleDetectorConfig::default());
        let report = detector.detect(&image, 2, 4, &ImageDebugWriter::disabled());

        assert_eq!(report.rows_detected, 1);
        assert_eq!(report.total_bubbles, 8);
        assert_eq!(report.answers[&1], Some('B'));
        assert_eq!(report.answers[&2], Some('A'));
        assert!(report.confidences[&1] > 0.6);
        assert_eq!(report.unanswered, 0);
    }

    #[test]
    fn blank_sheet_yields_a_quality_warning() {
        let image = GrayImage::from_pixel(200, 200, WHITE);
        let detector = BubbleDetector::new(BubbleDetectorConfig::default());
        let report = detector.detect(&image, 5, 4, &ImageDebugWriter::disabled());

        assert_eq!(report.total_bubbles, 0);
        assert!(report.answers.is_empty());
        assert!(report
            .notes
            .iter()
            .any(|n| n.contains("check image quality")));
    }

    #[test]
    fn detected_confidences_stay_in_unit_range() {
        let mut image = GrayImage::from_pixel(400, 120, WHITE);
        draw_answer_row(
            &mut image,
            &[(40, true), (80, true), (120, false), (160, false)],
            60,
        );

        let detector = BubbleDetector::new(BubbleDetectorConfig::default());
        let report = detector.detect(&image, 1, 4, &ImageDebugWriter::disabled());
        for confidence in report.confidences.values() {
            assert!((0.0..=1.0).contains(confidence));
        }
        assert_eq!(report.multi_marked, 1);
    }
}
