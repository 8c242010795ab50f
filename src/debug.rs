use std::path::{Path, PathBuf};

use image::{GrayImage, Rgb};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use log::{debug, warn};

use crate::bubble_detector::BubbleCandidate;
use crate::image_utils::gray_to_rgb;
use crate::template_matcher::AnswerRegion;

const GREEN: Rgb<u8> = Rgb([0, 200, 0]);
const RED: Rgb<u8> = Rgb([220, 0, 0]);
const CYAN: Rgb<u8> = Rgb([0, 180, 180]);

/// Creates a path for a debug image.
pub fn debug_image_path(base: &Path, label: &str) -> PathBuf {
    let mut result = PathBuf::from(base);
    result.set_file_name(format!(
        "{}_debug_{}.png",
        base.file_stem().unwrap_or_default().to_str().unwrap_or("sheet"),
        label
    ));
    result
}

/// Writes intermediate pipeline images next to the input file when enabled;
/// a disabled writer is a no-op so the pipeline never branches on debug
/// mode.
pub struct ImageDebugWriter {
    input_path: Option<PathBuf>,
}

impl ImageDebugWriter {
    pub fn new(input_path: PathBuf) -> Self {
        Self {
            input_path: Some(input_path),
        }
    }

    pub fn disabled() -> Self {
        Self { input_path: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.input_path.is_some()
    }

    fn save(&self, label: &str, save: impl FnOnce(&Path) -> image::ImageResult<()>) {
        if let Some(input_path) = &self.input_path {
            let path = debug_image_path(input_path, label);
            match save(&path) {
                Ok(()) => debug!("wrote debug image {}", path.display()),
                Err(e) => warn!("failed to write debug image {}: {}", path.display(), e),
            }
        }
    }

    pub fn write_gray(&self, label: &str, image: &GrayImage) {
        self.save(label, |path| image.save(path));
    }

    /// Detected bubbles over the normalized sheet: red boxes for filled
    /// bubbles, green for unfilled.
    pub fn write_bubble_overlay(
        &self,
        label: &str,
        image: &GrayImage,
        rows: &[Vec<BubbleCandidate>],
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut canvas = gray_to_rgb(image);
        for bubble in rows.iter().flatten() {
            let rect = Rect::at(bubble.x, bubble.y).of_size(bubble.width, bubble.height);
            let color = if bubble.filled { RED } else { GREEN };
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
        self.save(label, |path| canvas.save(path));
    }

    /// The nominal answer-region grid, for eyeballing layout assumptions.
    pub fn write_region_overlay(&self, label: &str, image: &GrayImage, regions: &[AnswerRegion]) {
        if !self.is_enabled() {
            return;
        }
        let mut canvas = gray_to_rgb(image);
        for region in regions {
            draw_hollow_rect_mut(&mut canvas, region.rect, CYAN);
        }
        self.save(label, |path| canvas.save(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_path_carries_the_label() {
        let path = debug_image_path(Path::new("/scans/sheet_042.png"), "binarized");
        assert_eq!(
            path,
            PathBuf::from("/scans/sheet_042_debug_binarized.png")
        );
    }

    #[test]
    fn disabled_writer_is_a_no_op() {
        let writer = ImageDebugWriter::disabled();
        assert!(!writer.is_enabled());
        // Must not attempt to write anywhere.
        writer.write_gray("normalized", &GrayImage::new(4, 4));
    }

    #[test]
    fn enabled_writer_writes_next_to_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sheet.png");
        let writer = ImageDebugWriter::new(input.clone());
        writer.write_gray("normalized", &GrayImage::new(8, 8));
        assert!(debug_image_path(&input, "normalized").exists());
    }
}
