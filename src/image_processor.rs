use image::{DynamicImage, GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::adaptive_threshold;
use imageproc::edges::canny;
use imageproc::filter::{gaussian_blur_f32, sharpen3x3};
use imageproc::geometric_transformations::{
    rotate_about_center, warp_into, Interpolation, Projection,
};
use imageproc::hough::{detect_lines, LineDetectionOptions};
use log::{debug, warn};
use logging_timer::time;

use crate::debug::ImageDebugWriter;
use crate::geometry::{circularity, contour_area, contour_centroid, contour_perimeter, order_corners};
use crate::image_utils::{invert, WHITE};

const CORNER_BLUR_SIGMA: f32 = 1.0;
const THRESHOLD_BLOCK_RADIUS: u32 = 5;
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;
const ENHANCE_BLUR_SIGMA: f32 = 0.8;

/// Geometric-normalization options. Defaults reproduce the standard sheet
/// pipeline; every field is an explicit knob, there is no global state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageProcessorConfig {
    /// Width of the canonical rectified sheet; height follows the A4
    /// portrait ratio (297/210).
    pub target_width: u32,
    /// Contour area bounds for circular corner alignment dots.
    pub corner_min_area: f64,
    pub corner_max_area: f64,
    /// Minimum circularity for a contour to count as an alignment dot.
    pub corner_min_circularity: f64,
    /// Skew below this magnitude (degrees) is left uncorrected.
    pub skew_threshold_degrees: f64,
    pub hough_vote_threshold: u32,
    /// Contrast-limited adaptive histogram equalization parameters.
    pub clahe_clip_limit: f64,
    pub clahe_grid: u32,
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self {
            target_width: 800,
            corner_min_area: 50.0,
            corner_max_area: 500.0,
            corner_min_circularity: 0.7,
            skew_threshold_degrees: 0.5,
            hough_vote_threshold: 100,
            clahe_clip_limit: 2.0,
            clahe_grid: 8,
        }
    }
}

/// Turns a raw photograph into a rectified, deskewed, contrast-enhanced
/// grayscale sheet. Every stage consumes its input immutably and produces a
/// fresh buffer; missing geometry degrades to pass-through, never to an
/// error.
pub struct ImageProcessor {
    config: ImageProcessorConfig,
}

impl ImageProcessor {
    pub fn new(config: ImageProcessorConfig) -> Self {
        Self { config }
    }

    #[time]
    pub fn normalize(&self, image: &DynamicImage, debug_writer: &ImageDebugWriter) -> GrayImage {
        let gray = image.to_luma8();
        let corrected = self.correct_perspective(&gray);
        let deskewed = self.correct_skew(&corrected);
        let enhanced = self.enhance(&deskewed);
        debug_writer.write_gray("normalized", &enhanced);
        enhanced
    }

    /// Finds circular alignment dots: adaptive binarization, external
    /// contours, then an area and circularity filter. Returns their
    /// centroids in contour order.
    pub fn detect_corners(&self, image: &GrayImage) -> Vec<(f64, f64)> {
        let blurred = gaussian_blur_f32(image, CORNER_BLUR_SIGMA);
        let binary = invert(&adaptive_threshold(&blurred, THRESHOLD_BLOCK_RADIUS));
        let contours: Vec<Contour<i32>> = find_contours(&binary);

        let mut corners = Vec::new();
        for contour in &contours {
            if contour.border_type != BorderType::Outer || contour.parent.is_some() {
                continue;
            }
            let area = contour_area(&contour.points);
            if area <= self.config.corner_min_area || area >= self.config.corner_max_area {
                continue;
            }
            let perimeter = contour_perimeter(&contour.points);
            if circularity(area, perimeter) <= self.config.corner_min_circularity {
                continue;
            }
            corners.push(contour_centroid(&contour.points));
        }
        debug!("found {} corner candidates", corners.len());
        corners
    }

    /// Rectifies the sheet onto the canonical A4-portrait rectangle when
    /// four corner dots are found; otherwise passes the image through
    /// unchanged.
    pub fn correct_perspective(&self, image: &GrayImage) -> GrayImage {
        let corners = self.detect_corners(image);
        if corners.len() < 4 {
            warn!(
                "only {} corner candidates found, skipping perspective correction",
                corners.len()
            );
            return image.clone();
        }

        let ordered = order_corners([corners[0], corners[1], corners[2], corners[3]]);
        let from = [
            (ordered[0].0 as f32, ordered[0].1 as f32),
            (ordered[1].0 as f32, ordered[1].1 as f32),
            (ordered[2].0 as f32, ordered[2].1 as f32),
            (ordered[3].0 as f32, ordered[3].1 as f32),
        ];

        let width = self.config.target_width;
        let height = width * 297 / 210;
        let to = [
            (0.0, 0.0),
            ((width - 1) as f32, 0.0),
            ((width - 1) as f32, (height - 1) as f32),
            (0.0, (height - 1) as f32),
        ];

        match Projection::from_control_points(from, to) {
            Some(projection) => {
                let mut out = GrayImage::from_pixel(width, height, WHITE);
                warp_into(image, &projection, Interpolation::Bilinear, WHITE, &mut out);
                out
            }
            None => {
                warn!("degenerate corner configuration, skipping perspective correction");
                image.clone()
            }
        }
    }

    /// Estimates skew as the median Hough-line angle, folded to
    /// (−90°, 90°]. No detected lines means no measurable skew.
    pub fn detect_skew_angle(&self, image: &GrayImage) -> f64 {
        let edges = canny(image, CANNY_LOW, CANNY_HIGH);
        let lines = detect_lines(
            &edges,
            LineDetectionOptions {
                vote_threshold: self.config.hough_vote_threshold,
                suppression_radius: 8,
            },
        );
        if lines.is_empty() {
            return 0.0;
        }

        let mut angles: Vec<f64> = lines
            .iter()
            .map(|line| {
                let angle = f64::from(line.angle_in_degrees);
                if angle > 90.0 {
                    angle - 180.0
                } else {
                    angle
                }
            })
            .collect();
        angles.sort_by(|a, b| a.partial_cmp(b).expect("angles are finite"));

        let mid = angles.len() / 2;
        if angles.len() % 2 == 0 {
            (angles[mid - 1] + angles[mid]) / 2.0
        } else {
            angles[mid]
        }
    }

    pub fn correct_skew(&self, image: &GrayImage) -> GrayImage {
        let angle = self.detect_skew_angle(image);
        if angle.abs() < self.config.skew_threshold_degrees {
            return image.clone();
        }
        debug!("correcting skew of {:.2} degrees", angle);
        rotate_about_center(
            image,
            (-angle.to_radians()) as f32,
            Interpolation::Bilinear,
            WHITE,
        )
    }

    /// Contrast-limited adaptive equalization, mild blur, then a sharpening
    /// convolution to restore edge definition.
    pub fn enhance(&self, image: &GrayImage) -> GrayImage {
        let equalized = clahe(image, self.config.clahe_clip_limit, self.config.clahe_grid);
        let blurred = gaussian_blur_f32(&equalized, ENHANCE_BLUR_SIGMA);
        sharpen3x3(&blurred)
    }
}

/// Contrast-limited adaptive histogram equalization: per-tile clipped
/// equalization mappings, blended bilinearly between tile centers.
fn clahe(image: &GrayImage, clip_limit: f64, grid: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    let grid = grid.max(1);
    if width < grid || height < grid {
        return image.clone();
    }

    let tiles = grid as usize;
    let tile_w = (width as usize + tiles - 1) / tiles;
    let tile_h = (height as usize + tiles - 1) / tiles;

    let mut mappings = vec![[0u8; 256]; tiles * tiles];
    for ty in 0..tiles {
        for tx in 0..tiles {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width as usize);
            let y1 = (y0 + tile_h).min(height as usize);
            mappings[ty * tiles + tx] = if x0 < x1 && y0 < y1 {
                tile_mapping(image, (x0, y0, x1, y1), clip_limit)
            } else {
                identity_mapping()
            };
        }
    }

    let mut out = GrayImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels() {
        let v = pixel.0[0] as usize;

        let gx = (f64::from(x) + 0.5) / tile_w as f64 - 0.5;
        let gy = (f64::from(y) + 0.5) / tile_h as f64 - 0.5;
        let ix = gx.floor() as i64;
        let iy = gy.floor() as i64;
        let fx = gx - ix as f64;
        let fy = gy - iy as f64;

        let last = tiles as i64 - 1;
        let tx0 = ix.clamp(0, last) as usize;
        let tx1 = (ix + 1).clamp(0, last) as usize;
        let ty0 = iy.clamp(0, last) as usize;
        let ty1 = (iy + 1).clamp(0, last) as usize;

        let top = f64::from(mappings[ty0 * tiles + tx0][v]) * (1.0 - fx)
            + f64::from(mappings[ty0 * tiles + tx1][v]) * fx;
        let bottom = f64::from(mappings[ty1 * tiles + tx0][v]) * (1.0 - fx)
            + f64::from(mappings[ty1 * tiles + tx1][v]) * fx;
        let value = top * (1.0 - fy) + bottom * fy;
        out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
    }
    out
}

fn identity_mapping() -> [u8; 256] {
    let mut map = [0u8; 256];
    for (i, entry) in map.iter_mut().enumerate() {
        *entry = i as u8;
    }
    map
}

fn tile_mapping(
    image: &GrayImage,
    (x0, y0, x1, y1): (usize, usize, usize, usize),
    clip_limit: f64,
) -> [u8; 256] {
    let mut hist = [0u64; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[image.get_pixel(x as u32, y as u32).0[0] as usize] += 1;
        }
    }
    let total = ((x1 - x0) * (y1 - y0)) as u64;

    // Clip the histogram and spread the excess evenly over all bins.
    let limit = ((clip_limit * total as f64 / 256.0).ceil() as u64).max(1);
    let mut excess = 0u64;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let bonus = excess / 256;
    for bin in hist.iter_mut() {
        *bin += bonus;
    }

    let mut cdf = [0u64; 256];
    let mut cumulative = 0u64;
    for (i, bin) in hist.iter().enumerate() {
        cumulative += *bin;
        cdf[i] = cumulative;
    }
    let cdf_min = hist
        .iter()
        .zip(cdf.iter())
        .find(|(bin, _)| **bin > 0)
        .map_or(0, |(_, c)| *c);

    let mut map = identity_mapping();
    if cumulative > cdf_min {
        let scale = 255.0 / (cumulative - cdf_min) as f64;
        for (i, entry) in map.iter_mut().enumerate() {
            let shifted = cdf[i].saturating_sub(cdf_min);
            *entry = (shifted as f64 * scale).round().clamp(0.0, 255.0) as u8;
        }
    }
    map
}
