use std::f64::consts::PI;

use imageproc::point::Point;
use imageproc::rect::Rect;

/// Area enclosed by a contour, via the shoelace formula over its boundary
/// points.
pub fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut doubled = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        doubled += i64::from(p.x) * i64::from(q.y) - i64::from(q.x) * i64::from(p.y);
    }
    (doubled.abs() as f64) / 2.0
}

/// Length of the closed boundary polyline through the contour points.
pub fn contour_perimeter(points: &[Point<i32>]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut length = 0.0;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        let dx = f64::from(p.x - q.x);
        let dy = f64::from(p.y - q.y);
        length += (dx * dx + dy * dy).sqrt();
    }
    length
}

pub fn contour_bounding_rect(points: &[Point<i32>]) -> Rect {
    let mut min_x = i32::MAX;
    let mut min_y = i32::MAX;
    let mut max_x = i32::MIN;
    let mut max_y = i32::MIN;
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Rect::at(min_x, min_y).of_size((max_x - min_x + 1) as u32, (max_y - min_y + 1) as u32)
}

pub fn contour_centroid(points: &[Point<i32>]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|p| f64::from(p.x)).sum();
    let sum_y: f64 = points.iter().map(|p| f64::from(p.y)).sum();
    (sum_x / n, sum_y / n)
}

/// `4π·area/perimeter²`, 1.0 for a perfect circle.
pub fn circularity(area: f64, perimeter: f64) -> f64 {
    if perimeter <= 0.0 {
        return 0.0;
    }
    4.0 * PI * area / (perimeter * perimeter)
}

pub fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

/// Orders four corner points clockwise starting from the top-left: sort by
/// polar angle around their centroid, then pin top-left/bottom-right to the
/// extremes of `x+y` and top-right/bottom-left to the extremes of `x−y`.
pub fn order_corners(corners: [(f64, f64); 4]) -> [(f64, f64); 4] {
    let cx = corners.iter().map(|c| c.0).sum::<f64>() / 4.0;
    let cy = corners.iter().map(|c| c.1).sum::<f64>() / 4.0;

    let mut by_angle = corners;
    by_angle.sort_by(|a, b| {
        let angle_a = (a.1 - cy).atan2(a.0 - cx);
        let angle_b = (b.1 - cy).atan2(b.0 - cx);
        angle_a.partial_cmp(&angle_b).expect("corner angles are finite")
    });

    let sum_key = |c: (f64, f64)| c.0 + c.1;
    let diff_key = |c: (f64, f64)| c.0 - c.1;
    let extreme = |keep_max: bool, key: fn((f64, f64)) -> f64| {
        let mut best = by_angle[0];
        for c in by_angle.iter().skip(1) {
            if (keep_max && key(*c) > key(best)) || (!keep_max && key(*c) < key(best)) {
                best = *c;
            }
        }
        best
    };

    [
        extreme(false, sum_key),
        extreme(true, diff_key),
        extreme(true, sum_key),
        extreme(false, diff_key),
    ]
}
