use image::{GrayImage, Luma, Rgb, RgbImage};

pub const WHITE: Luma<u8> = Luma([u8::MAX]);
pub const BLACK: Luma<u8> = Luma([u8::MIN]);

/// Inverts a grayscale image so dark ink becomes bright foreground.
pub fn invert(img: &GrayImage) -> GrayImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = u8::MAX - pixel.0[0];
    }
    out
}

pub fn mean_intensity(img: &GrayImage) -> f64 {
    let total = u64::from(img.width()) * u64::from(img.height());
    if total == 0 {
        return 0.0;
    }
    let sum: u64 = img.pixels().map(|p| u64::from(p.0[0])).sum();
    sum as f64 / total as f64
}

/// Standard deviation of pixel intensities, used as a contrast estimate.
pub fn intensity_stddev(img: &GrayImage) -> f64 {
    let total = u64::from(img.width()) * u64::from(img.height());
    if total == 0 {
        return 0.0;
    }
    let mean = mean_intensity(img);
    let variance = img
        .pixels()
        .map(|p| {
            let d = f64::from(p.0[0]) - mean;
            d * d
        })
        .sum::<f64>()
        / total as f64;
    variance.sqrt()
}

/// Variance of the 4-neighbour Laplacian over interior pixels. Low values
/// indicate a blurry capture.
pub fn laplacian_variance(img: &GrayImage) -> f64 {
    let (width, height) = img.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut responses = Vec::with_capacity(((width - 2) * (height - 2)) as usize);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = f64::from(img.get_pixel(x, y).0[0]);
            let neighbours = f64::from(img.get_pixel(x - 1, y).0[0])
                + f64::from(img.get_pixel(x + 1, y).0[0])
                + f64::from(img.get_pixel(x, y - 1).0[0])
                + f64::from(img.get_pixel(x, y + 1).0[0]);
            responses.push(4.0 * center - neighbours);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n
}

pub fn gray_to_rgb(img: &GrayImage) -> RgbImage {
    let mut out = RgbImage::new(img.width(), img.height());
    for (x, y, pixel) in img.enumerate_pixels() {
        let v = pixel.0[0];
        out.put_pixel(x, y, Rgb([v, v, v]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invert_is_an_involution() {
        let mut img = GrayImage::new(4, 4);
        img.put_pixel(1, 2, Luma([200]));
        img.put_pixel(3, 3, Luma([17]));
        assert_eq!(invert(&invert(&img)), img);
        assert_eq!(invert(&img).get_pixel(1, 2).0[0], 55);
    }

    #[test]
    fn constant_image_has_zero_spread() {
        let img = GrayImage::from_pixel(8, 8, Luma([128]));
        assert!((mean_intensity(&img) - 128.0).abs() < 1e-9);
        assert!(intensity_stddev(&img) < 1e-9);
        assert!(laplacian_variance(&img) < 1e-9);
    }

    #[test]
    fn checkerboard_has_high_spread() {
        let img = GrayImage::from_fn(16, 16, |x, y| {
            if (x + y) % 2 == 0 {
                WHITE
            } else {
                BLACK
            }
        });
        assert!(intensity_stddev(&img) > 100.0);
        assert!(laplacian_variance(&img) > 100.0);
    }
}
