use image::{imageops::FilterType, GrayImage, Luma};
use imageproc::{
    edges::canny,
    geometric_transformations::{warp_with, Interpolation},
    hough::{detect_lines, LineDetectionOptions},
};
use tracing::instrument;

use crate::config::DeskewConfig;

/// Skew is estimated on a downscaled copy; the angle does not depend on scale
/// and the Hough accumulator cost grows with the number of edge pixels.
const ANALYSIS_MAX_SIDE: u32 = 1600;
const MIN_VOTE_THRESHOLD: f32 = 50.0;
const SUPPRESSION_RADIUS: u32 = 8;

/// Median skew in degrees of the near-horizontal lines of the page. Positive
/// means the content is rotated clockwise.
pub fn detect_skew(image: &GrayImage, config: &DeskewConfig) -> Option<f32> {
    let (w, h) = image.dimensions();
    if w < 2 || h < 2 {
        return None;
    }
    let longest = w.max(h);
    let analysis = if longest > ANALYSIS_MAX_SIDE {
        let ratio = ANALYSIS_MAX_SIDE as f32 / longest as f32;
        image::imageops::resize(
            image,
            ((w as f32 * ratio) as u32).max(1),
            ((h as f32 * ratio) as u32).max(1),
            FilterType::Triangle,
        )
    } else {
        image.clone()
    };

    let edges = canny(&analysis, config.canny_low, config.canny_high);
    let min_side = analysis.width().min(analysis.height());
    let options = LineDetectionOptions {
        vote_threshold: (min_side as f32 * 0.25).max(MIN_VOTE_THRESHOLD) as u32,
        suppression_radius: SUPPRESSION_RADIUS,
    };
    let lines = detect_lines(&edges, options);

    // The polar angle is the angle of the line normal; horizontal lines sit at 90.
    let mut skews: Vec<f32> = lines
        .iter()
        .map(|l| l.angle_in_degrees as f32 - 90f32)
        .filter(|skew| skew.abs() < config.max_skew_degrees)
        .collect();
    tracing::debug!(
        "deskew found {} lines, {} near horizontal",
        lines.len(),
        skews.len()
    );
    if skews.is_empty() {
        return None;
    }
    skews.sort_by(|a, b| a.total_cmp(b));
    let mid = skews.len() / 2;
    let median = if skews.len() % 2 == 0 {
        (skews[mid - 1] + skews[mid]) / 2f32
    } else {
        skews[mid]
    };
    Some(median)
}

/// Rotate `image` about its centre so that a content skew of `angle_degrees`
/// (clockwise) is undone. Bicubic sampling, borders replicate the edge pixels.
pub fn rotate_replicate(image: &GrayImage, angle_degrees: f32) -> GrayImage {
    let (w, h) = image.dimensions();
    if w < 5 || h < 5 {
        return image.clone();
    }
    let (cx, cy) = (w as f32 / 2f32, h as f32 / 2f32);
    let (sin, cos) = angle_degrees.to_radians().sin_cos();
    // Bicubic sampling reads a 4x4 neighbourhood that must stay inside the image.
    let (max_x, max_y) = ((w - 4) as f32, (h - 4) as f32);

    warp_with(
        image,
        move |x, y| {
            let (dx, dy) = (x - cx, y - cy);
            let src_x = cx + dx * cos - dy * sin;
            let src_y = cy + dx * sin + dy * cos;
            (src_x.clamp(1f32, max_x), src_y.clamp(1f32, max_y))
        },
        Interpolation::Bicubic,
        Luma([255u8]),
    )
}

/// Detect and correct page rotation. Returns the input untouched when no
/// qualifying line is found.
#[instrument(skip_all)]
pub fn deskew(image: GrayImage, config: &DeskewConfig) -> GrayImage {
    match detect_skew(&image, config) {
        Some(angle) if angle.abs() >= config.min_skew_degrees => {
            tracing::debug!("correcting page skew of {angle:.1} degrees");
            rotate_replicate(&image, angle)
        }
        _ => image,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// White page with dark bands drawn at `skew_degrees` (clockwise).
    pub(crate) fn skewed_bands(width: u32, height: u32, skew_degrees: f32) -> GrayImage {
        let mut img = GrayImage::from_pixel(width, height, Luma([255u8]));
        let slope = skew_degrees.to_radians().tan();
        for band in [height / 3, 2 * height / 3] {
            for x in 0..width {
                let y_center = band as f32 + (x as f32 - width as f32 / 2f32) * slope;
                for dy in 0..5 {
                    let y = y_center as i64 + dy;
                    if y >= 0 && (y as u32) < height {
                        img.put_pixel(x, y as u32, Luma([0u8]));
                    }
                }
            }
        }
        img
    }

    #[test]
    fn test_blank_page_is_unchanged() {
        let config = DeskewConfig::default();
        let blank = GrayImage::from_pixel(200, 300, Luma([255u8]));
        assert_eq!(detect_skew(&blank, &config), None);
        let out = deskew(blank.clone(), &config);
        assert_eq!(out, blank);
    }

    #[test]
    fn test_detect_skew_of_rotated_bands() {
        let config = DeskewConfig::default();
        let img = skewed_bands(400, 300, 5.0);
        let skew = detect_skew(&img, &config).expect("bands should be detected");
        assert!((skew - 5.0).abs() <= 1.0, "skew was {skew}");
    }

    #[test]
    fn test_deskew_straightens_bands() {
        let config = DeskewConfig::default();
        let img = skewed_bands(400, 300, 5.0);
        let out = deskew(img, &config);
        assert_eq!(out.dimensions(), (400, 300));
        let skew = detect_skew(&out, &config).unwrap_or(0.0);
        assert!(skew.abs() <= 1.0, "residual skew was {skew}");
    }

    #[test]
    fn test_rotation_replicates_borders() {
        let img = GrayImage::from_pixel(50, 50, Luma([40u8]));
        let out = rotate_replicate(&img, 10.0);
        // Corners map outside the source and must copy the edge instead of a fill colour.
        assert_eq!(out.get_pixel(25, 25)[0], 40);
        assert!(out.get_pixel(0, 0)[0] < 255);
    }
}
