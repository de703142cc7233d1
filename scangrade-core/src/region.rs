use image::{imageops, GrayImage};
use imageproc::{contrast::adaptive_threshold, filter::median_filter};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::RegionConfig,
    detect::preprocess::clahe,
    entities::BBox,
    ocr::{OcrEngine, OcrWord},
};

const OCR_CLAHE_CLIP: f32 = 2.0;
const OCR_CLAHE_TILES: u32 = 8;
const OCR_THRESHOLD_RADIUS: u32 = 5;

/// Where the grade crop came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSource {
    /// Just below the first word containing this keyword.
    Anchor(String),
    /// Proportional crop of the page bottom.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct GradeRegion {
    pub image: GrayImage,
    pub bbox: BBox,
    pub source: RegionSource,
}

impl GradeRegion {
    pub fn is_anchored(&self) -> bool {
        matches!(self.source, RegionSource::Anchor(_))
    }
}

/// Contrast equalization, denoise and binarization applied to the page before
/// any text recognition.
#[instrument(skip_all)]
pub fn enhance_for_ocr(image: &GrayImage) -> GrayImage {
    let equalized = clahe(image, OCR_CLAHE_CLIP, OCR_CLAHE_TILES);
    let denoised = median_filter(&equalized, 1, 1);
    adaptive_threshold(&denoised, OCR_THRESHOLD_RADIUS)
}

/// Locate the grade box on an enhanced page.
///
/// OCR failures are not fatal here, the fallback crop is used and the grade
/// read later decides whether anything was found.
#[instrument(skip_all)]
pub fn extract_grade_region(
    image: &GrayImage,
    ocr: &dyn OcrEngine,
    config: &RegionConfig,
    cancel: &CancellationToken,
) -> GradeRegion {
    let words = match ocr.recognize_words(image, cancel) {
        Ok(words) => words,
        Err(e) => {
            tracing::warn!("page ocr failed, using fallback grade region: {e:#}");
            Vec::new()
        }
    };

    if let Some((keyword, bbox)) = anchor_region(&words, image.dimensions(), config) {
        tracing::debug!("grade region anchored on {keyword:?} at {bbox:?}");
        return GradeRegion {
            image: crop(image, &bbox),
            bbox,
            source: RegionSource::Anchor(keyword),
        };
    }

    let bbox = fallback_region(image.dimensions(), config);
    tracing::debug!("no anchor keyword, fallback grade region {bbox:?}");
    GradeRegion {
        image: crop(image, &bbox),
        bbox,
        source: RegionSource::Fallback,
    }
}

fn anchor_region(
    words: &[OcrWord],
    (width, height): (u32, u32),
    config: &RegionConfig,
) -> Option<(String, BBox)> {
    let keywords: Vec<String> = config
        .anchor_keywords
        .iter()
        .map(|k| k.to_lowercase())
        .collect();
    let (word, keyword) = words.iter().find_map(|word| {
        let text = word.text.to_lowercase();
        keywords
            .iter()
            .find(|k| text.contains(k.as_str()))
            .map(|k| (word, k))
    })?;

    let bbox = BBox::from_xywh(
        word.bbox.x0,
        word.bbox.y1,
        word.bbox.width() + config.extra_width as f32,
        word.bbox.height() + config.extra_height as f32,
    )
    .clamp_to(width, height);
    if bbox.width() < 1f32 || bbox.height() < 1f32 {
        tracing::debug!("anchor {keyword:?} found at the page edge, region is empty");
        return None;
    }
    Some((keyword.clone(), bbox))
}

fn fallback_region((width, height): (u32, u32), config: &RegionConfig) -> BBox {
    let (fx0, fy0, fx1, fy1) = config.fallback;
    let (w, h) = (width as f32, height as f32);
    BBox {
        x0: (w * fx0).floor(),
        y0: (h * fy0).floor(),
        x1: (w * fx1).floor(),
        y1: (h * fy1).floor(),
    }
    .clamp_to(width, height)
}

fn crop(image: &GrayImage, bbox: &BBox) -> GrayImage {
    let x = bbox.x0 as u32;
    let y = bbox.y0 as u32;
    let w = (bbox.width() as u32).max(1).min(image.width().saturating_sub(x));
    let h = (bbox.height() as u32).max(1).min(image.height().saturating_sub(y));
    imageops::crop_imm(image, x, y, w, h).to_image()
}
