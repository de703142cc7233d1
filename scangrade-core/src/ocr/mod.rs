use image::GrayImage;
use tokio_util::sync::CancellationToken;

use crate::entities::BBox;

mod tesseract;

pub use tesseract::TesseractEngine;

/// A recognized word with its pixel bounding box on the source image.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Text recognition used by the grade stage.
///
/// `recognize_words` runs on the full page with the page languages and is only
/// used to locate anchor keywords. `recognize_text` reads the grade region
/// with the digit whitelist.
///
/// Both calls run on a worker thread and must give up with an error once
/// `cancel` fires, the page timeout relies on it to get the worker back.
pub trait OcrEngine: Send + Sync {
    fn recognize_words(
        &self,
        image: &GrayImage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<OcrWord>>;
    fn recognize_text(&self, image: &GrayImage, cancel: &CancellationToken)
        -> anyhow::Result<String>;
}
