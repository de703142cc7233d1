use std::{fmt, sync::Arc, time::Instant};

use image::GrayImage;
use tracing::instrument;

use crate::entities::CodePayload;

pub mod payload;
pub mod preprocess;
pub mod readers;

pub use payload::parse_payload;
pub use preprocess::Preprocess;
pub use readers::{MultiFormatReader, QrReader};

/// A decoder for machine-readable codes. Returns the raw payload text.
pub trait CodeReader: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode(&self, image: &GrayImage) -> Option<String>;
}

/// Cascade step that produced a decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStage {
    Raw,
    Variant(Preprocess),
    Secondary,
}

impl fmt::Display for DetectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionStage::Raw => write!(f, "raw"),
            DetectionStage::Variant(p) => write!(f, "{}", p.name()),
            DetectionStage::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub raw: String,
    pub payload: CodePayload,
    pub stage: DetectionStage,
}

/// Runs the decode cascade: raw image, then each [`Preprocess`] variant in
/// order with the primary reader, then the secondary reader on the raw image.
/// The first success wins.
#[derive(Clone)]
pub struct CodeDetector {
    primary: Arc<dyn CodeReader>,
    secondary: Option<Arc<dyn CodeReader>>,
}

impl Default for CodeDetector {
    fn default() -> Self {
        Self::new(Arc::new(QrReader), Some(Arc::new(MultiFormatReader)))
    }
}

impl CodeDetector {
    pub fn new(primary: Arc<dyn CodeReader>, secondary: Option<Arc<dyn CodeReader>>) -> Self {
        Self { primary, secondary }
    }

    pub fn detect(&self, image: &GrayImage) -> Option<Detection> {
        self.detect_with(image, |_, _| {})
    }

    /// Same as [`CodeDetector::detect`], `on_variant` sees every preprocessed
    /// image tried.
    #[instrument(skip_all)]
    pub fn detect_with<F>(&self, image: &GrayImage, mut on_variant: F) -> Option<Detection>
    where
        F: FnMut(&'static str, &GrayImage),
    {
        let start = Instant::now();
        let found = self.run_cascade(image, &mut on_variant);
        match &found {
            Some((_, stage)) => {
                let reader = match stage {
                    DetectionStage::Secondary => {
                        self.secondary.as_ref().map(|r| r.name()).unwrap_or_default()
                    }
                    _ => self.primary.name(),
                };
                tracing::debug!(
                    "code decoded at stage {} by {} in {}ms",
                    stage,
                    reader,
                    start.elapsed().as_millis()
                )
            }
            None => tracing::debug!("no code found after {}ms", start.elapsed().as_millis()),
        }
        found.map(|(raw, stage)| Detection {
            payload: parse_payload(&raw),
            raw,
            stage,
        })
    }

    fn run_cascade<F>(&self, image: &GrayImage, on_variant: &mut F) -> Option<(String, DetectionStage)>
    where
        F: FnMut(&'static str, &GrayImage),
    {
        if let Some(raw) = self.primary.decode(image) {
            return Some((raw, DetectionStage::Raw));
        }
        for variant in Preprocess::CASCADE {
            let processed = variant.apply(image);
            on_variant(variant.name(), &processed);
            if let Some(raw) = self.primary.decode(&processed) {
                return Some((raw, DetectionStage::Variant(variant)));
            }
        }
        self.secondary
            .as_ref()
            .and_then(|reader| reader.decode(image))
            .map(|raw| (raw, DetectionStage::Secondary))
    }
}
