use std::{path::PathBuf, sync::Arc, time::Instant};

use image::GrayImage;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::{DeskewConfig, RegionConfig},
    deskew::deskew,
    detect::CodeDetector,
    draw::DiagnosticSink,
    entities::{CodePayload, ExamIdentifier, Grade, Identification, PageNumber, PageResult},
    error::PageError,
    grade::parse_grade,
    ocr::OcrEngine,
    region::{enhance_for_ocr, extract_grade_region},
};

/// Where a page's pixels come from.
#[derive(Debug, Clone)]
pub enum PageSource {
    /// Already rasterized (rendered pdf page, decoded image).
    Raster(GrayImage),
    /// Image file loaded by the worker.
    File(PathBuf),
    /// Pdf page pdfium could not render.
    RenderFailed(String),
}

/// One unit of work for the scheduler.
#[derive(Debug, Clone)]
pub struct PageInput {
    pub page_number: PageNumber,
    pub source: PageSource,
    /// Identifier from the document metadata, replaces code detection.
    pub shortcut: Option<ExamIdentifier>,
}

impl PageInput {
    pub fn raster(page_number: PageNumber, image: GrayImage) -> Self {
        Self {
            page_number,
            source: PageSource::Raster(image),
            shortcut: None,
        }
    }

    pub fn file(page_number: PageNumber, path: PathBuf) -> Self {
        Self {
            page_number,
            source: PageSource::File(path),
            shortcut: None,
        }
    }

    pub fn with_shortcut(mut self, shortcut: Option<ExamIdentifier>) -> Self {
        self.shortcut = shortcut;
        self
    }
}

/// Runs the stages of one page: deskew, identification, grade region, grade
/// recognition. Every stage failure ends up as a tag on the result.
#[derive(Clone)]
pub struct PageProcessor {
    detector: CodeDetector,
    ocr: Arc<dyn OcrEngine>,
    diagnostics: Arc<dyn DiagnosticSink>,
    deskew: DeskewConfig,
    region: RegionConfig,
}

impl PageProcessor {
    pub fn new(
        detector: CodeDetector,
        ocr: Arc<dyn OcrEngine>,
        diagnostics: Arc<dyn DiagnosticSink>,
        deskew: DeskewConfig,
        region: RegionConfig,
    ) -> Self {
        Self {
            detector,
            ocr,
            diagnostics,
            deskew,
            region,
        }
    }

    pub fn process(&self, input: PageInput, cancel: &CancellationToken) -> PageResult {
        let PageInput {
            page_number,
            source,
            shortcut,
        } = input;
        match source {
            PageSource::Raster(image) => self.process_image(page_number, image, shortcut, cancel),
            PageSource::File(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned());
                let result = match image::open(&path) {
                    Ok(image) => {
                        self.process_image(page_number, image.to_luma8(), shortcut, cancel)
                    }
                    Err(e) => {
                        tracing::warn!("can't read {}: {e}", path.display());
                        PageResult::failed(page_number, PageError::SourceUnreadable(e.to_string()))
                    }
                };
                result.with_source(name)
            }
            PageSource::RenderFailed(reason) => {
                PageResult::failed(page_number, PageError::RenderFailure(reason))
            }
        }
    }

    #[instrument(
        skip(self, image, shortcut, cancel),
        fields(deskew_duration_ms, detect_duration_ms, grade_duration_ms)
    )]
    pub fn process_image(
        &self,
        page_number: PageNumber,
        image: GrayImage,
        shortcut: Option<ExamIdentifier>,
        cancel: &CancellationToken,
    ) -> PageResult {
        let span = tracing::Span::current();
        let cancelled = || PageResult::failed(page_number, PageError::Cancelled);
        if cancel.is_cancelled() {
            return cancelled();
        }

        let start = Instant::now();
        let image = deskew(image, &self.deskew);
        self.diagnostics.snapshot(page_number, "deskewed", &image);
        span.record("deskew_duration_ms", start.elapsed().as_millis() as u64);
        if cancel.is_cancelled() {
            return cancelled();
        }

        let mut errors = Vec::new();
        let start = Instant::now();
        let identification = self.identify(page_number, &image, shortcut, &mut errors);
        span.record("detect_duration_ms", start.elapsed().as_millis() as u64);
        if cancel.is_cancelled() {
            return cancelled();
        }

        let start = Instant::now();
        let (grade, raw_text) = self.read_grade(page_number, &image, &mut errors, cancel);
        span.record("grade_duration_ms", start.elapsed().as_millis() as u64);
        if cancel.is_cancelled() {
            return cancelled();
        }

        tracing::debug!(
            "page {page_number} done: identified={}, grade={:?}, errors={:?}",
            identification.identifier().is_some(),
            grade.as_ref().map(|g| g.score),
            errors
        );
        PageResult::new(page_number, identification, grade, raw_text, errors)
    }

    fn identify(
        &self,
        page_number: PageNumber,
        image: &GrayImage,
        shortcut: Option<ExamIdentifier>,
        errors: &mut Vec<PageError>,
    ) -> Identification {
        if let Some(id) = shortcut {
            tracing::debug!("page {page_number} identified from document metadata");
            return Identification::Metadata(id);
        }
        match self.detector.detect_with(image, |stage, variant| {
            self.diagnostics.snapshot(page_number, stage, variant)
        }) {
            Some(detection) => {
                if let CodePayload::Unparsed(raw) = &detection.payload {
                    tracing::warn!("page {page_number}: unrecognized code payload {raw:?}");
                    errors.push(PageError::UnparsedPayload);
                }
                Identification::Vision(detection.payload)
            }
            None => {
                errors.push(PageError::DecodeFailure);
                Identification::Unidentified
            }
        }
    }

    fn read_grade(
        &self,
        page_number: PageNumber,
        image: &GrayImage,
        errors: &mut Vec<PageError>,
        cancel: &CancellationToken,
    ) -> (Option<Grade>, String) {
        let enhanced = enhance_for_ocr(image);
        self.diagnostics.snapshot(page_number, "ocr_ready", &enhanced);

        let region = extract_grade_region(&enhanced, self.ocr.as_ref(), &self.region, cancel);
        self.diagnostics.grade_region(page_number, image, &region.bbox);

        let raw_text = match self.ocr.recognize_text(&region.image, cancel) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("page {page_number}: grade recognition failed: {e:#}");
                errors.push(PageError::RecognitionFailure(format!("{e:#}")));
                return (None, String::new());
            }
        };
        let grade = parse_grade(&raw_text);
        if grade.is_none() {
            errors.push(PageError::MissingGrade);
        }
        (grade, raw_text)
    }
}
