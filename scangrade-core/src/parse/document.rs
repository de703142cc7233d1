use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    batch::{queued, BatchScheduler},
    native::{RasterMessage, RasterQueue, RasterRequest},
    page::{PageInput, PageProcessor, PageSource},
};
use crate::{
    config::ScanConfig,
    detect::{CodeDetector, CodeReader, MultiFormatReader, QrReader},
    draw::{DiagnosticSink, DirectorySink, NoopSink},
    entities::{ExamIdentifier, PageNumber, PageResult, ScanMetadata, ScanReport},
    metadata::read_shortcut,
    ocr::{OcrEngine, TesseractEngine},
};

const PDF_MAGIC: &[u8] = b"%PDF";
/// Rendered pages waiting for a worker. A page at 10x is tens of megabytes.
const RASTER_BUFFER: usize = 2;

/// Pluggable engines of the pipeline.
#[derive(Clone)]
pub struct ScanEngines {
    pub primary_reader: Arc<dyn CodeReader>,
    pub secondary_reader: Option<Arc<dyn CodeReader>>,
    pub ocr: Arc<dyn OcrEngine>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl ScanEngines {
    /// Default engines: rqrr, rxing, the tesseract binary, and a PNG sink when
    /// a debug directory is configured.
    pub fn from_config(config: &ScanConfig) -> Self {
        let diagnostics: Arc<dyn DiagnosticSink> = match &config.debug_dir {
            Some(dir) => Arc::new(DirectorySink::new(dir)),
            None => Arc::new(NoopSink),
        };
        Self {
            primary_reader: Arc::new(QrReader),
            secondary_reader: Some(Arc::new(MultiFormatReader)),
            ocr: Arc::new(TesseractEngine::new(config.ocr.clone())),
            diagnostics,
        }
    }
}

/// Entry point of a scan: turns a document or a set of images into page
/// results ordered by page number.
///
/// Pdf documents are rasterized by the pdfium worker and read for an embedded
/// identifier; every page then runs through the [`PageProcessor`] on the
/// [`BatchScheduler`] pool.
#[derive(Clone)]
pub struct ScanPipeline {
    config: ScanConfig,
    raster_queue: RasterQueue,
    processor: PageProcessor,
    scheduler: BatchScheduler,
}

impl ScanPipeline {
    /// Must be called from within a tokio runtime, the pdfium worker is
    /// started on the blocking pool.
    pub fn new(config: ScanConfig, engines: ScanEngines) -> Self {
        let ScanEngines {
            primary_reader,
            secondary_reader,
            ocr,
            diagnostics,
        } = engines;
        let processor = PageProcessor::new(
            CodeDetector::new(primary_reader, secondary_reader),
            ocr,
            diagnostics,
            config.deskew.clone(),
            config.region.clone(),
        );
        Self {
            raster_queue: RasterQueue::new(config.pdfium_lib_dir.clone()),
            scheduler: BatchScheduler::from_config(&config),
            processor,
            config,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Number of pages of a pdf document, without rendering them.
    pub async fn page_count(&self, doc: &[u8]) -> anyhow::Result<usize> {
        let (result_tx, mut result_rx) = mpsc::channel(1);
        let request =
            RasterRequest::new_count_only(Arc::from(doc), self.config.password.as_deref(), result_tx);
        self.raster_queue
            .push(request)
            .await
            .context("Failed to send page count request to raster queue")?;

        match result_rx
            .recv()
            .await
            .context("Failed to receive page count result")?
            .context("Rasterizer error")?
        {
            RasterMessage::PageCount(count) => Ok(count),
            other => anyhow::bail!("Received {other:?} for page count request"),
        }
    }

    /// Scan a pdf document or a single image.
    ///
    /// Fails only when the document itself can't be opened; page failures are
    /// tags on the page results.
    pub async fn process_document<P>(
        &self,
        doc: &[u8],
        doc_name: String,
        cancel: CancellationToken,
        progress: Option<P>,
    ) -> anyhow::Result<ScanReport>
    where
        P: Fn(PageNumber),
    {
        let start_time = Instant::now();
        let pages = if doc.starts_with(PDF_MAGIC) {
            self.process_pdf(doc, cancel, progress)
                .instrument(tracing::info_span!("pdf", doc_name = %doc_name))
                .await?
        } else {
            let image = image::load_from_memory(doc)
                .with_context(|| format!("{doc_name} is neither a pdf nor a readable image"))?
                .to_luma8();
            self.process_pages(vec![PageInput::raster(1, image)], cancel, progress)
                .await
        };

        Ok(self.report(doc_name, pages, start_time))
    }

    /// Scan independent image files. Page numbers follow the input order and
    /// each result records its file name.
    pub async fn process_images<P>(
        &self,
        paths: Vec<PathBuf>,
        doc_name: String,
        cancel: CancellationToken,
        progress: Option<P>,
    ) -> ScanReport
    where
        P: Fn(PageNumber),
    {
        let start_time = Instant::now();
        let inputs = paths
            .into_iter()
            .enumerate()
            .map(|(idx, path)| PageInput::file(idx + 1, path))
            .collect();
        let pages = self.process_pages(inputs, cancel, progress).await;
        self.report(doc_name, pages, start_time)
    }

    /// Run already prepared pages.
    pub async fn process_pages<P>(
        &self,
        inputs: Vec<PageInput>,
        cancel: CancellationToken,
        progress: Option<P>,
    ) -> Vec<PageResult>
    where
        P: Fn(PageNumber),
    {
        let units = inputs.into_iter().map(|i| (i.page_number, i)).collect();
        self.schedule(queued(units), cancel, progress).await
    }

    #[tracing::instrument(skip_all)]
    async fn process_pdf<P>(
        &self,
        doc: &[u8],
        cancel: CancellationToken,
        progress: Option<P>,
    ) -> anyhow::Result<Vec<PageResult>>
    where
        P: Fn(PageNumber),
    {
        let doc_data: Arc<[u8]> = Arc::from(doc);
        let shortcut = self.load_shortcut(Arc::clone(&doc_data)).await;
        match &shortcut {
            Some(id) => tracing::info!(
                "document metadata identifies student {} exam {}",
                id.student_id,
                id.exam_id
            ),
            None => tracing::debug!("no metadata shortcut, using code detection"),
        }

        let (raster_tx, raster_rx) = mpsc::channel(RASTER_BUFFER);
        let request = RasterRequest::new(
            doc_data,
            self.config.password.as_deref(),
            self.config.page_range.clone(),
            self.config.render_scale,
            raster_tx,
        );
        self.raster_queue.push(request).await?;
        self.process_rasters(raster_rx, shortcut, cancel, progress)
            .await
    }

    /// Read the metadata record on the blocking pool, lopdf parses the whole
    /// document.
    async fn load_shortcut(&self, doc: Arc<[u8]>) -> Option<ExamIdentifier> {
        let key = self.config.metadata_key.clone();
        match tokio::task::spawn_blocking(move || read_shortcut(&doc, &key)).await {
            Ok(shortcut) => shortcut,
            Err(e) => {
                tracing::warn!("metadata reader failed: {e}");
                None
            }
        }
    }

    /// Schedule the pages of a raster stream as they arrive.
    async fn process_rasters<P>(
        &self,
        mut raster_rx: mpsc::Receiver<anyhow::Result<RasterMessage>>,
        shortcut: Option<ExamIdentifier>,
        cancel: CancellationToken,
        progress: Option<P>,
    ) -> anyhow::Result<Vec<PageResult>>
    where
        P: Fn(PageNumber),
    {
        // The document is opened before any page is sent; failing here is fatal.
        let page_count = match raster_rx
            .recv()
            .await
            .context("rasterizer stopped before opening the document")??
        {
            RasterMessage::PageCount(count) => count,
            other => anyhow::bail!("expected the page count first, got {other:?}"),
        };
        tracing::info!("rasterizing {page_count} pages");

        let (unit_tx, unit_rx) = mpsc::channel(1);
        let (_, pages) = tokio::join!(
            forward_rasters(raster_rx, shortcut, unit_tx),
            self.schedule(unit_rx, cancel, progress)
        );
        Ok(pages)
    }

    async fn schedule<P>(
        &self,
        units: mpsc::Receiver<(PageNumber, PageInput)>,
        cancel: CancellationToken,
        progress: Option<P>,
    ) -> Vec<PageResult>
    where
        P: Fn(PageNumber),
    {
        let processor = self.processor.clone();
        self.scheduler
            .run(
                units,
                move |_, input, token| processor.process(input, token),
                cancel,
                progress,
            )
            .await
    }

    fn report(&self, doc_name: String, pages: Vec<PageResult>, start_time: Instant) -> ScanReport {
        let duration = start_time.elapsed();
        tracing::info!(
            "scanned {} pages of {doc_name} in {}ms",
            pages.len(),
            duration.as_millis()
        );
        ScanReport {
            doc_name,
            pages,
            debug_path: self.config.debug_dir.clone(),
            metadata: ScanMetadata::new(duration),
        }
    }
}

/// Turn rasterizer messages into page units. The metadata record describes
/// the first sheet of the document and only goes to page 1.
async fn forward_rasters(
    mut raster_rx: mpsc::Receiver<anyhow::Result<RasterMessage>>,
    shortcut: Option<ExamIdentifier>,
    unit_tx: mpsc::Sender<(PageNumber, PageInput)>,
) {
    while let Some(message) = raster_rx.recv().await {
        let input = match message {
            Ok(RasterMessage::Page {
                page_number, image, ..
            }) => PageInput::raster(page_number, image),
            Ok(RasterMessage::PageFailed {
                page_number,
                reason,
            }) => PageInput {
                page_number,
                source: PageSource::RenderFailed(reason),
                shortcut: None,
            },
            Ok(RasterMessage::PageCount(_)) => continue,
            Err(e) => {
                tracing::error!("rasterizer failed mid document: {e:#}");
                break;
            }
        };
        let input = if input.page_number == 1 {
            input.with_shortcut(shortcut.clone())
        } else {
            input
        };
        if unit_tx.send((input.page_number, input)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use image::{GrayImage, Luma};
    use lopdf::{dictionary, Object};

    use super::*;
    use crate::{
        config::DEFAULT_METADATA_KEY,
        detect::tests::FixedReader,
        entities::{CodePayload, Identification},
        error::PageError,
        metadata::tests::doc_with_info,
        region::tests::StaticOcr,
    };

    fn pipeline_with(reader: Arc<FixedReader>) -> ScanPipeline {
        let engines = ScanEngines {
            primary_reader: reader,
            secondary_reader: None,
            ocr: Arc::new(StaticOcr {
                words: vec![],
                text: "85 / 100".to_owned(),
            }),
            diagnostics: Arc::new(NoopSink),
        };
        ScanPipeline::new(ScanConfig::default(), engines)
    }

    fn rendered(page_number: PageNumber) -> anyhow::Result<RasterMessage> {
        Ok(RasterMessage::Page {
            page_number,
            image: GrayImage::from_pixel(64, 64, Luma([255u8])),
            render_duration_ms: 0,
        })
    }

    fn raster_stream(
        messages: Vec<anyhow::Result<RasterMessage>>,
    ) -> mpsc::Receiver<anyhow::Result<RasterMessage>> {
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for message in messages {
            let _ = tx.try_send(message);
        }
        rx
    }

    fn no_progress() -> Option<fn(PageNumber)> {
        None
    }

    #[tokio::test]
    async fn test_metadata_record_identifies_first_page() -> anyhow::Result<()> {
        let mut doc = doc_with_info(dictionary! {
            DEFAULT_METADATA_KEY => Object::string_literal(r#"{"student_id": 45, "exam_id": 9}"#),
        });
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)?;

        let reader = Arc::new(FixedReader::new(Some("7-3-20250107")));
        let pipeline = pipeline_with(reader.clone());
        let shortcut = pipeline.load_shortcut(Arc::from(bytes.as_slice())).await;
        assert_eq!(shortcut, Some(ExamIdentifier::new(45, 9)));

        let stream = raster_stream(vec![Ok(RasterMessage::PageCount(2)), rendered(1), rendered(2)]);
        let pages = pipeline
            .process_rasters(stream, shortcut, CancellationToken::new(), no_progress())
            .await?;

        assert_eq!(pages.len(), 2);
        assert_eq!(
            pages[0].identification(),
            &Identification::Metadata(ExamIdentifier::new(45, 9))
        );
        assert!(matches!(
            pages[1].identification(),
            Identification::Vision(CodePayload::Parsed(id)) if id.student_id == 7
        ));
        // Only page 2 went through code detection, and its raw attempt decoded.
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_render_failure_becomes_a_page_tag() -> anyhow::Result<()> {
        let pipeline = pipeline_with(Arc::new(FixedReader::new(Some("7-3-20250107"))));
        let stream = raster_stream(vec![
            Ok(RasterMessage::PageCount(2)),
            Ok(RasterMessage::PageFailed {
                page_number: 1,
                reason: "bad stream".to_owned(),
            }),
            rendered(2),
        ]);
        let pages = pipeline
            .process_rasters(stream, None, CancellationToken::new(), no_progress())
            .await?;

        assert_eq!(
            pages[0].errors(),
            [PageError::RenderFailure("bad stream".to_owned())]
        );
        assert!(pages[1].errors().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unopenable_document_is_fatal() {
        let pipeline = pipeline_with(Arc::new(FixedReader::new(None)));
        let stream = raster_stream(vec![Err(anyhow::anyhow!("can't open pdf document"))]);
        let result = pipeline
            .process_rasters(stream, None, CancellationToken::new(), no_progress())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_no_metadata_record() {
        let pipeline = pipeline_with(Arc::new(FixedReader::new(None)));
        assert_eq!(
            pipeline.load_shortcut(Arc::from(&b"%PDF-1.5 truncated"[..])).await,
            None
        );
    }
}
