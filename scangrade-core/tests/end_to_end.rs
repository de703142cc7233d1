use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use image::{GrayImage, ImageFormat, Luma};
use scangrade_core::{
    detect::CodeReader,
    draw::NoopSink,
    entities::{ExamIdentifier, Identification, PageNumber},
    error::PageError,
    ocr::{OcrEngine, OcrWord},
    Assignment, AssignmentResolver, BatchStats, GradeEntry, GradeWriter, PageInput,
    ResultPersister, ScanConfig, ScanEngines, ScanPipeline,
};
use tokio_util::sync::CancellationToken;

const MARKER: u8 = 17;

/// Stands in for a QR reader: "decodes" pages carrying two marker pixels.
#[derive(Default)]
struct MarkerReader {
    calls: AtomicUsize,
}

impl CodeReader for MarkerReader {
    fn name(&self) -> &'static str {
        "marker"
    }

    fn decode(&self, image: &GrayImage) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (image.get_pixel(0, 0)[0] == MARKER && image.get_pixel(1, 0)[0] == MARKER)
            .then(|| "7-3-20250107".to_owned())
    }
}

struct FixedOcr;

impl OcrEngine for FixedOcr {
    fn recognize_words(
        &self,
        _image: &GrayImage,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<OcrWord>> {
        Ok(vec![])
    }

    fn recognize_text(
        &self,
        _image: &GrayImage,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        Ok("85 / 100".to_owned())
    }
}

/// OCR that never answers on its own, like a stuck tesseract process.
struct StuckOcr;

impl OcrEngine for StuckOcr {
    fn recognize_words(
        &self,
        _image: &GrayImage,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<OcrWord>> {
        Ok(vec![])
    }

    fn recognize_text(
        &self,
        _image: &GrayImage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                anyhow::bail!("ocr cancelled");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok("85 / 100".to_owned())
    }
}

#[derive(Default)]
struct MemoryStore {
    assignments: Vec<Assignment>,
    written: Mutex<Vec<(u64, GradeEntry)>>,
}

impl AssignmentResolver for MemoryStore {
    fn find_latest_assignment(
        &self,
        student_id: u64,
        exam_id: u64,
    ) -> anyhow::Result<Option<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .find(|a| a.student_id == student_id && a.exam_id == exam_id)
            .cloned())
    }
}

impl GradeWriter for MemoryStore {
    fn write_grade(&self, assignment: &Assignment, entry: &GradeEntry) -> anyhow::Result<()> {
        self.written
            .lock()
            .map_err(|_| anyhow::anyhow!("store lock poisoned"))?
            .push((assignment.id, entry.clone()));
        Ok(())
    }
}

fn pipeline(reader: Arc<MarkerReader>) -> ScanPipeline {
    let engines = ScanEngines {
        primary_reader: reader,
        secondary_reader: None,
        ocr: Arc::new(FixedOcr),
        diagnostics: Arc::new(NoopSink),
    };
    ScanPipeline::new(ScanConfig::default(), engines)
}

fn blank_page() -> GrayImage {
    GrayImage::from_pixel(64, 64, Luma([255u8]))
}

fn marked_page() -> GrayImage {
    let mut page = blank_page();
    page.put_pixel(0, 0, Luma([MARKER]));
    page.put_pixel(1, 0, Luma([MARKER]));
    page
}

fn no_progress() -> Option<fn(PageNumber)> {
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scan_and_commit_three_pages() {
    let reader = Arc::new(MarkerReader::default());
    let pipeline = pipeline(reader.clone());
    let inputs = vec![
        PageInput::raster(1, blank_page()).with_shortcut(Some(ExamIdentifier::new(45, 9))),
        PageInput::raster(2, marked_page()),
        PageInput::raster(3, blank_page()),
    ];

    let pages = pipeline
        .process_pages(inputs, CancellationToken::new(), no_progress())
        .await;

    assert_eq!(pages.len(), 3);
    let ids: Vec<_> = pages
        .iter()
        .map(|p| p.identifier().map(|id| (id.student_id, id.exam_id)))
        .collect();
    assert_eq!(ids, [Some((45, 9)), Some((7, 3)), None]);
    assert!(pages[0].is_shortcut());
    assert!(matches!(pages[1].identification(), Identification::Vision(_)));
    assert_eq!(
        pages[1].identifier().and_then(|id| id.date.as_deref()),
        Some("2025-01-07")
    );
    assert_eq!(pages[2].errors(), [PageError::DecodeFailure]);
    assert!(pages.iter().all(|p| p.grade().map(|g| g.score) == Some(85)));

    let store = MemoryStore {
        assignments: vec![
            Assignment {
                id: 100,
                student_id: 45,
                exam_id: 9,
                scheduled_date: None,
            },
            Assignment {
                id: 200,
                student_id: 7,
                exam_id: 3,
                scheduled_date: Some("2025-01-07".into()),
            },
        ],
        ..Default::default()
    };
    let stats = ResultPersister::new(&store, &store).persist(&pages);
    assert_eq!(
        stats,
        BatchStats {
            total: 3,
            saved: 2,
            failed: 1,
            errors: vec!["Page 3: missing identifier".to_owned()],
            total_errors: 1,
        }
    );
    let written = store.written.lock().unwrap();
    let assignment_ids: Vec<_> = written.iter().map(|(id, _)| *id).collect();
    assert_eq!(assignment_ids, [100, 200]);
    assert_eq!(written[0].1.method, "automated");
    assert_eq!(written[0].1.notes, "OCR: 85 / 100");
}

#[tokio::test]
async fn test_rerun_is_identical() {
    let pipeline = pipeline(Arc::new(MarkerReader::default()));
    let inputs = || {
        vec![
            PageInput::raster(1, marked_page()),
            PageInput::raster(2, blank_page()),
        ]
    };
    let first = pipeline
        .process_pages(inputs(), CancellationToken::new(), no_progress())
        .await;
    let second = pipeline
        .process_pages(inputs(), CancellationToken::new(), no_progress())
        .await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_image_batch_with_unreadable_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let good = dir.path().join("student-7.png");
    marked_page().save(&good)?;
    let broken = dir.path().join("student-8.png");
    std::fs::write(&broken, b"truncated")?;

    let pipeline = pipeline(Arc::new(MarkerReader::default()));
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);
    let report = pipeline
        .process_images(
            vec![good, broken],
            "batch".to_owned(),
            CancellationToken::new(),
            Some(move |_page| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

    assert_eq!(report.pages.len(), 2);
    assert_eq!(report.pages[0].source(), Some("student-7.png"));
    assert_eq!(
        report.pages[0].identifier().map(|id| id.student_id),
        Some(7)
    );
    assert_eq!(report.pages[1].source(), Some("student-8.png"));
    assert!(matches!(
        report.pages[1].errors(),
        [PageError::SourceUnreadable(_)]
    ));
    assert_eq!(finished.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_single_image_document() -> anyhow::Result<()> {
    let mut png = Cursor::new(Vec::new());
    marked_page().write_to(&mut png, ImageFormat::Png)?;

    let pipeline = pipeline(Arc::new(MarkerReader::default()));
    let report = pipeline
        .process_document(
            png.get_ref(),
            "scan".to_owned(),
            CancellationToken::new(),
            no_progress(),
        )
        .await?;
    assert_eq!(report.doc_name, "scan");
    assert_eq!(report.pages.len(), 1);
    assert_eq!(report.pages[0].page_number(), 1);
    assert_eq!(report.pages[0].identifier().map(|id| id.exam_id), Some(3));

    let garbage = pipeline
        .process_document(
            b"not an image",
            "junk".to_owned(),
            CancellationToken::new(),
            no_progress(),
        )
        .await;
    assert!(garbage.is_err());
    Ok(())
}

#[tokio::test]
async fn test_cancelled_scan() {
    let reader = Arc::new(MarkerReader::default());
    let pipeline = pipeline(reader.clone());
    let token = CancellationToken::new();
    token.cancel();

    let pages = pipeline
        .process_pages(
            vec![
                PageInput::raster(1, marked_page()),
                PageInput::raster(2, marked_page()),
            ],
            token,
            no_progress(),
        )
        .await;
    assert!(pages.iter().all(|p| p.errors() == [PageError::Cancelled]));
    assert_eq!(reader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_ocr_does_not_hold_the_pool() {
    let engines = ScanEngines {
        primary_reader: Arc::new(MarkerReader::default()),
        secondary_reader: None,
        ocr: Arc::new(StuckOcr),
        diagnostics: Arc::new(NoopSink),
    };
    let config = ScanConfig {
        max_workers: 1,
        page_timeout: Some(Duration::from_millis(300)),
        ..Default::default()
    };
    let pipeline = ScanPipeline::new(config, engines);

    let start = Instant::now();
    let pages = pipeline
        .process_pages(
            (1..=3).map(|n| PageInput::raster(n, marked_page())).collect(),
            CancellationToken::new(),
            no_progress(),
        )
        .await;

    assert!(pages.iter().all(|p| p.errors() == [PageError::Timeout]));
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_secs(3), "scan took {elapsed:?}");
}
