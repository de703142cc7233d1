use std::{ops::Range, path::PathBuf, time::Duration};

/// Default key of the document information entry holding the identifier record.
pub const DEFAULT_METADATA_KEY: &str = "YeshivaData";

/// Configuration options for a scan. Passed to [`crate::ScanPipeline::new`];
/// nothing in the pipeline reads process-wide state.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Number of pages processed concurrently.
    pub max_workers: usize,

    /// Upper bound on the time spent on one page. `None` disables the timeout.
    pub page_timeout: Option<Duration>,

    /// Magnification used to rasterize PDF pages. Visual codes are printed with
    /// small modules, anything close to screen resolution loses them.
    pub render_scale: f32,

    /// Optional password for encrypted PDF documents
    pub password: Option<String>,

    /// Optional range of pages to process (0-based, end exclusive). When None,
    /// processes all pages
    pub page_range: Option<Range<usize>>,

    /// Document information key holding the JSON identifier record
    pub metadata_key: String,

    /// Directory where pdfium is looked up. Falls back to the system library.
    pub pdfium_lib_dir: Option<PathBuf>,

    /// Optional directory for debug snapshots of each stage
    pub debug_dir: Option<PathBuf>,

    pub ocr: OcrConfig,
    pub region: RegionConfig,
    pub deskew: DeskewConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            page_timeout: Some(Duration::from_secs(120)),
            render_scale: 10.0,
            password: None,
            page_range: None,
            metadata_key: DEFAULT_METADATA_KEY.to_owned(),
            pdfium_lib_dir: None,
            debug_dir: None,
            ocr: OcrConfig::default(),
            region: RegionConfig::default(),
            deskew: DeskewConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// Path to the tesseract executable. Uses `tesseract` from `PATH` when None.
    pub tesseract_path: Option<PathBuf>,
    /// Languages used to find anchor words on the full page
    pub page_languages: String,
    /// Languages used to read the grade itself
    pub grade_languages: String,
    /// Characters tesseract may emit when reading the grade region
    pub grade_whitelist: String,
    /// Tesseract page segmentation mode
    pub psm: u8,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            tesseract_path: None,
            page_languages: "heb+eng".to_owned(),
            grade_languages: "eng".to_owned(),
            grade_whitelist: "0123456789./".to_owned(),
            psm: 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Words marking the grade box ("score", "total", "points").
    pub anchor_keywords: Vec<String>,
    /// Pixels added to the anchor word width.
    pub extra_width: u32,
    /// Pixels added to the anchor word height.
    pub extra_height: u32,
    /// Fallback crop, as fractions of the page: (x0, y0, x1, y1).
    pub fallback: (f32, f32, f32, f32),
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            anchor_keywords: ["ציון", "סה\"כ", "נקודות", "score", "total", "points"]
                .into_iter()
                .map(String::from)
                .collect(),
            extra_width: 200,
            extra_height: 50,
            fallback: (0.3, 0.85, 0.7, 1.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeskewConfig {
    /// Lines whose skew exceeds this many degrees are ignored.
    pub max_skew_degrees: f32,
    /// Skews below this many degrees are left alone.
    pub min_skew_degrees: f32,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for DeskewConfig {
    fn default() -> Self {
        Self {
            max_skew_degrees: 45.0,
            min_skew_degrees: 0.5,
            canny_low: 50.0,
            canny_high: 150.0,
        }
    }
}
