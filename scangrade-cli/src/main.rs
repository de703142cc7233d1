use clap::{Args, Parser, Subcommand};
use colored::*;

use indicatif::{ProgressBar, ProgressStyle};
use memmap2::Mmap;
use scangrade_core::{
    config::{OcrConfig, DEFAULT_METADATA_KEY},
    create_dirs,
    entities::ScanReport,
    persist::DEFAULT_GRADER,
    save_batch_stats, save_scan_report, BatchStats, ResultPersister, ScanConfig, ScanEngines,
    ScanPipeline,
};
use std::{
    fs::File,
    ops::Range,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod store;

use store::JsonGradeStore;

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp"];

#[derive(Parser, Debug)]
#[command(
    version,
    about = "scangrade - read student identity and grades from scanned exams",
    long_about = "scangrade reads the identity of the student and exam from the metadata or the printed code of scanned exam pages, recognizes the handwritten grade and commits it to the grading store."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a pdf, an image, or a directory of images
    Scan(ScanArgs),
    /// Commit the grades of a saved scan report
    Commit {
        /// Path to a `<doc>.json` report produced by `scan`
        report: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Pdf or image files, or directories of images
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    #[arg(
        long,
        short('r'),
        help = "Specify pages to scan (e.g., '1-5' or '1' for single page)"
    )]
    page_range: Option<String>,

    #[arg(long, env = "SCANGRADE_PDF_PASSWORD", help = "Password of encrypted pdfs")]
    password: Option<String>,

    /// Specifies the target directory where scan results will be saved
    ///
    /// If not specified, defaults to the current working directory.
    #[arg(
        long,
        env = "SCANGRADE_OUTPUT_DIR",
        help = "Specify the directory to store scan results"
    )]
    output_dir: Option<PathBuf>,

    #[arg(
        long,
        short('j'),
        env = "SCANGRADE_WORKERS",
        default_value_t = 4,
        help = "Number of pages processed concurrently"
    )]
    workers: usize,

    #[arg(
        long,
        env = "SCANGRADE_PAGE_TIMEOUT",
        default_value_t = 120,
        help = "Per page timeout in seconds, 0 disables it"
    )]
    page_timeout: u64,

    #[arg(
        long,
        env = "SCANGRADE_RENDER_SCALE",
        default_value_t = 10.0,
        help = "Magnification used to render pdf pages"
    )]
    render_scale: f32,

    #[arg(
        long,
        env = "SCANGRADE_METADATA_KEY",
        default_value = DEFAULT_METADATA_KEY,
        help = "Document information key holding the identifier record"
    )]
    metadata_key: String,

    #[arg(
        long,
        env = "SCANGRADE_TESSERACT_PATH",
        help = "Path to the tesseract executable"
    )]
    tesseract_path: Option<PathBuf>,

    #[arg(
        long,
        env = "SCANGRADE_PDFIUM_LIB_DIR",
        help = "Directory containing the pdfium shared library"
    )]
    pdfium_lib_dir: Option<PathBuf>,

    /// Enable debug mode to output intermediate images
    #[arg(
        long,
        default_value_t = false,
        env = "SCANGRADE_DEBUG",
        help = "Save the intermediate images of every page"
    )]
    debug: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Commit the grades to the store once the scan is done"
    )]
    commit: bool,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args, Debug)]
struct StoreArgs {
    #[arg(
        long,
        env = "SCANGRADE_ASSIGNMENTS",
        default_value = "assignments.json",
        help = "JSON array of student exam assignments"
    )]
    assignments: PathBuf,

    #[arg(
        long,
        env = "SCANGRADE_GRADES",
        default_value = "grades.jsonl",
        help = "JSON lines file grades are appended to"
    )]
    grades: PathBuf,

    #[arg(
        long,
        env = "SCANGRADE_GRADER",
        default_value = DEFAULT_GRADER,
        help = "Name recorded as the grader"
    )]
    grader: String,
}

fn parse_page_range(range_str: &str) -> anyhow::Result<Range<usize>> {
    if let Some((start, end)) = range_str.split_once('-') {
        let start: usize = start.trim().parse()?;
        let end: usize = end.trim().parse()?;
        if start > 0 && end >= start {
            Ok(Range {
                start: start - 1,
                end,
            })
        } else {
            anyhow::bail!("Invalid page range: start must be > 0 and end must be >= start")
        }
    } else {
        // Single page
        let page: usize = range_str.trim().parse()?;
        if page > 0 {
            Ok(Range {
                start: page - 1,
                end: page,
            })
        } else {
            anyhow::bail!("Page number must be greater than 0")
        }
    }
}

fn setup_progress_bar(length_pages: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(length_pages as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("#>-"),
    );
    Ok(pb)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("scangrade=info,scangrade_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// Expand directories into their image files, sorted by name.
fn collect_inputs(inputs: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut images: Vec<PathBuf> = std::fs::read_dir(input)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image(p))
                .collect();
            images.sort();
            files.extend(images);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn doc_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next().map(|s| s.to_owned()))
        .unwrap_or(Uuid::new_v4().to_string())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} Cancelling, waiting for running pages", "!".red().bold());
            child.cancel();
        }
    });
    token
}

fn print_summary(report: &ScanReport) {
    for page in &report.pages {
        let id = page
            .identifier()
            .map(|id| format!("student {} exam {}", id.student_id, id.exam_id))
            .unwrap_or_else(|| "unidentified".to_owned());
        let grade = page
            .grade()
            .map(|g| match g.total {
                Some(total) => format!("{}/{}", g.score, total),
                None => g.score.to_string(),
            })
            .unwrap_or_else(|| "-".to_owned());
        let status = if page.errors().is_empty() {
            "✓".green().bold()
        } else {
            "✗".red().bold()
        };
        let errors: Vec<String> = page.errors().iter().map(|e| e.to_string()).collect();
        println!(
            "{status} Page {:>3} {}{:<28} grade {:<8} {}",
            page.page_number(),
            if page.is_shortcut() { "*" } else { " " },
            id,
            grade,
            errors.join("; ").dimmed()
        );
    }
}

fn print_stats(stats: &BatchStats) {
    println!(
        "{} Saved {} of {} grades ({} failed)",
        if stats.failed == 0 {
            "✓".green().bold()
        } else {
            "ℹ".yellow().bold()
        },
        stats.saved.to_string().green(),
        stats.total,
        stats.failed.to_string().red()
    );
    for error in &stats.errors {
        println!("  {} {}", "-".red(), error);
    }
    if stats.total_errors > stats.errors.len() {
        println!(
            "  ... and {} more",
            stats.total_errors - stats.errors.len()
        );
    }
}

fn commit_report(report: &ScanReport, store_args: &StoreArgs) -> anyhow::Result<BatchStats> {
    let store = JsonGradeStore::open(&store_args.assignments, &store_args.grades)?;
    let stats = ResultPersister::new(&store, &store)
        .with_grader(store_args.grader.clone())
        .persist(&report.pages);
    print_stats(&stats);
    Ok(stats)
}

/// One report produced by `scan`.
#[derive(Debug, PartialEq)]
enum ScanJob {
    /// A pdf, or any single file, scanned as its own document.
    Document(PathBuf),
    /// Image files scanned together, one page each.
    Images { name: String, paths: Vec<PathBuf> },
}

impl ScanJob {
    fn doc_name(&self) -> String {
        match self {
            ScanJob::Document(path) => doc_name_of(path),
            ScanJob::Images { name, .. } => name.clone(),
        }
    }
}

/// A single input is one document. Otherwise every non-image file is its own
/// document and the images form one batch named after the first input.
fn plan_jobs(files: Vec<PathBuf>, inputs: &[PathBuf]) -> Vec<ScanJob> {
    if files.len() == 1 {
        return files.into_iter().map(ScanJob::Document).collect();
    }
    let (paths, documents): (Vec<_>, Vec<_>) = files.into_iter().partition(|p| is_image(p));
    let mut jobs: Vec<ScanJob> = documents.into_iter().map(ScanJob::Document).collect();
    if !paths.is_empty() {
        let name = inputs
            .first()
            .map(|p| doc_name_of(p))
            .unwrap_or(Uuid::new_v4().to_string());
        jobs.push(ScanJob::Images { name, paths });
    }
    jobs
}

fn scan_config(
    args: &ScanArgs,
    page_range: Option<Range<usize>>,
    debug_dir: Option<PathBuf>,
) -> ScanConfig {
    ScanConfig {
        max_workers: args.workers,
        page_timeout: (args.page_timeout > 0).then(|| Duration::from_secs(args.page_timeout)),
        render_scale: args.render_scale,
        password: args.password.clone(),
        page_range,
        metadata_key: args.metadata_key.clone(),
        pdfium_lib_dir: args.pdfium_lib_dir.clone(),
        debug_dir,
        ocr: OcrConfig {
            tesseract_path: args.tesseract_path.clone(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn scan_document(
    pipeline: &ScanPipeline,
    path: &Path,
    doc_name: String,
    cancel: CancellationToken,
) -> anyhow::Result<ScanReport> {
    let file = File::open(path)?;
    // SAFETY: the input is only read, and not expected to change during the scan
    let mmap = unsafe { Mmap::map(&file)? };
    let length_pages = if mmap.starts_with(b"%PDF") {
        let total = pipeline.page_count(&mmap).await?;
        pipeline
            .config()
            .page_range
            .as_ref()
            .map(|r| r.len())
            .unwrap_or(total)
    } else {
        1
    };
    let pb = setup_progress_bar(length_pages)?;
    let pbc = pb.clone();
    let report = pipeline
        .process_document(
            &mmap,
            doc_name,
            cancel,
            Some(move |page| {
                pbc.set_message(format!("Page #{page}"));
                pbc.inc(1u64);
            }),
        )
        .await?;
    pb.finish_with_message(format!(
        "Scanned document in {}ms",
        report.metadata.scan_duration.as_millis()
    ));
    Ok(report)
}

async fn scan_images(
    pipeline: &ScanPipeline,
    paths: Vec<PathBuf>,
    doc_name: String,
    cancel: CancellationToken,
) -> anyhow::Result<ScanReport> {
    let pb = setup_progress_bar(paths.len())?;
    let pbc = pb.clone();
    let report = pipeline
        .process_images(
            paths,
            doc_name,
            cancel,
            Some(move |page| {
                pbc.set_message(format!("Image #{page}"));
                pbc.inc(1u64);
            }),
        )
        .await;
    pb.finish_with_message(format!(
        "Scanned images in {}ms",
        report.metadata.scan_duration.as_millis()
    ));
    Ok(report)
}

async fn run_job(
    args: &ScanArgs,
    job: ScanJob,
    page_range: Option<Range<usize>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let doc_name = job.doc_name();
    let (res_dir_path, debug_dir) = create_dirs(args.output_dir.as_ref(), &doc_name, args.debug)?;
    let config = scan_config(args, page_range, debug_dir);
    let engines = ScanEngines::from_config(&config);
    let pipeline = ScanPipeline::new(config, engines);

    let report = match job {
        ScanJob::Document(path) => scan_document(&pipeline, &path, doc_name, cancel).await?,
        ScanJob::Images { paths, .. } => scan_images(&pipeline, paths, doc_name, cancel).await?,
    };

    print_summary(&report);
    save_scan_report(&report, &res_dir_path)?;

    if args.commit {
        let stats = commit_report(&report, &args.store)?;
        save_batch_stats(&stats, &report.doc_name, &res_dir_path)?;
    }
    Ok(())
}

async fn scan(args: ScanArgs) -> anyhow::Result<()> {
    let page_range = args
        .page_range
        .as_deref()
        .map(parse_page_range)
        .transpose()?;
    let jobs = plan_jobs(collect_inputs(&args.inputs)?, &args.inputs);
    anyhow::ensure!(!jobs.is_empty(), "no input files found");

    let cancel = cancel_on_ctrl_c();
    let total = jobs.len();
    let mut failed = 0;
    for job in jobs {
        if cancel.is_cancelled() {
            break;
        }
        let doc_name = job.doc_name();
        if let Err(e) = run_job(&args, job, page_range.clone(), cancel.clone()).await {
            if total == 1 {
                return Err(e);
            }
            eprintln!("{} Can't scan {}: {e:#}", "✗".red().bold(), doc_name);
            failed += 1;
        }
    }
    anyhow::ensure!(failed == 0, "{failed} of {total} documents could not be scanned");
    Ok(())
}

fn commit(report_path: &Path, store_args: &StoreArgs) -> anyhow::Result<()> {
    let file = File::open(report_path)?;
    let report: ScanReport = serde_json::from_reader(std::io::BufReader::new(file))?;
    let stats = commit_report(&report, store_args)?;
    if let Some(dir) = report_path.parent() {
        save_batch_stats(&stats, &report.doc_name, dir)?;
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Scan(args) => scan(args).await,
        Command::Commit { report, store } => commit(&report, &store),
    }
}
