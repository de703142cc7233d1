pub mod config;
pub mod deskew;
pub mod detect;
pub mod draw;
pub mod entities;
pub mod error;
pub mod grade;
pub mod metadata;
pub mod ocr;
pub mod parse;
pub mod persist;
pub mod region;
mod utils;

pub use config::ScanConfig;
pub use parse::{
    batch::BatchScheduler,
    document::{ScanEngines, ScanPipeline},
    page::{PageInput, PageProcessor, PageSource},
};
pub use persist::{
    Assignment, AssignmentResolver, BatchStats, GradeEntry, GradeWriter, ResultPersister,
};
pub use utils::{create_dirs, save_batch_stats, save_scan_report};
