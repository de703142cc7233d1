use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    entities::{CodePayload, Identification, PageResult},
    error::PersistError,
};

pub const DEFAULT_GRADER: &str = "OCR";
pub const GRADING_METHOD: &str = "automated";
const NOTES_EXCERPT_CHARS: usize = 100;
const MAX_REPORTED_ERRORS: usize = 10;

/// A student scheduled to sit an exam, as stored by the grading store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Assignment {
    pub id: u64,
    pub student_id: u64,
    pub exam_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GradeEntry {
    pub score: u32,
    pub grader: String,
    pub method: String,
    pub confidence: f32,
    pub notes: String,
}

pub trait AssignmentResolver: Send + Sync {
    /// Most recently scheduled assignment of `student_id` to `exam_id`.
    fn find_latest_assignment(
        &self,
        student_id: u64,
        exam_id: u64,
    ) -> anyhow::Result<Option<Assignment>>;
}

pub trait GradeWriter: Send + Sync {
    fn write_grade(&self, assignment: &Assignment, entry: &GradeEntry) -> anyhow::Result<()>;
}

/// Outcome of one persistence call.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub saved: usize,
    pub failed: usize,
    /// First errors, capped.
    pub errors: Vec<String>,
    pub total_errors: usize,
}

impl BatchStats {
    fn record_error(&mut self, error: &PersistError) {
        self.failed += 1;
        self.total_errors += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(error.to_string());
        }
    }
}

/// Commits page results to a grading store. Pages are independent: a failing
/// page is counted and reported without touching the others.
pub struct ResultPersister<'a> {
    resolver: &'a dyn AssignmentResolver,
    writer: &'a dyn GradeWriter,
    grader: String,
}

impl<'a> ResultPersister<'a> {
    pub fn new(resolver: &'a dyn AssignmentResolver, writer: &'a dyn GradeWriter) -> Self {
        Self {
            resolver,
            writer,
            grader: DEFAULT_GRADER.to_owned(),
        }
    }

    pub fn with_grader(mut self, grader: impl Into<String>) -> Self {
        self.grader = grader.into();
        self
    }

    #[instrument(skip_all, fields(pages = pages.len()))]
    pub fn persist(&self, pages: &[PageResult]) -> BatchStats {
        let mut stats = BatchStats {
            total: pages.len(),
            ..Default::default()
        };
        for page in pages {
            match self.persist_page(page) {
                Ok(()) => stats.saved += 1,
                Err(e) => {
                    tracing::warn!("{e}");
                    stats.record_error(&e);
                }
            }
        }
        tracing::info!(
            "persisted {} grades, {} failed out of {}",
            stats.saved,
            stats.failed,
            stats.total
        );
        stats
    }

    pub fn persist_page(&self, page: &PageResult) -> Result<(), PersistError> {
        let page_number = page.page_number();
        let id = match page.identification() {
            Identification::Vision(CodePayload::Unparsed(raw)) => {
                return Err(PersistError::UnparsedPayload {
                    page: page_number,
                    raw: raw.clone(),
                })
            }
            identification => identification
                .identifier()
                .ok_or(PersistError::MissingIdentifier { page: page_number })?,
        };
        let grade = page
            .grade()
            .ok_or(PersistError::MissingGrade { page: page_number })?;

        let assignment = self
            .resolver
            .find_latest_assignment(id.student_id, id.exam_id)
            .map_err(|e| PersistError::PersistenceFailure {
                page: page_number,
                reason: format!("{e:#}"),
            })?
            .ok_or(PersistError::UnmatchedAssignment {
                student_id: id.student_id,
                exam_id: id.exam_id,
            })?;

        let entry = GradeEntry {
            score: grade.score,
            grader: self.grader.clone(),
            method: GRADING_METHOD.to_owned(),
            confidence: grade.confidence,
            notes: format!(
                "OCR: {}",
                page.raw_text()
                    .chars()
                    .take(NOTES_EXCERPT_CHARS)
                    .collect::<String>()
            ),
        };
        self.writer
            .write_grade(&assignment, &entry)
            .map_err(|e| PersistError::PersistenceFailure {
                page: page_number,
                reason: format!("{e:#}"),
            })
    }
}
