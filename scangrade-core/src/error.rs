use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::PageNumber;

/// Error tags attached to a page result. None of these abort sibling pages.
#[derive(Debug, Clone, PartialEq, Eq, Error, Deserialize, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum PageError {
    #[error("no code found after the full decode cascade")]
    DecodeFailure,

    #[error("code payload is neither JSON nor <student>-<exam>-<date>")]
    UnparsedPayload,

    #[error("no grade digits recognized")]
    MissingGrade,

    #[error("text recognition failed: {0}")]
    RecognitionFailure(String),

    #[error("page could not be rendered: {0}")]
    RenderFailure(String),

    #[error("source could not be read: {0}")]
    SourceUnreadable(String),

    #[error("page processing timed out")]
    Timeout,

    #[error("page processing was cancelled")]
    Cancelled,

    #[error("page worker failed: {0}")]
    WorkerFailure(String),
}

/// Reasons a page result could not be committed to the grading store.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Page {page}: missing identifier")]
    MissingIdentifier { page: PageNumber },

    #[error("Page {page}: unparsed code payload {raw:?}")]
    UnparsedPayload { page: PageNumber, raw: String },

    #[error("Page {page}: missing grade")]
    MissingGrade { page: PageNumber },

    #[error("Student {student_id} not assigned to exam {exam_id}")]
    UnmatchedAssignment { student_id: u64, exam_id: u64 },

    #[error("Page {page}: error saving grade: {reason}")]
    PersistenceFailure { page: PageNumber, reason: String },
}
