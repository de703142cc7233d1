use serde::{Deserialize, Deserializer, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::PageError;

/// 1-based page number, the stable ordering key of a scan.
pub type PageNumber = usize;

const SCANGRADE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity confidence of an identifier read from document metadata.
pub const SHORTCUT_CONFIDENCE: f32 = 1.0;

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            x0: x,
            y0: y,
            x1: x + w,
            y1: y + h,
        }
    }

    #[inline(always)]
    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
    #[inline(always)]
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }
    #[inline(always)]
    pub fn area(&self) -> f32 {
        self.height() * self.width()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.width() <= 0f32 || self.height() <= 0f32
    }

    /// Clamp the box to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x0: self.x0.clamp(0f32, w),
            y0: self.y0.clamp(0f32, h),
            x1: self.x1.clamp(0f32, w),
            y1: self.y1.clamp(0f32, h),
        }
    }
}

/// Identifier of the student/exam pair that produced a page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExamIdentifier {
    #[serde(deserialize_with = "de_numeric_id")]
    pub student_id: u64,
    #[serde(deserialize_with = "de_numeric_id")]
    pub exam_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_title: Option<String>,
}

impl ExamIdentifier {
    pub fn new(student_id: u64, exam_id: u64) -> Self {
        Self {
            student_id,
            exam_id,
            date: None,
            version: None,
            student_name: None,
            exam_title: None,
        }
    }
}

/// Ids are written as JSON numbers by the exam generator but as strings in the
/// individual metadata keys.
fn de_numeric_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Decoded content of a visual code.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CodePayload {
    Parsed(ExamIdentifier),
    /// Raw payload that matched neither the JSON nor the positional format.
    Unparsed(String),
}

/// How a page's identity was recovered.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(tag = "source", content = "payload", rename_all = "snake_case")]
pub enum Identification {
    Metadata(ExamIdentifier),
    Vision(CodePayload),
    #[default]
    Unidentified,
}

impl Identification {
    /// The parsed identifier, whatever its source.
    pub fn identifier(&self) -> Option<&ExamIdentifier> {
        match self {
            Identification::Metadata(id) | Identification::Vision(CodePayload::Parsed(id)) => {
                Some(id)
            }
            _ => None,
        }
    }

    pub fn is_shortcut(&self) -> bool {
        matches!(self, Identification::Metadata(_))
    }

    /// Confidence in the identity itself (not in the grade).
    pub fn confidence(&self) -> Option<f32> {
        match self {
            Identification::Metadata(_) => Some(SHORTCUT_CONFIDENCE),
            Identification::Vision(CodePayload::Parsed(_)) => Some(1.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Grade {
    pub score: u32,
    pub total: Option<u32>,
    pub percentage: Option<f64>,
    pub confidence: f32,
}

/// Outcome for one page. Produced once by the page processor and never mutated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PageResult {
    page_number: PageNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    identification: Identification,
    grade: Option<Grade>,
    raw_text: String,
    errors: Vec<PageError>,
}

impl PageResult {
    pub fn new(
        page_number: PageNumber,
        identification: Identification,
        grade: Option<Grade>,
        raw_text: String,
        errors: Vec<PageError>,
    ) -> Self {
        Self {
            page_number,
            source: None,
            identification,
            grade,
            raw_text,
            errors,
        }
    }

    /// Result for a page whose processing could not run at all.
    pub fn failed(page_number: PageNumber, error: PageError) -> Self {
        Self::new(
            page_number,
            Identification::Unidentified,
            None,
            String::new(),
            vec![error],
        )
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    pub fn page_number(&self) -> PageNumber {
        self.page_number
    }
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
    pub fn identification(&self) -> &Identification {
        &self.identification
    }
    pub fn identifier(&self) -> Option<&ExamIdentifier> {
        self.identification.identifier()
    }
    pub fn is_shortcut(&self) -> bool {
        self.identification.is_shortcut()
    }
    pub fn grade(&self) -> Option<&Grade> {
        self.grade.as_ref()
    }
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }
    pub fn errors(&self) -> &[PageError] {
        &self.errors
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScanMetadata {
    #[serde(with = "serde_millis")]
    pub scan_duration: Duration,
    pub scangrade_version: String,
}

impl ScanMetadata {
    pub fn new(scan_duration: Duration) -> Self {
        Self {
            scan_duration,
            scangrade_version: SCANGRADE_VERSION.to_owned(),
        }
    }
}

/// A finished scan job.
#[derive(Debug, Deserialize, Serialize)]
pub struct ScanReport {
    pub doc_name: String,
    pub pages: Vec<PageResult>,
    pub debug_path: Option<PathBuf>,
    pub metadata: ScanMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_clamp() {
        let bbox = BBox::from_xywh(-10.0, 90.0, 50.0, 50.0);
        let clamped = bbox.clamp_to(100, 100);
        assert_eq!(
            clamped,
            BBox {
                x0: 0.0,
                y0: 90.0,
                x1: 40.0,
                y1: 100.0
            }
        );
        assert_eq!(clamped.area(), 400.0);

        let outside = BBox::from_xywh(120.0, 0.0, 10.0, 10.0).clamp_to(100, 100);
        assert!(outside.is_empty());
    }

    #[test]
    fn test_identifier_accepts_string_ids() -> anyhow::Result<()> {
        let id: ExamIdentifier =
            serde_json::from_str(r#"{"student_id": "45", "exam_id": 9, "version": "A"}"#)?;
        assert_eq!(id.student_id, 45);
        assert_eq!(id.exam_id, 9);
        assert_eq!(id.version.as_deref(), Some("A"));
        assert!(id.date.is_none());

        let bad = serde_json::from_str::<ExamIdentifier>(r#"{"student_id": "abc", "exam_id": 9}"#);
        assert!(bad.is_err());
        Ok(())
    }

    #[test]
    fn test_identification_sources() {
        let id = ExamIdentifier::new(7, 3);
        let shortcut = Identification::Metadata(id.clone());
        let vision = Identification::Vision(CodePayload::Parsed(id.clone()));
        let unparsed = Identification::Vision(CodePayload::Unparsed("garbage".into()));

        assert!(shortcut.is_shortcut());
        assert_eq!(shortcut.confidence(), Some(SHORTCUT_CONFIDENCE));
        assert!(!vision.is_shortcut());
        assert_eq!(vision.identifier(), Some(&id));
        assert_eq!(unparsed.identifier(), None);
        assert_eq!(Identification::Unidentified.confidence(), None);
    }

    #[test]
    fn test_page_result_serde() -> anyhow::Result<()> {
        let page = PageResult::new(
            2,
            Identification::Vision(CodePayload::Parsed(ExamIdentifier::new(7, 3))),
            Some(Grade {
                score: 85,
                total: Some(100),
                percentage: Some(85.0),
                confidence: 0.8,
            }),
            "85 / 100".to_string(),
            vec![],
        );
        let json = serde_json::to_value(&page)?;
        assert_eq!(json["page_number"], 2);
        assert_eq!(json["identification"]["source"], "vision");
        assert_eq!(json["identification"]["payload"]["value"]["student_id"], 7);

        let back: PageResult = serde_json::from_value(json)?;
        assert_eq!(back, page);
        Ok(())
    }
}
