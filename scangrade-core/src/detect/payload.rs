use crate::entities::{CodePayload, ExamIdentifier};

/// Interpret the text carried by a visual code.
///
/// Two encodings are produced by the exam generator: the JSON identifier
/// record, and the compact `<student_id>-<exam_id>-<YYYYMMDD>` form used when
/// the code has to stay small. Anything else is kept verbatim as
/// [`CodePayload::Unparsed`].
pub fn parse_payload(raw: &str) -> CodePayload {
    let text = raw.trim();
    if let Ok(id) = serde_json::from_str::<ExamIdentifier>(text) {
        return CodePayload::Parsed(id);
    }
    match parse_positional(text) {
        Some(id) => CodePayload::Parsed(id),
        None => CodePayload::Unparsed(raw.to_owned()),
    }
}

fn parse_positional(text: &str) -> Option<ExamIdentifier> {
    let parts: Vec<&str> = text.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    let student_id = parts[0].trim().parse().ok()?;
    let exam_id = parts[1].trim().parse().ok()?;
    let mut id = ExamIdentifier::new(student_id, exam_id);
    let date = parts[2].trim();
    id.date = (!date.is_empty()).then(|| format_compact_date(date));
    Some(id)
}

/// `YYYYMMDD` to `YYYY-MM-DD`; other shapes are kept as written.
fn format_compact_date(date: &str) -> String {
    if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) {
        format!("{}-{}-{}", &date[..4], &date[4..6], &date[6..])
    } else {
        date.to_owned()
    }
}
