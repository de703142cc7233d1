use lopdf::{Dictionary, Document, Object};
use tracing::instrument;

use crate::entities::ExamIdentifier;

const STUDENT_ID_KEY: &[u8] = b"Student_ID";
const EXAM_ID_KEY: &[u8] = b"Exam_ID";
const STUDENT_NAME_KEY: &[u8] = b"Student_Name";
const EXAM_TITLE_KEY: &[u8] = b"Exam_Title";
const DATE_KEY: &[u8] = b"Date";

/// Look for the identifier record embedded by the exam generator in the
/// document information dictionary.
///
/// Never fails: a document without the record, with a malformed record or that
/// cannot be parsed at all yields `None` and the pages go through code
/// detection instead.
#[instrument(skip(data))]
pub fn read_shortcut(data: &[u8], key: &str) -> Option<ExamIdentifier> {
    match Document::load_mem(data) {
        Ok(doc) => read_shortcut_from(&doc, key),
        Err(e) => {
            tracing::debug!("can't read document metadata: {e}");
            None
        }
    }
}

pub fn read_shortcut_from(doc: &Document, key: &str) -> Option<ExamIdentifier> {
    let info = match info_dictionary(doc) {
        Some(info) => info,
        None => {
            tracing::debug!("document has no information dictionary");
            return None;
        }
    };

    if let Some(record) = text_entry(doc, info, key.as_bytes()) {
        match serde_json::from_str::<ExamIdentifier>(&record) {
            Ok(id) => return Some(id),
            Err(e) => tracing::debug!("metadata key {key} holds an invalid record: {e}"),
        }
    }

    let student_id = text_entry(doc, info, STUDENT_ID_KEY)?.trim().parse().ok()?;
    let exam_id = text_entry(doc, info, EXAM_ID_KEY)?.trim().parse().ok()?;
    let mut id = ExamIdentifier::new(student_id, exam_id);
    id.student_name = text_entry(doc, info, STUDENT_NAME_KEY);
    id.exam_title = text_entry(doc, info, EXAM_TITLE_KEY);
    id.date = text_entry(doc, info, DATE_KEY);
    Some(id)
}

fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
    match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn text_entry(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    let object = match dict.get(key).ok()? {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        object => object,
    };
    match object {
        Object::String(bytes, _) => Some(decode_text_string(bytes)),
        Object::Name(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Object::Integer(n) => Some(n.to_string()),
        _ => None,
    }
}

/// PDF text strings are either UTF-16BE with a byte order mark or a single byte
/// encoding. Generators commonly put raw UTF-8 in the latter.
fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
