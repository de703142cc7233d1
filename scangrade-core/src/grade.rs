use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::entities::Grade;

const RATIO_CONFIDENCE: f32 = 0.8;
const LABEL_CONFIDENCE: f32 = 0.6;
const POINTS_CONFIDENCE: f32 = 0.4;
const BARE_NUMBER_CONFIDENCE: f32 = 0.4;

lazy_static! {
    static ref RATIO_PATTERNS: [Regex; 3] = [
        Regex::new(r"(?i)([0-9]+)\s*/\s*([0-9]+)").unwrap(),
        Regex::new(r"(?i)([0-9]+)\s*(?:מתוך|out\s+of)\s*([0-9]+)").unwrap(),
        Regex::new(r"(?i)([0-9]+)\s*:\s*([0-9]+)").unwrap(),
    ];
    static ref LABEL_PATTERN: Regex = Regex::new(r"(?i)(?:ציון|score|grade)[:\s]*([0-9]+)").unwrap();
    static ref POINTS_PATTERN: Regex =
        Regex::new(r"(?i)([0-9]{1,3})\s*(?:נקודות|נק|points|pts)").unwrap();
    static ref NUMBER_PATTERN: Regex = Regex::new(r"[0-9]+").unwrap();
}

/// Extract a score from recognized text.
///
/// Patterns are tried from the most to the least specific and the first that
/// matches wins: `score/total` style ratios, a labelled score, a score with a
/// points suffix, then any number.
pub fn parse_grade(text: &str) -> Option<Grade> {
    RATIO_PATTERNS
        .iter()
        .find_map(|re| re.captures(text).and_then(|c| ratio_grade(&c)))
        .or_else(|| single_grade(&LABEL_PATTERN, text, LABEL_CONFIDENCE))
        .or_else(|| single_grade(&POINTS_PATTERN, text, POINTS_CONFIDENCE))
        .or_else(|| {
            let score = NUMBER_PATTERN
                .find_iter(text)
                .find_map(|m| m.as_str().parse().ok())?;
            Some(Grade {
                score,
                total: None,
                percentage: None,
                confidence: BARE_NUMBER_CONFIDENCE,
            })
        })
}

fn ratio_grade(captures: &Captures) -> Option<Grade> {
    let score: u32 = captures.get(1)?.as_str().parse().ok()?;
    let total: u32 = captures.get(2)?.as_str().parse().ok()?;
    let percentage =
        (total > 0).then(|| (score as f64 / total as f64 * 100f64 * 100f64).round() / 100f64);
    Some(Grade {
        score,
        total: Some(total),
        percentage,
        confidence: RATIO_CONFIDENCE,
    })
}

fn single_grade(re: &Regex, text: &str, confidence: f32) -> Option<Grade> {
    let score = re.captures(text)?.get(1)?.as_str().parse().ok()?;
    Some(Grade {
        score,
        total: None,
        percentage: None,
        confidence,
    })
}
