//! Wire formats for LLM extraction output.
//!
//! Two encodings are supported, selected by the project's `toon_output`
//! flag: plain JSON and TOON, a tab-delimited tabular encoding that trades
//! readability for output-token count. Both parsers tolerate surrounding
//! markdown fences and produce the same flat record sequence; everything
//! downstream (schema resolution, grouping) is format-agnostic.

mod json;
mod toon;

use thiserror::Error;

pub use toon::encode as encode_toon;

/// Which encoding the model was asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Toon,
}

impl WireFormat {
    pub fn for_flags(toon_output: bool) -> Self {
        if toon_output {
            WireFormat::Toon
        } else {
            WireFormat::Json
        }
    }
}

/// One extraction record as it appears on the wire, before schema
/// resolution. Field names that match nothing in the schema are resolved
/// (or discarded) later; absence is represented, not defaulted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawExtraction {
    pub column_id: Option<String>,
    pub column_name: Option<String>,
    pub value: Option<String>,
    pub image_index: Option<i64>,
    pub row_index: Option<i64>,
    pub bbox_2d: Option<[i64; 4]>,
    pub confidence: Option<f64>,
}

/// The response does not match the declared wire format. Non-retriable:
/// the same model will likely produce the same malformed output again.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("response is not valid JSON: {0}")]
    Json(String),
    #[error("expected an 'extractions' array, got {0}")]
    Shape(String),
    #[error("malformed TOON header: {0}")]
    ToonHeader(String),
    #[error("TOON body line {line}: {reason}")]
    ToonBody { line: usize, reason: String },
}

/// Parse assistant content in the given format, tolerating markdown fences.
pub fn parse(content: &str, format: WireFormat) -> Result<Vec<RawExtraction>, ParseError> {
    let stripped = strip_code_fences(content);
    match format {
        WireFormat::Json => json::parse(stripped),
        WireFormat::Toon => toon::parse(stripped),
    }
}

/// Remove a surrounding markdown code fence, with or without a language
/// tag. Content without fences passes through untouched.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line, then the closing fence.
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => return trimmed,
    };
    body.trim_end().strip_suffix("```").map_or(body, str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences_plain_and_tagged() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_format_selection() {
        assert_eq!(WireFormat::for_flags(false), WireFormat::Json);
        assert_eq!(WireFormat::for_flags(true), WireFormat::Toon);
    }

    #[test]
    fn test_parse_dispatches_with_fences() {
        let content = "```json\n{\"extractions\":[{\"column_id\":\"a\",\"column_name\":\"A\",\"value\":\"1\",\"image_index\":0}]}\n```";
        let records = parse(content, WireFormat::Json).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].column_id.as_deref(), Some("a"));
    }
}
