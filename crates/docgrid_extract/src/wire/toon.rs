//! TOON wire format.
//!
//! Header line: `extractions[N]{f1,f2,...}:`. N body lines follow, each
//! indented two spaces, values TAB-separated in the declared field order.
//! Missing values are the literal `null`. Values containing a tab, a
//! newline, or a leading quote are wrapped in double quotes with internal
//! `"` escaped as `\"`.

use super::{ParseError, RawExtraction};

pub(super) fn parse(content: &str) -> Result<Vec<RawExtraction>, ParseError> {
    let mut lines = content.lines();

    let (count, fields) = loop {
        let Some(line) = lines.next() else {
            return Err(ParseError::ToonHeader("no header line found".to_string()));
        };
        if line.trim().is_empty() {
            continue;
        }
        break parse_header(line.trim())?;
    };

    let mut records = Vec::with_capacity(count);
    for index in 0..count {
        let Some(line) = lines.next() else {
            return Err(ParseError::ToonBody {
                line: index + 1,
                reason: format!("header declared {count} rows, body has {index}"),
            });
        };
        let cells = split_cells(line.strip_prefix("  ").unwrap_or(line));
        if cells.len() != fields.len() {
            return Err(ParseError::ToonBody {
                line: index + 1,
                reason: format!("expected {} values, got {}", fields.len(), cells.len()),
            });
        }
        records.push(decode_record(&fields, &cells, index)?);
    }

    Ok(records)
}

/// `extractions[N]{f1,f2,...}:` -> (N, fields)
fn parse_header(line: &str) -> Result<(usize, Vec<String>), ParseError> {
    let rest = line
        .strip_prefix("extractions[")
        .ok_or_else(|| ParseError::ToonHeader(line.to_string()))?;
    let (count, rest) = rest
        .split_once(']')
        .ok_or_else(|| ParseError::ToonHeader(line.to_string()))?;
    let count: usize = count
        .trim()
        .parse()
        .map_err(|_| ParseError::ToonHeader(format!("bad row count '{count}'")))?;

    let rest = rest
        .strip_prefix('{')
        .ok_or_else(|| ParseError::ToonHeader(line.to_string()))?;
    let (fields, tail) = rest
        .split_once('}')
        .ok_or_else(|| ParseError::ToonHeader(line.to_string()))?;
    if tail.trim() != ":" {
        return Err(ParseError::ToonHeader(line.to_string()));
    }

    let fields: Vec<String> = fields
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.is_empty() {
        return Err(ParseError::ToonHeader("header declares no fields".to_string()));
    }
    Ok((count, fields))
}

/// Split a body line on tabs, honoring double-quoted cells.
fn split_cells(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' if in_quotes => in_quotes = false,
            '"' if current.is_empty() => in_quotes = true,
            '\t' if !in_quotes => {
                cells.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    cells.push(current);
    cells
}

fn decode_record(
    fields: &[String],
    cells: &[String],
    line: usize,
) -> Result<RawExtraction, ParseError> {
    let mut record = RawExtraction::default();
    for (field, cell) in fields.iter().zip(cells) {
        let cell = cell.as_str();
        if cell == "null" {
            continue;
        }
        match field.as_str() {
            "column_id" => record.column_id = Some(cell.to_string()),
            "column_name" => record.column_name = Some(cell.to_string()),
            "value" => record.value = Some(cell.to_string()),
            "image_index" => record.image_index = Some(parse_int(field, cell, line)?),
            "row_index" => record.row_index = Some(parse_int(field, cell, line)?),
            "bbox_2d" => record.bbox_2d = parse_bbox(cell),
            "confidence" => {
                record.confidence = cell.trim().parse().ok();
            }
            // Unknown declared fields are carried but ignored.
            _ => {}
        }
    }
    Ok(record)
}

fn parse_int(field: &str, cell: &str, line: usize) -> Result<i64, ParseError> {
    cell.trim().parse().map_err(|_| ParseError::ToonBody {
        line: line + 1,
        reason: format!("{field} '{cell}' is not an integer"),
    })
}

/// Bounding boxes travel as a JSON-style tuple inside one cell.
fn parse_bbox(cell: &str) -> Option<[i64; 4]> {
    let inner = cell.trim().strip_prefix('[')?.strip_suffix(']')?;
    let parts: Vec<i64> = inner
        .split(',')
        .map(|p| p.trim().parse::<f64>().ok().map(|f| f as i64))
        .collect::<Option<Vec<_>>>()?;
    if parts.len() != 4 {
        return None;
    }
    Some([parts[0], parts[1], parts[2], parts[3]])
}

// ============================================================================
// Encoding (used for prompt output examples)
// ============================================================================

/// Render records in TOON, the exact shape the parser accepts.
pub fn encode(fields: &[&str], rows: &[Vec<Option<String>>]) -> String {
    let mut out = format!("extractions[{}]{{{}}}:\n", rows.len(), fields.join(","));
    for row in rows {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| match cell {
                None => "null".to_string(),
                Some(value) => quote_cell(value),
            })
            .collect();
        out.push_str("  ");
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out
}

fn quote_cell(value: &str) -> String {
    if value.contains('\t') || value.contains('\n') || value.starts_with('"') {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}
