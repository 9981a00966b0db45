//! JSON wire format.
//!
//! Accepts `{"extractions": [...]}` or a bare array. Individual records are
//! decoded tolerantly: numeric and boolean values become strings, numeric
//! strings are accepted where integers are expected, and unknown fields are
//! ignored.

use serde_json::Value;

use super::{ParseError, RawExtraction};

pub(super) fn parse(content: &str) -> Result<Vec<RawExtraction>, ParseError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| ParseError::Json(e.to_string()))?;

    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("extractions") {
            Some(Value::Array(items)) => items,
            Some(other) => return Err(ParseError::Shape(type_name(other).to_string())),
            None => return Err(ParseError::Shape("an object without that key".to_string())),
        },
        other => return Err(ParseError::Shape(type_name(other).to_string())),
    };

    Ok(items.iter().filter_map(decode_record).collect())
}

/// Decode one record; non-object entries are dropped.
fn decode_record(item: &Value) -> Option<RawExtraction> {
    let map = item.as_object()?;
    Some(RawExtraction {
        column_id: map.get("column_id").and_then(as_string),
        column_name: map.get("column_name").and_then(as_string),
        value: map.get("value").and_then(as_value_string),
        image_index: map.get("image_index").and_then(as_integer),
        row_index: map.get("row_index").and_then(as_integer),
        bbox_2d: map.get("bbox_2d").and_then(as_bbox),
        confidence: map.get("confidence").and_then(Value::as_f64),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Extracted cell values keep their textual form; null stays absent.
fn as_value_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bbox(value: &Value) -> Option<[i64; 4]> {
    let items = value.as_array()?;
    if items.len() != 4 {
        return None;
    }
    let mut bbox = [0i64; 4];
    for (slot, item) in bbox.iter_mut().zip(items) {
        *slot = as_integer(item)?;
    }
    Some(bbox)
}
