//! Prompt assembly.
//!
//! Prompts are rendered deterministically: fixed preamble, schema in stored
//! column order, feature-flag-conditional rule blocks, and an output-format
//! example generated by the same code path the parser accepts.

use docgrid_protocol::{ColumnDefinition, ColumnType, ExtractionResult, Project};

use crate::wire::{encode_toon, WireFormat};

const CORE_PREAMBLE: &str = "You are a precise data extraction engine. You are given one or more \
document images (statements, receipts, invoices or similar) and, where \
available, OCR reference text for each page. Extract the fields defined \
below exactly as they appear in the document. Do not invent values: when a \
field is not present, return null for it. Respond with the extraction data \
only, no commentary.";

const REDO_PREAMBLE: &str = "You are a precise data extraction engine. You are given cropped \
sub-images of a document, one per field listed below. Re-extract only those \
fields from their crops. Do not invent values: when a field is not legible, \
return null for it. Respond with the extraction data only, no commentary.";

/// Full-batch extraction prompt.
pub fn build_extraction_prompt(project: &Project) -> String {
    let mut prompt = String::new();
    prompt.push_str(CORE_PREAMBLE);
    prompt.push_str("\n\n## Fields to extract\n\n");
    prompt.push_str(&render_schema(&project.columns));
    prompt.push_str("\n## Rules\n\n");
    prompt.push_str(&render_rules(project));
    prompt.push_str("\n## Output format\n\n");
    prompt.push_str(&render_output_format(project, &project.columns));
    prompt
}

/// Redo prompt: only the redo columns are extracted; the row's other
/// fields are provided as read-only context.
pub fn build_redo_prompt(
    project: &Project,
    context: &[ExtractionResult],
    redo_column_ids: &[String],
) -> String {
    let redo_columns: Vec<ColumnDefinition> = redo_column_ids
        .iter()
        .filter_map(|id| project.column_by_id(id).cloned())
        .collect();

    let mut prompt = String::new();
    prompt.push_str(REDO_PREAMBLE);
    prompt.push_str("\n\n## Fields to re-extract\n\n");
    prompt.push_str(&render_schema(&redo_columns));
    prompt.push_str(
        "\nThe crops are provided in the order the fields are listed above, one image per field.\n",
    );

    let context_fields: Vec<&ExtractionResult> = context
        .iter()
        .filter(|r| !redo_column_ids.contains(&r.column_id))
        .collect();
    if !context_fields.is_empty() {
        prompt.push_str("\n## Other fields of this row (read-only context, do not re-extract)\n\n");
        for field in context_fields {
            prompt.push_str(&format!(
                "- {}: {}\n",
                field.column_name,
                field.value.as_deref().unwrap_or("null")
            ));
        }
    }

    prompt.push_str("\n## Rules\n\n");
    prompt.push_str(&render_rules(project));
    prompt.push_str(&format!(
        "- Return exactly {} extraction(s), one per field listed above.\n",
        redo_columns.len()
    ));
    prompt.push_str("\n## Output format\n\n");
    prompt.push_str(&render_output_format(project, &redo_columns));
    prompt
}

/// Columns in stored order, each with id, name, type and any constraints.
fn render_schema(columns: &[ColumnDefinition]) -> String {
    let mut out = String::new();
    for column in columns {
        out.push_str(&format!(
            "- `{}` (\"{}\", {})",
            column.id, column.name, column.column_type
        ));
        if let Some(description) = &column.description {
            out.push_str(&format!(": {description}"));
        }
        if let Some(allowed) = &column.allowed_values {
            out.push_str(&format!("; allowed values: {}", allowed.join(", ")));
        }
        if let Some(pattern) = &column.validation_pattern {
            out.push_str(&format!("; must match `{pattern}`"));
        }
        out.push('\n');
    }
    out
}

fn render_rules(project: &Project) -> String {
    let mut out = String::new();
    out.push_str(
        "- Use the field ids above as `column_id` and the field names as `column_name`.\n",
    );
    out.push_str("- `image_index` is the 0-based index of the image a value came from.\n");

    if project.flags.multi_row_extraction {
        out.push_str(
            "- The document contains repeating items (e.g. one transaction per line). \
Emit one set of fields per item and tag every extraction with a 0-based \
`row_index`, starting at 0 with no gaps.\n",
        );
    } else {
        out.push_str("- The document describes a single item; extract each field once.\n");
    }

    if project.flags.bounding_boxes {
        out.push_str(&format!(
            "- For every extraction include `bbox_2d`, the bounding box of the value as \
{} with integer coordinates in [0, 1000]; x and y are normalized \
independently of the aspect ratio.\n",
            project.coordinate_format.tuple_order()
        ));
    }

    if project.flags.confidence_scores {
        out.push_str(
            "- For every extraction include `confidence`, a number between 0.0 and 1.0.\n",
        );
    }

    out
}

/// Render the output example in the project's wire format. The example's
/// shape is exactly what the response parser accepts.
fn render_output_format(project: &Project, columns: &[ColumnDefinition]) -> String {
    let samples: Vec<&ColumnDefinition> = columns.iter().take(2).collect();
    match WireFormat::for_flags(project.flags.toon_output) {
        WireFormat::Json => {
            let extractions: Vec<serde_json::Value> =
                samples.iter().map(|c| json_sample(project, c)).collect();
            let body = serde_json::to_string_pretty(&serde_json::json!({
                "extractions": extractions
            }))
            .expect("sample extraction serializes");
            format!("Respond with JSON of this exact shape:\n\n{body}\n")
        }
        WireFormat::Toon => {
            let mut fields = vec!["column_id", "column_name", "value", "image_index"];
            if project.flags.multi_row_extraction {
                fields.push("row_index");
            }
            if project.flags.bounding_boxes {
                fields.push("bbox_2d");
            }
            if project.flags.confidence_scores {
                fields.push("confidence");
            }
            let rows: Vec<Vec<Option<String>>> = samples
                .iter()
                .map(|c| toon_sample(c, &fields))
                .collect();
            let body = encode_toon(&fields, &rows);
            format!(
                "Respond in TOON: a header line `extractions[N]{{fields}}:` where N is the \
number of extractions, then N lines indented two spaces with TAB-separated \
values in the declared order. Use the literal `null` for missing values. \
Example:\n\n{body}"
            )
        }
    }
}

fn json_sample(project: &Project, column: &ColumnDefinition) -> serde_json::Value {
    let mut sample = serde_json::json!({
        "column_id": column.id,
        "column_name": column.name,
        "value": sample_value(column.column_type),
        "image_index": 0,
    });
    let object = sample.as_object_mut().expect("sample is an object");
    if project.flags.multi_row_extraction {
        object.insert("row_index".to_string(), serde_json::json!(0));
    }
    if project.flags.bounding_boxes {
        object.insert("bbox_2d".to_string(), serde_json::json!([120, 80, 480, 110]));
    }
    if project.flags.confidence_scores {
        object.insert("confidence".to_string(), serde_json::json!(0.95));
    }
    sample
}

fn toon_sample(column: &ColumnDefinition, fields: &[&str]) -> Vec<Option<String>> {
    fields
        .iter()
        .map(|field| match *field {
            "column_id" => Some(column.id.clone()),
            "column_name" => Some(column.name.clone()),
            "value" => Some(sample_value(column.column_type).to_string()),
            "image_index" => Some("0".to_string()),
            "row_index" => Some("0".to_string()),
            "bbox_2d" => Some("[120, 80, 480, 110]".to_string()),
            "confidence" => Some("0.95".to_string()),
            _ => None,
        })
        .collect()
}

fn sample_value(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "Coffee Shop",
        ColumnType::Number => "3",
        ColumnType::Date => "2024-03-15",
        ColumnType::Currency => "42.00",
        ColumnType::Boolean => "true",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use docgrid_protocol::{CoordinateFormat, FeatureFlags, LlmSettings, RateLimitSettings};

    fn project(flags: FeatureFlags) -> Project {
        Project {
            id: "p1".to_string(),
            owner_id: "u1".to_string(),
            name: "Statements".to_string(),
            columns: vec![
                ColumnDefinition {
                    id: "date".to_string(),
                    name: "Date".to_string(),
                    column_type: ColumnType::Date,
                    description: Some("Transaction date".to_string()),
                    allowed_values: None,
                    validation_pattern: None,
                },
                ColumnDefinition {
                    id: "total".to_string(),
                    name: "Total".to_string(),
                    column_type: ColumnType::Currency,
                    description: None,
                    allowed_values: None,
                    validation_pattern: Some(r"^\d+\.\d{2}$".to_string()),
                },
            ],
            flags,
            llm: LlmSettings {
                endpoint_url: "https://llm.example/v1/chat/completions".to_string(),
                model: "vision-1".to_string(),
                api_key: "key".to_string(),
            },
            limits: RateLimitSettings::default(),
            request_timeout_secs: 60,
            coordinate_format: CoordinateFormat::YminXminYmaxXmax,
        }
    }

    #[test]
    fn test_prompt_renders_schema_in_order() {
        let prompt = build_extraction_prompt(&project(FeatureFlags::default()));
        let date_at = prompt.find("`date`").unwrap();
        let total_at = prompt.find("`total`").unwrap();
        assert!(date_at < total_at);
        assert!(prompt.contains("Transaction date"));
        assert!(prompt.contains(r"^\d+\.\d{2}$"));
    }

    #[test]
    fn test_rule_blocks_follow_flags() {
        let plain = build_extraction_prompt(&project(FeatureFlags::default()));
        assert!(!plain.contains("row_index"));
        assert!(!plain.contains("bbox_2d"));
        assert!(!plain.contains("confidence"));

        let full = build_extraction_prompt(&project(FeatureFlags {
            bounding_boxes: true,
            confidence_scores: true,
            multi_row_extraction: true,
            toon_output: false,
        }));
        assert!(full.contains("row_index"));
        assert!(full.contains("[y_min, x_min, y_max, x_max]"));
        assert!(full.contains("confidence"));
    }

    #[test]
    fn test_json_example_parses_with_the_wire_parser() {
        let project = project(FeatureFlags {
            bounding_boxes: true,
            confidence_scores: true,
            multi_row_extraction: true,
            toon_output: false,
        });
        let example = render_output_format(&project, &project.columns);
        let body = &example[example.find('{').unwrap()..];
        let records = wire::parse(body, wire::WireFormat::Json).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bbox_2d, Some([120, 80, 480, 110]));
        assert_eq!(records[0].confidence, Some(0.95));
    }

    #[test]
    fn test_toon_example_parses_with_the_wire_parser() {
        let project = project(FeatureFlags {
            bounding_boxes: false,
            confidence_scores: false,
            multi_row_extraction: true,
            toon_output: true,
        });
        let example = render_output_format(&project, &project.columns);
        let body = &example[example.find("extractions[").unwrap()..];
        let records = wire::parse(body, wire::WireFormat::Toon).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].column_id.as_deref(), Some("date"));
        assert_eq!(records[1].value.as_deref(), Some("42.00"));
    }

    #[test]
    fn test_redo_prompt_lists_only_redo_columns_with_context() {
        let project = project(FeatureFlags::default());
        let context = vec![
            ExtractionResult {
                column_id: "date".to_string(),
                column_name: "Date".to_string(),
                value: Some("2024-03-15".to_string()),
                image_index: 0,
                bbox_2d: None,
                confidence: None,
                row_index: Some(0),
                redone: None,
            },
            ExtractionResult {
                column_id: "total".to_string(),
                column_name: "Total".to_string(),
                value: Some("42.00".to_string()),
                image_index: 0,
                bbox_2d: None,
                confidence: None,
                row_index: Some(0),
                redone: None,
            },
        ];
        let prompt = build_redo_prompt(&project, &context, &["total".to_string()]);

        // Only the redo column is listed for extraction.
        assert!(prompt.contains("`total`"));
        assert!(!prompt.contains("`date`"));
        // The other field appears as read-only context.
        assert!(prompt.contains("- Date: 2024-03-15"));
        assert!(prompt.contains("exactly 1 extraction(s)"));
    }
}
