//! Field-aware ingest planning: normalize the caller's input (strings or
//! structured records), project records through an optional schema, select
//! the text segments that become document content, merge metadata layers and
//! plan the per-field + combined chunk set for the processing phase.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::chunker::chunk_by_token_size;
use crate::config::GlobalConfig;
use crate::error::{RagError, Result};
use crate::ids::{combined_chunk_id, compute_mdhash_id, field_chunk_id, PREFIX_DOC};
use crate::tokenize::Tokenizer;
use crate::types::{
    ChunkRecord, FieldSpec, InsertInput, InsertOptions, Metadatas, StructuredRow, TableSchema,
};

/// Metadata key stashing the original record for the processing phase.
pub const ORIGINAL_DATA_KEY: &str = "_original_data";

#[derive(Debug, Clone)]
pub struct InsertPayload {
    pub documents: Vec<String>,
    pub ids: Option<Vec<String>>,
    pub metadatas: Option<Vec<Map<String, Value>>>,
    pub structured_rows: Vec<StructuredRow>,
}

pub fn prepare_insert_payload(
    config: &GlobalConfig,
    input: InsertInput,
    options: &InsertOptions,
) -> Result<InsertPayload> {
    match input {
        InsertInput::Text(text) => prepare_unstructured(vec![text], options),
        InsertInput::Texts(texts) => prepare_unstructured(texts, options),
        InsertInput::Record(record) => prepare_structured(config, vec![record], options),
        InsertInput::Records(records) => prepare_structured(config, records, options),
    }
}

fn prepare_unstructured(documents: Vec<String>, options: &InsertOptions) -> Result<InsertPayload> {
    let ids = normalize_ids(options.ids.as_deref(), documents.len())?;
    let metadatas = normalize_metadatas(options.metadatas.as_ref(), documents.len())?;
    if metadatas.is_some() && ids.is_none() {
        return Err(RagError::Validation(
            "explicit ids are required when providing metadatas".to_string(),
        ));
    }
    Ok(InsertPayload {
        documents,
        ids,
        metadatas,
        structured_rows: Vec::new(),
    })
}

fn prepare_structured(
    config: &GlobalConfig,
    records: Vec<Map<String, Value>>,
    options: &InsertOptions,
) -> Result<InsertPayload> {
    let override_ids = normalize_ids(options.ids.as_deref(), records.len())?;
    let override_metadatas = normalize_metadatas(options.metadatas.as_ref(), records.len())?;
    let id_column = options
        .schema
        .as_ref()
        .map(|s| s.id_column.clone())
        .unwrap_or_else(|| "doc_id".to_string());

    let mut documents = Vec::with_capacity(records.len());
    let mut resolved_ids = Vec::with_capacity(records.len());
    let mut metadata_list = Vec::with_capacity(records.len());
    let mut structured_rows = Vec::new();

    for (idx, record) in records.iter().enumerate() {
        let mut record_fields = record.clone();
        let record_metadata = match record_fields.remove("metadata") {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };

        let structured_values =
            apply_schema_to_record(&record_fields, options.schema.as_ref(), &id_column)?;

        let segments = collect_text_segments(
            &record_fields,
            &structured_values,
            options.text_fields.as_deref(),
            options.schema.as_ref(),
        );
        if segments.is_empty() {
            return Err(RagError::Validation(
                "no text fields found for structured record insertion".to_string(),
            ));
        }
        let doc_text = segments.join("\n").trim().to_string();

        let candidate_id = structured_values
            .get(&id_column)
            .filter(|v| !v.is_null())
            .or_else(|| record_fields.get(&id_column))
            .map(value_to_plain_string)
            .unwrap_or_else(|| compute_mdhash_id(&doc_text, PREFIX_DOC));

        let mut merged = record_metadata;
        for (field, value) in &structured_values {
            if field == &id_column {
                continue;
            }
            merged.insert(field.clone(), value.clone());
        }
        if let Some(overrides) = &override_metadatas {
            for (k, v) in &overrides[idx] {
                merged.insert(k.clone(), v.clone());
            }
        }
        if config.field_split.enable_field_splitting {
            merged.insert(ORIGINAL_DATA_KEY.to_string(), Value::Object(record.clone()));
        }

        if let Some(schema) = &options.schema {
            let mut row = StructuredRow::new();
            for name in schema.column_names() {
                row.insert(
                    name.clone(),
                    structured_values.get(&name).cloned().unwrap_or(Value::Null),
                );
            }
            row.entry(id_column.clone())
                .or_insert_with(|| Value::String(candidate_id.clone()));
            structured_rows.push(row);
        }

        documents.push(doc_text);
        resolved_ids.push(candidate_id);
        metadata_list.push(merged);
    }

    Ok(InsertPayload {
        documents,
        ids: Some(override_ids.unwrap_or(resolved_ids)),
        metadatas: Some(metadata_list),
        structured_rows,
    })
}

fn normalize_ids(ids: Option<&[String]>, expected: usize) -> Result<Option<Vec<String>>> {
    match ids {
        None => Ok(None),
        Some(list) => {
            if list.len() != expected {
                return Err(RagError::Validation(
                    "number of ids must match the number of documents".to_string(),
                ));
            }
            Ok(Some(list.to_vec()))
        }
    }
}

fn normalize_metadatas(
    metadatas: Option<&Metadatas>,
    expected: usize,
) -> Result<Option<Vec<Map<String, Value>>>> {
    match metadatas {
        None => Ok(None),
        Some(Metadatas::Shared(map)) => Ok(Some(vec![map.clone(); expected])),
        Some(Metadatas::PerItem(list)) => {
            if list.len() != expected {
                return Err(RagError::Validation(
                    "number of metadatas must match the number of documents".to_string(),
                ));
            }
            Ok(Some(list.clone()))
        }
    }
}

fn apply_schema_to_record(
    record: &Map<String, Value>,
    schema: Option<&TableSchema>,
    _id_column: &str,
) -> Result<Map<String, Value>> {
    let Some(schema) = schema else {
        return Ok(record.clone());
    };
    if schema.fields.is_empty() {
        return Ok(record.clone());
    }
    let mut structured = Map::new();
    for (field_name, spec) in &schema.fields {
        match record.get(field_name) {
            None | Some(Value::Null) => {
                if !spec.nullable {
                    return Err(RagError::Validation(format!(
                        "field '{field_name}' is not nullable but value is missing"
                    )));
                }
                structured.insert(field_name.clone(), Value::Null);
            }
            Some(value) => {
                structured.insert(field_name.clone(), coerce_field_value(value, spec, field_name)?);
            }
        }
    }
    Ok(structured)
}

fn coerce_field_value(value: &Value, spec: &FieldSpec, field_name: &str) -> Result<Value> {
    let field_type = spec.field_type.to_lowercase();
    match field_type.as_str() {
        "text" | "varchar" | "character varying" => Ok(Value::String(match value {
            Value::Array(items) => items
                .iter()
                .filter(|v| !v.is_null())
                .map(value_to_plain_string)
                .collect::<Vec<_>>()
                .join("\n"),
            other => value_to_plain_string(other),
        })),
        "integer" | "int" | "int4" | "bigint" | "smallint" => {
            let parsed = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                Value::Bool(b) => Some(*b as i64),
                _ => None,
            };
            parsed.map(|n| Value::Number(n.into())).ok_or_else(|| {
                RagError::Validation(format!("field '{field_name}' is not an integer: {value}"))
            })
        }
        "float" | "double" | "double precision" | "real" | "numeric" | "decimal" => {
            let parsed = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| {
                    RagError::Validation(format!("field '{field_name}' is not numeric: {value}"))
                })
        }
        "boolean" | "bool" => {
            let parsed = match value {
                Value::Bool(b) => Some(*b),
                Value::Number(n) => n.as_f64().map(|f| f != 0.0),
                Value::String(s) => s.trim().parse::<bool>().ok(),
                _ => None,
            };
            parsed.map(Value::Bool).ok_or_else(|| {
                RagError::Validation(format!("field '{field_name}' is not a boolean: {value}"))
            })
        }
        // Unknown declared types (timestamps, uuids, …) pass through.
        _ => Ok(value.clone()),
    }
}

fn collect_text_segments(
    record: &Map<String, Value>,
    structured_values: &Map<String, Value>,
    text_fields: Option<&[String]>,
    schema: Option<&TableSchema>,
) -> Vec<String> {
    let candidates: Vec<String> = if let Some(explicit) = text_fields {
        explicit.to_vec()
    } else if let Some(schema) = schema.filter(|s| !s.fields.is_empty()) {
        schema
            .fields
            .iter()
            .filter(|(_, spec)| spec.is_textual())
            .map(|(name, _)| name.clone())
            .collect()
    } else {
        record
            .iter()
            .filter(|(_, value)| value.is_string())
            .map(|(name, _)| name.clone())
            .collect()
    };

    let mut segments = Vec::new();
    for field in candidates {
        let value = record.get(&field).or_else(|| structured_values.get(&field));
        match value {
            None | Some(Value::Null) => continue,
            Some(Value::Array(items)) => {
                segments.extend(
                    items
                        .iter()
                        .filter(|v| !v.is_null())
                        .map(value_to_plain_string),
                );
            }
            Some(other) => segments.push(value_to_plain_string(other)),
        }
    }
    segments.retain(|s| !s.is_empty());
    segments
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Partition a structured record into textual fields and non-text metadata.
/// List values are joined with newlines; the record's own `metadata` sub-map
/// seeds the returned metadata.
pub fn extract_text_fields(
    original: &Map<String, Value>,
    text_field_keys: &[String],
) -> (Vec<(String, String)>, Map<String, Value>) {
    let mut text_fields = Vec::new();
    let mut metadata = match original.get("metadata") {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };

    for (key, value) in original {
        if key == "doc_id" || key == "metadata" {
            continue;
        }
        let is_text = text_field_keys.iter().any(|k| k == key)
            || value.is_string()
            || value.is_array();
        if is_text {
            let content = match value {
                Value::Array(items) => items
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(value_to_plain_string)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n"),
                other => value_to_plain_string(other),
            };
            text_fields.push((key.clone(), content));
        } else {
            metadata.insert(key.clone(), value.clone());
        }
    }
    (text_fields, metadata)
}

/// Produce the multi-granular chunk set for one field-split document: one
/// population per non-empty text field plus, when enabled, the combined
/// `_all` population over the newline-join of every field.
pub fn generate_chunks_per_field(
    config: &GlobalConfig,
    tokenizer: &dyn Tokenizer,
    doc_id: &str,
    text_fields: &[(String, String)],
    base_metadata: &Map<String, Value>,
) -> Result<HashMap<String, ChunkRecord>> {
    let mut all_chunks = HashMap::new();

    for (field_name, field_content) in text_fields {
        if field_content.trim().is_empty() {
            continue;
        }
        let pieces = chunk_by_token_size(
            tokenizer,
            field_content,
            config.chunking.chunk_overlap_token_size,
            config.chunking.chunk_token_size,
        )?;
        for piece in pieces {
            let chunk_id = field_chunk_id(&piece.content, field_name, doc_id);
            let mut metadata = base_metadata.clone();
            metadata.insert("text_field".to_string(), Value::String(field_name.clone()));
            all_chunks.insert(
                chunk_id,
                ChunkRecord {
                    tokens: piece.tokens,
                    content: piece.content,
                    chunk_order_index: piece.chunk_order_index,
                    full_doc_id: doc_id.to_string(),
                    metadata: Value::Object(metadata),
                    updated_at: None,
                },
            );
        }
    }

    if config.field_split.generate_combined_chunk {
        let combined_content = text_fields
            .iter()
            .map(|(_, content)| content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let pieces = chunk_by_token_size(
            tokenizer,
            &combined_content,
            config.chunking.chunk_overlap_token_size,
            config.chunking.chunk_token_size,
        )?;
        for piece in pieces {
            let chunk_id = combined_chunk_id(&piece.content, doc_id);
            let mut metadata = base_metadata.clone();
            metadata.insert("text_field".to_string(), Value::String("_all".to_string()));
            all_chunks.insert(
                chunk_id,
                ChunkRecord {
                    tokens: piece.tokens,
                    content: piece.content,
                    chunk_order_index: piece.chunk_order_index,
                    full_doc_id: doc_id.to_string(),
                    metadata: Value::Object(metadata),
                    updated_at: None,
                },
            );
        }
    }

    Ok(all_chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema {
            table: Some("public.customer_orders".to_string()),
            id_column: "doc_id".to_string(),
            fields: vec![
                ("doc_id".to_string(), FieldSpec::text(false)),
                ("title".to_string(), FieldSpec::text(true)),
                ("summary".to_string(), FieldSpec::text(true)),
                ("body".to_string(), FieldSpec::text(true)),
                ("region".to_string(), FieldSpec::text(true)),
                (
                    "priority".to_string(),
                    FieldSpec {
                        field_type: "integer".to_string(),
                        nullable: true,
                    },
                ),
            ],
            conflict_columns: None,
        }
    }

    fn order_record() -> Map<String, Value> {
        json!({
            "doc_id": "order-001",
            "title": "注文1",
            "summary": "概要",
            "body": ["長文A", "長文B"],
            "region": "APAC",
            "priority": 1,
            "metadata": {"category": "order"},
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_structured_payload_merges_metadata_layers() {
        let config = GlobalConfig::default();
        let options = InsertOptions {
            schema: Some(schema()),
            text_fields: Some(vec!["title".to_string(), "body".to_string()]),
            ..Default::default()
        };
        let payload =
            prepare_insert_payload(&config, InsertInput::Record(order_record()), &options).unwrap();

        assert_eq!(payload.ids.as_ref().unwrap()[0], "order-001");
        let content = &payload.documents[0];
        assert!(content.contains("注文1"));
        assert!(content.contains("長文A"));
        assert!(content.contains("長文B"));

        let metadata = &payload.metadatas.as_ref().unwrap()[0];
        assert_eq!(metadata["category"], json!("order"));
        assert_eq!(metadata["region"], json!("APAC"));
        assert_eq!(metadata["priority"], json!(1));
        assert!(metadata.contains_key(ORIGINAL_DATA_KEY));
        assert!(!metadata.contains_key("doc_id"));

        assert_eq!(payload.structured_rows.len(), 1);
        let row = &payload.structured_rows[0];
        assert_eq!(row["doc_id"], json!("order-001"));
        assert_eq!(row["body"], json!("長文A\n長文B"));
        assert_eq!(row["priority"], json!(1));
    }

    #[test]
    fn test_non_nullable_field_missing_is_validation_error() {
        let config = GlobalConfig::default();
        let mut record = order_record();
        record.remove("doc_id");
        let options = InsertOptions {
            schema: Some(schema()),
            ..Default::default()
        };
        let err = prepare_insert_payload(&config, InsertInput::Record(record), &options)
            .unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
    }

    #[test]
    fn test_metadatas_without_ids_rejected_for_plain_text() {
        let config = GlobalConfig::default();
        let options = InsertOptions {
            metadatas: Some(Metadatas::Shared(Map::new())),
            ..Default::default()
        };
        let err = prepare_insert_payload(&config, InsertInput::Text("hi".to_string()), &options)
            .unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
    }

    #[test]
    fn test_id_arity_mismatch_rejected() {
        let config = GlobalConfig::default();
        let options = InsertOptions {
            ids: Some(vec!["a".to_string(), "b".to_string()]),
            ..Default::default()
        };
        let err = prepare_insert_payload(&config, InsertInput::Text("one".to_string()), &options)
            .unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
    }

    #[test]
    fn test_text_segments_fall_back_to_string_fields() {
        let config = GlobalConfig::default();
        let record = json!({"name": "widget", "count": 3})
            .as_object()
            .unwrap()
            .clone();
        let payload = prepare_insert_payload(
            &config,
            InsertInput::Record(record),
            &InsertOptions::default(),
        )
        .unwrap();
        assert_eq!(payload.documents[0], "widget");
    }

    #[test]
    fn test_extract_text_fields_partitions_record() {
        let config = GlobalConfig::default();
        let record = order_record();
        let (text_fields, metadata) =
            extract_text_fields(&record, &config.field_split.text_field_keys);

        let names: Vec<&str> = text_fields.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"title"));
        assert!(names.contains(&"body"));
        assert!(!names.contains(&"doc_id"));
        let body = &text_fields.iter().find(|(n, _)| n == "body").unwrap().1;
        assert_eq!(body, "長文A\n長文B");

        assert_eq!(metadata["category"], json!("order"));
        assert_eq!(metadata["priority"], json!(1));
    }

    #[test]
    fn test_generate_chunks_per_field_marks_populations() {
        struct CharTokenizer;
        impl Tokenizer for CharTokenizer {
            fn encode(&self, text: &str) -> Vec<u32> {
                text.chars().map(|c| c as u32).collect()
            }
            fn decode(&self, tokens: &[u32]) -> crate::error::Result<String> {
                Ok(tokens
                    .iter()
                    .filter_map(|t| char::from_u32(*t))
                    .collect())
            }
        }

        let config = GlobalConfig::default();
        let fields = vec![
            ("title".to_string(), "short title".to_string()),
            ("summary".to_string(), "a summary".to_string()),
            ("empty".to_string(), "".to_string()),
        ];
        let chunks = generate_chunks_per_field(
            &config,
            &CharTokenizer,
            "doc-1",
            &fields,
            &Map::new(),
        )
        .unwrap();

        let mut populations: Vec<&str> = chunks
            .values()
            .map(|c| c.metadata["text_field"].as_str().unwrap())
            .collect();
        populations.sort();
        populations.dedup();
        assert_eq!(populations, vec!["_all", "summary", "title"]);
        assert!(chunks.keys().any(|id| id.starts_with("chunk-title-")));
        assert!(chunks.keys().any(|id| id.starts_with("chunk-all-")));
        assert!(chunks.values().all(|c| c.full_doc_id == "doc-1"));
    }
}
