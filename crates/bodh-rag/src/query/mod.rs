//! Query dispatch: translate `target_fields` into a `text_field` metadata
//! clause, then hand the query to the selected strategy.

use serde_json::Value;

use crate::error::{RagError, Result};
use crate::pipeline::RagEngine;
use crate::types::{QueryMode, QueryParam, QueryResponse};

pub mod hybrid;
pub mod keywords;
pub mod mini;
pub mod naive;

pub(crate) async fn dispatch(
    engine: &RagEngine,
    query: &str,
    mut param: QueryParam,
) -> Result<QueryResponse> {
    apply_target_fields_filter(&mut param)?;
    match param.mode {
        QueryMode::Naive => naive::naive_query(engine, query, &param).await,
        QueryMode::Light => hybrid::hybrid_query(engine, query, &param).await,
        QueryMode::Mini => mini::mini_query(engine, query, &param).await,
    }
}

/// Fold `target_fields` into the metadata filter: none → `"_all"`, one →
/// equality, several → any-of. A caller-supplied `text_field` clause next to
/// explicit `target_fields` is ambiguous and fails loudly.
fn apply_target_fields_filter(param: &mut QueryParam) -> Result<()> {
    let existing = param
        .metadata_filter
        .as_ref()
        .map(|m| m.contains_key("text_field"))
        .unwrap_or(false);

    let derived = match &param.target_fields {
        None => {
            if existing {
                // The caller addressed the populations directly.
                return Ok(());
            }
            Value::String("_all".to_string())
        }
        Some(fields) if existing => {
            return Err(RagError::Validation(format!(
                "metadata_filter already constrains text_field; conflicting target_fields {fields:?}"
            )));
        }
        Some(fields) if fields.len() == 1 => Value::String(fields[0].clone()),
        Some(fields) => Value::Array(fields.iter().cloned().map(Value::String).collect()),
    };

    param
        .metadata_filter
        .get_or_insert_with(Default::default)
        .insert("text_field".to_string(), derived);
    Ok(())
}

/// Strip the model's echo of the system prompt and query out of an answer.
pub(crate) fn strip_prompt_echo(response: &str, system_prompt: &str, query: &str) -> String {
    if response.len() > system_prompt.len() {
        response
            .replace(system_prompt, "")
            .replace(query, "")
            .replace("<system>", "")
            .replace("</system>", "")
            .trim()
            .to_string()
    } else {
        response.trim().to_string()
    }
}
