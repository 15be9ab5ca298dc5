//! Prompt templates and wire-format delimiters for the extraction and query
//! stages. Templates carry `{name}` placeholders filled by [`render`]; the
//! delimiter strings are opaque to the rest of the engine.

/// Separator for multi-value node/edge properties (descriptions, source ids).
pub const GRAPH_FIELD_SEP: &str = "<SEP>";

pub const DEFAULT_TUPLE_DELIMITER: &str = "<|>";
pub const DEFAULT_RECORD_DELIMITER: &str = "##";
pub const DEFAULT_COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

pub const DEFAULT_ENTITY_TYPES: &[&str] = &[
    "organization",
    "person",
    "location",
    "event",
    "product",
    "category",
];

pub const FAIL_RESPONSE: &str = "Sorry, I'm not able to provide an answer to that question.";

/// Fill `{name}` placeholders in a template.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

pub const ENTITY_EXTRACTION: &str = r#"-Goal-
Given a text document, identify all entities of the requested types and all relationships among the identified entities.

-Steps-
1. Identify all entities. For each, extract:
- entity_name: name of the entity, capitalized
- entity_type: one of the following types: [{entity_types}]
- entity_description: comprehensive description of the entity's attributes and activities
Format each entity as ("entity"{tuple_delimiter}<entity_name>{tuple_delimiter}<entity_type>{tuple_delimiter}<entity_description>)

2. From the entities identified in step 1, identify all pairs of (source_entity, target_entity) that are clearly related to each other. For each pair, extract:
- source_entity: name of the source entity
- target_entity: name of the target entity
- relationship_description: why the source and target are related
- relationship_keywords: high-level keywords summarizing the relationship
- relationship_strength: numeric score indicating the strength of the relationship
Format each relationship as ("relationship"{tuple_delimiter}<source_entity>{tuple_delimiter}<target_entity>{tuple_delimiter}<relationship_description>{tuple_delimiter}<relationship_keywords>{tuple_delimiter}<relationship_strength>)

3. Return output as a single list of all entities and relationships, using {record_delimiter} as the list delimiter.

4. When finished, output {completion_delimiter}

-Real Data-
Text: {input_text}
Output:
"#;

pub const ENTITY_CONTINUE_EXTRACTION: &str = r#"MANY entities were missed in the last extraction. Add them below using the same format:
"#;

pub const ENTITY_IF_LOOP_EXTRACTION: &str = r#"It appears some entities may have still been missed. Answer YES | NO if there are still entities that need to be added.
"#;

pub const KEYWORDS_EXTRACTION: &str = r#"-Role-
You are a helpful assistant tasked with identifying both high-level and low-level keywords in the user's query.

-Goal-
Given the query, list both high-level keywords (overarching concepts or themes) and low-level keywords (specific entities or details).

-Instructions-
Output the keywords in JSON format with two keys:
- "high_level_keywords" for overarching concepts or themes
- "low_level_keywords" for specific entities or details

-Real Data-
Query: {query}
Output:
"#;

pub const MINI_QUERY_TO_KEYWORDS: &str = r#"-Role-
You are a helpful assistant analyzing a user's question before retrieval over a knowledge graph.

-Goal-
Given the question, output two fields in JSON format:
- "answer_type_keywords": the most likely types of the answer, chosen from the Answer type pool. No more than three, the most likely first.
- "entities_from_query": the specific entities or details mentioned in the question.

Answer type pool: {type_pool}

-Real Data-
Query: {query}
Output:
"#;

pub const RAG_RESPONSE: &str = r#"-Role-
You are a helpful assistant responding to questions about data in the tables provided.

-Goal-
Generate a response of the target length and format that answers the user's question, summarizing all information in the input data tables, and incorporating relevant general knowledge. Do not include information where supporting evidence is not provided.

-Target response length and format-
{response_type}

-Data tables-
{context_data}
"#;

pub const NAIVE_RAG_RESPONSE: &str = r#"-Role-
You are a helpful assistant responding to questions about the documents provided.

-Goal-
Generate a response of the target length and format that answers the user's question, summarizing the relevant information in the provided documents. Do not include information where supporting evidence is not provided.

-Target response length and format-
{response_type}

-Documents-
{content_data}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_placeholders() {
        let out = render("a {x} b {y} {x}", &[("x", "1"), ("y", "2")]);
        assert_eq!(out, "a 1 b 2 1");
    }

    #[test]
    fn test_extraction_prompt_placeholders_resolve() {
        let out = render(
            ENTITY_EXTRACTION,
            &[
                ("entity_types", "person, organization"),
                ("tuple_delimiter", DEFAULT_TUPLE_DELIMITER),
                ("record_delimiter", DEFAULT_RECORD_DELIMITER),
                ("completion_delimiter", DEFAULT_COMPLETION_DELIMITER),
                ("input_text", "sample"),
            ],
        );
        assert!(!out.contains('{'));
        assert!(out.contains("sample"));
    }
}
