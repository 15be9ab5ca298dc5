//! Context assembly: labelled CSV sections inside fenced blocks, structural
//! combination of two contexts with deduplication, and token-budget
//! truncation of row lists.

use std::collections::HashSet;

use crate::tokenize::Tokenizer;

/// Data rows for the three context sections. Rows carry no id column; ids
/// are assigned at render time so combined contexts renumber cleanly.
#[derive(Debug, Clone, Default)]
pub struct ContextSections {
    /// entity, type, description, rank
    pub entities: Vec<Vec<String>>,
    /// source, target, description, keywords, weight, rank
    pub relationships: Vec<Vec<String>>,
    /// chunk contents
    pub sources: Vec<String>,
}

impl ContextSections {
    pub fn render(&self) -> String {
        let entities = rows_to_csv(
            &["id", "entity", "type", "description", "rank"],
            &self.entities,
        );
        let relationships = rows_to_csv(
            &["id", "source", "target", "description", "keywords", "weight", "rank"],
            &self.relationships,
        );
        let sources = rows_to_csv(
            &["id", "content"],
            &self
                .sources
                .iter()
                .map(|content| vec![content.clone()])
                .collect::<Vec<_>>(),
        );
        format!(
            "\n-----Entities-----\n```csv\n{entities}\n```\n-----Relationships-----\n```csv\n{relationships}\n```\n-----Sources-----\n```csv\n{sources}\n```\n"
        )
    }
}

/// Merge the high-level and low-level contexts: concatenate each section,
/// deduplicate rows (sources on content string), keep first-seen order.
pub fn combine_sections(
    high: Option<ContextSections>,
    low: Option<ContextSections>,
) -> ContextSections {
    let mut combined = ContextSections::default();
    let mut seen_entities = HashSet::new();
    let mut seen_relationships = HashSet::new();
    let mut seen_sources = HashSet::new();
    for sections in [high, low].into_iter().flatten() {
        for row in sections.entities {
            if seen_entities.insert(row.join("\u{1}")) {
                combined.entities.push(row);
            }
        }
        for row in sections.relationships {
            if seen_relationships.insert(row.join("\u{1}")) {
                combined.relationships.push(row);
            }
        }
        for content in sections.sources {
            if seen_sources.insert(content.clone()) {
                combined.sources.push(content);
            }
        }
    }
    combined
}

/// Keep the longest prefix whose cumulative token count stays within
/// `max_token_size`; the first overflowing item is excluded.
pub fn truncate_list_by_token_size<T>(
    items: Vec<T>,
    key: impl Fn(&T) -> &str,
    max_token_size: usize,
    tokenizer: &dyn Tokenizer,
) -> Vec<T> {
    let mut tokens = 0usize;
    for (i, item) in items.iter().enumerate() {
        tokens += tokenizer.count_tokens(key(item));
        if tokens > max_token_size {
            return items.into_iter().take(i).collect();
        }
    }
    items
}

/// CSV without an id column (the mini strategy's entity table carries its
/// own score column instead).
pub fn rows_to_csv_plain(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(
        header
            .iter()
            .map(|h| escape_csv_field(h))
            .collect::<Vec<_>>()
            .join(","),
    );
    for row in rows {
        lines.push(
            row.iter()
                .map(|f| escape_csv_field(f))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    lines.join("\n")
}

/// CSV with an auto-assigned id column; fields containing the delimiter,
/// quotes or newlines are quoted with doubled inner quotes.
pub fn rows_to_csv(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(
        header
            .iter()
            .map(|h| escape_csv_field(h))
            .collect::<Vec<_>>()
            .join(","),
    );
    for (i, row) in rows.iter().enumerate() {
        let mut fields = vec![i.to_string()];
        fields.extend(row.iter().map(|f| escape_csv_field(f)));
        lines.push(fields.join(","));
    }
    lines.join("\n")
}

fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    struct CharTokenizer;
    impl Tokenizer for CharTokenizer {
        fn encode(&self, text: &str) -> Vec<u32> {
            text.chars().map(|c| c as u32).collect()
        }
        fn decode(&self, tokens: &[u32]) -> Result<String> {
            Ok(tokens.iter().filter_map(|t| char::from_u32(*t)).collect())
        }
    }

    #[test]
    fn test_render_has_three_fenced_sections() {
        let sections = ContextSections {
            entities: vec![vec![
                "\"ACME\"".to_string(),
                "ORGANIZATION".to_string(),
                "a supplier".to_string(),
                "2".to_string(),
            ]],
            relationships: Vec::new(),
            sources: vec!["first chunk".to_string()],
        };
        let rendered = sections.render();
        assert!(rendered.contains("-----Entities-----"));
        assert!(rendered.contains("-----Relationships-----"));
        assert!(rendered.contains("-----Sources-----"));
        assert!(rendered.contains("0,\"\"\"ACME\"\"\",ORGANIZATION,a supplier,2"));
        assert!(rendered.contains("0,first chunk"));
    }

    #[test]
    fn test_combine_dedupes_sources_on_content() {
        let a = ContextSections {
            sources: vec!["same".to_string(), "only-a".to_string()],
            ..Default::default()
        };
        let b = ContextSections {
            sources: vec!["same".to_string(), "only-b".to_string()],
            ..Default::default()
        };
        let combined = combine_sections(Some(a), Some(b));
        assert_eq!(combined.sources, vec!["same", "only-a", "only-b"]);
    }

    #[test]
    fn test_truncate_by_token_size_excludes_overflowing_item() {
        let items = vec!["aaaa".to_string(), "bbbb".to_string(), "cccc".to_string()];
        let kept = truncate_list_by_token_size(items, |s| s.as_str(), 9, &CharTokenizer);
        assert_eq!(kept.len(), 2);

        let items = vec!["aaaa".to_string(), "bbbb".to_string()];
        let kept = truncate_list_by_token_size(items, |s| s.as_str(), 100, &CharTokenizer);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_csv_escaping() {
        let csv = rows_to_csv(&["id", "content"], &[vec!["a,b \"quoted\"".to_string()]]);
        assert!(csv.contains("0,\"a,b \"\"quoted\"\"\""));
    }
}
