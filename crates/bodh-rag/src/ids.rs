//! Content-addressed identifiers. Every record in every store is keyed by a
//! 32-hex md5 digest carrying a typed prefix; the prefix is part of the id
//! and travels verbatim through foreign references.

/// Typed id prefixes.
pub const PREFIX_DOC: &str = "doc-";
pub const PREFIX_CHUNK: &str = "chunk-";
pub const PREFIX_ENTITY: &str = "ent-";
pub const PREFIX_ENTITY_NAME: &str = "Ename-";
pub const PREFIX_RELATION: &str = "rel-";

/// `prefix + hex(md5(content))`.
pub fn compute_mdhash_id(content: &str, prefix: &str) -> String {
    format!("{}{:x}", prefix, md5::compute(content.as_bytes()))
}

/// Chunk id for a field-split chunk: hashes content ⊕ field ⊕ doc id so the
/// same text in two fields (or two documents) gets distinct ids.
pub fn field_chunk_id(content: &str, field: &str, doc_id: &str) -> String {
    compute_mdhash_id(
        &format!("{content}{field}{doc_id}"),
        &format!("chunk-{field}-"),
    )
}

/// Chunk id for the combined (`_all`) chunk of a field-split document.
pub fn combined_chunk_id(content: &str, doc_id: &str) -> String {
    compute_mdhash_id(&format!("{content}_all{doc_id}"), "chunk-all-")
}

/// Canonical entity name: trimmed, uppercased, wrapped in double quotes.
/// Extraction output and the public delete API both normalize through here
/// so graph keys and vector ids always agree.
pub fn canonical_entity_name(raw: &str) -> String {
    let inner = raw.trim().trim_matches('"').trim();
    format!("\"{}\"", inner.to_uppercase())
}

/// Vector-row id for an entity in the `entities` index.
pub fn entity_vector_id(entity_name: &str) -> String {
    compute_mdhash_id(entity_name, PREFIX_ENTITY)
}

/// Vector-row id for an entity in the `entities_name` index.
pub fn entity_name_vector_id(entity_name: &str) -> String {
    compute_mdhash_id(entity_name, PREFIX_ENTITY_NAME)
}

/// Vector-row id for an edge: hashes src ⊕ tgt in stored pair order.
pub fn relation_vector_id(src: &str, tgt: &str) -> String {
    compute_mdhash_id(&format!("{src}{tgt}"), PREFIX_RELATION)
}

/// First ~100 characters of the content, used for the doc-status summary.
pub fn content_summary(content: &str, max_chars: usize) -> String {
    let trimmed = content.trim();
    let mut out: String = trimmed.chars().take(max_chars).collect();
    if trimmed.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

/// Strip control characters and surrounding whitespace from text coming in
/// from callers or out of the LLM.
pub fn clean_text(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
