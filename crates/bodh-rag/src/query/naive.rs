//! Naive strategy: one similarity search over the chunks index, fetch the
//! chunk bodies, truncate to the text-unit budget and answer (or return the
//! raw sections).

use crate::context::truncate_list_by_token_size;
use crate::error::Result;
use crate::filter::VectorFilter;
use crate::pipeline::RagEngine;
use crate::prompts;
use crate::types::{ChunkRecord, QueryParam, QueryResponse};

pub(crate) async fn naive_query(
    engine: &RagEngine,
    query: &str,
    param: &QueryParam,
) -> Result<QueryResponse> {
    let filter = VectorFilter {
        metadata: param.metadata_filter.clone(),
        start_time: param.start_time,
        end_time: param.end_time,
    };
    let hits = engine.chunks_vdb.query(query, param.top_k, &filter).await?;
    if hits.is_empty() {
        return Ok(QueryResponse::failed(prompts::FAIL_RESPONSE));
    }

    let chunk_ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
    let rows = engine.text_chunks.get_by_ids(&chunk_ids).await?;
    let chunks: Vec<ChunkRecord> = rows
        .into_iter()
        .flatten()
        .filter_map(|row| serde_json::from_value(row).ok())
        .collect();

    let total = chunks.len();
    let chunks = truncate_list_by_token_size(
        chunks,
        |c| c.content.as_str(),
        param.max_token_for_text_unit,
        engine.tokenizer.as_ref(),
    );
    tracing::info!(total, kept = chunks.len(), "naive query truncated chunks");

    let section = chunks
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("--New Chunk--\n");
    let sources: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

    if param.only_need_context {
        return Ok(QueryResponse {
            content: section,
            sources,
            provenance: None,
        });
    }

    let system_prompt = prompts::render(
        prompts::NAIVE_RAG_RESPONSE,
        &[
            ("content_data", &section),
            ("response_type", &param.response_type),
        ],
    );
    let response = engine.llm.complete(query, &[], Some(&system_prompt)).await?;
    let answer = super::strip_prompt_echo(&response, &system_prompt, query);
    Ok(QueryResponse {
        content: answer,
        sources,
        provenance: None,
    })
}
