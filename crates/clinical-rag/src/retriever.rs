use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunker::Chunk;
use crate::facts::ExtractedFacts;
use crate::index::{RetrievedChunk, VectorIndex};

/// Fixed first-pass query. Names the kinds of facts Step 1 extracts and nothing about
/// history or plans, so the factual sections score highest.
pub const FACT_QUERY: &str = "patient age sex symptoms fever pain vital signs temp temperature heart rate \
blood pressure examination exam findings signs laboratory results wbc elevated imaging assessment";

/// Second-pass query built from Step-1 facts, or the first-pass query when there are none.
pub fn diagnosis_query(facts: Option<&ExtractedFacts>) -> String {
    match facts.map(ExtractedFacts::query_terms) {
        Some(terms) if !terms.is_empty() => terms.join(" "),
        _ => FACT_QUERY.to_string(),
    }
}

/// One retrieval pass as reported on the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetrievalPass {
    pub query: String,
    pub chunks: Vec<RetrievedChunk>,
    /// Set when the ranked search failed and chunks are in note order instead.
    pub degraded: bool,
}

/// Top-k search over a note, degrading to note order when no index is available.
pub struct Retriever {
    index: Option<VectorIndex>,
    chunks: Vec<Chunk>,
    top_k: usize,
}

impl Retriever {
    pub fn new(index: Option<VectorIndex>, chunks: Vec<Chunk>, top_k: usize) -> Self {
        Self { index, chunks, top_k }
    }

    /// Run one pass. The second value describes why the pass degraded, if it did.
    pub async fn retrieve(&self, query: &str) -> (RetrievalPass, Option<String>) {
        if let Some(index) = &self.index {
            match index.search(query, self.top_k).await {
                Ok(chunks) => {
                    debug!(hits = chunks.len(), top_k = self.top_k, "retrieval pass");
                    return (
                        RetrievalPass {
                            query: query.to_string(),
                            chunks,
                            degraded: false,
                        },
                        None,
                    );
                }
                Err(e) => {
                    warn!(error = %e, "query embedding failed, using chunks in note order");
                    return (self.fallback(query), Some(format!("query embedding failed: {e}")));
                }
            }
        }
        (self.fallback(query), None)
    }

    /// Every chunk in note order with score 0, so later stages still see the whole note.
    fn fallback(&self, query: &str) -> RetrievalPass {
        RetrievalPass {
            query: query.to_string(),
            chunks: self
                .chunks
                .iter()
                .enumerate()
                .map(|(i, c)| RetrievedChunk::from_chunk(c, 0.0, i + 1))
                .collect(),
            degraded: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use copilot_common::embedding::HashingEmbedder;

    use super::*;
    use crate::chunker::chunk_sections;
    use crate::facts::Finding;
    use crate::section::{SectionKind, split_sections};

    const NOTE: &str = "CHIEF COMPLAINT: cough\n\
HPI: three days of productive cough and fever\n\
PAST MEDICAL HISTORY: asthma\n\
LABS: WBC 14.1 elevated\n\
PLAN: chest x-ray, follow up in clinic";

    fn chunks() -> Vec<Chunk> {
        chunk_sections(&split_sections(NOTE), 1, 1500)
    }

    #[test]
    fn diagnosis_query_uses_fact_terms() {
        let mut facts = ExtractedFacts::default();
        facts.symptoms.push(Finding {
            name: "cough".to_string(),
            detail: None,
            evidence: None,
        });
        assert_eq!(diagnosis_query(Some(&facts)), "cough");
        assert_eq!(diagnosis_query(Some(&ExtractedFacts::default())), FACT_QUERY);
        assert_eq!(diagnosis_query(None), FACT_QUERY);
    }

    #[tokio::test]
    async fn ranked_pass_is_clamped() {
        let all = chunks();
        let index = VectorIndex::build(&all, Arc::new(HashingEmbedder::default())).await.unwrap();
        let retriever = Retriever::new(Some(index), all.clone(), 100);
        let (pass, warning) = retriever.retrieve(FACT_QUERY).await;
        assert!(warning.is_none());
        assert!(!pass.degraded);
        assert_eq!(pass.chunks.len(), all.len());
    }

    #[tokio::test]
    async fn closest_chunk_comes_first() {
        let all = chunks();
        let index = VectorIndex::build(&all, Arc::new(HashingEmbedder::default())).await.unwrap();
        let retriever = Retriever::new(Some(index), all, 2);
        let (pass, _) = retriever.retrieve("wbc elevated").await;
        assert_eq!(pass.chunks.len(), 2);
        assert_eq!(pass.chunks[0].section, SectionKind::Labs);
    }

    #[tokio::test]
    async fn missing_index_returns_note_order() {
        let all = chunks();
        let retriever = Retriever::new(None, all.clone(), 2);
        let (pass, warning) = retriever.retrieve("anything").await;
        assert!(pass.degraded);
        assert!(warning.is_none());
        let ids: Vec<&str> = pass.chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        let expected: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, expected);
    }
}
