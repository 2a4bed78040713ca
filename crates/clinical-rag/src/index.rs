/// Per-request in-memory vector index over a note's chunks.
///
/// Vectors are L2-normalized at insert time, so cosine similarity is a plain dot product.
/// Ranking is a stable sort on score, which keeps ties in original chunk order.
use std::sync::Arc;

use copilot_common::embedding::{EmbeddingProvider, l2_normalize};
use copilot_common::error::CommonError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::Chunk;
use crate::section::SectionKind;

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// A search hit, carrying enough of the chunk for display and citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub section: SectionKind,
    pub text: String,
    pub score: f32,
    /// 1-based position in the ranking.
    pub rank: usize,
    pub start: usize,
    pub end: usize,
}

impl RetrievedChunk {
    pub fn from_chunk(chunk: &Chunk, score: f32, rank: usize) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            section: chunk.section,
            text: chunk.text.clone(),
            score,
            rank,
            start: chunk.start,
            end: chunk.end,
        }
    }
}

pub struct VectorIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Embed every chunk and build the index.
    ///
    /// # Errors
    ///
    /// Fails if the embedder fails, returns the wrong number of vectors, or returns
    /// vectors of the wrong dimensionality.
    pub async fn build(
        chunks: &[Chunk],
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, CommonError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_documents(&texts).await?
        };
        if vectors.len() != chunks.len() {
            return Err(CommonError::Embedding(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        let expected = embedder.dimensions();
        let mut entries = Vec::with_capacity(chunks.len());
        for (chunk, mut embedding) in chunks.iter().zip(vectors) {
            if embedding.len() != expected {
                return Err(CommonError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
            l2_normalize(&mut embedding);
            entries.push(IndexEntry {
                chunk: chunk.clone(),
                embedding,
            });
        }
        debug!(entries = entries.len(), embedder = embedder.name(), "vector index built");
        Ok(Self { embedder, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.entries.iter().map(|e| &e.chunk)
    }

    /// Top `top_k` chunks by cosine similarity to `query`. `top_k` is clamped to the
    /// number of indexed chunks.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, CommonError> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let mut query_vec = self.embedder.embed_query(query).await?;
        let expected = self.embedder.dimensions();
        if query_vec.len() != expected {
            return Err(CommonError::DimensionMismatch {
                expected,
                actual: query_vec.len(),
            });
        }
        l2_normalize(&mut query_vec);

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, dot(&query_vec, &e.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(scored
            .into_iter()
            .take(top_k.min(self.entries.len()))
            .enumerate()
            .map(|(rank, (i, score))| RetrievedChunk::from_chunk(&self.entries[i].chunk, score, rank + 1))
            .collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use copilot_common::embedding::HashingEmbedder;

    use super::*;
    use crate::chunker::chunk_sections;
    use crate::section::split_sections;

    const NOTE: &str = "CHIEF COMPLAINT: fever and headache\n\
PHYSICAL EXAM: nuchal rigidity present\n\
LABS: WBC 15,200 elevated\n\
PLAN: lumbar puncture and ceftriaxone";

    fn chunks() -> Vec<Chunk> {
        chunk_sections(&split_sections(NOTE), 1, 1500)
    }

    fn hashing() -> Arc<dyn EmbeddingProvider> {
        Arc::new(HashingEmbedder::default())
    }

    /// Returns the same vector for every input.
    struct ConstantEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ConstantEmbedder {
        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        async fn embed_query(&self, _query: &str) -> Result<Vec<f32>, CommonError> {
            Ok(vec![2.0, 0.0])
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn name(&self) -> &str {
            "constant"
        }
    }

    struct WrongDimensions;

    #[async_trait]
    impl EmbeddingProvider for WrongDimensions {
        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
            Ok(texts.iter().map(|_| vec![1.0; 3]).collect())
        }
        async fn embed_query(&self, _query: &str) -> Result<Vec<f32>, CommonError> {
            Ok(vec![1.0; 3])
        }
        fn dimensions(&self) -> usize {
            4
        }
        fn name(&self) -> &str {
            "wrong"
        }
    }

    #[tokio::test]
    async fn most_similar_chunk_ranks_first() {
        let index = VectorIndex::build(&chunks(), hashing()).await.unwrap();
        let hits = index.search("lumbar puncture ceftriaxone", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].section, SectionKind::Plan);
        assert_eq!(hits[0].rank, 1);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn top_k_is_clamped_to_chunk_count() {
        let all = chunks();
        let index = VectorIndex::build(&all, hashing()).await.unwrap();
        let hits = index.search("fever", 50).await.unwrap();
        assert_eq!(hits.len(), all.len());
    }

    #[tokio::test]
    async fn ties_keep_chunk_order() {
        let all = chunks();
        let index = VectorIndex::build(&all, Arc::new(ConstantEmbedder)).await.unwrap();
        let hits = index.search("anything", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        let expected: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, expected);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn repeated_searches_are_identical() {
        let index = VectorIndex::build(&chunks(), hashing()).await.unwrap();
        let a = index.search("neck stiffness fever", 3).await.unwrap();
        let b = index.search("neck stiffness fever", 3).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_reported() {
        let err = VectorIndex::build(&chunks(), Arc::new(WrongDimensions))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CommonError::DimensionMismatch { expected: 4, actual: 3 }));
    }

    #[tokio::test]
    async fn empty_index_returns_nothing() {
        let index = VectorIndex::build(&[], hashing()).await.unwrap();
        assert!(index.is_empty());
        assert!(index.search("fever", 6).await.unwrap().is_empty());
    }
}
