/// Embedding providers for chunk retrieval.
///
/// `TextEmbedding` from fastembed is synchronous and CPU-bound. All embed calls go through
/// `tokio::task::spawn_blocking`. The model is loaded at most once per process: the first
/// caller of [`FastEmbedder::shared`] pays the initialization (and the download on a cold
/// cache); every later caller receives the same `Arc`. The model is immutable after init, so
/// concurrent requests share it without locking.
///
/// The nomic-embed-text-v1.5 model uses task-prefixed inputs:
/// - Documents: "search_document: {text}"
/// - Queries: "search_query: {text}"
///
/// [`HashingEmbedder`] is a deterministic, dependency-free alternative used when no model is
/// available (offline hosts, tests).
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::error::CommonError;

static NOMIC_MODEL: OnceCell<Arc<FastEmbedder>> = OnceCell::const_new();
static MINILM_MODEL: OnceCell<Arc<FastEmbedder>> = OnceCell::const_new();

/// A backend that turns text into dense vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed chunk texts for indexing. Output order matches input order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError>;

    /// Embed a single retrieval query.
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError>;

    /// Dimensionality of every vector this provider returns.
    fn dimensions(&self) -> usize;

    /// Short backend name, reported in analysis results and logs.
    fn name(&self) -> &str;
}

/// Which fastembed model to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastEmbedModel {
    /// nomic-embed-text-v1.5, 768 dimensions, task-prefixed.
    NomicEmbedTextV15,
    /// all-MiniLM-L6-v2, 384 dimensions. Smaller download, faster inference.
    AllMiniLmL6V2,
}

impl FastEmbedModel {
    fn dimensions(self) -> usize {
        match self {
            Self::NomicEmbedTextV15 => 768,
            Self::AllMiniLmL6V2 => 384,
        }
    }

    fn document_prefix(self) -> &'static str {
        match self {
            Self::NomicEmbedTextV15 => "search_document: ",
            Self::AllMiniLmL6V2 => "",
        }
    }

    fn query_prefix(self) -> &'static str {
        match self {
            Self::NomicEmbedTextV15 => "search_query: ",
            Self::AllMiniLmL6V2 => "",
        }
    }

    fn as_fastembed(self) -> fastembed::EmbeddingModel {
        match self {
            Self::NomicEmbedTextV15 => fastembed::EmbeddingModel::NomicEmbedTextV15,
            Self::AllMiniLmL6V2 => fastembed::EmbeddingModel::AllMiniLML6V2,
        }
    }
}

/// Wraps fastembed's `TextEmbedding` model for generating vector embeddings.
pub struct FastEmbedder {
    model: Arc<fastembed::TextEmbedding>,
    kind: FastEmbedModel,
}

impl FastEmbedder {
    /// Return the process-wide instance of `kind`, loading it on first use.
    pub async fn shared(kind: FastEmbedModel) -> Result<Arc<Self>, CommonError> {
        let cell = match kind {
            FastEmbedModel::NomicEmbedTextV15 => &NOMIC_MODEL,
            FastEmbedModel::AllMiniLmL6V2 => &MINILM_MODEL,
        };
        cell.get_or_try_init(|| async { Self::load(kind).await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Initialize a fresh model instance. Prefer [`FastEmbedder::shared`].
    ///
    /// This downloads the model on first run. The download happens synchronously
    /// inside a blocking task.
    pub async fn load(kind: FastEmbedModel) -> Result<Self, CommonError> {
        let model = tokio::task::spawn_blocking(move || {
            let options = fastembed::InitOptions::new(kind.as_fastembed())
                .with_show_download_progress(false);
            fastembed::TextEmbedding::try_new(options)
        })
        .await
        .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
        .map_err(|e| CommonError::Embedding(format!("model initialization failed: {e}")))?;

        Ok(Self {
            model: Arc::new(model),
            kind,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedder {
    /// Chunks are processed in small batches to bound peak memory during ONNX inference.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        let prefix = self.kind.document_prefix();
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{prefix}{t}")).collect();
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.embed(prefixed, Some(4)))
            .await
            .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("document embedding failed: {e}")))
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError> {
        let prefixed = vec![format!("{}{query}", self.kind.query_prefix())];
        let model = Arc::clone(&self.model);
        let mut results = tokio::task::spawn_blocking(move || model.embed(prefixed, None))
            .await
            .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("query embedding failed: {e}")))?;
        results
            .pop()
            .ok_or_else(|| CommonError::Embedding("empty embedding result".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.kind.dimensions()
    }

    fn name(&self) -> &str {
        match self.kind {
            FastEmbedModel::NomicEmbedTextV15 => "fastembed:nomic-embed-text-v1.5",
            FastEmbedModel::AllMiniLmL6V2 => "fastembed:all-minilm-l6-v2",
        }
    }
}

/// Feature-hashing embedder over word unigrams and bigrams.
///
/// Each feature is hashed with SHA-256; the first eight digest bytes pick a bucket and a
/// sign. Output is L2-normalized. Identical input always yields an identical vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 384;

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let mut vector = vec![0.0_f32; self.dimensions];
        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        l2_normalize(&mut vector);
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(bytes);
        let bucket = (h % self.dimensions as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError> {
        Ok(self.embed(query))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}
