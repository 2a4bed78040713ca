use std::str::FromStr;

use clinical_rag::PipelineConfig;
use copilot_common::embedding::FastEmbedModel;

use crate::error::AppError;

/// Which `TextGenerator` answers the two analysis prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationBackend {
    Rules,
    OpenAi,
}

impl FromStr for GenerationBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rules" | "" => Ok(Self::Rules),
            "openai" => Ok(Self::OpenAi),
            other => Err(AppError::Config(format!(
                "GENERATION_BACKEND must be `rules` or `openai`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    FastEmbed,
    FastEmbedSmall,
    Hashing,
}

impl EmbeddingBackend {
    /// The fastembed model to load, or `None` for the in-process hashing embedder.
    pub fn model(self) -> Option<FastEmbedModel> {
        match self {
            Self::FastEmbed => Some(FastEmbedModel::NomicEmbedTextV15),
            Self::FastEmbedSmall => Some(FastEmbedModel::AllMiniLmL6V2),
            Self::Hashing => None,
        }
    }
}

impl FromStr for EmbeddingBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fastembed" | "" => Ok(Self::FastEmbed),
            "fastembed-small" => Ok(Self::FastEmbedSmall),
            "hashing" => Ok(Self::Hashing),
            other => Err(AppError::Config(format!(
                "EMBEDDING_BACKEND must be `fastembed`, `fastembed-small` or `hashing`, got `{other}`"
            ))),
        }
    }
}

/// Server configuration loaded explicitly from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub generation_backend: GenerationBackend,
    pub embedding_backend: EmbeddingBackend,
    /// TCP address to serve on. `None` serves a single client over stdio.
    pub tcp_listen_addr: Option<String>,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `GENERATION_BACKEND`: `rules` (default) or `openai` (reads the `LLM_*` variables)
    /// - `EMBEDDING_BACKEND`: `fastembed` (default), `fastembed-small` or `hashing`
    /// - `MCP_TCP_LISTEN_ADDR`: serve on TCP instead of stdio
    /// - `COPILOT_*`: pipeline tuning, see [`PipelineConfig::from_env`]
    pub fn from_env() -> Result<Self, AppError> {
        let generation_backend = std::env::var("GENERATION_BACKEND")
            .map(|v| v.parse())
            .unwrap_or(Ok(GenerationBackend::Rules))?;

        let embedding_backend = std::env::var("EMBEDDING_BACKEND")
            .map(|v| v.parse())
            .unwrap_or(Ok(EmbeddingBackend::FastEmbed))?;

        let tcp_listen_addr = std::env::var("MCP_TCP_LISTEN_ADDR")
            .ok()
            .filter(|a| !a.trim().is_empty());

        let pipeline = PipelineConfig::from_env()?;

        Ok(Self {
            generation_backend,
            embedding_backend,
            tcp_listen_addr,
            pipeline,
        })
    }
}
