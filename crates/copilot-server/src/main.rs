mod config;
mod error;
mod server;

use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clinical_rag::{OpenAiGenerator, Pipeline, RuleEngine, TextGenerator};
use copilot_common::embedding::{EmbeddingProvider, FastEmbedder, HashingEmbedder};
use copilot_common::openai::{LlmClient, LlmClientConfig};

use config::{Config, EmbeddingBackend, GenerationBackend};
use error::AppError;
use server::CopilotServer;

async fn build_embedder(backend: EmbeddingBackend) -> Arc<dyn EmbeddingProvider> {
    let Some(kind) = backend.model() else {
        return Arc::new(HashingEmbedder::default());
    };
    match FastEmbedder::shared(kind).await {
        Ok(model) => model,
        Err(e) => {
            warn!(error = %e, model = ?kind, "fastembed unavailable, falling back to hashing embedder");
            Arc::new(HashingEmbedder::default())
        }
    }
}

fn build_generator(config: &Config) -> Result<Arc<dyn TextGenerator>, AppError> {
    match config.generation_backend {
        GenerationBackend::Rules => Ok(Arc::new(RuleEngine::new(
            config.pipeline.thresholds,
            config.pipeline.max_diagnoses,
        ))),
        GenerationBackend::OpenAi => {
            let llm_config = LlmClientConfig::from_env();
            info!(
                base_url = %llm_config.base_url,
                model = %llm_config.model,
                timeout_ms = llm_config.request_timeout.as_millis(),
                "llm client configured"
            );
            Ok(Arc::new(OpenAiGenerator::new(LlmClient::new(llm_config)?)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing to stderr (stdout is reserved for MCP JSON-RPC)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting clinical-copilot MCP server");

    let config = Config::from_env()?;
    info!(
        generation = ?config.generation_backend,
        embedding = ?config.embedding_backend,
        top_k = config.pipeline.top_k,
        max_chunk_chars = config.pipeline.max_chunk_chars,
        generation_timeout_ms = config.pipeline.generation_timeout.as_millis(),
        "configuration loaded"
    );

    let embedder = build_embedder(config.embedding_backend).await;
    let generator = build_generator(&config)?;
    info!(embedder = embedder.name(), backend = generator.name(), "backends ready");

    let pipeline = Pipeline::new(config.pipeline.clone(), embedder, generator);
    let server = CopilotServer::new(pipeline);

    if let Some(addr) = config.tcp_listen_addr {
        let listener = TcpListener::bind(&addr).await?;
        info!(listen_addr = %addr, "MCP server ready, serving on TCP");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = server.clone();
            tokio::spawn(async move {
                info!(peer = %peer, "MCP client connected");
                let service = server.serve(stream).await.inspect_err(|e| {
                    tracing::error!(error = %e, "MCP server error");
                })?;
                service.waiting().await?;
                info!(peer = %peer, "MCP client disconnected");
                Ok::<(), anyhow::Error>(())
            });
        }
    } else {
        info!("MCP server ready, serving on stdio");
        let service = server.serve(stdio()).await.inspect_err(|e| {
            tracing::error!(error = %e, "MCP server error");
        })?;

        service.waiting().await?;
        info!("MCP server shut down");
    }
    Ok(())
}
