use clinical_rag::AnalysisError;
use copilot_common::openai::LlmClientError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("llm client error: {0}")]
    Llm(#[from] LlmClientError),

    #[error("config error: {0}")]
    Config(String),
}
