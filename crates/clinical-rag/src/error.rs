use std::time::Duration;

/// Failures that stop an analysis before any partial result exists.
///
/// Everything that goes wrong after the note has been accepted is reported on the
/// result as a stage warning instead.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("input error: note text is empty")]
    EmptyInput,

    #[error("input error: {0}")]
    InvalidInput(String),

    #[error("config error: {0}")]
    Config(String),
}

/// Failures of a single generation call.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("generation backend unavailable: {0}")]
    Unavailable(String),

    #[error("generation backend failed: {0}")]
    Backend(String),

    #[error("generation backend returned an empty response")]
    EmptyResponse,

    #[error("prompt was not recognised by the rule engine")]
    UnsupportedPrompt,

    #[error("failed to encode generated output: {0}")]
    Encode(#[from] serde_json::Error),
}
