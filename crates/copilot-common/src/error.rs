/// Error types shared across the copilot crates.
///
/// These errors represent failures in infrastructure components (embedding models,
/// configuration) that both the analysis core and the server binary touch.
/// Crate-specific errors wrap `CommonError` via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("config error: {0}")]
    Config(String),
}
