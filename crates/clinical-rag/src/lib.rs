pub mod answer;
pub mod chunker;
pub mod citation;
pub mod config;
pub mod ddx;
pub mod error;
pub mod facts;
pub mod generation;
pub mod index;
pub mod pipeline;
pub mod prompt;
pub mod retriever;
pub mod section;
pub mod soap;
mod text;

pub use answer::{ChatMessage, ChatRole, QuestionAnswer, QuestionRequest};
pub use config::{ConfidenceThresholds, PipelineConfig};
pub use error::{AnalysisError, GenerationError};
pub use generation::{OpenAiGenerator, RuleEngine, TextGenerator};
pub use pipeline::{AnalysisRequest, AnalysisResult, Pipeline, PipelineState};
