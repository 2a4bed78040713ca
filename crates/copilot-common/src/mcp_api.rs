use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AnalyzeNoteParams {
    /// Full clinical note text (already extracted from any document format).
    pub text: String,
    /// Numeric document identifier embedded in chunk ids (default: 1).
    pub doc_id: Option<u64>,
    /// Chunks retrieved per pass (default: 6, clamped to the chunk count).
    pub top_k: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ResolveCitationsParams {
    /// Text containing inline `[evidence: <chunk_id>]` tokens.
    pub text: String,
    /// Chunk ids known for the analysed note. Tokens naming other ids are dropped.
    pub chunk_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResolveCitationsResponse {
    pub chunk_ids: Vec<String>,
    /// The input text with citation tokens removed.
    pub display_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeywordGroupInfo {
    pub label: String,
    pub keywords: Vec<String>,
    pub weight: f32,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConditionPatternInfo {
    pub name: String,
    pub groups: Vec<KeywordGroupInfo>,
    pub exclusions: Vec<String>,
    pub workup: String,
    pub red_flags: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConditionPatternListResponse {
    pub patterns: Vec<ConditionPatternInfo>,
}
