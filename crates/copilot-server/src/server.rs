use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use clinical_rag::chunker::Chunk;
use clinical_rag::citation::{self, CitationResolver};
use clinical_rag::ddx::{pattern_library_info, DiagnosisCandidate};
use clinical_rag::{
    AnalysisRequest, AnalysisResult, ChatMessage, Pipeline, QuestionAnswer, QuestionRequest,
};
use copilot_common::mcp_api::{
    AnalyzeNoteParams, ConditionPatternListResponse, ResolveCitationsParams,
    ResolveCitationsResponse,
};

/// Parameters for `ask_note`. The context fields are taken from an `analyze_note` result.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AskNoteParams {
    /// The follow-up question.
    pub question: String,
    /// `chunks` from the analysis, unchanged, so citations resolve to the same ids.
    pub chunks: Vec<Chunk>,
    /// `soap_text` from the analysis.
    #[serde(default)]
    pub soap_text: Option<String>,
    /// `diagnoses` from the analysis.
    #[serde(default)]
    pub diagnoses: Vec<DiagnosisCandidate>,
    /// Earlier turns of the conversation, oldest first. Only the last five are used.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Chunks to retrieve for the answer (default 3).
    #[serde(default)]
    pub top_k: Option<u32>,
}

#[derive(Clone)]
pub struct CopilotServer {
    pipeline: Arc<Pipeline>,
    tool_router: ToolRouter<CopilotServer>,
}

impl CopilotServer {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl CopilotServer {
    #[tool(description = "Analyze a clinical note: section and chunk it, retrieve evidence, extract facts, rank a differential diagnosis and compose a SOAP note. Every generated statement cites the chunk ids it came from as [evidence: <chunk_id>].")]
    async fn analyze_note(
        &self,
        Parameters(params): Parameters<AnalyzeNoteParams>,
    ) -> Result<Json<AnalysisResult>, String> {
        if params.text.trim().is_empty() {
            return Err("text must not be empty".to_string());
        }
        if params.top_k == Some(0) {
            return Err("top_k must be greater than zero".to_string());
        }

        let request = AnalysisRequest {
            text: params.text,
            doc_id: params.doc_id,
            top_k: params.top_k.map(|k| k as usize),
        };
        let result = self
            .pipeline
            .analyze(request)
            .await
            .map_err(|e| format!("analyze_note failed: {e}"))?;

        info!(
            doc_id = result.doc_id,
            state = ?result.state,
            diagnoses = result.diagnoses.len(),
            warnings = result.warnings.len(),
            elapsed_ms = result.processing_time_ms,
            "note analyzed"
        );
        Ok(Json(result))
    }

    #[tool(description = "Answer a follow-up question about a note already analyzed with analyze_note. Pass the analysis chunks, SOAP text and diagnoses back with the question. The answer cites chunk ids as [evidence: <chunk_id>] and lists the retrieved chunks as sources.")]
    async fn ask_note(
        &self,
        Parameters(params): Parameters<AskNoteParams>,
    ) -> Result<Json<QuestionAnswer>, String> {
        if params.question.trim().is_empty() {
            return Err("question must not be empty".to_string());
        }
        if params.top_k == Some(0) {
            return Err("top_k must be greater than zero".to_string());
        }

        let request = QuestionRequest {
            question: params.question,
            chunks: params.chunks,
            soap_text: params.soap_text,
            diagnoses: params.diagnoses,
            history: params.history,
            top_k: params.top_k.map(|k| k as usize),
        };
        let answer = self
            .pipeline
            .ask(request)
            .await
            .map_err(|e| format!("ask_note failed: {e}"))?;

        info!(
            sources = answer.sources.len(),
            cited = answer.cited.len(),
            warnings = answer.warnings.len(),
            elapsed_ms = answer.processing_time_ms,
            "note question answered"
        );
        Ok(Json(answer))
    }

    #[tool(description = "Extract the chunk ids cited by [evidence: ...] tokens in a text, keeping only ids from the given list, in order of first appearance. Also returns the text with the tokens removed.")]
    async fn resolve_citations(
        &self,
        Parameters(params): Parameters<ResolveCitationsParams>,
    ) -> Result<Json<ResolveCitationsResponse>, String> {
        let resolver = CitationResolver::new(params.chunk_ids);
        Ok(Json(ResolveCitationsResponse {
            chunk_ids: resolver.resolve(&params.text),
            display_text: citation::strip(&params.text),
        }))
    }

    #[tool(description = "List the condition patterns the local rule engine scores: keyword groups with weights, required groups, exclusions, suggested workup and red flags.")]
    async fn list_condition_patterns(&self) -> Result<Json<ConditionPatternListResponse>, String> {
        Ok(Json(ConditionPatternListResponse {
            patterns: pattern_library_info(),
        }))
    }
}

#[tool_handler]
impl ServerHandler for CopilotServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "clinical-copilot".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Evidence-grounded clinical note analysis (generation: {}, embeddings: {}). \
Use analyze_note on the full note text, then ask_note for follow-up questions about it, \
passing the analysis chunks back. Use resolve_citations to map [evidence: ...] tokens in any \
returned text back to chunks. Output is decision support for clinicians, \
not a diagnosis.",
                self.pipeline.backend_name(),
                self.pipeline.embedder_name()
            )),
        }
    }
}
