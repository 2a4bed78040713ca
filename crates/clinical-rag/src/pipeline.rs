/// The two-step analysis pipeline.
///
/// `Received → Sectioned → Chunked → Indexed → Step1Retrieved → FactsExtracted →
/// Step2Retrieved → DiagnosesGenerated → SoapComposed → Complete`
///
/// Only an empty note is an error. Every later failure is recorded as a [`StageWarning`]
/// and the pipeline carries on with what it has, finishing in
/// [`PipelineState::CompleteWithWarning`]. States that were skipped are absent from
/// [`AnalysisResult::trace`].
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use copilot_common::embedding::EmbeddingProvider;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::answer::{DEFAULT_QUESTION_TOP_K, NO_CONTEXT_ANSWER, QuestionAnswer, QuestionRequest};
use crate::chunker::{Chunk, chunk_sections};
use crate::citation::{self, Citation, CitationResolver};
use crate::config::PipelineConfig;
use crate::ddx::DiagnosisCandidate;
use crate::error::{AnalysisError, GenerationError};
use crate::facts::ExtractedFacts;
use crate::generation::{RuleEngine, TextGenerator};
use crate::index::VectorIndex;
use crate::prompt::{
    build_differential_prompt, build_facts_prompt, build_question_prompt, parse_differential_response,
    parse_facts_response,
};
use crate::retriever::{FACT_QUERY, RetrievalPass, Retriever, diagnosis_query};
use crate::section::split_sections;
use crate::soap::{SoapNote, compose_soap};

const DEFAULT_DOC_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PipelineState {
    Received,
    Sectioned,
    Chunked,
    Indexed,
    Step1Retrieved,
    FactsExtracted,
    Step2Retrieved,
    DiagnosesGenerated,
    SoapComposed,
    Complete,
    CompleteWithWarning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Indexing,
    FirstRetrieval,
    FactExtraction,
    SecondRetrieval,
    Differential,
    QuestionRetrieval,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ParseError,
    Timeout,
    Unavailable,
    BackendError,
    RetrievalDegraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StageWarning {
    pub stage: Stage,
    pub kind: WarningKind,
    pub message: String,
}

impl StageWarning {
    fn new(stage: Stage, kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    fn from_generation(stage: Stage, err: &GenerationError) -> Self {
        let kind = match err {
            GenerationError::Timeout { .. } => WarningKind::Timeout,
            GenerationError::Unavailable(_) => WarningKind::Unavailable,
            _ => WarningKind::BackendError,
        };
        Self::new(stage, kind, err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub text: String,
    pub doc_id: Option<u64>,
    /// Overrides the configured `top_k` for this request.
    pub top_k: Option<usize>,
}

impl AnalysisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisResult {
    pub doc_id: u64,
    pub state: PipelineState,
    /// States passed, in order.
    pub trace: Vec<PipelineState>,
    /// Generation backend name.
    pub backend: String,
    /// Embedding provider name.
    pub embedder: String,
    pub soap: SoapNote,
    /// The SOAP note rendered as text, citation tokens included.
    pub soap_text: String,
    pub facts: Option<ExtractedFacts>,
    pub diagnoses: Vec<DiagnosisCandidate>,
    pub chunks: Vec<Chunk>,
    pub step1_retrieval: RetrievalPass,
    pub step2_retrieval: RetrievalPass,
    /// Every chunk cited by the SOAP note, the diagnoses or the facts, in that order.
    pub citations: Vec<Citation>,
    pub warnings: Vec<StageWarning>,
    pub facts_parse_error: Option<String>,
    pub ddx_parse_error: Option<String>,
    pub step1_raw: Option<String>,
    pub step2_raw: Option<String>,
    pub processing_time_ms: u64,
}

/// Shared, immutable pipeline state. Cheap to clone; each `analyze` call builds its own
/// index, so concurrent requests never share mutable data.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn TextGenerator>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            config,
            embedder,
            generator,
        }
    }

    /// Pipeline backed by the local rule engine, configured from `config`.
    pub fn with_rule_engine(config: PipelineConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let engine = RuleEngine::new(config.thresholds, config.max_diagnoses);
        Self::new(config, embedder, Arc::new(engine))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.generator.name()
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    /// Analyze one note.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::EmptyInput`] for an empty or whitespace-only note and
    /// [`AnalysisError::InvalidInput`] for a zero `top_k` override. Nothing is chunked
    /// in either case.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        let started = Instant::now();
        if request.text.trim().is_empty() {
            return Err(AnalysisError::EmptyInput);
        }
        let top_k = match request.top_k {
            Some(0) => return Err(AnalysisError::InvalidInput("top_k must be greater than 0".into())),
            Some(k) => k,
            None => self.config.top_k,
        };
        let doc_id = request.doc_id.unwrap_or(DEFAULT_DOC_ID);
        let mut trace = vec![PipelineState::Received];
        let mut warnings = Vec::new();
        info!(doc_id, chars = request.text.len(), backend = self.generator.name(), "analysis started");

        let sections = split_sections(&request.text);
        trace.push(PipelineState::Sectioned);
        debug!(doc_id, sections = sections.len(), "note sectioned");

        let chunks = chunk_sections(&sections, doc_id, self.config.max_chunk_chars);
        trace.push(PipelineState::Chunked);
        debug!(doc_id, chunks = chunks.len(), "note chunked");
        let resolver = CitationResolver::from_chunks(&chunks);

        let index = match VectorIndex::build(&chunks, Arc::clone(&self.embedder)).await {
            Ok(index) => {
                trace.push(PipelineState::Indexed);
                info!(doc_id, entries = index.len(), embedder = self.embedder.name(), "index built");
                Some(index)
            }
            Err(e) => {
                warn!(doc_id, error = %e, "index build failed, retrieval degraded to note order");
                warnings.push(StageWarning::new(
                    Stage::Indexing,
                    WarningKind::RetrievalDegraded,
                    format!("index build failed: {e}"),
                ));
                None
            }
        };
        let retriever = Retriever::new(index, chunks.clone(), top_k);

        // Step 1: facts.
        let (step1_retrieval, degraded) = retriever.retrieve(FACT_QUERY).await;
        if let Some(message) = degraded {
            warnings.push(StageWarning::new(Stage::FirstRetrieval, WarningKind::RetrievalDegraded, message));
        }
        trace.push(PipelineState::Step1Retrieved);
        debug!(doc_id, hits = step1_retrieval.chunks.len(), "step 1 retrieval");

        let mut facts = None;
        let mut facts_parse_error = None;
        let mut step1_raw = None;
        match self.generate(Stage::FactExtraction, &build_facts_prompt(&step1_retrieval.chunks)).await {
            Ok(raw) => {
                match parse_facts_response(&raw) {
                    Ok(mut parsed) => {
                        parsed.retain_known_evidence(|id| resolver.is_known(id));
                        trace.push(PipelineState::FactsExtracted);
                        info!(doc_id, evidence = parsed.evidence_ids().len(), "facts extracted");
                        facts = Some(parsed);
                    }
                    Err(message) => {
                        warn!(doc_id, error = %message, "facts response did not parse");
                        warnings.push(StageWarning::new(
                            Stage::FactExtraction,
                            WarningKind::ParseError,
                            message.clone(),
                        ));
                        facts_parse_error = Some(message);
                    }
                }
                step1_raw = Some(raw);
            }
            Err(warning) => warnings.push(warning),
        }

        // Step 2: differential.
        let (step2_retrieval, degraded) = retriever.retrieve(&diagnosis_query(facts.as_ref())).await;
        if let Some(message) = degraded {
            warnings.push(StageWarning::new(Stage::SecondRetrieval, WarningKind::RetrievalDegraded, message));
        }
        trace.push(PipelineState::Step2Retrieved);
        debug!(doc_id, query = %step2_retrieval.query, hits = step2_retrieval.chunks.len(), "step 2 retrieval");

        let mut diagnoses = Vec::new();
        let mut ddx_parse_error = None;
        let mut step2_raw = None;
        let ddx_result = match build_differential_prompt(facts.as_ref(), &step2_retrieval.chunks) {
            Ok(prompt) => self.generate(Stage::Differential, &prompt).await,
            Err(e) => Err(StageWarning::from_generation(Stage::Differential, &GenerationError::Encode(e))),
        };
        match ddx_result {
            Ok(raw) => {
                match parse_differential_response(&raw) {
                    Ok(candidates) => {
                        diagnoses = self.ground_candidates(candidates, &resolver);
                        trace.push(PipelineState::DiagnosesGenerated);
                        info!(
                            doc_id,
                            candidates = diagnoses.len(),
                            top = diagnoses.first().map(|d| d.diagnosis.as_str()).unwrap_or(""),
                            "differential generated"
                        );
                    }
                    Err(message) => {
                        warn!(doc_id, error = %message, "differential response did not parse");
                        warnings.push(StageWarning::new(
                            Stage::Differential,
                            WarningKind::ParseError,
                            message.clone(),
                        ));
                        ddx_parse_error = Some(message);
                    }
                }
                step2_raw = Some(raw);
            }
            Err(warning) => warnings.push(warning),
        }

        let soap = compose_soap(facts.as_ref(), &diagnoses, &sections, &chunks);
        let soap_text = soap.render();
        trace.push(PipelineState::SoapComposed);

        let citations = collect_citations(&resolver, &soap_text, &diagnoses, facts.as_ref());

        let state = if warnings.is_empty() {
            PipelineState::Complete
        } else {
            PipelineState::CompleteWithWarning
        };
        trace.push(state);
        let processing_time_ms = elapsed_ms(started);
        info!(
            doc_id,
            state = ?state,
            warnings = warnings.len(),
            citations = citations.len(),
            elapsed_ms = processing_time_ms,
            "analysis finished"
        );

        Ok(AnalysisResult {
            doc_id,
            state,
            trace,
            backend: self.generator.name().to_string(),
            embedder: self.embedder.name().to_string(),
            soap,
            soap_text,
            facts,
            diagnoses,
            chunks,
            step1_retrieval,
            step2_retrieval,
            citations,
            warnings,
            facts_parse_error,
            ddx_parse_error,
            step1_raw,
            step2_raw,
            processing_time_ms,
        })
    }

    /// Answer a follow-up question from the chunks of an earlier analysis.
    ///
    /// The chunks are re-indexed with this pipeline's embedder and the closest
    /// `top_k` (default 3) retrieved. Without chunks there is nothing to search and the
    /// answer says so. Retrieval and generation failures are reported as warnings.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::InvalidInput`] for a blank question or a zero `top_k`.
    pub async fn ask(&self, request: QuestionRequest) -> Result<QuestionAnswer, AnalysisError> {
        let started = Instant::now();
        let question = request.question.trim();
        if question.is_empty() {
            return Err(AnalysisError::InvalidInput("question must not be empty".into()));
        }
        let top_k = match request.top_k {
            Some(0) => return Err(AnalysisError::InvalidInput("top_k must be greater than 0".into())),
            Some(k) => k,
            None => DEFAULT_QUESTION_TOP_K,
        };
        let backend = self.generator.name().to_string();
        if request.chunks.is_empty() {
            return Ok(QuestionAnswer {
                answer: Some(NO_CONTEXT_ANSWER.to_string()),
                relevant_chunks: Vec::new(),
                sources: Vec::new(),
                cited: Vec::new(),
                backend,
                warnings: Vec::new(),
                processing_time_ms: elapsed_ms(started),
            });
        }

        let mut warnings = Vec::new();
        let resolver = CitationResolver::from_chunks(&request.chunks);
        let index = match VectorIndex::build(&request.chunks, Arc::clone(&self.embedder)).await {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(error = %e, "index build failed, answering from chunks in note order");
                warnings.push(StageWarning::new(
                    Stage::Indexing,
                    WarningKind::RetrievalDegraded,
                    format!("index build failed: {e}"),
                ));
                None
            }
        };
        let retriever = Retriever::new(index, request.chunks, top_k);
        let (pass, degraded) = retriever.retrieve(question).await;
        if let Some(message) = degraded {
            warnings.push(StageWarning::new(Stage::QuestionRetrieval, WarningKind::RetrievalDegraded, message));
        }

        let prompt = build_question_prompt(
            question,
            request.soap_text.as_deref(),
            &request.diagnoses,
            &request.history,
            &pass.chunks,
        );
        let (answer, cited) = match self.generate(Stage::Answer, &prompt).await {
            Ok(raw) => {
                let cited = resolver.resolve(&raw);
                (Some(raw.trim().to_string()), cited)
            }
            Err(warning) => {
                warnings.push(warning);
                (None, Vec::new())
            }
        };

        let processing_time_ms = elapsed_ms(started);
        info!(
            hits = pass.chunks.len(),
            cited = cited.len(),
            warnings = warnings.len(),
            elapsed_ms = processing_time_ms,
            "question answered"
        );
        Ok(QuestionAnswer {
            answer,
            sources: pass.chunks.iter().map(|c| c.chunk_id.clone()).collect(),
            relevant_chunks: pass.chunks,
            cited,
            backend,
            warnings,
            processing_time_ms,
        })
    }

    /// One bounded generation call. Failures come back as the warning to record.
    async fn generate(&self, stage: Stage, prompt: &str) -> Result<String, StageWarning> {
        let limit = self.config.generation_timeout;
        let outcome = match tokio::time::timeout(limit, self.generator.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout { after: limit }),
        };
        outcome.map_err(|e| {
            warn!(stage = ?stage, backend = self.generator.name(), error = %e, "generation failed");
            StageWarning::from_generation(stage, &e)
        })
    }

    /// Keep only known evidence ids, merge ids cited in the rationale, drop nameless
    /// candidates and cap the list.
    fn ground_candidates(
        &self,
        candidates: Vec<DiagnosisCandidate>,
        resolver: &CitationResolver,
    ) -> Vec<DiagnosisCandidate> {
        candidates
            .into_iter()
            .filter(|c| !c.diagnosis.is_empty())
            .map(|mut c| {
                let cited = citation::extract_ids(&c.rationale);
                let ids = c.evidence.iter().map(String::as_str).chain(cited);
                let evidence = resolver.retain_known(ids);
                let dropped = c.evidence.iter().filter(|id| !resolver.is_known(id)).count();
                if dropped > 0 {
                    debug!(diagnosis = %c.diagnosis, dropped, "unknown evidence ids removed");
                }
                c.evidence = evidence;
                c
            })
            .take(self.config.max_diagnoses)
            .collect()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn collect_citations(
    resolver: &CitationResolver,
    soap_text: &str,
    diagnoses: &[DiagnosisCandidate],
    facts: Option<&ExtractedFacts>,
) -> Vec<Citation> {
    let mut ids: Vec<String> = citation::extract_ids(soap_text).into_iter().map(str::to_string).collect();
    for d in diagnoses {
        ids.extend(d.evidence.iter().cloned());
        ids.extend(citation::extract_ids(&d.rationale).into_iter().map(str::to_string));
    }
    if let Some(f) = facts {
        ids.extend(f.evidence_ids());
    }
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .filter_map(|id| resolver.citation(id).cloned())
        .collect()
}
