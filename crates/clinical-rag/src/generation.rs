/// Backends behind the single "prompt in, text out" generation capability.
use async_trait::async_trait;
use copilot_common::openai::{LlmClient, LlmClientError};
use tracing::debug;

use crate::answer::answer_from_blocks;
use crate::config::ConfidenceThresholds;
use crate::ddx::generate_differential;
use crate::error::GenerationError;
use crate::facts::extract_facts;
use crate::prompt::{ParsedPrompt, parse_prompt};

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Backend name reported on results.
    fn name(&self) -> &str;
}

/// Deterministic local backend. Reads the prompt's task and context blocks back and
/// answers with the same JSON a language model is asked for.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    thresholds: ConfidenceThresholds,
    max_diagnoses: usize,
}

impl RuleEngine {
    pub fn new(thresholds: ConfidenceThresholds, max_diagnoses: usize) -> Self {
        Self {
            thresholds,
            max_diagnoses,
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(ConfidenceThresholds::default(), 3)
    }
}

#[async_trait]
impl TextGenerator for RuleEngine {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        match parse_prompt(prompt).ok_or(GenerationError::UnsupportedPrompt)? {
            ParsedPrompt::ExtractFacts { blocks } => {
                let facts = extract_facts(&blocks);
                debug!(blocks = blocks.len(), empty = facts.is_empty(), "rule engine extracted facts");
                Ok(serde_json::to_string_pretty(&facts)?)
            }
            ParsedPrompt::Differential { facts, blocks } => {
                let ddx = generate_differential(&facts, &blocks, &self.thresholds, self.max_diagnoses);
                debug!(candidates = ddx.len(), "rule engine ranked differential");
                Ok(serde_json::to_string_pretty(&ddx)?)
            }
            ParsedPrompt::Question {
                question,
                differential,
                blocks,
            } => Ok(answer_from_blocks(&question, &differential, &blocks)),
        }
    }

    fn name(&self) -> &str {
        "rules"
    }
}

const SYSTEM_PROMPT: &str = "You are a careful clinical documentation assistant. Answer only from the \
provided note context, never invent findings, and follow the requested JSON format exactly.";

/// OpenAI-compatible chat completions backend (OpenAI, Ollama, vLLM, Groq).
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: LlmClient,
    name: String,
}

impl OpenAiGenerator {
    pub fn new(client: LlmClient) -> Self {
        let name = format!("openai:{}", client.config().model);
        Self { client, name }
    }
}

impl From<LlmClientError> for GenerationError {
    fn from(e: LlmClientError) -> Self {
        if e.is_unreachable() {
            GenerationError::Unavailable(e.to_string())
        } else if matches!(e, LlmClientError::EmptyCompletion) {
            GenerationError::EmptyResponse
        } else {
            GenerationError::Backend(e.to_string())
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let text = self
            .client
            .complete(SYSTEM_PROMPT, prompt)
            .await
            .map_err(|e| match e {
                e if e.is_timeout() => GenerationError::Timeout {
                    after: self.client.config().request_timeout,
                },
                e => GenerationError::from(e),
            })?;
        debug!(chars = text.len(), backend = %self.name, "completion received");
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddx::DiagnosisCandidate;
    use crate::facts::ExtractedFacts;
    use crate::index::RetrievedChunk;
    use crate::prompt::{build_differential_prompt, build_facts_prompt, build_question_prompt};
    use crate::section::SectionKind;

    fn chunk(id: &str, section: SectionKind, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            section,
            text: text.to_string(),
            score: 1.0,
            rank: 1,
            start: 0,
            end: text.len(),
        }
    }

    #[tokio::test]
    async fn rule_engine_answers_facts_prompt() {
        let chunks = vec![chunk(
            "1_HPI_0_00000001",
            SectionKind::HistoryOfPresentIllness,
            "HPI: 62-year-old woman with productive cough and fever.",
        )];
        let raw = RuleEngine::default().generate(&build_facts_prompt(&chunks)).await.unwrap();
        let facts: ExtractedFacts = serde_json::from_str(&raw).unwrap();
        assert_eq!(facts.demographics.age.as_ref().map(|a| a.value), Some(62));
        let names: Vec<&str> = facts.symptoms.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"cough") && names.contains(&"fever"));
        assert!(facts.symptoms.iter().all(|s| s.evidence.as_deref() == Some("1_HPI_0_00000001")));
    }

    #[tokio::test]
    async fn rule_engine_answers_differential_prompt() {
        let chunks = vec![chunk(
            "1_HPI_0_00000002",
            SectionKind::HistoryOfPresentIllness,
            "productive cough, fever, crackles at the right base, WBC elevated",
        )];
        let prompt = build_differential_prompt(None, &chunks).unwrap();
        let raw = RuleEngine::default().generate(&prompt).await.unwrap();
        let ddx: Vec<DiagnosisCandidate> = serde_json::from_str(&raw).unwrap();
        assert_eq!(ddx[0].diagnosis, "Community-Acquired Pneumonia");
        assert_eq!(ddx[0].evidence, vec!["1_HPI_0_00000002"]);
    }

    #[tokio::test]
    async fn rule_engine_answers_question_prompt() {
        let chunks = vec![chunk(
            "1_EXAM_0_00000003",
            SectionKind::PhysicalExam,
            "Neck: Positive nuchal rigidity. Skin: No rash observed.",
        )];
        let prompt = build_question_prompt("Is there a rash?", None, &[], &[], &chunks);
        let answer = RuleEngine::default().generate(&prompt).await.unwrap();
        assert!(answer.contains("No rash observed [evidence: 1_EXAM_0_00000003]"), "{answer}");
    }

    #[tokio::test]
    async fn rule_engine_rejects_free_text() {
        let err = RuleEngine::default().generate("write a poem").await.unwrap_err();
        assert!(matches!(err, GenerationError::UnsupportedPrompt));
    }

    #[test]
    fn client_errors_map_to_generation_errors() {
        assert!(matches!(
            GenerationError::from(LlmClientError::EmptyCompletion),
            GenerationError::EmptyResponse
        ));
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            GenerationError::from(LlmClientError::InvalidJson(bad_json)),
            GenerationError::Backend(_)
        ));
    }
}
