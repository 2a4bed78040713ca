//! End-to-end analysis scenarios with the hashing embedder and stub backends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clinical_rag::ddx::Confidence;
use clinical_rag::facts::Sex;
use clinical_rag::pipeline::{Stage, WarningKind};
use clinical_rag::{
    AnalysisError, AnalysisRequest, GenerationError, Pipeline, PipelineConfig, PipelineState, RuleEngine,
    TextGenerator,
};
use copilot_common::embedding::{EmbeddingProvider, HashingEmbedder};
use copilot_common::error::CommonError;

const MENINGITIS_NOTE: &str = "CHIEF COMPLAINT: Fever, headache, and neck stiffness for 3 days.

HISTORY OF PRESENT ILLNESS:
Patient is a 35-year-old male presenting to the emergency department with a 3-day history of progressively worsening fever (up to 102.5°F), severe headache, and neck stiffness. He reports photophobia and nausea with one episode of vomiting. Denies recent head trauma, sick contacts, or travel. No similar episodes in the past.

PAST MEDICAL HISTORY:
- No significant past medical history
- No chronic medications
- No known drug allergies

PHYSICAL EXAMINATION:
- Vitals: Temp 101.8°F, HR 110 bpm, BP 128/82 mmHg, RR 18, O2 sat 98% on room air
- General: Appears ill, in moderate distress
- HEENT: Pupils equal and reactive, photophobia noted
- Neck: Positive nuchal rigidity, Kernig's and Brudzinski's signs positive
- Neurological: Alert and oriented x3, no focal neurological deficits
- Skin: No rash observed

LABORATORY:
- WBC: 15,200/μL (elevated)
- Neutrophils: 82% (elevated)
- CRP: 45 mg/L (elevated)

ASSESSMENT:
Clinical presentation highly concerning for bacterial meningitis given fever, severe headache, nuchal rigidity, and positive meningeal signs.

PLAN:
- Urgent LP for CSF analysis
- Start empiric IV antibiotics (ceftriaxone + vancomycin)
- CT head if LP delayed
- Admit to ICU for close monitoring
- Infectious disease consult";

fn hashing() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingEmbedder::default())
}

fn rules_pipeline() -> Pipeline {
    Pipeline::with_rule_engine(PipelineConfig::default(), hashing())
}

fn is_differential(prompt: &str) -> bool {
    prompt.starts_with("TASK: DIFFERENTIAL_DIAGNOSIS")
}

/// Answers Step 1 with the rule engine and fails Step 2 as unreachable.
struct DifferentialUnavailable(RuleEngine);

#[async_trait]
impl TextGenerator for DifferentialUnavailable {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        if is_differential(prompt) {
            return Err(GenerationError::Unavailable("connection refused".to_string()));
        }
        self.0.generate(prompt).await
    }
    fn name(&self) -> &str {
        "step2-down"
    }
}

/// Answers Step 1 with the rule engine and never finishes Step 2.
struct DifferentialHangs(RuleEngine);

#[async_trait]
impl TextGenerator for DifferentialHangs {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        if is_differential(prompt) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.0.generate(prompt).await
    }
    fn name(&self) -> &str {
        "step2-hangs"
    }
}

struct BrokenEmbedder;

#[async_trait]
impl EmbeddingProvider for BrokenEmbedder {
    async fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        Err(CommonError::Embedding("model not loaded".to_string()))
    }
    async fn embed_query(&self, _query: &str) -> Result<Vec<f32>, CommonError> {
        Err(CommonError::Embedding("model not loaded".to_string()))
    }
    fn dimensions(&self) -> usize {
        8
    }
    fn name(&self) -> &str {
        "broken"
    }
}

#[tokio::test]
async fn meningitis_note_end_to_end() {
    let result = rules_pipeline()
        .analyze(AnalysisRequest::new(MENINGITIS_NOTE))
        .await
        .unwrap();

    assert_eq!(result.state, PipelineState::Complete, "warnings: {:?}", result.warnings);
    assert_eq!(result.chunks.len(), 7);

    let top = &result.diagnoses[0];
    assert!(top.diagnosis.contains("Meningitis"), "top candidate: {}", top.diagnosis);
    assert_eq!(top.confidence, Confidence::High);
    assert!(!top.evidence.is_empty());

    let ids: HashSet<&str> = result.chunks.iter().map(|c| c.id.as_str()).collect();
    assert!(top.evidence.iter().all(|id| ids.contains(id.as_str())));
    assert!(result.citations.iter().all(|c| ids.contains(c.chunk_id.as_str())));

    let facts = result.facts.as_ref().unwrap();
    assert!(facts.evidence_ids().iter().all(|id| ids.contains(id.as_str())));
    let symptoms: Vec<&str> = facts.symptoms.iter().map(|s| s.name.as_str()).collect();
    assert!(symptoms.contains(&"fever") && symptoms.contains(&"headache"));

    assert!(result.soap_text.contains("Bacterial Meningitis (High confidence)"));
    assert!(result.soap.plan.starts_with("- Urgent LP for CSF analysis"));
    assert!(result.step1_raw.is_some() && result.step2_raw.is_some());
    assert!(result.facts_parse_error.is_none() && result.ddx_parse_error.is_none());
}

#[tokio::test]
async fn rule_engine_scores_survive_into_the_result() {
    let result = rules_pipeline()
        .analyze(AnalysisRequest::new(MENINGITIS_NOTE))
        .await
        .unwrap();
    let top = &result.diagnoses[0];
    let score = top.score.expect("top candidate carries its coverage score");
    assert!(score > 0.0 && score <= 1.0, "score {score}");
    assert!(!top.matched_features.is_empty());
    assert!(result.diagnoses.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn demographics_come_from_the_history() {
    let request = AnalysisRequest {
        top_k: Some(7),
        ..AnalysisRequest::new(MENINGITIS_NOTE)
    };
    let result = rules_pipeline().analyze(request).await.unwrap();
    let demo = &result.facts.unwrap().demographics;
    assert_eq!(demo.age.as_ref().map(|a| a.value), Some(35));
    assert_eq!(demo.sex.as_ref().map(|s| s.value), Some(Sex::Male));
}

#[tokio::test]
async fn unavailable_second_step_keeps_first_step_output() {
    let pipeline = Pipeline::new(
        PipelineConfig::default(),
        hashing(),
        Arc::new(DifferentialUnavailable(RuleEngine::default())),
    );
    let result = pipeline.analyze(AnalysisRequest::new(MENINGITIS_NOTE)).await.unwrap();

    assert_eq!(result.state, PipelineState::CompleteWithWarning);
    assert!(result.diagnoses.is_empty());
    assert!(result.step2_raw.is_none());

    let facts = result.facts.as_ref().expect("facts survive a step 2 failure");
    assert!(!facts.is_empty());
    let fact_ids = facts.evidence_ids();
    assert!(!fact_ids.is_empty());
    let cited: HashSet<&str> = result.citations.iter().map(|c| c.chunk_id.as_str()).collect();
    assert!(fact_ids.iter().all(|id| cited.contains(id.as_str())));

    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].stage, Stage::Differential);
    assert_eq!(result.warnings[0].kind, WarningKind::Unavailable);
    assert!(result.trace.contains(&PipelineState::FactsExtracted));
    assert!(!result.trace.contains(&PipelineState::DiagnosesGenerated));
    assert!(result.trace.contains(&PipelineState::SoapComposed));
}

#[tokio::test]
async fn slow_second_step_times_out() {
    let config = PipelineConfig::builder()
        .generation_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let pipeline = Pipeline::new(config, hashing(), Arc::new(DifferentialHangs(RuleEngine::default())));
    let result = pipeline.analyze(AnalysisRequest::new(MENINGITIS_NOTE)).await.unwrap();

    assert_eq!(result.state, PipelineState::CompleteWithWarning);
    assert!(result.facts.is_some());
    assert!(result.diagnoses.is_empty());
    assert_eq!(result.warnings[0].kind, WarningKind::Timeout);
}

#[tokio::test]
async fn empty_note_is_an_input_error() {
    for text in ["", "   ", "\n\n\t"] {
        let err = rules_pipeline().analyze(AnalysisRequest::new(text)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyInput), "{text:?}");
    }
}

#[tokio::test]
async fn embedding_failure_degrades_to_note_order() {
    let pipeline = Pipeline::with_rule_engine(PipelineConfig::default(), Arc::new(BrokenEmbedder));
    let result = pipeline.analyze(AnalysisRequest::new(MENINGITIS_NOTE)).await.unwrap();

    assert_eq!(result.state, PipelineState::CompleteWithWarning);
    assert!(!result.trace.contains(&PipelineState::Indexed));
    assert!(result.step1_retrieval.degraded);
    assert_eq!(result.step1_retrieval.chunks.len(), result.chunks.len());
    assert!(result.warnings.iter().all(|w| w.kind == WarningKind::RetrievalDegraded));
    assert!(result.diagnoses[0].diagnosis.contains("Meningitis"));
}

#[tokio::test]
async fn concurrent_requests_are_independent() {
    let pipeline = rules_pipeline();
    let handles: Vec<_> = (1..=8u64)
        .map(|doc_id| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let request = AnalysisRequest {
                    doc_id: Some(doc_id),
                    ..AnalysisRequest::new(MENINGITIS_NOTE)
                };
                pipeline.analyze(request).await
            })
        })
        .collect();

    let mut all_ids = HashSet::new();
    let mut tops = HashSet::new();
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        let doc_id = i as u64 + 1;
        assert_eq!(result.doc_id, doc_id);
        for chunk in &result.chunks {
            assert!(chunk.id.starts_with(&format!("{doc_id}_")));
            assert!(all_ids.insert(chunk.id.clone()), "duplicate id {}", chunk.id);
        }
        tops.insert(result.diagnoses[0].diagnosis.clone());
    }
    assert_eq!(tops.len(), 1);
}
