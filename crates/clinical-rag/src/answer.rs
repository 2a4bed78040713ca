/// Follow-up questions about an analyzed note.
///
/// A question is answered from the note's own chunks: the chunks are re-indexed, the
/// closest ones retrieved, and the generator asked to answer with inline citations.
use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;
use crate::citation;
use crate::ddx::DiagnosisCandidate;
use crate::index::RetrievedChunk;
use crate::pipeline::StageWarning;
use crate::prompt::ContextBlock;
use crate::section::SectionKind;

/// Chunks retrieved per question unless the request says otherwise.
pub const DEFAULT_QUESTION_TOP_K: usize = 3;

pub const NO_CONTEXT_ANSWER: &str = "No analysis context available. Please analyze a clinical note first.";

const NOT_DOCUMENTED_ANSWER: &str = "The note does not document an answer to this question.";

const MAX_ANSWER_SENTENCES: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "has", "have", "had", "does", "did", "what", "which",
    "who", "how", "why", "when", "where", "any", "this", "that", "there", "with", "about", "patient",
    "patients", "note", "his", "her", "their", "they", "been", "show", "shows", "tell", "from", "into",
];

const DIAGNOSIS_CUES: &[&str] = &["diagnos", "differential", "ddx", "likely", "cause", "condition", "suspect"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// A question plus the analysis it is about.
#[derive(Debug, Clone, Default)]
pub struct QuestionRequest {
    pub question: String,
    /// Chunks of the analyzed note, ids unchanged.
    pub chunks: Vec<Chunk>,
    pub soap_text: Option<String>,
    pub diagnoses: Vec<DiagnosisCandidate>,
    /// Earlier turns, oldest first.
    pub history: Vec<ChatMessage>,
    pub top_k: Option<usize>,
}

impl QuestionRequest {
    pub fn new(question: impl Into<String>, chunks: Vec<Chunk>) -> Self {
        Self {
            question: question.into(),
            chunks,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuestionAnswer {
    /// `None` when generation failed; the reason is in `warnings`.
    pub answer: Option<String>,
    pub relevant_chunks: Vec<RetrievedChunk>,
    /// Ids of `relevant_chunks`, in rank order.
    pub sources: Vec<String>,
    /// Known chunk ids cited inside `answer`, in order of first appearance.
    pub cited: Vec<String>,
    pub backend: String,
    pub warnings: Vec<StageWarning>,
    pub processing_time_ms: u64,
}

fn content_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .map(|w| {
            if w.ends_with('s') && w.chars().count() > 4 {
                w[..w.len() - 1].to_string()
            } else {
                w
            }
        })
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .flat_map(|line| line.split(". "))
        .map(|s| s.trim().trim_start_matches(['-', '*', '•']).trim().trim_end_matches('.'))
        .filter(|s| !s.is_empty())
}

/// How many question terms a sentence shares, by prefix in either direction.
fn overlap(terms: &[String], sentence: &str) -> usize {
    let words = content_terms(sentence);
    terms
        .iter()
        .filter(|t| words.iter().any(|w| w.starts_with(t.as_str()) || t.starts_with(w.as_str())))
        .count()
}

/// Deterministic answer quoting the retrieved sentences that share the most terms with
/// the question. Each quote is cited. Diagnostic questions lead with the top candidate.
pub fn answer_from_blocks(question: &str, differential: &[String], blocks: &[ContextBlock]) -> String {
    let terms = content_terms(question);
    let mut lines = Vec::new();

    let asks_diagnosis = terms.iter().any(|t| DIAGNOSIS_CUES.iter().any(|cue| t.starts_with(cue)));
    if let (true, Some(top)) = (asks_diagnosis, differential.first()) {
        lines.push(format!("Leading differential: {top}"));
    }

    let mut scored: Vec<(usize, String)> = blocks
        .iter()
        .flat_map(|b| {
            let section = SectionKind::from_code(&b.section).map_or("Note", SectionKind::display_name);
            sentences(&b.text).map(move |s| (s, section, b.chunk_id.as_str()))
        })
        .filter_map(|(sentence, section, id)| {
            let score = overlap(&terms, sentence);
            (score > 0).then(|| (score, format!("- {section}: {sentence} {}", citation::token(&[id]))))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    lines.extend(scored.into_iter().take(MAX_ANSWER_SENTENCES).map(|(_, line)| line));

    if lines.is_empty() {
        return NOT_DOCUMENTED_ANSWER.to_string();
    }
    format!("Based on the note:\n{}", lines.join("\n"))
}
