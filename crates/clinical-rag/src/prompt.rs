/// Prompt layout shared by both generation backends.
///
/// Every prompt starts with a `TASK:` line and carries its evidence as context blocks of
/// the form `[chunk_id][SECTION]: text`. The rule engine parses prompts back with
/// [`parse_prompt`]; language models read them as plain instructions.
///
/// Responses are parsed leniently: prose and code fences around the JSON are ignored.
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::answer::ChatMessage;
use crate::ddx::{Confidence, DiagnosisCandidate};
use crate::facts::ExtractedFacts;
use crate::index::RetrievedChunk;

const TASK_EXTRACT: &str = "TASK: EXTRACT_FACTS";
const TASK_DIFFERENTIAL: &str = "TASK: DIFFERENTIAL_DIAGNOSIS";
const CONTEXT_START: &str = "CONTEXT:";
const CONTEXT_END: &str = "END CONTEXT";
const FACTS_START: &str = "FACTS:";
const FACTS_END: &str = "END FACTS";
const TASK_ANSWER: &str = "TASK: ANSWER_QUESTION";
const SUMMARY_START: &str = "SUMMARY:";
const SUMMARY_END: &str = "END SUMMARY";
const DIFFERENTIAL_START: &str = "DIFFERENTIAL:";
const DIFFERENTIAL_END: &str = "END DIFFERENTIAL";
const HISTORY_START: &str = "HISTORY:";
const HISTORY_END: &str = "END HISTORY";
const QUESTION_START: &str = "QUESTION:";
const QUESTION_END: &str = "END QUESTION";

/// Only the most recent turns of a conversation are replayed.
pub const MAX_HISTORY_MESSAGES: usize = 5;

const EXTRACT_INSTRUCTION: &str = "You are a clinical fact extractor. Using ONLY the context blocks below, \
extract the patient's demographics, symptoms, vital signs, physical exam findings, laboratory results, \
imaging studies and the clinician's stated assessment. Copy the bracketed chunk id of the block each \
fact came from into its \"evidence\" field. Omit anything that is not documented. Ignore negated \
findings (\"denies\", \"no\", \"without\"). Respond with a single JSON object and nothing else.";

const EXTRACT_SCHEMA: &str = r#"{
  "demographics": {"age": {"value": <integer>, "evidence": "<chunk_id>"}, "sex": {"value": "male|female", "evidence": "<chunk_id>"}},
  "symptoms": [{"name": "<symptom>", "detail": "<optional text>", "evidence": "<chunk_id>"}],
  "vitals": {
    "temperature": {"value": <number>, "unit": "F|C", "evidence": "<chunk_id>"},
    "heart_rate": {"value": <number>, "unit": "bpm", "evidence": "<chunk_id>"},
    "blood_pressure": {"systolic": <number>, "diastolic": <number>, "evidence": "<chunk_id>"},
    "respiratory_rate": {"value": <number>, "unit": "breaths/min", "evidence": "<chunk_id>"},
    "oxygen_saturation": {"value": <number>, "unit": "%", "evidence": "<chunk_id>"}
  },
  "exam_findings": [{"name": "<finding>", "detail": "<optional text>", "evidence": "<chunk_id>"}],
  "labs": [{"name": "<test>", "value": <number|null>, "unit": "<unit|null>", "flag": "elevated|decreased|normal|null", "evidence": "<chunk_id>"}],
  "imaging": [{"name": "<study>", "detail": "<optional text>", "evidence": "<chunk_id>"}],
  "stated_assessment": {"value": "<clinician impression>", "evidence": "<chunk_id>"}
}"#;

const DIFFERENTIAL_INSTRUCTION: &str = "You are a diagnostic reasoning assistant. Using the extracted FACTS \
and the context blocks below, produce a ranked differential diagnosis (most likely first). In each \
rationale, cite supporting blocks inline as [evidence: <chunk_id>] using only chunk ids that appear \
in the context. Respond with a JSON array and nothing else.";

const DIFFERENTIAL_SCHEMA: &str = r#"[
  {
    "diagnosis": "<condition>",
    "confidence": "High|Medium|Low",
    "rationale": "<reasoning with [evidence: <chunk_id>] citations>",
    "evidence": ["<chunk_id>"],
    "workup": "<recommended next tests>",
    "red_flags": "<findings that would escalate care>"
  }
]"#;

const ANSWER_INSTRUCTION: &str = "You are a clinical assistant helping a clinician understand one analyzed \
note. Answer the QUESTION using ONLY the context blocks, the SOAP summary and the differential below. \
Cite every block you rely on inline as [evidence: <chunk_id>]. If the context does not answer the \
question, say so plainly. Respond in plain text.";

static BLOCK_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\[([^\]\s]+)\]\[([^\]\s]*)\]: ").expect("valid regex"));

/// One retrieved chunk as it appears inside a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlock {
    pub chunk_id: String,
    pub section: String,
    pub text: String,
}

impl From<&RetrievedChunk> for ContextBlock {
    fn from(chunk: &RetrievedChunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            section: chunk.section.code().to_string(),
            text: chunk.text.clone(),
        }
    }
}

/// A prompt recognised by [`parse_prompt`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPrompt {
    ExtractFacts {
        blocks: Vec<ContextBlock>,
    },
    Differential {
        facts: ExtractedFacts,
        blocks: Vec<ContextBlock>,
    },
    Question {
        question: String,
        /// One line per candidate, best first.
        differential: Vec<String>,
        blocks: Vec<ContextBlock>,
    },
}

fn render_context(out: &mut String, chunks: &[RetrievedChunk]) {
    out.push_str(CONTEXT_START);
    out.push('\n');
    for chunk in chunks {
        out.push_str(&format!("[{}][{}]: {}\n", chunk.chunk_id, chunk.section.code(), chunk.text));
    }
    out.push_str(CONTEXT_END);
    out.push('\n');
}

pub fn build_facts_prompt(chunks: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    out.push_str(TASK_EXTRACT);
    out.push('\n');
    out.push_str(EXTRACT_INSTRUCTION);
    out.push_str("\n\nSCHEMA:\n");
    out.push_str(EXTRACT_SCHEMA);
    out.push_str("\n\n");
    render_context(&mut out, chunks);
    out
}

/// `facts` is `None` when Step 1 failed; the prompt then carries an empty facts object.
pub fn build_differential_prompt(
    facts: Option<&ExtractedFacts>,
    chunks: &[RetrievedChunk],
) -> Result<String, serde_json::Error> {
    let facts_json = match facts {
        Some(f) => serde_json::to_string_pretty(f)?,
        None => "{}".to_string(),
    };
    let mut out = String::new();
    out.push_str(TASK_DIFFERENTIAL);
    out.push('\n');
    out.push_str(DIFFERENTIAL_INSTRUCTION);
    out.push_str("\n\n");
    out.push_str(FACTS_START);
    out.push('\n');
    out.push_str(&facts_json);
    out.push('\n');
    out.push_str(FACTS_END);
    out.push_str("\n\n");
    render_context(&mut out, chunks);
    out.push_str("\nOUTPUT SCHEMA:\n");
    out.push_str(DIFFERENTIAL_SCHEMA);
    out.push('\n');
    Ok(out)
}

fn push_section(out: &mut String, start: &str, body: &str, end: &str) {
    out.push_str(start);
    out.push('\n');
    out.push_str(body.trim());
    out.push('\n');
    out.push_str(end);
    out.push_str("\n\n");
}

/// Context blocks come first so that no free text supplied by the user precedes them.
pub fn build_question_prompt(
    question: &str,
    soap_text: Option<&str>,
    diagnoses: &[DiagnosisCandidate],
    history: &[ChatMessage],
    chunks: &[RetrievedChunk],
) -> String {
    let mut out = String::new();
    out.push_str(TASK_ANSWER);
    out.push('\n');
    out.push_str(ANSWER_INSTRUCTION);
    out.push_str("\n\n");
    render_context(&mut out, chunks);
    out.push('\n');
    push_section(&mut out, SUMMARY_START, soap_text.unwrap_or_default(), SUMMARY_END);

    let differential: Vec<String> = diagnoses
        .iter()
        .map(|d| {
            let line = format!("- {} ({} confidence): {}", d.diagnosis, d.confidence, d.rationale);
            line.replace('\n', " ").trim_end().to_string()
        })
        .collect();
    push_section(&mut out, DIFFERENTIAL_START, &differential.join("\n"), DIFFERENTIAL_END);

    let skip = history.len().saturating_sub(MAX_HISTORY_MESSAGES);
    let turns: Vec<String> = history[skip..]
        .iter()
        .map(|m| format!("{}: {}", m.role.label(), m.content.replace('\n', " ")))
        .collect();
    push_section(&mut out, HISTORY_START, &turns.join("\n"), HISTORY_END);
    push_section(&mut out, QUESTION_START, &question.replace('\n', " "), QUESTION_END);
    out
}

/// Recover the task and its inputs from a prompt built by this module.
pub fn parse_prompt(prompt: &str) -> Option<ParsedPrompt> {
    let task = prompt.lines().map(str::trim).find(|l| l.starts_with("TASK:"))?;
    let blocks = parse_context_blocks(prompt);
    match task {
        TASK_EXTRACT => Some(ParsedPrompt::ExtractFacts { blocks }),
        TASK_DIFFERENTIAL => {
            let facts = section_between(prompt, FACTS_START, FACTS_END)
                .and_then(|json| serde_json::from_str::<ExtractedFacts>(json.trim()).ok())
                .unwrap_or_default();
            Some(ParsedPrompt::Differential { facts, blocks })
        }
        TASK_ANSWER => {
            let question = last_section_between(prompt, QUESTION_START, QUESTION_END)?.trim().to_string();
            let differential = last_section_between(prompt, DIFFERENTIAL_START, DIFFERENTIAL_END)
                .map(|body| {
                    body.lines()
                        .map(|l| l.trim().trim_start_matches("- ").to_string())
                        .filter(|l| !l.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            Some(ParsedPrompt::Question {
                question,
                differential,
                blocks,
            })
        }
        _ => None,
    }
}

/// Like [`section_between`], but starts at the last header so that note text quoted earlier in
/// the prompt cannot shadow it.
fn last_section_between<'p>(prompt: &'p str, start: &str, end: &str) -> Option<&'p str> {
    let start_line = format!("\n{start}\n");
    let from = prompt.rfind(&start_line)? + start_line.len();
    let to = prompt[from..].find(&format!("\n{end}")).map(|i| from + i)?;
    Some(&prompt[from..to])
}

fn section_between<'p>(prompt: &'p str, start: &str, end: &str) -> Option<&'p str> {
    let start_line = format!("{start}\n");
    let from = prompt.find(&start_line)? + start_line.len();
    let to = prompt[from..].find(&format!("\n{end}")).map(|i| from + i)?;
    Some(&prompt[from..to])
}

/// Context blocks in prompt order. Block text runs until the next block header.
pub fn parse_context_blocks(prompt: &str) -> Vec<ContextBlock> {
    let Some(context) = section_between(prompt, CONTEXT_START, CONTEXT_END) else {
        return Vec::new();
    };
    let headers: Vec<_> = BLOCK_HEADER_RE.captures_iter(context).collect();
    headers
        .iter()
        .enumerate()
        .filter_map(|(i, caps)| {
            let whole = caps.get(0)?;
            let end = headers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(context.len(), |m| m.start());
            Some(ContextBlock {
                chunk_id: caps.get(1)?.as_str().to_string(),
                section: caps.get(2)?.as_str().to_string(),
                text: context[whole.end()..end].trim_end().to_string(),
            })
        })
        .collect()
}

/// Slice from the first `open` to the last `close`, if both exist in that order.
fn json_slice(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

pub fn parse_facts_response(raw: &str) -> Result<ExtractedFacts, String> {
    let json = json_slice(raw, '{', '}').ok_or_else(|| "no JSON object in response".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("facts JSON did not match schema: {e}"))
}

/// Accepts a bare array, or an object wrapping it under `diagnoses` / `differential`.
pub fn parse_differential_response(raw: &str) -> Result<Vec<DiagnosisCandidate>, String> {
    let array_start = raw.find('[');
    let object_start = raw.find('{');
    let value: Value = match (array_start, object_start) {
        (Some(a), Some(o)) if o < a => {
            let json = json_slice(raw, '{', '}').ok_or_else(|| "unterminated JSON object".to_string())?;
            let mut obj: Value =
                serde_json::from_str(json).map_err(|e| format!("differential JSON is invalid: {e}"))?;
            ["diagnoses", "differential", "ddx"]
                .iter()
                .find_map(|k| obj.get_mut(*k).map(Value::take))
                .ok_or_else(|| "JSON object has no diagnoses array".to_string())?
        }
        (Some(_), _) => {
            let json = json_slice(raw, '[', ']').ok_or_else(|| "unterminated JSON array".to_string())?;
            serde_json::from_str(json).map_err(|e| format!("differential JSON is invalid: {e}"))?
        }
        _ => return Err("no JSON array in response".to_string()),
    };
    let raw_candidates: Vec<RawCandidate> =
        serde_json::from_value(value).map_err(|e| format!("differential JSON did not match schema: {e}"))?;
    Ok(raw_candidates.into_iter().map(RawCandidate::into_candidate).collect())
}

/// Candidate as a model may phrase it: list-or-string fields and loose confidence labels.
#[derive(Debug, Deserialize)]
struct RawCandidate {
    diagnosis: String,
    #[serde(default)]
    confidence: Option<Value>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    evidence: Option<Value>,
    #[serde(default)]
    workup: Option<Value>,
    #[serde(default)]
    red_flags: Option<Value>,
    #[serde(default)]
    score: Option<Value>,
    #[serde(default)]
    matched_features: Option<Value>,
}

impl RawCandidate {
    fn into_candidate(self) -> DiagnosisCandidate {
        let confidence = self
            .confidence
            .as_ref()
            .and_then(|v| match v {
                Value::String(s) => Confidence::parse(s),
                Value::Number(n) => n.as_u64().and_then(Confidence::from_ordinal),
                _ => None,
            })
            .unwrap_or(Confidence::Low);
        DiagnosisCandidate {
            diagnosis: self.diagnosis.trim().to_string(),
            confidence,
            rationale: self.rationale.unwrap_or_default(),
            evidence: string_list(self.evidence),
            workup: joined_text(self.workup),
            red_flags: joined_text(self.red_flags),
            score: self.score.as_ref().and_then(score_value),
            matched_features: string_list(self.matched_features),
        }
    }
}

fn score_value(value: &Value) -> Option<f32> {
    let score = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    score.is_finite().then_some(score as f32)
}

fn string_list(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s
            .split([',', ';'])
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn joined_text(value: Option<Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s,
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; "),
        _ => return None,
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}
