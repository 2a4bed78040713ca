/// Rule-based differential diagnosis over a static condition pattern library.
///
/// Each condition is a set of weighted keyword groups. A group matches when any of its
/// keywords occurs, un-negated, in a fact-derived term or in a retrieved chunk. The
/// matched share of the total weight (the coverage) decides the confidence band.
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use copilot_common::mcp_api::{ConditionPatternInfo, KeywordGroupInfo};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::ConfidenceThresholds;
use crate::facts::{ExtractedFacts, FactTerm};
use crate::prompt::ContextBlock;
use crate::text::{find_affirmed, phrase_regex};

const MAX_EVIDENCE: usize = 5;
const MAX_IDS_PER_FEATURE: usize = 2;

pub const UNDIFFERENTIATED: &str = "Undifferentiated Illness";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, JsonSchema)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn ordinal(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    pub fn from_ordinal(n: u64) -> Option<Self> {
        match n {
            3 => Some(Self::High),
            2 => Some(Self::Medium),
            1 => Some(Self::Low),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" | "moderate" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Band for a coverage value, or `None` when it falls below the lowest threshold.
    pub fn from_coverage(coverage: f32, thresholds: &ConfidenceThresholds) -> Option<Self> {
        if coverage >= thresholds.high {
            Some(Self::High)
        } else if coverage >= thresholds.medium {
            Some(Self::Medium)
        } else if coverage >= thresholds.low {
            Some(Self::Low)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown confidence {raw:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DiagnosisCandidate {
    pub diagnosis: String,
    pub confidence: Confidence,
    /// Reasoning with inline `[evidence: <chunk_id>]` tokens.
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub red_flags: Option<String>,
    /// Keyword-group coverage in `[0, 1]`. Only set by the rule engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_features: Vec<String>,
}

impl DiagnosisCandidate {
    pub fn undifferentiated() -> Self {
        Self {
            diagnosis: UNDIFFERENTIATED.to_string(),
            confidence: Confidence::Low,
            rationale: "Clinical presentation requires further diagnostic workup to establish a diagnosis."
                .to_string(),
            evidence: Vec::new(),
            workup: Some(
                "Complete history and examination, basic labs (CBC, BMP), and targeted imaging as indicated"
                    .to_string(),
            ),
            red_flags: None,
            score: None,
            matched_features: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct KeywordGroup {
    pub label: &'static str,
    pub keywords: &'static [&'static str],
    pub weight: f32,
    pub required: bool,
}

#[derive(Debug)]
pub struct ConditionPattern {
    pub name: &'static str,
    pub groups: &'static [KeywordGroup],
    /// Any affirmed occurrence rules the condition out.
    pub exclusions: &'static [&'static str],
    pub rationale: &'static str,
    pub workup: &'static str,
    pub red_flags: &'static str,
}

impl ConditionPattern {
    pub fn total_weight(&self) -> f32 {
        self.groups.iter().map(|g| g.weight).sum()
    }
}

const fn group(
    label: &'static str,
    keywords: &'static [&'static str],
    weight: f32,
    required: bool,
) -> KeywordGroup {
    KeywordGroup {
        label,
        keywords,
        weight,
        required,
    }
}

const FEVER: &[&str] = &["fever", "fevers", "febrile", "pyrexia"];
const LEUKOCYTOSIS: &[&str] = &["leukocytosis", "elevated wbc", "neutrophilia", "elevated neutrophils"];
const ALTERED_MENTATION: &[&str] = &["confusion", "confused", "altered mental status", "disoriented"];

/// Declaration order is the ranking tie-break.
pub static PATTERNS: &[ConditionPattern] = &[
    ConditionPattern {
        name: "Bacterial Meningitis",
        groups: &[
            group("fever", FEVER, 3.0, false),
            group("headache", &["headache", "headaches", "cephalgia"], 3.0, false),
            group(
                "meningismus",
                &[
                    "neck stiffness",
                    "nuchal rigidity",
                    "stiff neck",
                    "meningeal signs",
                    "kernig",
                    "kernigs",
                    "brudzinski",
                    "brudzinskis",
                    "meningismus",
                ],
                3.0,
                true,
            ),
            group("leukocytosis", LEUKOCYTOSIS, 1.0, false),
            group("photophobia or altered mentation", &["photophobia", "confusion", "altered mental status"], 0.5, false),
        ],
        exclusions: &[],
        rationale: "Classic triad of fever, headache and nuchal rigidity with meningeal signs.",
        workup: "Lumbar puncture with CSF analysis (cell count, glucose, protein, Gram stain, culture); blood cultures before antibiotics; CT head before LP if focal deficits or papilledema",
        red_flags: "Altered mental status, seizures, petechial rash, hemodynamic instability",
    },
    ConditionPattern {
        name: "Community-Acquired Pneumonia",
        groups: &[
            group(
                "respiratory symptoms",
                &["cough", "productive cough", "shortness of breath", "dyspnea", "sputum"],
                3.0,
                true,
            ),
            group("fever", FEVER, 2.5, false),
            group("leukocytosis", LEUKOCYTOSIS, 2.0, false),
            group(
                "abnormal lung exam",
                &["crackles", "rales", "rhonchi", "abnormal breath sounds", "consolidation", "infiltrate"],
                1.5,
                false,
            ),
            group("tachypnea or hypoxia", &["tachypnea", "hypoxia", "hypoxemia"], 1.0, false),
        ],
        exclusions: &[],
        rationale: "Fever with respiratory symptoms and leukocytosis suggests bacterial pneumonia.",
        workup: "Chest X-ray; CBC; blood and sputum cultures; procalcitonin",
        red_flags: "Hypoxia, respiratory distress, hypotension, confusion",
    },
    ConditionPattern {
        name: "Acute Myocardial Infarction",
        groups: &[
            group(
                "chest pain",
                &["chest pain", "chest pressure", "chest tightness", "chest discomfort"],
                3.5,
                true,
            ),
            group(
                "troponin elevation",
                &["elevated troponin", "troponin positive", "positive troponin", "troponin elevated"],
                3.0,
                false,
            ),
            group(
                "ischemic ECG changes",
                &["st elevation", "st depression", "stemi", "nstemi", "t wave inversion", "t wave inversions"],
                1.5,
                false,
            ),
            group(
                "associated symptoms",
                &["shortness of breath", "dyspnea", "diaphoresis", "nausea", "radiating"],
                1.0,
                false,
            ),
        ],
        exclusions: &[],
        rationale: "Chest pain with elevated troponin or associated symptoms is concerning for acute MI.",
        workup: "Serial troponins; 12-lead ECG; urgent cardiology consultation",
        red_flags: "Ongoing chest pain, hemodynamic instability, arrhythmia",
    },
    ConditionPattern {
        name: "Sepsis",
        groups: &[
            group("fever or hypothermia", &["fever", "fevers", "febrile", "hypothermia"], 2.5, true),
            group("leukocytosis", &["leukocytosis", "elevated wbc", "leukopenia", "neutrophilia"], 2.0, false),
            group(
                "organ dysfunction",
                &[
                    "hypotension",
                    "confusion",
                    "altered mental status",
                    "elevated lactate",
                    "lactic acidosis",
                    "septic shock",
                ],
                3.0,
                true,
            ),
            group("tachycardia", &["tachycardia"], 1.5, false),
            group("tachypnea", &["tachypnea"], 1.0, false),
        ],
        exclusions: &[],
        rationale: "Fever with leukocytosis and organ dysfunction or hemodynamic instability is concerning for sepsis.",
        workup: "Blood cultures; serum lactate; CBC; comprehensive metabolic panel; urinalysis; source imaging",
        red_flags: "Hypotension, rising lactate, altered mental status, decreasing urine output",
    },
    ConditionPattern {
        name: "Acute Abdomen (Appendicitis/Cholecystitis)",
        groups: &[
            group(
                "abdominal pain",
                &["abdominal pain", "stomach pain", "belly pain", "rlq pain", "ruq pain", "epigastric pain"],
                3.5,
                true,
            ),
            group(
                "abdominal exam findings",
                &["abdominal findings", "tenderness", "guarding", "rebound", "mcburney", "murphy"],
                2.5,
                false,
            ),
            group("GI symptoms", &["nausea", "vomiting", "anorexia"], 1.5, false),
            group("systemic response", &["fever", "febrile", "leukocytosis", "elevated wbc"], 1.5, false),
        ],
        exclusions: &[],
        rationale: "Abdominal pain with systemic symptoms warrants imaging to evaluate for a surgical abdomen.",
        workup: "CT abdomen/pelvis or right upper quadrant ultrasound; CBC; lipase; liver function tests",
        red_flags: "Peritoneal signs, rigid abdomen, hemodynamic instability",
    },
    ConditionPattern {
        name: "Cerebrovascular Accident (Stroke)",
        groups: &[
            group(
                "focal neurological deficit",
                &[
                    "focal deficit",
                    "focal deficits",
                    "focal neurological deficit",
                    "focal neurological deficits",
                    "neurological findings",
                    "hemiparesis",
                    "facial droop",
                    "aphasia",
                    "slurred speech",
                    "unilateral weakness",
                    "numbness",
                ],
                4.0,
                true,
            ),
            group("acute onset", &["sudden onset", "acute onset", "abrupt onset", "suddenly"], 2.0, false),
            group("mental status change", ALTERED_MENTATION, 1.5, false),
            group(
                "vascular risk factors",
                &["hypertension", "atrial fibrillation", "diabetes", "smoking", "prior stroke", "tia"],
                1.5,
                false,
            ),
        ],
        exclusions: &[],
        rationale: "Acute neurological deficits require urgent imaging to evaluate for stroke.",
        workup: "Non-contrast CT head; CT angiography; glucose; stroke team activation",
        red_flags: "Symptom onset within the thrombolysis window, declining consciousness",
    },
    ConditionPattern {
        name: "Migraine or Tension Headache",
        groups: &[
            group("headache", &["headache", "headaches", "cephalgia"], 4.0, true),
            group(
                "migraine features",
                &["photophobia", "phonophobia", "aura", "throbbing", "unilateral headache", "nausea"],
                2.0,
                false,
            ),
            group(
                "recurrent pattern",
                &["recurrent", "similar episodes", "history of migraine", "migraines", "episodic"],
                1.5,
                false,
            ),
        ],
        exclusions: &[
            "neck stiffness",
            "nuchal rigidity",
            "stiff neck",
            "meningeal signs",
            "meningismus",
            "kernig",
            "kernigs",
            "brudzinski",
            "brudzinskis",
            "focal deficit",
            "focal deficits",
            "neurological findings",
        ],
        rationale: "Headache without focal neurological deficits or meningeal signs suggests a primary headache disorder.",
        workup: "Neurological examination; headache diary; neuroimaging only if red flags develop",
        red_flags: "Thunderclap onset, fever with neck stiffness, focal deficits, worst headache of life",
    },
    ConditionPattern {
        name: "Heart Failure",
        groups: &[
            group(
                "volume overload",
                &[
                    "edema",
                    "swelling",
                    "jvd",
                    "jugular venous distension",
                    "orthopnea",
                    "paroxysmal nocturnal dyspnea",
                ],
                3.0,
                true,
            ),
            group("dyspnea", &["shortness of breath", "dyspnea", "dyspnea on exertion"], 2.5, false),
            group(
                "cardiopulmonary exam",
                &["crackles", "rales", "s3", "gallop", "cardiac findings"],
                1.5,
                false,
            ),
            group(
                "cardiac markers",
                &["elevated bnp", "bnp", "cardiomegaly", "reduced ejection fraction"],
                2.0,
                false,
            ),
        ],
        exclusions: &[],
        rationale: "Dyspnea with signs of volume overload suggests decompensated heart failure.",
        workup: "BNP; chest X-ray; echocardiogram; basic metabolic panel",
        red_flags: "Hypoxia, pulmonary edema, cardiogenic shock",
    },
    ConditionPattern {
        name: "Hypertensive Emergency",
        groups: &[
            group(
                "severe hypertension",
                &["severe hypertension", "hypertensive crisis", "hypertensive emergency", "hypertensive urgency"],
                4.0,
                true,
            ),
            group(
                "end-organ symptoms",
                &[
                    "headache",
                    "confusion",
                    "altered mental status",
                    "chest pain",
                    "blurred vision",
                    "papilledema",
                    "acute kidney injury",
                ],
                3.0,
                false,
            ),
            group("associated symptoms", &["nausea", "dizziness", "shortness of breath"], 1.0, false),
        ],
        exclusions: &[],
        rationale: "Severely elevated blood pressure with end-organ symptoms indicates a hypertensive emergency.",
        workup: "Repeat blood pressure; ECG; troponin; creatinine; urinalysis; fundoscopic exam",
        red_flags: "Encephalopathy, chest pain, acute kidney injury, visual loss",
    },
    ConditionPattern {
        name: "Acute Kidney Injury",
        groups: &[
            group(
                "renal dysfunction",
                &["acute kidney injury", "aki", "elevated creatinine", "elevated bun", "renal failure"],
                4.0,
                true,
            ),
            group("urine output", &["oliguria", "anuria", "decreased urine output"], 2.0, false),
            group("volume status", &["dehydration", "hypotension", "vomiting", "swelling"], 1.5, false),
            group(
                "electrolyte disturbance",
                &["hyperkalemia", "elevated electrolytes", "metabolic acidosis"],
                1.0,
                false,
            ),
        ],
        exclusions: &[],
        rationale: "Rising creatinine with reduced urine output is consistent with acute kidney injury.",
        workup: "Repeat creatinine and BUN; urinalysis; urine electrolytes; renal ultrasound",
        red_flags: "Hyperkalemia, fluid overload, uremic symptoms",
    },
];

struct CompiledPattern {
    pattern: &'static ConditionPattern,
    groups: Vec<Regex>,
    exclusions: Option<Regex>,
}

static COMPILED: LazyLock<Vec<CompiledPattern>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .map(|pattern| CompiledPattern {
            pattern,
            groups: pattern.groups.iter().map(|g| phrase_regex(g.keywords)).collect(),
            exclusions: (!pattern.exclusions.is_empty()).then(|| phrase_regex(pattern.exclusions)),
        })
        .collect()
});

/// A piece of text the matcher can read, plus the chunk id that backs it.
#[derive(Debug, Clone, Copy)]
pub struct MatchSource<'a> {
    pub text: &'a str,
    pub evidence: Option<&'a str>,
}

/// Matching sources in priority order: fact terms first, then context blocks.
pub fn match_sources<'a>(
    terms: &'a [FactTerm],
    blocks: &'a [ContextBlock],
) -> Vec<MatchSource<'a>> {
    terms
        .iter()
        .map(|t| MatchSource {
            text: &t.term,
            evidence: t.evidence.as_deref(),
        })
        .chain(blocks.iter().map(|b| MatchSource {
            text: &b.text,
            evidence: Some(&b.chunk_id),
        }))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedFeature {
    pub label: &'static str,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub name: &'static str,
    pub coverage: f32,
    pub features: Vec<MatchedFeature>,
    pub missing_required: bool,
    pub excluded: bool,
}

impl PatternMatch {
    pub fn confidence(&self, thresholds: &ConfidenceThresholds) -> Option<Confidence> {
        if self.missing_required || self.excluded {
            return None;
        }
        Confidence::from_coverage(self.coverage, thresholds)
    }
}

fn score_compiled(compiled: &CompiledPattern, sources: &[MatchSource<'_>]) -> PatternMatch {
    let pattern = compiled.pattern;
    let mut matched_weight = 0.0;
    let mut features = Vec::new();
    let mut missing_required = false;

    for (group, re) in pattern.groups.iter().zip(&compiled.groups) {
        let mut hit = false;
        let mut evidence = Vec::new();
        for source in sources {
            if find_affirmed(re, source.text).is_none() {
                continue;
            }
            hit = true;
            if let Some(id) = source.evidence {
                if evidence.len() < MAX_IDS_PER_FEATURE && !evidence.iter().any(|e| e == id) {
                    evidence.push(id.to_string());
                }
            }
        }
        if hit {
            matched_weight += group.weight;
            features.push(MatchedFeature {
                label: group.label,
                evidence,
            });
        } else if group.required {
            missing_required = true;
        }
    }

    let excluded = compiled
        .exclusions
        .as_ref()
        .is_some_and(|re| sources.iter().any(|s| find_affirmed(re, s.text).is_some()));
    let total = pattern.total_weight();

    PatternMatch {
        name: pattern.name,
        coverage: if total > 0.0 { matched_weight / total } else { 0.0 },
        features,
        missing_required,
        excluded,
    }
}

/// Score every pattern in the library, in declaration order.
pub fn score_patterns(sources: &[MatchSource<'_>]) -> Vec<PatternMatch> {
    COMPILED.iter().map(|c| score_compiled(c, sources)).collect()
}

fn rationale_for(pattern: &ConditionPattern, features: &[MatchedFeature]) -> String {
    let findings: Vec<String> = features
        .iter()
        .map(|f| {
            if f.evidence.is_empty() {
                f.label.to_string()
            } else {
                format!("{} [evidence: {}]", f.label, f.evidence.join(", "))
            }
        })
        .collect();
    format!("{} Supporting findings: {}.", pattern.rationale, findings.join("; "))
}

/// Ranked candidates for the given facts and context, at most `max_diagnoses`.
///
/// Falls back to a single low-confidence undifferentiated candidate when no pattern
/// reaches the lowest band.
pub fn generate_differential(
    facts: &ExtractedFacts,
    blocks: &[ContextBlock],
    thresholds: &ConfidenceThresholds,
    max_diagnoses: usize,
) -> Vec<DiagnosisCandidate> {
    let terms = facts.match_terms();
    let sources = match_sources(&terms, blocks);

    let mut scored: Vec<(DiagnosisCandidate, f32)> = COMPILED
        .iter()
        .filter_map(|compiled| {
            let m = score_compiled(compiled, &sources);
            let confidence = m.confidence(thresholds)?;
            let pattern = compiled.pattern;

            let mut seen = HashSet::new();
            let evidence: Vec<String> = m
                .features
                .iter()
                .flat_map(|f| f.evidence.iter())
                .filter(|id| seen.insert(id.as_str()))
                .take(MAX_EVIDENCE)
                .cloned()
                .collect();

            let candidate = DiagnosisCandidate {
                diagnosis: pattern.name.to_string(),
                confidence,
                rationale: rationale_for(pattern, &m.features),
                evidence,
                workup: Some(pattern.workup.to_string()),
                red_flags: Some(pattern.red_flags.to_string()),
                score: Some(m.coverage),
                matched_features: m.features.iter().map(|f| f.label.to_string()).collect(),
            };
            Some((candidate, m.coverage))
        })
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut candidates: Vec<DiagnosisCandidate> =
        scored.into_iter().map(|(c, _)| c).take(max_diagnoses.max(1)).collect();
    if candidates.is_empty() {
        candidates.push(DiagnosisCandidate::undifferentiated());
    }
    candidates
}

/// The pattern library in the shape the MCP API publishes.
pub fn pattern_library_info() -> Vec<ConditionPatternInfo> {
    PATTERNS
        .iter()
        .map(|p| ConditionPatternInfo {
            name: p.name.to_string(),
            groups: p
                .groups
                .iter()
                .map(|g| KeywordGroupInfo {
                    label: g.label.to_string(),
                    keywords: g.keywords.iter().map(|k| (*k).to_string()).collect(),
                    weight: g.weight,
                    required: g.required,
                })
                .collect(),
            exclusions: p.exclusions.iter().map(|k| (*k).to_string()).collect(),
            workup: p.workup.to_string(),
            red_flags: p.red_flags.to_string(),
        })
        .collect()
}
