/// Structured clinical facts and the deterministic Step-1 extractor.
///
/// The extractor only ever sees retrieved context blocks. Every fact it emits carries the
/// id of the chunk it was found in. Missing data is simply absent; extraction never fails.
use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::prompt::ContextBlock;
use crate::section::{SectionKind, strip_header};
use crate::text::{affirmed_matches, clause_around, find_affirmed, phrase_regex, truncate_chars};

const DETAIL_MAX_CHARS: usize = 160;
const ASSESSMENT_MAX_CHARS: usize = 240;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedFacts {
    #[serde(default)]
    pub demographics: Demographics,
    #[serde(default)]
    pub symptoms: Vec<Finding>,
    #[serde(default)]
    pub vitals: Vitals,
    #[serde(default)]
    pub exam_findings: Vec<Finding>,
    #[serde(default)]
    pub labs: Vec<LabResult>,
    #[serde(default)]
    pub imaging: Vec<Finding>,
    /// The clinician's own impression, if the note states one.
    #[serde(default)]
    pub stated_assessment: Option<Sourced<String>>,
}

/// A value plus the chunk id it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct Sourced<T> {
    pub value: T,
    pub evidence: Option<String>,
}

impl<T> Sourced<T> {
    pub fn new(value: T, evidence: impl Into<String>) -> Self {
        Self {
            value,
            evidence: Some(evidence.into()),
        }
    }
}

/// Accepts both `{"value": v, "evidence": id}` and a bare `v`.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sourced<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Full {
                value: T,
                #[serde(default)]
                evidence: Option<String>,
            },
            Bare(T),
        }
        Ok(match Repr::<T>::deserialize(deserializer)? {
            Repr::Full { value, evidence } => Self { value, evidence },
            Repr::Bare(value) => Self {
                value,
                evidence: None,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl<'de> Deserialize<'de> for Sex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" | "m" | "man" => Ok(Self::Male),
            "female" | "f" | "woman" => Ok(Self::Female),
            other => Err(serde::de::Error::custom(format!("unknown sex {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Demographics {
    #[serde(default)]
    pub age: Option<Sourced<u32>>,
    #[serde(default)]
    pub sex: Option<Sourced<Sex>>,
}

/// A named finding from one of the fixed taxonomies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    pub name: String,
    /// The clause the finding was read from.
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Measurement {
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BloodPressure {
    pub systolic: f64,
    pub diastolic: f64,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Vitals {
    #[serde(default)]
    pub temperature: Option<Measurement>,
    #[serde(default)]
    pub heart_rate: Option<Measurement>,
    #[serde(default)]
    pub blood_pressure: Option<BloodPressure>,
    #[serde(default)]
    pub respiratory_rate: Option<Measurement>,
    #[serde(default)]
    pub oxygen_saturation: Option<Measurement>,
}

impl Vitals {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.heart_rate.is_none()
            && self.blood_pressure.is_none()
            && self.respiratory_rate.is_none()
            && self.oxygen_saturation.is_none()
    }

    /// Named abnormalities implied by the recorded values, with their evidence ids.
    pub fn abnormal_findings(&self) -> Vec<(&'static str, Option<&str>)> {
        let mut out = Vec::new();
        if let Some(t) = &self.temperature {
            let fahrenheit = if t.unit.eq_ignore_ascii_case("c") || (t.unit.is_empty() && t.value < 45.0) {
                t.value * 9.0 / 5.0 + 32.0
            } else {
                t.value
            };
            if fahrenheit >= 100.4 {
                out.push(("fever", t.evidence.as_deref()));
            } else if fahrenheit < 95.0 {
                out.push(("hypothermia", t.evidence.as_deref()));
            }
        }
        if let Some(hr) = &self.heart_rate {
            if hr.value > 100.0 {
                out.push(("tachycardia", hr.evidence.as_deref()));
            } else if hr.value < 50.0 {
                out.push(("bradycardia", hr.evidence.as_deref()));
            }
        }
        if let Some(bp) = &self.blood_pressure {
            let evidence = bp.evidence.as_deref();
            if bp.systolic < 90.0 {
                out.push(("hypotension", evidence));
            } else if bp.systolic >= 180.0 || bp.diastolic >= 120.0 {
                out.push(("severe hypertension", evidence));
                out.push(("hypertension", evidence));
            } else if bp.systolic >= 140.0 || bp.diastolic >= 90.0 {
                out.push(("hypertension", evidence));
            }
        }
        if let Some(rr) = &self.respiratory_rate {
            if rr.value > 20.0 {
                out.push(("tachypnea", rr.evidence.as_deref()));
            }
        }
        if let Some(o2) = &self.oxygen_saturation {
            if o2.value < 92.0 {
                out.push(("hypoxia", o2.evidence.as_deref()));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LabFlag {
    Elevated,
    Decreased,
    Normal,
}

impl LabFlag {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "elevated" | "high" | "increased" | "raised" | "h" | "↑" => Some(Self::Elevated),
            "decreased" | "low" | "reduced" | "l" | "↓" => Some(Self::Decreased),
            "normal" | "wnl" | "within normal limits" => Some(Self::Normal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Elevated => "elevated",
            Self::Decreased => "decreased",
            Self::Normal => "normal",
        }
    }
}

impl<'de> Deserialize<'de> for LabFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown lab flag {raw:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LabResult {
    pub name: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub flag: Option<LabFlag>,
    #[serde(default)]
    pub evidence: Option<String>,
}

/// A phrase derived from the facts, used for differential matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactTerm {
    pub term: String,
    pub evidence: Option<String>,
}

impl ExtractedFacts {
    pub fn is_empty(&self) -> bool {
        self.demographics.age.is_none()
            && self.demographics.sex.is_none()
            && self.symptoms.is_empty()
            && self.vitals.is_empty()
            && self.exam_findings.is_empty()
            && self.labs.is_empty()
            && self.imaging.is_empty()
            && self.stated_assessment.is_none()
    }

    /// Every evidence id referenced by a fact, in schema order, without duplicates.
    pub fn evidence_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |id: Option<&String>| {
            if let Some(id) = id {
                if seen.insert(id.clone()) {
                    out.push(id.clone());
                }
            }
        };
        push(self.demographics.age.as_ref().and_then(|a| a.evidence.as_ref()));
        push(self.demographics.sex.as_ref().and_then(|s| s.evidence.as_ref()));
        for f in &self.symptoms {
            push(f.evidence.as_ref());
        }
        let v = &self.vitals;
        for m in [&v.temperature, &v.heart_rate, &v.respiratory_rate, &v.oxygen_saturation]
            .into_iter()
            .flatten()
        {
            push(m.evidence.as_ref());
        }
        push(v.blood_pressure.as_ref().and_then(|b| b.evidence.as_ref()));
        for f in &self.exam_findings {
            push(f.evidence.as_ref());
        }
        for l in &self.labs {
            push(l.evidence.as_ref());
        }
        for f in &self.imaging {
            push(f.evidence.as_ref());
        }
        push(self.stated_assessment.as_ref().and_then(|a| a.evidence.as_ref()));
        out
    }

    /// Clears evidence ids that `is_known` rejects.
    pub fn retain_known_evidence(&mut self, is_known: impl Fn(&str) -> bool) {
        let scrub = |e: &mut Option<String>| {
            if e.as_deref().is_some_and(|id| !is_known(id)) {
                *e = None;
            }
        };
        if let Some(a) = &mut self.demographics.age {
            scrub(&mut a.evidence);
        }
        if let Some(s) = &mut self.demographics.sex {
            scrub(&mut s.evidence);
        }
        for f in self
            .symptoms
            .iter_mut()
            .chain(self.exam_findings.iter_mut())
            .chain(self.imaging.iter_mut())
        {
            scrub(&mut f.evidence);
        }
        let v = &mut self.vitals;
        for m in [
            &mut v.temperature,
            &mut v.heart_rate,
            &mut v.respiratory_rate,
            &mut v.oxygen_saturation,
        ]
        .into_iter()
        .flatten()
        {
            scrub(&mut m.evidence);
        }
        if let Some(bp) = &mut v.blood_pressure {
            scrub(&mut bp.evidence);
        }
        for l in &mut self.labs {
            scrub(&mut l.evidence);
        }
        if let Some(a) = &mut self.stated_assessment {
            scrub(&mut a.evidence);
        }
    }

    /// Phrases describing the findings, for differential matching.
    ///
    /// Lab flags expand into clinical terms ("elevated wbc", "leukocytosis"), and abnormal
    /// vitals contribute their names ("fever", "tachycardia").
    pub fn match_terms(&self) -> Vec<FactTerm> {
        let mut terms = Vec::new();
        let mut push = |term: String, evidence: &Option<String>| {
            terms.push(FactTerm {
                term: term.to_lowercase(),
                evidence: evidence.clone(),
            });
        };
        for f in self.symptoms.iter().chain(&self.exam_findings).chain(&self.imaging) {
            push(f.name.clone(), &f.evidence);
            if let Some(detail) = &f.detail {
                push(detail.clone(), &f.evidence);
            }
        }
        for lab in &self.labs {
            push(lab.name.clone(), &lab.evidence);
            if let Some(flag) = lab.flag {
                if flag != LabFlag::Normal {
                    push(format!("{} {}", flag.as_str(), lab.name), &lab.evidence);
                }
                if let Some(synonym) = lab_flag_synonym(&lab.name, flag) {
                    push(synonym.to_string(), &lab.evidence);
                }
            }
        }
        for (name, evidence) in self.vitals.abnormal_findings() {
            push(name.to_string(), &evidence.map(str::to_string));
        }
        terms
    }

    /// Keywords summarising the findings, used as the second retrieval query.
    pub fn query_terms(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |t: String| {
            let t = t.to_lowercase();
            if seen.insert(t.clone()) {
                out.push(t);
            }
        };
        for f in self.symptoms.iter().chain(&self.exam_findings) {
            push(f.name.clone());
        }
        for (name, _) in self.vitals.abnormal_findings() {
            push(name.to_string());
        }
        for lab in &self.labs {
            match lab.flag {
                Some(flag) if flag != LabFlag::Normal => push(format!("{} {}", flag.as_str(), lab.name)),
                _ => push(lab.name.clone()),
            }
        }
        for f in &self.imaging {
            push(f.name.clone());
        }
        out
    }
}

fn lab_flag_synonym(name: &str, flag: LabFlag) -> Option<&'static str> {
    let name = name.to_ascii_lowercase();
    match (name.as_str(), flag) {
        ("wbc", LabFlag::Elevated) => Some("leukocytosis"),
        ("wbc", LabFlag::Decreased) => Some("leukopenia"),
        ("neutrophils", LabFlag::Elevated) => Some("neutrophilia"),
        ("hemoglobin", LabFlag::Decreased) => Some("anemia"),
        ("platelets", LabFlag::Decreased) => Some("thrombocytopenia"),
        ("glucose", LabFlag::Elevated) => Some("hyperglycemia"),
        ("glucose", LabFlag::Decreased) => Some("hypoglycemia"),
        ("troponin", LabFlag::Elevated) => Some("troponin positive"),
        ("creatinine", LabFlag::Elevated) => Some("acute kidney injury"),
        _ => None,
    }
}

const SYMPTOM_TABLE: &[(&str, &[&str])] = &[
    ("pain", &["pain", "ache", "aches", "discomfort"]),
    ("fever", &["fever", "fevers", "febrile", "pyrexia"]),
    ("headache", &["headache", "headaches", "cephalgia"]),
    ("nausea", &["nausea", "nauseous", "vomiting", "emesis"]),
    ("shortness of breath", &["shortness of breath", "dyspnea", "sob", "breathless", "breathlessness"]),
    ("cough", &["cough", "coughing"]),
    ("fatigue", &["fatigue", "tired", "tiredness", "weakness", "malaise"]),
    ("dizziness", &["dizziness", "dizzy", "vertigo", "lightheaded", "light-headed"]),
    ("chest pain", &["chest pain", "chest discomfort", "chest tightness", "chest pressure"]),
    ("abdominal pain", &["abdominal pain", "stomach pain", "belly pain"]),
    ("neck stiffness", &["neck stiffness", "nuchal rigidity", "stiff neck"]),
    ("rash", &["rash", "skin lesion", "skin lesions"]),
    ("swelling", &["swelling", "edema"]),
    ("confusion", &["confusion", "confused", "altered mental status", "altered mentation", "disoriented"]),
];

const EXAM_TABLE: &[(&str, &[&str])] = &[
    ("abnormal breath sounds", &["crackles", "rales", "wheezing", "wheezes", "rhonchi"]),
    ("cardiac findings", &["murmur", "murmurs", "gallop", "friction rub"]),
    (
        "meningeal signs",
        &["nuchal rigidity", "kernig", "kernigs", "brudzinski", "brudzinskis", "meningeal signs", "meningismus"],
    ),
    (
        "neurological findings",
        &[
            "focal deficit",
            "focal deficits",
            "focal neurological deficit",
            "focal neurological deficits",
            "hemiparesis",
            "facial droop",
            "numbness",
            "paralysis",
        ],
    ),
    ("skin findings", &["rash", "lesion", "lesions", "erythema", "cyanosis", "jaundice", "petechiae"]),
    ("abdominal findings", &["tenderness", "guarding", "rebound", "distension", "distention"]),
];

const LAB_TABLE: &[(&str, &[&str])] = &[
    ("WBC", &["wbc", "white blood cell", "white blood cells", "white count", "leukocyte", "leukocytes"]),
    ("Hemoglobin", &["hemoglobin", "hgb", "hb"]),
    ("Platelets", &["platelet", "platelets", "plt"]),
    ("Neutrophils", &["neutrophil", "neutrophils", "pmn", "pmns"]),
    ("Glucose", &["glucose", "blood sugar"]),
    ("Creatinine", &["creatinine", "cr"]),
    ("Troponin", &["troponin", "trop"]),
    ("BUN", &["bun", "blood urea nitrogen"]),
    ("Electrolytes", &["sodium", "potassium", "electrolytes"]),
    ("Liver enzymes", &["alt", "ast", "liver enzymes", "transaminases", "lfts"]),
    ("CRP", &["crp", "c-reactive protein"]),
    ("ESR", &["esr", "sed rate"]),
];

const IMAGING_TABLE: &[(&str, &[&str])] = &[
    ("X-ray", &["x-ray", "xray", "cxr", "radiograph"]),
    ("CT", &["ct", "cat scan", "computed tomography"]),
    ("MRI", &["mri", "magnetic resonance"]),
    ("Ultrasound", &["ultrasound", "sonogram", "doppler"]),
    ("Echocardiogram", &["echo", "echocardiogram", "tte"]),
    ("ECG", &["ecg", "ekg", "electrocardiogram"]),
];

const ASSESSMENT_CUES: &[&str] = &[
    "concerning for",
    "consistent with",
    "suspicious for",
    "suggestive of",
    "likely",
    "impression",
    "diagnosis",
    "rule out",
    "meningitis",
    "pneumonia",
    "sepsis",
    "myocardial infarction",
    "stroke",
    "appendicitis",
    "cholecystitis",
    "pancreatitis",
    "heart failure",
];

fn compile(table: &'static [(&'static str, &'static [&'static str])]) -> Vec<(&'static str, Regex)> {
    table.iter().map(|(name, phrases)| (*name, phrase_regex(phrases))).collect()
}

static SYMPTOMS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| compile(SYMPTOM_TABLE));
static EXAM: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| compile(EXAM_TABLE));
static LABS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| compile(LAB_TABLE));
static IMAGING: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| compile(IMAGING_TABLE));
static ASSESSMENT: LazyLock<Regex> = LazyLock::new(|| phrase_regex(ASSESSMENT_CUES));

static AGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(\d{1,3})[- ]years?[- ]old\b",
        r"(?i)\bage[:\s]+(\d{1,3})\b",
        r"(?i)\b(\d{1,3})[- ]?yo\b",
        r"(?i)\b(\d{1,3})\s*y/o\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static MALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:male|man|gentleman|boy)\b").expect("valid regex"));
static FEMALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:female|woman|lady|girl)\b").expect("valid regex"));

static TEMP_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:temp(?:erature)?|tmax)\s*[:=]?\s*(?:of\s+)?(\d{2,3}(?:\.\d+)?)\s*°?\s*([FC])?\b",
        r"(?i)(\d{2,3}(?:\.\d+)?)\s*°\s*([FC])\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});
static HR_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:hr|heart rate|pulse)\s*[:=]?\s*(?:of\s+)?(\d{2,3})\b",
        r"(?i)\b(\d{2,3})\s*bpm\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});
static BP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:bp|blood pressure)\s*[:=]?\s*(?:of\s+)?(\d{2,3})\s*/\s*(\d{2,3})\b")
        .expect("valid regex")
});
static RR_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:rr|respiratory rate|resp rate|respirations)\s*[:=]?\s*(?:of\s+)?(\d{1,2})\b",
        r"(?i)\b(\d{1,2})\s*breaths\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});
static SPO2_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:o2\s*sat(?:uration)?|spo2|sao2|sat(?:uration)?s?|pulse ox(?:imetry)?)\s*[:=]?\s*(?:of\s+)?(\d{2,3})\s*%?",
    )
    .expect("valid regex")
});

static LAB_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[\s:=]*(?:(?:level|count)[\s:=]*)?(?:(?:of|is|was)\s+)?(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)[ \t]*([^\s(),;]+)?",
    )
    .expect("valid regex")
});
static ELEVATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:elevated|high|increased|raised)\b|↑").expect("valid regex")
});
static DECREASED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:low|decreased|reduced|depressed)\b|↓").expect("valid regex"));
static NORMAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:normal|wnl|within normal limits|unremarkable)\b").expect("valid regex")
});

/// Deterministic extraction over retrieved context blocks, in block order.
pub fn extract_facts(blocks: &[ContextBlock]) -> ExtractedFacts {
    ExtractedFacts {
        demographics: Demographics {
            age: extract_age(blocks),
            sex: extract_sex(blocks),
        },
        symptoms: extract_findings(blocks, &SYMPTOMS, false),
        vitals: extract_vitals(blocks),
        exam_findings: extract_findings(blocks, &EXAM, true),
        labs: extract_labs(blocks),
        imaging: extract_findings(blocks, &IMAGING, true),
        stated_assessment: extract_assessment(blocks),
    }
}

fn extract_age(blocks: &[ContextBlock]) -> Option<Sourced<u32>> {
    AGE_PATTERNS.iter().find_map(|re| {
        blocks.iter().find_map(|b| {
            let age = re.captures(&b.text)?.get(1)?.as_str().parse::<u32>().ok()?;
            (age <= 130).then(|| Sourced::new(age, &b.chunk_id))
        })
    })
}

fn extract_sex(blocks: &[ContextBlock]) -> Option<Sourced<Sex>> {
    blocks.iter().find_map(|b| {
        let male = MALE_RE.find(&b.text).map(|m| m.start());
        let female = FEMALE_RE.find(&b.text).map(|m| m.start());
        let sex = match (male, female) {
            (Some(m), Some(f)) if f < m => Sex::Female,
            (Some(_), _) => Sex::Male,
            (None, Some(_)) => Sex::Female,
            (None, None) => return None,
        };
        Some(Sourced::new(sex, &b.chunk_id))
    })
}

/// True when another entry of `table` matches a longer span that contains `m`, so that
/// "chest pain" does not also count as "pain".
fn covered_by_longer_term(table: &[(&'static str, Regex)], name: &str, text: &str, m: &regex::Match<'_>) -> bool {
    table.iter().filter(|(other, _)| *other != name).any(|(_, re)| {
        re.find_iter(text)
            .any(|o| o.start() <= m.start() && o.end() >= m.end() && o.len() > m.len())
    })
}

fn extract_findings(blocks: &[ContextBlock], table: &[(&'static str, Regex)], with_detail: bool) -> Vec<Finding> {
    table
        .iter()
        .filter_map(|(name, re)| {
            blocks.iter().find_map(|b| {
                let m = affirmed_matches(re, &b.text).find(|m| !covered_by_longer_term(table, name, &b.text, m))?;
                Some(Finding {
                    name: (*name).to_string(),
                    detail: with_detail.then(|| clause_around(&b.text, m.start(), DETAIL_MAX_CHARS)),
                    evidence: Some(b.chunk_id.clone()),
                })
            })
        })
        .collect()
}

/// First block matching any of `res`, tried in pattern priority order.
fn first_capture<'b>(
    blocks: &'b [ContextBlock],
    res: &[Regex],
) -> Option<(regex::Captures<'b>, &'b ContextBlock)> {
    res.iter()
        .find_map(|re| blocks.iter().find_map(|b| re.captures(&b.text).map(|caps| (caps, b))))
}

fn measurement(blocks: &[ContextBlock], res: &[Regex], unit: &str, max: f64) -> Option<Measurement> {
    let (caps, block) = first_capture(blocks, res)?;
    let value = caps.get(1)?.as_str().parse::<f64>().ok()?;
    (value <= max).then(|| Measurement {
        value,
        unit: unit.to_string(),
        evidence: Some(block.chunk_id.clone()),
    })
}

fn extract_vitals(blocks: &[ContextBlock]) -> Vitals {
    let temperature = first_capture(blocks, &TEMP_RES).and_then(|(caps, block)| {
        let value = caps.get(1)?.as_str().parse::<f64>().ok()?;
        let unit = match caps.get(2) {
            Some(u) => u.as_str().to_ascii_uppercase(),
            None if value > 45.0 => "F".to_string(),
            None => "C".to_string(),
        };
        Some(Measurement {
            value,
            unit,
            evidence: Some(block.chunk_id.clone()),
        })
    });

    let blood_pressure = blocks.iter().find_map(|b| {
        let caps = BP_RE.captures(&b.text)?;
        Some(BloodPressure {
            systolic: caps.get(1)?.as_str().parse().ok()?,
            diastolic: caps.get(2)?.as_str().parse().ok()?,
            evidence: Some(b.chunk_id.clone()),
        })
    });

    Vitals {
        temperature,
        heart_rate: measurement(blocks, &HR_RES, "bpm", 300.0),
        blood_pressure,
        respiratory_rate: measurement(blocks, &RR_RES, "breaths/min", 80.0),
        oxygen_saturation: measurement(blocks, std::slice::from_ref(&*SPO2_RE), "%", 100.0),
    }
}

fn extract_labs(blocks: &[ContextBlock]) -> Vec<LabResult> {
    LABS.iter()
        .filter_map(|(name, re)| {
            blocks.iter().find_map(|b| {
                let m = find_affirmed(re, &b.text)?;
                let text = b.text.as_str();
                let line_end = text[m.end()..].find('\n').map_or(text.len(), |i| m.end() + i);
                let (value, unit) = lab_value(&text[m.end()..line_end]);
                let segment = lab_segment(text, m.start(), m.end(), line_end);
                Some(LabResult {
                    name: (*name).to_string(),
                    value,
                    unit,
                    flag: lab_flag(segment),
                    evidence: Some(b.chunk_id.clone()),
                })
            })
        })
        .collect()
}

fn lab_value(rest: &str) -> (Option<f64>, Option<String>) {
    let Some(caps) = LAB_VALUE_RE.captures(rest) else {
        return (None, None);
    };
    let value = caps
        .get(1)
        .and_then(|v| v.as_str().replace(',', "").parse::<f64>().ok());
    let unit = caps
        .get(2)
        .map(|u| u.as_str().to_string())
        .filter(|u| looks_like_unit(u));
    (value, unit)
}

fn looks_like_unit(s: &str) -> bool {
    if LabFlag::parse(s).is_some() {
        return false;
    }
    !s.chars().all(char::is_alphabetic) || s.chars().count() <= 4
}

/// The comma- or semicolon-delimited list item around a lab mention, within its line.
fn lab_segment(text: &str, start: usize, end: usize, line_end: usize) -> &str {
    let line_start = text[..start].rfind('\n').map_or(0, |i| i + 1);
    let seg_start = ["; ", ", "]
        .iter()
        .filter_map(|sep| text[line_start..start].rfind(sep).map(|i| line_start + i + sep.len()))
        .max()
        .unwrap_or(line_start);
    let seg_end = ["; ", ", "]
        .iter()
        .filter_map(|sep| text[end..line_end].find(sep).map(|i| end + i))
        .min()
        .unwrap_or(line_end);
    &text[seg_start..seg_end]
}

fn lab_flag(segment: &str) -> Option<LabFlag> {
    if ELEVATED_RE.is_match(segment) {
        Some(LabFlag::Elevated)
    } else if DECREASED_RE.is_match(segment) {
        Some(LabFlag::Decreased)
    } else if NORMAL_RE.is_match(segment) {
        Some(LabFlag::Normal)
    } else {
        None
    }
}

fn extract_assessment(blocks: &[ContextBlock]) -> Option<Sourced<String>> {
    let from_section = blocks.iter().find_map(|b| {
        let kind = SectionKind::from_code(&b.section)?;
        if !matches!(kind, SectionKind::Assessment | SectionKind::AssessmentAndPlan) {
            return None;
        }
        let body = strip_header(&b.text);
        let sentence = clause_around(body, 0, ASSESSMENT_MAX_CHARS);
        (!sentence.is_empty()).then(|| Sourced::new(sentence, &b.chunk_id))
    });
    from_section.or_else(|| {
        blocks.iter().find_map(|b| {
            let m = find_affirmed(&ASSESSMENT, &b.text)?;
            let sentence = clause_around(&b.text, m.start(), ASSESSMENT_MAX_CHARS);
            let sentence = truncate_chars(&sentence, ASSESSMENT_MAX_CHARS).to_string();
            (!sentence.is_empty()).then(|| Sourced::new(sentence, &b.chunk_id))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: &str, section: &str, text: &str) -> ContextBlock {
        ContextBlock {
            chunk_id: id.to_string(),
            section: section.to_string(),
            text: text.to_string(),
        }
    }

    fn meningitis_blocks() -> Vec<ContextBlock> {
        vec![
            block(
                "1_HPI_0_aaaaaaaa",
                "HPI",
                "HISTORY OF PRESENT ILLNESS:\nPatient is a 35-year-old male with fever (up to 102.5°F), \
severe headache, and neck stiffness. He reports photophobia and nausea. Denies recent head trauma.",
            ),
            block(
                "1_EXAM_0_bbbbbbbb",
                "EXAM",
                "PHYSICAL EXAMINATION:\n- Vitals: Temp 101.8°F, HR 110 bpm, BP 128/82 mmHg, RR 18, O2 sat 98% on room air\n\
- Neck: Positive nuchal rigidity, Kernig's and Brudzinski's signs positive\n\
- Neurological: Alert and oriented x3, no focal neurological deficits\n- Skin: No rash observed",
            ),
            block(
                "1_LABS_0_cccccccc",
                "LABS",
                "LABORATORY:\n- WBC: 15,200/μL (elevated)\n- Neutrophils: 82% (elevated)\n- CRP: 45 mg/L (elevated)",
            ),
            block(
                "1_ASSESSMENT_0_dddddddd",
                "ASSESSMENT",
                "ASSESSMENT:\nClinical presentation highly concerning for bacterial meningitis given fever.",
            ),
        ]
    }

    fn names(findings: &[Finding]) -> Vec<&str> {
        findings.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn negated_history_does_not_hide_later_findings() {
        let facts = extract_facts(&[block("1_HPI_0_x", "HPI", "HIV negative, presents with fever and cough")]);
        assert_eq!(names(&facts.symptoms), vec!["fever", "cough"]);

        let facts = extract_facts(&[block(
            "1_HPI_0_y",
            "HPI",
            "No recent travel, now with fever and neck stiffness",
        )]);
        assert_eq!(names(&facts.symptoms), vec!["fever", "neck stiffness"]);
    }

    #[test]
    fn specific_pain_is_not_counted_twice() {
        let facts = extract_facts(&[block(
            "1_HPI_0_z",
            "HPI",
            "Crushing chest pain and abdominal pain since this morning",
        )]);
        assert_eq!(names(&facts.symptoms), vec!["chest pain", "abdominal pain"]);

        let facts = extract_facts(&[block("1_HPI_0_w", "HPI", "Chest pain at rest and back pain")]);
        assert_eq!(names(&facts.symptoms), vec!["pain", "chest pain"]);
    }

    #[test]
    fn extracts_demographics() {
        let facts = extract_facts(&meningitis_blocks());
        let age = facts.demographics.age.unwrap();
        assert_eq!(age.value, 35);
        assert_eq!(age.evidence.as_deref(), Some("1_HPI_0_aaaaaaaa"));
        assert_eq!(facts.demographics.sex.unwrap().value, Sex::Male);
    }

    #[test]
    fn alternative_age_formats() {
        for text in ["age: 61", "61 yo woman", "61 y/o F", "61-year-old"] {
            let facts = extract_facts(&[block("1_GENERAL_0_x", "GENERAL", text)]);
            assert_eq!(facts.demographics.age.map(|a| a.value), Some(61), "{text}");
        }
        let facts = extract_facts(&[block("1_GENERAL_0_x", "GENERAL", "61 yo woman")]);
        assert_eq!(facts.demographics.sex.map(|s| s.value), Some(Sex::Female));
    }

    #[test]
    fn symptoms_follow_taxonomy_order_with_evidence() {
        let facts = extract_facts(&meningitis_blocks());
        assert_eq!(names(&facts.symptoms), vec!["fever", "headache", "nausea", "neck stiffness"]);
        assert!(
            facts
                .symptoms
                .iter()
                .all(|s| s.evidence.as_deref() == Some("1_HPI_0_aaaaaaaa"))
        );
    }

    #[test]
    fn headache_does_not_count_as_pain() {
        let facts = extract_facts(&[block("1_CC_0_x", "CC", "Severe headache")]);
        assert_eq!(names(&facts.symptoms), vec!["headache"]);
    }

    #[test]
    fn negated_findings_are_skipped() {
        let facts = extract_facts(&meningitis_blocks());
        let exam = names(&facts.exam_findings);
        assert_eq!(exam, vec!["meningeal signs"]);
        assert!(!names(&facts.symptoms).contains(&"rash"));
    }

    #[test]
    fn vitals_prefer_labelled_values() {
        let facts = extract_facts(&meningitis_blocks());
        let v = &facts.vitals;
        let temp = v.temperature.as_ref().unwrap();
        assert_eq!(temp.value, 101.8);
        assert_eq!(temp.unit, "F");
        assert_eq!(temp.evidence.as_deref(), Some("1_EXAM_0_bbbbbbbb"));
        assert_eq!(v.heart_rate.as_ref().unwrap().value, 110.0);
        let bp = v.blood_pressure.as_ref().unwrap();
        assert_eq!((bp.systolic, bp.diastolic), (128.0, 82.0));
        assert_eq!(v.respiratory_rate.as_ref().unwrap().value, 18.0);
        assert_eq!(v.oxygen_saturation.as_ref().unwrap().value, 98.0);

        let abnormal: Vec<&str> = v.abnormal_findings().into_iter().map(|(n, _)| n).collect();
        assert_eq!(abnormal, vec!["fever", "tachycardia"]);
    }

    #[test]
    fn labs_carry_value_unit_and_flag() {
        let facts = extract_facts(&meningitis_blocks());
        let wbc = &facts.labs[0];
        assert_eq!(wbc.name, "WBC");
        assert_eq!(wbc.value, Some(15200.0));
        assert_eq!(wbc.unit.as_deref(), Some("/μL"));
        assert_eq!(wbc.flag, Some(LabFlag::Elevated));
        let names: Vec<&str> = facts.labs.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["WBC", "Neutrophils", "CRP"]);
        let crp = &facts.labs[2];
        assert_eq!(crp.unit.as_deref(), Some("mg/L"));
    }

    #[test]
    fn lab_flags_are_scoped_to_their_item() {
        let facts = extract_facts(&[block("1_LABS_0_x", "LABS", "Hgb 9.1 low, platelets 250 normal")]);
        assert_eq!(facts.labs[0].name, "Hemoglobin");
        assert_eq!(facts.labs[0].flag, Some(LabFlag::Decreased));
        assert_eq!(facts.labs[1].name, "Platelets");
        assert_eq!(facts.labs[1].flag, Some(LabFlag::Normal));
    }

    #[test]
    fn stated_assessment_comes_from_assessment_section() {
        let facts = extract_facts(&meningitis_blocks());
        let a = facts.stated_assessment.unwrap();
        assert!(a.value.starts_with("Clinical presentation highly concerning"));
        assert_eq!(a.evidence.as_deref(), Some("1_ASSESSMENT_0_dddddddd"));
    }

    #[test]
    fn empty_context_yields_empty_facts() {
        let facts = extract_facts(&[]);
        assert!(facts.is_empty());
        assert!(facts.evidence_ids().is_empty());
    }

    #[test]
    fn match_terms_expand_lab_flags_and_vitals() {
        let facts = extract_facts(&meningitis_blocks());
        let terms: Vec<String> = facts.match_terms().into_iter().map(|t| t.term).collect();
        assert!(terms.contains(&"leukocytosis".to_string()));
        assert!(terms.contains(&"elevated wbc".to_string()));
        assert!(terms.contains(&"tachycardia".to_string()));
        assert!(terms.contains(&"meningeal signs".to_string()));
    }

    #[test]
    fn query_terms_are_unique() {
        let facts = extract_facts(&meningitis_blocks());
        let terms = facts.query_terms();
        let unique: HashSet<&String> = terms.iter().collect();
        assert_eq!(unique.len(), terms.len());
        assert!(terms.contains(&"fever".to_string()));
        assert!(terms.contains(&"elevated wbc".to_string()));
    }

    #[test]
    fn lenient_json_forms_deserialize() {
        let json = r#"{
            "demographics": {"age": 40, "sex": "F"},
            "labs": [{"name": "Troponin", "flag": "HIGH"}]
        }"#;
        let facts: ExtractedFacts = serde_json::from_str(json).unwrap();
        assert_eq!(facts.demographics.age.unwrap().value, 40);
        assert_eq!(facts.demographics.sex.unwrap().value, Sex::Female);
        assert_eq!(facts.labs[0].flag, Some(LabFlag::Elevated));
        assert!(facts.symptoms.is_empty());
    }

    #[test]
    fn unknown_evidence_is_scrubbed() {
        let mut facts = extract_facts(&meningitis_blocks());
        facts.retain_known_evidence(|id| id == "1_LABS_0_cccccccc");
        assert_eq!(facts.evidence_ids(), vec!["1_LABS_0_cccccccc".to_string()]);
    }
}
