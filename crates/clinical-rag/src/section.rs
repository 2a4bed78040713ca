/// Clinical section detection.
///
/// A header is recognised only at the start of a line (after optional markdown `#`/`*`
/// decoration) and only when it is followed by a colon or by the end of the line. The
/// returned sections tile the input: concatenating their texts reproduces it exactly.
use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum SectionKind {
    #[serde(rename = "GENERAL")]
    General,
    #[serde(rename = "CC")]
    ChiefComplaint,
    #[serde(rename = "HPI")]
    HistoryOfPresentIllness,
    #[serde(rename = "PMH")]
    PastMedicalHistory,
    #[serde(rename = "MEDS")]
    Medications,
    #[serde(rename = "ALLERGIES")]
    Allergies,
    #[serde(rename = "ROS")]
    ReviewOfSystems,
    #[serde(rename = "EXAM")]
    PhysicalExam,
    #[serde(rename = "LABS")]
    Labs,
    #[serde(rename = "IMAGING")]
    Imaging,
    #[serde(rename = "ASSESSMENT")]
    Assessment,
    #[serde(rename = "PLAN")]
    Plan,
    #[serde(rename = "ASSESSMENT_PLAN")]
    AssessmentAndPlan,
    #[serde(rename = "SOCIAL")]
    SocialHistory,
    #[serde(rename = "FAMILY")]
    FamilyHistory,
    #[serde(rename = "DISCHARGE")]
    DischargeSummary,
}

impl SectionKind {
    pub const ALL: [SectionKind; 16] = [
        Self::General,
        Self::ChiefComplaint,
        Self::HistoryOfPresentIllness,
        Self::PastMedicalHistory,
        Self::Medications,
        Self::Allergies,
        Self::ReviewOfSystems,
        Self::PhysicalExam,
        Self::Labs,
        Self::Imaging,
        Self::Assessment,
        Self::Plan,
        Self::AssessmentAndPlan,
        Self::SocialHistory,
        Self::FamilyHistory,
        Self::DischargeSummary,
    ];

    /// Short upper-snake code used inside chunk ids and prompt context labels.
    pub fn code(self) -> &'static str {
        match self {
            Self::General => "GENERAL",
            Self::ChiefComplaint => "CC",
            Self::HistoryOfPresentIllness => "HPI",
            Self::PastMedicalHistory => "PMH",
            Self::Medications => "MEDS",
            Self::Allergies => "ALLERGIES",
            Self::ReviewOfSystems => "ROS",
            Self::PhysicalExam => "EXAM",
            Self::Labs => "LABS",
            Self::Imaging => "IMAGING",
            Self::Assessment => "ASSESSMENT",
            Self::Plan => "PLAN",
            Self::AssessmentAndPlan => "ASSESSMENT_PLAN",
            Self::SocialHistory => "SOCIAL",
            Self::FamilyHistory => "FAMILY",
            Self::DischargeSummary => "DISCHARGE",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code().eq_ignore_ascii_case(code.trim()))
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::General => "General",
            Self::ChiefComplaint => "Chief Complaint",
            Self::HistoryOfPresentIllness => "History of Present Illness",
            Self::PastMedicalHistory => "Past Medical History",
            Self::Medications => "Medications",
            Self::Allergies => "Allergies",
            Self::ReviewOfSystems => "Review of Systems",
            Self::PhysicalExam => "Physical Exam",
            Self::Labs => "Labs",
            Self::Imaging => "Imaging",
            Self::Assessment => "Assessment",
            Self::Plan => "Plan",
            Self::AssessmentAndPlan => "Assessment and Plan",
            Self::SocialHistory => "Social History",
            Self::FamilyHistory => "Family History",
            Self::DischargeSummary => "Discharge Summary",
        }
    }

    /// Sections whose body is the clinician's own plan.
    pub fn is_plan(self) -> bool {
        matches!(self, Self::Plan | Self::AssessmentAndPlan)
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Recognised header spellings. Matching is case-insensitive.
const HEADER_ALIASES: &[(&str, SectionKind)] = &[
    ("CHIEF COMPLAINT", SectionKind::ChiefComplaint),
    ("CC", SectionKind::ChiefComplaint),
    ("HISTORY OF PRESENT ILLNESS", SectionKind::HistoryOfPresentIllness),
    ("HPI", SectionKind::HistoryOfPresentIllness),
    ("PAST MEDICAL HISTORY", SectionKind::PastMedicalHistory),
    ("MEDICAL HISTORY", SectionKind::PastMedicalHistory),
    ("PMH", SectionKind::PastMedicalHistory),
    ("CURRENT MEDICATIONS", SectionKind::Medications),
    ("MEDICATIONS", SectionKind::Medications),
    ("MEDS", SectionKind::Medications),
    ("ALLERGIES", SectionKind::Allergies),
    ("REVIEW OF SYSTEMS", SectionKind::ReviewOfSystems),
    ("ROS", SectionKind::ReviewOfSystems),
    ("PHYSICAL EXAMINATION", SectionKind::PhysicalExam),
    ("PHYSICAL EXAM", SectionKind::PhysicalExam),
    ("LABORATORY DATA", SectionKind::Labs),
    ("LABORATORY", SectionKind::Labs),
    ("LAB RESULTS", SectionKind::Labs),
    ("LABS", SectionKind::Labs),
    ("IMAGING", SectionKind::Imaging),
    ("RADIOLOGY", SectionKind::Imaging),
    ("ASSESSMENT AND PLAN", SectionKind::AssessmentAndPlan),
    ("A/P", SectionKind::AssessmentAndPlan),
    ("ASSESSMENT", SectionKind::Assessment),
    ("IMPRESSION", SectionKind::Assessment),
    ("PLAN", SectionKind::Plan),
    ("SOCIAL HISTORY", SectionKind::SocialHistory),
    ("FAMILY HISTORY", SectionKind::FamilyHistory),
    ("DISCHARGE SUMMARY", SectionKind::DischargeSummary),
];

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    let mut aliases: Vec<&str> = HEADER_ALIASES.iter().map(|(alias, _)| *alias).collect();
    // Longest first so "ASSESSMENT AND PLAN" wins over "ASSESSMENT".
    aliases.sort_by_key(|a| std::cmp::Reverse(a.len()));
    let alternation = aliases
        .iter()
        .map(|a| {
            a.split(' ')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"[ \t]+")
        })
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r"(?im)^[ \t]*(?:#+[ \t]*)?\**[ \t]*(?P<name>{alternation})[ \t]*(?:\**[ \t]*:[ \t]*\**[ \t]*|\**[ \t]*\r?$)"
    ))
    .expect("valid regex")
});

fn kind_for_header(name: &str) -> Option<SectionKind> {
    let normalized = name.split_whitespace().collect::<Vec<_>>().join(" ");
    HEADER_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(&normalized))
        .map(|(_, kind)| *kind)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Section {
    pub kind: SectionKind,
    /// Header text as written in the note, if the section was introduced by one.
    pub header: Option<String>,
    /// Full section text including its header line.
    pub text: String,
    /// Byte offset of the section inside the note.
    pub start: usize,
    /// Byte offset one past the section's last byte.
    pub end: usize,
    /// Byte offset where the body begins (after the header and its colon).
    pub body_start: usize,
}

impl Section {
    /// Section text without its header.
    pub fn body(&self) -> &str {
        &self.text[self.body_start - self.start..]
    }
}

/// Split a note into sections that cover it exactly.
pub fn split_sections(text: &str) -> Vec<Section> {
    struct Header<'t> {
        kind: SectionKind,
        name: &'t str,
        line_start: usize,
        body_start: usize,
    }

    let headers: Vec<Header<'_>> = HEADER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.name("name")?;
            let kind = kind_for_header(name.as_str())?;
            // A whole-line header ends before the newline; the body starts on the next line.
            Some(Header {
                kind,
                name: name.as_str(),
                line_start: whole.start(),
                body_start: whole.end(),
            })
        })
        .collect();

    let mut sections = Vec::with_capacity(headers.len() + 1);
    let first_start = headers.first().map_or(text.len(), |h| h.line_start);
    if first_start > 0 {
        sections.push(Section {
            kind: SectionKind::General,
            header: None,
            text: text[..first_start].to_string(),
            start: 0,
            end: first_start,
            body_start: 0,
        });
    }

    for (i, header) in headers.iter().enumerate() {
        let end = headers.get(i + 1).map_or(text.len(), |next| next.line_start);
        sections.push(Section {
            kind: header.kind,
            header: Some(header.name.to_string()),
            text: text[header.line_start..end].to_string(),
            start: header.line_start,
            end,
            body_start: header.body_start,
        });
    }
    sections
}

/// Remove a leading section header from `text`, if it starts with one.
pub fn strip_header(text: &str) -> &str {
    match HEADER_RE.find(text) {
        Some(m) if text[..m.start()].trim().is_empty() => text[m.end()..].trim_start(),
        _ => text,
    }
}
