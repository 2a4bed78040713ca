use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;
use crate::citation;
use crate::ddx::DiagnosisCandidate;
use crate::facts::{ExtractedFacts, Finding, LabResult, Measurement, Sex};
use crate::section::Section;

const GENERIC_PLAN: &str = "Further diagnostic workup and treatment as clinically indicated.";

/// Where the plan text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    NoteSection,
    TopCandidateWorkup,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SoapNote {
    pub subjective: String,
    pub objective: String,
    pub assessment: String,
    pub plan: String,
    pub plan_source: PlanSource,
}

impl SoapNote {
    pub fn render(&self) -> String {
        format!(
            "SUBJECTIVE:\n{}\n\nOBJECTIVE:\n{}\n\nASSESSMENT:\n{}\n\nPLAN:\n{}\n",
            self.subjective, self.objective, self.assessment, self.plan
        )
    }
}

fn cite(evidence: Option<&str>) -> String {
    evidence.map(|id| format!(" {}", citation::token(&[id]))).unwrap_or_default()
}

fn cite_all(ids: &[String]) -> String {
    if ids.is_empty() {
        return String::new();
    }
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    format!(" {}", citation::token(&ids))
}

fn number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.0}")
    } else {
        format!("{v}")
    }
}

fn finding_list(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| format!("{}{}", f.name, cite(f.evidence.as_deref())))
        .collect::<Vec<_>>()
        .join(", ")
}

fn measurement(label: &str, m: &Measurement) -> String {
    let value = number(m.value);
    let unit = match m.unit.as_str() {
        "" => String::new(),
        "%" => "%".to_string(),
        "F" | "C" => format!(" °{}", m.unit),
        u => format!(" {u}"),
    };
    format!("{label} {value}{unit}{}", cite(m.evidence.as_deref()))
}

fn lab_line(lab: &LabResult) -> String {
    let mut line = lab.name.clone();
    if let Some(v) = lab.value {
        line.push(' ');
        line.push_str(&number(v));
    }
    if let Some(u) = &lab.unit {
        line.push(' ');
        line.push_str(u);
    }
    if let Some(flag) = lab.flag {
        line.push_str(&format!(" ({})", flag.as_str()));
    }
    line.push_str(&cite(lab.evidence.as_deref()));
    line
}

fn subjective(facts: &ExtractedFacts) -> String {
    let mut lines = Vec::new();
    let demo = &facts.demographics;
    let age = demo.age.as_ref().map(|a| format!("{}-year-old", a.value));
    let sex = demo.sex.as_ref().map(|s| match s.value {
        Sex::Male => "male",
        Sex::Female => "female",
    });
    let evidence = demo
        .age
        .as_ref()
        .and_then(|a| a.evidence.as_deref())
        .or_else(|| demo.sex.as_ref().and_then(|s| s.evidence.as_deref()));
    match (age, sex) {
        (Some(a), Some(s)) => lines.push(format!("Patient: {a} {s}{}", cite(evidence))),
        (Some(a), None) => lines.push(format!("Patient: {a}{}", cite(evidence))),
        (None, Some(s)) => lines.push(format!("Patient: {s}{}", cite(evidence))),
        (None, None) => {}
    }
    if !facts.symptoms.is_empty() {
        lines.push(format!("Reports: {}", finding_list(&facts.symptoms)));
    }
    if lines.is_empty() {
        "No subjective findings documented.".to_string()
    } else {
        lines.join("\n")
    }
}

fn objective(facts: &ExtractedFacts) -> String {
    let mut lines = Vec::new();
    let v = &facts.vitals;
    let mut vitals = Vec::new();
    if let Some(t) = &v.temperature {
        vitals.push(measurement("Temp", t));
    }
    if let Some(hr) = &v.heart_rate {
        vitals.push(measurement("HR", hr));
    }
    if let Some(bp) = &v.blood_pressure {
        vitals.push(format!(
            "BP {}/{} mmHg{}",
            number(bp.systolic),
            number(bp.diastolic),
            cite(bp.evidence.as_deref())
        ));
    }
    if let Some(rr) = &v.respiratory_rate {
        vitals.push(measurement("RR", rr));
    }
    if let Some(o2) = &v.oxygen_saturation {
        vitals.push(measurement("SpO2", o2));
    }
    if !vitals.is_empty() {
        lines.push(format!("Vitals: {}", vitals.join(", ")));
    }
    if !facts.exam_findings.is_empty() {
        lines.push(format!("Exam: {}", finding_list(&facts.exam_findings)));
    }
    if !facts.labs.is_empty() {
        let labs: Vec<String> = facts.labs.iter().map(lab_line).collect();
        lines.push(format!("Labs: {}", labs.join(", ")));
    }
    if !facts.imaging.is_empty() {
        lines.push(format!("Imaging: {}", finding_list(&facts.imaging)));
    }
    if lines.is_empty() {
        "No objective findings documented.".to_string()
    } else {
        lines.join("\n")
    }
}

fn assessment(facts: Option<&ExtractedFacts>, diagnoses: &[DiagnosisCandidate]) -> String {
    let mut lines = Vec::new();
    if let Some(stated) = facts.and_then(|f| f.stated_assessment.as_ref()) {
        lines.push(format!("Clinician impression: {}{}", stated.value, cite(stated.evidence.as_deref())));
    }
    for (i, d) in diagnoses.iter().enumerate() {
        lines.push(format!(
            "{}. {} ({} confidence){}",
            i + 1,
            d.diagnosis,
            d.confidence,
            cite_all(&d.evidence)
        ));
    }
    if lines.is_empty() {
        "Differential diagnosis unavailable.".to_string()
    } else {
        lines.join("\n")
    }
}

fn plan(
    diagnoses: &[DiagnosisCandidate],
    sections: &[Section],
    chunks: &[Chunk],
) -> (String, PlanSource) {
    let plan_sections: Vec<&Section> = sections
        .iter()
        .filter(|s| s.kind.is_plan() && !s.body().trim().is_empty())
        .collect();
    if !plan_sections.is_empty() {
        let text = plan_sections
            .iter()
            .map(|s| {
                let ids: Vec<String> = chunks
                    .iter()
                    .filter(|c| c.start >= s.start && c.end <= s.end)
                    .map(|c| c.id.clone())
                    .collect();
                format!("{}{}", s.body().trim(), cite_all(&ids))
            })
            .collect::<Vec<_>>()
            .join("\n");
        return (text, PlanSource::NoteSection);
    }
    match diagnoses.first().and_then(|d| d.workup.as_deref()) {
        Some(workup) if !workup.trim().is_empty() => {
            let top = &diagnoses[0];
            (
                format!("Workup for {}: {}{}", top.diagnosis, workup.trim(), cite_all(&top.evidence)),
                PlanSource::TopCandidateWorkup,
            )
        }
        _ => (GENERIC_PLAN.to_string(), PlanSource::Generic),
    }
}

/// Deterministic SOAP note from facts, ranked diagnoses and the note's own plan.
pub fn compose_soap(
    facts: Option<&ExtractedFacts>,
    diagnoses: &[DiagnosisCandidate],
    sections: &[Section],
    chunks: &[Chunk],
) -> SoapNote {
    let empty = ExtractedFacts::default();
    let f = facts.unwrap_or(&empty);
    let (plan, plan_source) = plan(diagnoses, sections, chunks);
    SoapNote {
        subjective: subjective(f),
        objective: objective(f),
        assessment: assessment(facts, diagnoses),
        plan,
        plan_source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::chunk_sections;
    use crate::ddx::Confidence;
    use crate::facts::{Demographics, Sourced, Vitals};
    use crate::section::split_sections;

    fn candidate(workup: Option<&str>) -> DiagnosisCandidate {
        DiagnosisCandidate {
            diagnosis: "Sepsis".to_string(),
            confidence: Confidence::Medium,
            rationale: String::new(),
            evidence: vec!["1_HPI_0_aaaaaaaa".to_string()],
            workup: workup.map(str::to_string),
            red_flags: None,
            score: Some(0.8),
            matched_features: Vec::new(),
        }
    }

    fn facts() -> ExtractedFacts {
        ExtractedFacts {
            demographics: Demographics {
                age: Some(Sourced::new(70, "1_HPI_0_aaaaaaaa")),
                sex: Some(Sourced::new(Sex::Female, "1_HPI_0_aaaaaaaa")),
            },
            symptoms: vec![Finding {
                name: "fever".to_string(),
                detail: None,
                evidence: Some("1_HPI_0_aaaaaaaa".to_string()),
            }],
            vitals: Vitals {
                temperature: Some(Measurement {
                    value: 38.9,
                    unit: "C".to_string(),
                    evidence: Some("1_EXAM_0_bbbbbbbb".to_string()),
                }),
                oxygen_saturation: Some(Measurement {
                    value: 91.0,
                    unit: "%".to_string(),
                    evidence: None,
                }),
                ..Vitals::default()
            },
            ..ExtractedFacts::default()
        }
    }

    #[test]
    fn note_plan_is_echoed_verbatim() {
        let note = "HPI: fever\nPLAN:\n- Blood cultures\n- Start cefepime";
        let sections = split_sections(note);
        let chunks = chunk_sections(&sections, 1, 1500);
        let soap = compose_soap(Some(&facts()), &[candidate(Some("lactate"))], &sections, &chunks);
        assert_eq!(soap.plan_source, PlanSource::NoteSection);
        assert!(soap.plan.starts_with("- Blood cultures\n- Start cefepime [evidence: 1_PLAN_0_"));
    }

    #[test]
    fn workup_is_used_without_a_plan_section() {
        let sections = split_sections("HPI: fever");
        let soap = compose_soap(Some(&facts()), &[candidate(Some("Blood cultures; lactate"))], &sections, &[]);
        assert_eq!(soap.plan_source, PlanSource::TopCandidateWorkup);
        assert_eq!(
            soap.plan,
            "Workup for Sepsis: Blood cultures; lactate [evidence: 1_HPI_0_aaaaaaaa]"
        );
    }

    #[test]
    fn generic_plan_is_the_last_resort() {
        let soap = compose_soap(None, &[], &split_sections("HPI: fever"), &[]);
        assert_eq!(soap.plan_source, PlanSource::Generic);
        assert_eq!(soap.assessment, "Differential diagnosis unavailable.");
        assert_eq!(soap.subjective, "No subjective findings documented.");
    }

    #[test]
    fn sections_carry_citations() {
        let soap = compose_soap(Some(&facts()), &[candidate(None)], &[], &[]);
        assert_eq!(
            soap.subjective,
            "Patient: 70-year-old female [evidence: 1_HPI_0_aaaaaaaa]\nReports: fever [evidence: 1_HPI_0_aaaaaaaa]"
        );
        assert_eq!(soap.objective, "Vitals: Temp 38.9 °C [evidence: 1_EXAM_0_bbbbbbbb], SpO2 91%");
        assert_eq!(soap.assessment, "1. Sepsis (Medium confidence) [evidence: 1_HPI_0_aaaaaaaa]");
    }

    #[test]
    fn render_has_four_headed_sections() {
        let rendered = compose_soap(None, &[], &[], &[]).render();
        for header in ["SUBJECTIVE:\n", "\n\nOBJECTIVE:\n", "\n\nASSESSMENT:\n", "\n\nPLAN:\n"] {
            assert!(rendered.contains(header), "{header:?}");
        }
    }
}
