/// `[evidence: <chunk_id>]` citation tokens.
///
/// The keyword is case-insensitive, whitespace around the colon is optional and one token
/// may carry several ids separated by `,` or `;`. An id is only valid if it contains `_`
/// and is not the keyword itself; anything else inside a token is ignored.
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;
use crate::section::SectionKind;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*evidence\s*:\s*([^\]]*)\]").expect("valid regex"));

/// A citation resolved against the note's chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Citation {
    pub chunk_id: String,
    pub section: SectionKind,
    pub start: usize,
    pub end: usize,
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.contains('_')
        && !id.eq_ignore_ascii_case("evidence")
        && !id.chars().any(char::is_whitespace)
}

/// Every syntactically valid id in `text`, in order of appearance, with duplicates.
pub fn extract_ids(text: &str) -> Vec<&str> {
    TOKEN_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .flat_map(|m| m.as_str().split([',', ';']))
        .map(str::trim)
        .filter(|id| is_valid_id(id))
        .collect()
}

/// Format ids as a single citation token.
pub fn token(ids: &[&str]) -> String {
    format!("[evidence: {}]", ids.join(", "))
}

/// `text` with every citation token removed and the whitespace left behind tidied.
pub fn strip(text: &str) -> String {
    let removed = TOKEN_RE.replace_all(text, "");
    removed
        .lines()
        .map(|line| {
            let mut out = line.split_whitespace().collect::<Vec<_>>().join(" ");
            if line.starts_with(char::is_whitespace) {
                let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
                out.insert_str(0, &indent);
            }
            out
                .replace(" .", ".")
                .replace(" ,", ",")
                .replace(" ;", ";")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolves tokens against the chunk ids of one analysed note.
#[derive(Debug, Clone, Default)]
pub struct CitationResolver {
    known: HashMap<String, Option<Citation>>,
}

impl CitationResolver {
    /// Accepts ids only, without span information.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: ids.into_iter().map(|id| (id.into(), None)).collect(),
        }
    }

    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        Self {
            known: chunks
                .iter()
                .map(|c| {
                    let citation = Citation {
                        chunk_id: c.id.clone(),
                        section: c.section,
                        start: c.start,
                        end: c.end,
                    };
                    (c.id.clone(), Some(citation))
                })
                .collect(),
        }
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.known.contains_key(id)
    }

    /// Known ids cited in `text`, ordered by first appearance, without duplicates.
    /// Unknown ids are dropped silently.
    pub fn resolve(&self, text: &str) -> Vec<String> {
        self.retain_known(extract_ids(text))
    }

    /// Filter arbitrary ids down to known ones, keeping order and dropping duplicates.
    pub fn retain_known<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut seen = HashSet::new();
        ids.into_iter()
            .map(str::trim)
            .filter(|id| self.is_known(id) && seen.insert(*id))
            .map(str::to_string)
            .collect()
    }

    /// Span information for a known id, if the resolver was built from chunks.
    pub fn citation(&self, id: &str) -> Option<&Citation> {
        self.known.get(id).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> CitationResolver {
        CitationResolver::new(["1_HPI_0_abcd1234", "1_LABS_0_deadbeef", "1_PLAN_0_00ff00ff"])
    }

    #[test]
    fn resolves_in_order_of_appearance() {
        let text = "Fever [evidence: 1_LABS_0_deadbeef] and headache [evidence: 1_HPI_0_abcd1234].";
        assert_eq!(resolver().resolve(text), vec!["1_LABS_0_deadbeef", "1_HPI_0_abcd1234"]);
    }

    #[test]
    fn keyword_is_case_insensitive_and_spacing_optional() {
        let text = "[EVIDENCE:1_HPI_0_abcd1234] [ Evidence :  1_PLAN_0_00ff00ff ]";
        assert_eq!(resolver().resolve(text), vec!["1_HPI_0_abcd1234", "1_PLAN_0_00ff00ff"]);
    }

    #[test]
    fn multiple_ids_per_token() {
        let text = "[evidence: 1_HPI_0_abcd1234, 1_LABS_0_deadbeef; 1_PLAN_0_00ff00ff]";
        assert_eq!(resolver().resolve(text).len(), 3);
    }

    #[test]
    fn duplicates_and_unknown_ids_are_dropped() {
        let text = "[evidence: 1_HPI_0_abcd1234] [evidence: 9_HPI_0_ffffffff] [evidence: 1_HPI_0_abcd1234]";
        assert_eq!(resolver().resolve(text), vec!["1_HPI_0_abcd1234"]);
    }

    #[test]
    fn malformed_tokens_are_ignored() {
        let text = "[evidence: evidence] [evidence: CLINICAL] [evidence: ] [evidence 1_HPI_0_abcd1234] \
                    [evidence: 1_HPI_0_abcd1234";
        assert!(extract_ids(text).is_empty());
        assert!(resolver().resolve(text).is_empty());
    }

    #[test]
    fn strip_removes_tokens() {
        let text = "Fever [evidence: 1_HPI_0_abcd1234], headache [evidence: 1_HPI_0_abcd1234].\n  - WBC [evidence: x_y]";
        assert_eq!(strip(text), "Fever, headache.\n  - WBC");
    }

    #[test]
    fn token_round_trips() {
        let ids = ["1_HPI_0_abcd1234", "1_LABS_0_deadbeef"];
        assert_eq!(resolver().resolve(&token(&ids)), ids.to_vec());
    }

    #[test]
    fn from_chunks_exposes_spans() {
        let chunks = crate::chunker::chunk_sections(&crate::section::split_sections("HPI: fever"), 2, 1500);
        let resolver = CitationResolver::from_chunks(&chunks);
        let citation = resolver.citation(&chunks[0].id).unwrap();
        assert_eq!(citation.section, SectionKind::HistoryOfPresentIllness);
        assert_eq!((citation.start, citation.end), (chunks[0].start, chunks[0].end));
    }
}
