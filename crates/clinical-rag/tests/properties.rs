//! Property tests for sectioning, chunking, retrieval, citations and confidence bands.

use std::collections::HashSet;
use std::sync::Arc;

use clinical_rag::chunker::chunk_sections;
use clinical_rag::citation::{self, CitationResolver};
use clinical_rag::ddx::{MatchSource, PATTERNS, score_patterns};
use clinical_rag::index::VectorIndex;
use clinical_rag::section::split_sections;
use clinical_rag::ConfidenceThresholds;
use copilot_common::embedding::HashingEmbedder;
use proptest::prelude::*;

fn squash(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Lines mixing real headers, header look-alikes and free text.
fn arb_line() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("HPI:".to_string()),
        Just("PLAN:".to_string()),
        Just("Plan to discharge tomorrow".to_string()),
        Just("## Assessment".to_string()),
        Just("**LABS:** WBC 12".to_string()),
        Just("  PHYSICAL EXAM: lungs clear".to_string()),
        Just("".to_string()),
        "[a-zA-Zμ°0-9 .,;:/()-]{0,60}",
    ]
}

fn arb_note() -> impl Strategy<Value = String> {
    proptest::collection::vec(arb_line(), 0..25).prop_map(|lines| lines.join("\n"))
}

mod prop_sections {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn sections_tile_the_note(note in arb_note()) {
            let sections = split_sections(&note);
            let joined: String = sections.iter().map(|s| s.text.as_str()).collect();
            prop_assert_eq!(&joined, &note);

            let mut pos = 0;
            for s in &sections {
                prop_assert_eq!(s.start, pos);
                prop_assert_eq!(&note[s.start..s.end], s.text.as_str());
                prop_assert!(s.body_start >= s.start && s.body_start <= s.end);
                pos = s.end;
            }
            prop_assert_eq!(pos, note.len());
        }
    }
}

mod prop_chunks {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn chunks_cover_sections_within_bounds(note in arb_note(), max_chars in 64usize..400) {
            let sections = split_sections(&note);
            let chunks = chunk_sections(&sections, 7, max_chars);

            let ids: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
            prop_assert_eq!(ids.len(), chunks.len());

            for c in &chunks {
                prop_assert!(c.text.chars().count() <= max_chars);
                prop_assert!(!c.text.trim().is_empty());
                prop_assert_eq!(&note[c.start..c.end], c.text.as_str());
                let prefix = format!("7_{}_{}_", c.section.code(), c.sequence);
                prop_assert!(c.id.starts_with(&prefix));
            }

            for s in &sections {
                let inside: String = chunks
                    .iter()
                    .filter(|c| c.start >= s.start && c.end <= s.end)
                    .map(|c| c.text.as_str())
                    .collect();
                prop_assert_eq!(squash(&inside), squash(&s.text));
            }
        }
    }
}

mod prop_retrieval {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn search_is_deterministic_and_clamped(
            note in arb_note(),
            query in "[a-z ]{0,40}",
            top_k in 1usize..30,
        ) {
            let chunks = chunk_sections(&split_sections(&note), 1, 200);
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (first, second) = rt.block_on(async {
                let index = VectorIndex::build(&chunks, Arc::new(HashingEmbedder::default()))
                    .await
                    .unwrap();
                let a = index.search(&query, top_k).await.unwrap();
                let b = index.search(&query, top_k).await.unwrap();
                (a, b)
            });

            prop_assert_eq!(first.len(), top_k.min(chunks.len()));
            prop_assert_eq!(&first, &second);
            prop_assert!(first.windows(2).all(|w| w[0].score >= w[1].score));
            for (i, hit) in first.iter().enumerate() {
                prop_assert_eq!(hit.rank, i + 1);
            }
        }
    }
}

mod prop_citations {
    use super::*;

    const KNOWN: &[&str] = &[
        "1_HPI_0_0a1b2c3d",
        "1_HPI_1_ffee0011",
        "1_LABS_0_12345678",
        "1_PLAN_0_cafebabe",
        "12_ASSESSMENT_PLAN_3_00000000",
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn embedded_known_ids_round_trip(
            picks in proptest::collection::vec(0usize..KNOWN.len(), 0..10),
            filler in proptest::collection::vec("[a-zA-Z ,.]{0,20}", 10),
        ) {
            let mut text = String::new();
            for (i, p) in picks.iter().enumerate() {
                text.push_str(&filler[i % filler.len()]);
                text.push_str(&citation::token(&[KNOWN[*p]]));
            }
            let resolver = CitationResolver::new(KNOWN.iter().copied());

            let mut seen = HashSet::new();
            let expected: Vec<String> = picks
                .iter()
                .map(|p| KNOWN[*p])
                .filter(|id| seen.insert(*id))
                .map(str::to_string)
                .collect();
            prop_assert_eq!(resolver.resolve(&text), expected);
            prop_assert!(!citation::strip(&text).to_lowercase().contains("[evidence"));
        }

        #[test]
        fn arbitrary_text_only_yields_known_ids(text in "\\PC{0,200}", noise in "[\\[\\]:_a-z ]{0,80}") {
            let resolver = CitationResolver::new(KNOWN.iter().copied());
            let input = format!("{text}[evidence:{noise}]{noise}");
            let resolved = resolver.resolve(&input);
            let unique: HashSet<&String> = resolved.iter().collect();
            prop_assert_eq!(unique.len(), resolved.len());
            prop_assert!(resolved.iter().all(|id| KNOWN.contains(&id.as_str())));
        }
    }
}

mod prop_confidence {
    use super::*;

    fn pattern_and_order() -> impl Strategy<Value = (usize, Vec<usize>)> {
        (0..PATTERNS.len()).prop_flat_map(|p| {
            let n = PATTERNS[p].groups.len();
            (Just(p), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn adding_groups_never_lowers_the_band((p, order) in pattern_and_order(), pick in 0usize..8) {
            let thresholds = ConfidenceThresholds::default();
            let pattern = &PATTERNS[p];
            let mut texts: Vec<&str> = Vec::new();
            let mut previous = None;
            for g in order {
                let keywords = pattern.groups[g].keywords;
                texts.push(keywords[pick % keywords.len()]);
                let sources: Vec<MatchSource<'_>> =
                    texts.iter().map(|t| MatchSource { text: t, evidence: None }).collect();
                let band = score_patterns(&sources)[p].confidence(&thresholds);
                prop_assert!(band >= previous, "{}: {:?} after {:?}", pattern.name, band, previous);
                previous = band;
            }
        }
    }
}
