use regex::{Match, Regex};

/// Cue words that negate a finding later in the same clause.
const NEGATION_CUES: &[&str] = &["no", "not", "denies", "denied", "denying", "without", "never"];

/// Cues that negate the term right before them ("cultures negative"). Followed by "for"
/// they negate what comes after instead ("negative for fever").
const TRAILING_NEGATION_CUES: &[&str] = &["negative", "absent"];

/// Words that open a new assertion. A negation never reaches past one.
const SCOPE_PIVOTS: &[&str] = &[
    "but", "now", "however", "although", "though", "except", "with", "presents", "presenting",
    "presented", "reports", "reporting", "complains",
];

/// How many words before a match a negation cue may sit.
const NEGATION_WINDOW_WORDS: usize = 8;

/// A negation carries across a comma only into list items up to this long.
const LIST_ITEM_MAX_WORDS: usize = 4;

/// How many words after a match a trailing cue may sit.
const TRAILING_WINDOW_WORDS: usize = 2;

fn is_one_of(word: &str, list: &[&str]) -> bool {
    list.iter().any(|cue| word.eq_ignore_ascii_case(cue))
}

fn words(s: &str) -> impl DoubleEndedIterator<Item = &str> {
    s.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
}

/// Compile an alternation of plain phrases into a case-insensitive, word-bounded regex.
///
/// Spaces inside a phrase match any run of whitespace.
pub(crate) fn phrase_regex(phrases: &[&str]) -> Regex {
    let alternation = phrases
        .iter()
        .map(|p| {
            p.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).expect("valid regex")
}

/// Byte offset where the clause containing `pos` begins.
///
/// Clauses end at newlines, semicolons, colons, and sentence punctuation followed by
/// whitespace. A period inside a number ("101.8") does not end a clause.
pub(crate) fn clause_start(text: &str, pos: usize) -> usize {
    let prefix = &text[..pos];
    let mut chars = prefix.char_indices().rev().peekable();
    let mut next: Option<char> = None;
    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' | ';' | ':' => true,
            '.' | '!' | '?' => next.is_none_or(char::is_whitespace),
            _ => false,
        };
        if boundary {
            return i + c.len_utf8();
        }
        next = Some(c);
    }
    0
}

/// Byte offset where the clause containing `pos` ends (exclusive).
pub(crate) fn clause_end(text: &str, pos: usize) -> usize {
    let rest = &text[pos..];
    let mut iter = rest.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        let boundary = match c {
            '\n' | ';' => true,
            '.' | '!' | '?' => iter.peek().is_none_or(|(_, n)| n.is_whitespace()),
            _ => false,
        };
        if boundary {
            return pos + i;
        }
    }
    text.len()
}

/// True when a negation cue governs the text starting at `start`.
///
/// The scope runs backwards through the clause, stops at a pivot word, and only crosses a
/// comma while the items it leaves behind stay short ("denies trauma, sick contacts, or travel").
pub(crate) fn is_negated(text: &str, start: usize) -> bool {
    let clause = &text[clause_start(text, start)..start];
    let tail = text[start..clause_end(text, start)].split(',').next().unwrap_or_default();
    let mut tail_words = words(tail).count();
    let mut budget = NEGATION_WINDOW_WORDS;
    for segment in clause.rsplit(',') {
        let segment_words: Vec<&str> = words(segment).collect();
        let mut following: Option<&str> = None;
        for word in segment_words.iter().rev() {
            if budget == 0 || is_one_of(word, SCOPE_PIVOTS) {
                return false;
            }
            budget -= 1;
            let leading_trailing_cue = is_one_of(word, TRAILING_NEGATION_CUES)
                && following.is_some_and(|f| f.eq_ignore_ascii_case("for"));
            if is_one_of(word, NEGATION_CUES) || leading_trailing_cue {
                return true;
            }
            following = Some(word);
        }
        if segment_words.len() + tail_words > LIST_ITEM_MAX_WORDS {
            return false;
        }
        tail_words = 0;
    }
    false
}

/// True when a trailing cue ("negative", "absent") directly follows the text ending at `end`.
pub(crate) fn is_negated_after(text: &str, end: usize) -> bool {
    let rest = &text[end..clause_end(text, end)];
    let segment = rest.split(',').next().unwrap_or_default();
    let after: Vec<&str> = words(segment).take(TRAILING_WINDOW_WORDS + 1).collect();
    for (i, word) in after.iter().take(TRAILING_WINDOW_WORDS).enumerate() {
        if is_one_of(word, SCOPE_PIVOTS) || is_one_of(word, &["and", "or"]) {
            return false;
        }
        if is_one_of(word, TRAILING_NEGATION_CUES) {
            return !after.get(i + 1).is_some_and(|n| n.eq_ignore_ascii_case("for"));
        }
    }
    false
}

/// Occurrences of `re` in `text` that are not negated, in order.
pub(crate) fn affirmed_matches<'r, 't>(re: &'r Regex, text: &'t str) -> impl Iterator<Item = Match<'t>> + 'r
where
    't: 'r,
{
    re.find_iter(text)
        .filter(move |m| !is_negated(text, m.start()) && !is_negated_after(text, m.end()))
}

/// First occurrence of `re` in `text` that is not negated.
pub(crate) fn find_affirmed<'t>(re: &Regex, text: &'t str) -> Option<Match<'t>> {
    affirmed_matches(re, text).next()
}

/// Trimmed clause around a match, capped to `max_chars` characters.
pub(crate) fn clause_around(text: &str, start: usize, max_chars: usize) -> String {
    let clause = &text[clause_start(text, start)..clause_end(text, start)];
    let clause = clause.trim().trim_start_matches(['-', '*', '•']).trim();
    truncate_chars(clause, max_chars).to_string()
}

/// Longest prefix of `s` with at most `max_chars` characters.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
