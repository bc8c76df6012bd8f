//! Query-aware excerpt builder.

use std::collections::HashSet;

use globset::GlobMatcher;

use crate::analyzer::{Analyzer, Token};
use crate::error::SearchResult;
use crate::index::wildcard_matcher;
use crate::query::Query;

pub const HIGHLIGHT_OPEN: &str = "<span class='highlight'>";
pub const HIGHLIGHT_CLOSE: &str = "</span>";

/// Builds one highlighted fragment of at most `fragment_len` characters.
#[derive(Debug, Clone)]
pub struct Highlighter {
    analyzer: Analyzer,
    fragment_len: usize,
}

struct Matchers {
    terms: HashSet<String>,
    phrases: Vec<Vec<String>>,
    globs: Vec<GlobMatcher>,
}

impl Matchers {
    fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.phrases.is_empty() && self.globs.is_empty()
    }
}

impl Highlighter {
    pub fn new(analyzer: Analyzer, fragment_len: usize) -> Self {
        Self {
            analyzer,
            fragment_len: fragment_len.max(1),
        }
    }

    /// Best fragment of `text` for the positive leaves of `query` on any of
    /// `fields`. Returns `Ok(None)` when nothing in `text` matches.
    pub fn best_fragment(
        &self,
        query: &Query,
        fields: &[&str],
        text: &str,
    ) -> SearchResult<Option<String>> {
        let matchers = collect_matchers(query, fields)?;
        if matchers.is_empty() || text.is_empty() {
            return Ok(None);
        }

        let tokens = self.analyzer.tokenize(text);
        let hits = mark_hits(&tokens, &matchers);
        if !hits.iter().any(|h| *h) {
            return Ok(None);
        }

        let (first, last) = self.best_window(text, &tokens, &hits);
        let start = tokens[first].start;
        let end = clip_end(text, start, tokens[last].end, self.fragment_len);

        let mut out = String::with_capacity(end - start + 32);
        let mut cursor = start;
        for i in first..=last {
            let tok = &tokens[i];
            if hits[i] {
                let tok_end = tok.end.min(end);
                out.push_str(&text[cursor..tok.start]);
                out.push_str(HIGHLIGHT_OPEN);
                out.push_str(&text[tok.start..tok_end]);
                out.push_str(HIGHLIGHT_CLOSE);
                cursor = tok_end;
            }
        }
        out.push_str(&text[cursor..end]);

        Ok(Some(strip_invalid_xml_chars(&out)))
    }

    /// Token range `[first, last]` that fits the fragment length and covers
    /// the most matched tokens; the earliest wins ties. A single token longer
    /// than the fragment is returned alone and clipped by the caller.
    fn best_window(&self, text: &str, tokens: &[Token], hits: &[bool]) -> (usize, usize) {
        let mut best = (0usize, 0usize);
        let mut best_hits = 0usize;

        for first in (0..tokens.len()).filter(|i| hits[*i]) {
            let start = tokens[first].start;
            let mut last = first;
            let mut count = 0;
            for (i, tok) in tokens.iter().enumerate().skip(first) {
                if text[start..tok.end].chars().count() > self.fragment_len && i > first {
                    break;
                }
                last = i;
                if hits[i] {
                    count += 1;
                }
            }
            if count > best_hits {
                best_hits = count;
                best = (first, last);
            }
        }

        best
    }
}

/// Byte offset ending at most `max_chars` characters after `start`, not
/// beyond `end`.
fn clip_end(text: &str, start: usize, end: usize, max_chars: usize) -> usize {
    text[start..end]
        .char_indices()
        .nth(max_chars)
        .map_or(end, |(offset, _)| start + offset)
}

fn collect_matchers(query: &Query, fields: &[&str]) -> SearchResult<Matchers> {
    let mut matchers = Matchers {
        terms: HashSet::new(),
        phrases: Vec::new(),
        globs: Vec::new(),
    };

    for leaf in query.positive_leaves() {
        match leaf {
            Query::Term { field, value } if fields.contains(&field.as_str()) => {
                matchers.terms.insert(value.clone());
            }
            Query::Phrase { field, terms } if fields.contains(&field.as_str()) => {
                matchers.phrases.push(terms.clone());
            }
            Query::Wildcard { field, pattern } if fields.contains(&field.as_str()) => {
                matchers.globs.push(wildcard_matcher(pattern)?);
            }
            _ => {}
        }
    }

    Ok(matchers)
}

fn mark_hits(tokens: &[Token], matchers: &Matchers) -> Vec<bool> {
    let mut hits: Vec<bool> = tokens
        .iter()
        .map(|t| matchers.terms.contains(&t.term) || matchers.globs.iter().any(|g| g.is_match(&t.term)))
        .collect();

    for phrase in &matchers.phrases {
        if phrase.is_empty() || phrase.len() > tokens.len() {
            continue;
        }
        for i in 0..=tokens.len() - phrase.len() {
            if phrase.iter().zip(&tokens[i..]).all(|(p, t)| *p == t.term) {
                for hit in hits.iter_mut().skip(i).take(phrase.len()) {
                    *hit = true;
                }
            }
        }
    }

    hits
}

/// Drop characters that are not allowed in XML 1.0 documents.
pub fn strip_invalid_xml_chars(s: &str) -> String {
    s.chars()
        .filter(|c| {
            matches!(*c,
                '\u{9}' | '\u{A}' | '\u{D}'
                | '\u{20}'..='\u{D7FF}'
                | '\u{E000}'..='\u{FFFD}'
                | '\u{10000}'..='\u{10FFFF}')
        })
        .collect()
}
