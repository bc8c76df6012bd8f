//! Text analyzers.
//!
//! The analyzer is selected by configuration key and is used for query
//! analysis, highlighting and term listing. Each variant also names the
//! FTS5 tokenizer that produces the same tokens on the storage side, so
//! stored terms and query terms always agree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// A token and its byte span in the analyzed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub term: String,
    pub start: usize,
    pub end: usize,
}

/// Statically registered analyzers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Analyzer {
    /// Unicode letters and digits, lower-cased.
    #[default]
    Standard,
    /// Letters only, lower-cased; digits and punctuation split tokens.
    Simple,
    /// Like `Standard`, with diacritics folded (`café` → `cafe`).
    Folding,
}

impl Analyzer {
    pub fn name(&self) -> &'static str {
        match self {
            Analyzer::Standard => "standard",
            Analyzer::Simple => "simple",
            Analyzer::Folding => "folding",
        }
    }

    /// The `tokenize=` argument for an FTS5 table using this analyzer.
    pub fn fts5_tokenizer(&self) -> &'static str {
        match self {
            Analyzer::Standard => "unicode61 remove_diacritics 0",
            Analyzer::Simple => "unicode61 remove_diacritics 0 categories 'L*'",
            Analyzer::Folding => "unicode61 remove_diacritics 2",
        }
    }

    fn is_token_char(&self, c: char) -> bool {
        match self {
            Analyzer::Standard | Analyzer::Folding => c.is_alphanumeric(),
            Analyzer::Simple => c.is_alphabetic(),
        }
    }

    fn normalize(&self, raw: &str) -> String {
        match self {
            Analyzer::Standard | Analyzer::Simple => raw.to_lowercase(),
            Analyzer::Folding => raw
                .nfd()
                .filter(|c| !is_combining_mark(*c))
                .collect::<String>()
                .to_lowercase(),
        }
    }

    /// Split `text` into tokens with byte offsets into `text`.
    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut start: Option<usize> = None;

        for (i, c) in text.char_indices() {
            if self.is_token_char(c) {
                if start.is_none() {
                    start = Some(i);
                }
            } else if let Some(s) = start.take() {
                tokens.push(self.token(text, s, i));
            }
        }
        if let Some(s) = start {
            tokens.push(self.token(text, s, text.len()));
        }

        tokens
    }

    fn token(&self, text: &str, start: usize, end: usize) -> Token {
        Token {
            term: self.normalize(&text[start..end]),
            start,
            end,
        }
    }

    /// Token terms only, in order.
    pub fn terms(&self, text: &str) -> Vec<String> {
        self.tokenize(text).into_iter().map(|t| t.term).collect()
    }

    /// Normalize a single wildcard pattern the same way terms are normalized,
    /// leaving `*` and `?` in place.
    pub fn normalize_pattern(&self, pattern: &str) -> String {
        self.normalize(pattern)
    }
}

impl fmt::Display for Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Analyzer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Analyzer::Standard),
            "simple" => Ok(Analyzer::Simple),
            "folding" => Ok(Analyzer::Folding),
            other => Err(format!(
                "unknown analyzer '{}'; expected standard, simple or folding",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_lowercases_and_keeps_digits() {
        let terms = Analyzer::Standard.terms("Invoice 2024-03, ACME Corp.");
        assert_eq!(terms, vec!["invoice", "2024", "03", "acme", "corp"]);
    }

    #[test]
    fn simple_drops_digits() {
        let terms = Analyzer::Simple.terms("r2d2 droid");
        assert_eq!(terms, vec!["r", "d", "droid"]);
    }

    #[test]
    fn folding_strips_diacritics() {
        let terms = Analyzer::Folding.terms("Café Ñandú");
        assert_eq!(terms, vec!["cafe", "nandu"]);
        assert_eq!(Analyzer::Standard.terms("Café"), vec!["café"]);
    }

    #[test]
    fn offsets_point_into_source_text() {
        let text = "  alpha, beta";
        let tokens = Analyzer::Standard.tokenize(text);
        assert_eq!(tokens.len(), 2);
        assert_eq!(&text[tokens[0].start..tokens[0].end], "alpha");
        assert_eq!(&text[tokens[1].start..tokens[1].end], "beta");
    }

    #[test]
    fn parses_config_keys() {
        assert_eq!("Standard".parse::<Analyzer>().unwrap(), Analyzer::Standard);
        assert_eq!("folding".parse::<Analyzer>().unwrap(), Analyzer::Folding);
        assert!("org.apache.lucene.MyAnalyzer".parse::<Analyzer>().is_err());
    }
}
