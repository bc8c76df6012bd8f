//! Query model and the classic query-string parser.
//!
//! The parser accepts the familiar syntax: bare terms, `field:value`,
//! `"phrases"`, `*`/`?` wildcards, `+`/`-` modifiers, `AND`/`OR`/`NOT`
//! (also `&&`, `||`, `!`), parentheses, `^boost`, backslash escapes and the
//! `*:*` match-all. Query text is analyzed per field, exactly as stored
//! values are, so the resulting leaves carry index-ready terms.

use std::fmt;

use crate::analyzer::Analyzer;
use crate::error::{SearchError, SearchResult};

/// How a boolean clause participates in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    Must,
    Should,
    MustNot,
}

/// One clause of a [`Query::Bool`].
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub occur: Occur,
    pub query: Query,
}

/// Parsed, analyzed query tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Exact term in a field (an analyzed token or a whole exact value).
    Term { field: String, value: String },
    /// Consecutive analyzed tokens.
    Phrase { field: String, terms: Vec<String> },
    /// Glob-style pattern; `*` and `?` are wildcards, `\` escapes.
    Wildcard { field: String, pattern: String },
    Bool { clauses: Vec<Clause> },
    Boost { query: Box<Query>, boost: f64 },
    MatchAll,
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn bool(clauses: Vec<Clause>) -> Self {
        Query::Bool { clauses }
    }

    pub fn must(query: Query) -> Clause {
        Clause {
            occur: Occur::Must,
            query,
        }
    }

    pub fn should(query: Query) -> Clause {
        Clause {
            occur: Occur::Should,
            query,
        }
    }

    pub fn must_not(query: Query) -> Clause {
        Clause {
            occur: Occur::MustNot,
            query,
        }
    }

    /// Leaves that contribute to a match, skipping prohibited subtrees.
    pub fn positive_leaves(&self) -> Vec<&Query> {
        let mut out = Vec::new();
        self.collect_positive(&mut out);
        out
    }

    fn collect_positive<'a>(&'a self, out: &mut Vec<&'a Query>) {
        match self {
            Query::Bool { clauses } => {
                for clause in clauses {
                    if clause.occur != Occur::MustNot {
                        clause.query.collect_positive(out);
                    }
                }
            }
            Query::Boost { query, .. } => query.collect_positive(out),
            Query::MatchAll => {}
            leaf => out.push(leaf),
        }
    }
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(
            c,
            '\\' | '+' | '-' | '!' | '(' | ')' | ':' | '^' | '"' | '~' | '*' | '?' | '[' | ']'
                | '{' | '}' | ' '
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Term { field, value } => write!(f, "{}:{}", field, escape_value(value)),
            Query::Phrase { field, terms } => write!(f, "{}:\"{}\"", field, terms.join(" ")),
            Query::Wildcard { field, pattern } => write!(f, "{}:{}", field, pattern),
            Query::MatchAll => f.write_str("*:*"),
            Query::Boost { query, boost } => match **query {
                Query::Bool { .. } => write!(f, "({})^{}", query, boost),
                _ => write!(f, "{}^{}", query, boost),
            },
            Query::Bool { clauses } => {
                for (i, clause) in clauses.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    match clause.occur {
                        Occur::Must => f.write_str("+")?,
                        Occur::MustNot => f.write_str("-")?,
                        Occur::Should => {}
                    }
                    match clause.query {
                        Query::Bool { .. } => write!(f, "({})", clause.query)?,
                        _ => write!(f, "{}", clause.query)?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// How a field's values are stored and therefore how query text is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Tokenized by the analyzer.
    Analyzed,
    /// Matched as a whole value, case preserved.
    Exact,
    /// Matched as a whole value, lower-cased on both sides.
    LowercaseExact,
}

/// Tells the parser how each field is indexed.
pub trait FieldCatalog {
    fn field_kind(&self, field: &str) -> FieldKind;
}

// ============ Lexer ============

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    LParen,
    RParen,
    Colon,
    Plus,
    Minus,
    Not,
    And,
    Or,
    Caret(f64),
    Quoted(String),
    Word {
        text: String,
        /// Glob pattern when the word holds unescaped wildcards.
        pattern: Option<String>,
    },
}

fn lex(input: &str) -> SearchResult<Vec<(Tok, usize)>> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                toks.push((Tok::LParen, pos));
                i += 1;
            }
            ')' => {
                toks.push((Tok::RParen, pos));
                i += 1;
            }
            ':' => {
                toks.push((Tok::Colon, pos));
                i += 1;
            }
            '+' => {
                toks.push((Tok::Plus, pos));
                i += 1;
            }
            '-' => {
                toks.push((Tok::Minus, pos));
                i += 1;
            }
            '!' => {
                toks.push((Tok::Not, pos));
                i += 1;
            }
            '&' if matches!(chars.get(i + 1), Some((_, '&'))) => {
                toks.push((Tok::And, pos));
                i += 2;
            }
            '|' if matches!(chars.get(i + 1), Some((_, '|'))) => {
                toks.push((Tok::Or, pos));
                i += 2;
            }
            '~' => {
                return Err(SearchError::parse(
                    "fuzzy and proximity queries are not supported",
                    pos,
                ))
            }
            '[' | ']' | '{' | '}' => {
                return Err(SearchError::parse("range queries are not supported", pos))
            }
            '^' => {
                let mut j = i + 1;
                let mut num = String::new();
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    num.push(chars[j].1);
                    j += 1;
                }
                let boost: f64 = num
                    .parse()
                    .map_err(|_| SearchError::parse("expected a number after '^'", pos))?;
                toks.push((Tok::Caret(boost), pos));
                i = j;
            }
            '"' => {
                let mut j = i + 1;
                let mut text = String::new();
                let mut closed = false;
                while j < chars.len() {
                    match chars[j].1 {
                        '\\' if j + 1 < chars.len() => {
                            text.push(chars[j + 1].1);
                            j += 2;
                        }
                        '"' => {
                            closed = true;
                            j += 1;
                            break;
                        }
                        other => {
                            text.push(other);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(SearchError::parse("unterminated phrase", pos));
                }
                toks.push((Tok::Quoted(text), pos));
                i = j;
            }
            _ => {
                let mut text = String::new();
                let mut pattern = String::new();
                let mut wild = false;
                let mut j = i;
                while j < chars.len() {
                    let ch = chars[j].1;
                    if ch.is_whitespace()
                        || matches!(ch, '(' | ')' | ':' | '^' | '"' | '~' | '[' | ']' | '{' | '}')
                    {
                        break;
                    }
                    if ch == '\\' {
                        let escaped = chars
                            .get(j + 1)
                            .map(|(_, e)| *e)
                            .ok_or_else(|| SearchError::parse("dangling escape", chars[j].0))?;
                        text.push(escaped);
                        pattern.push('\\');
                        pattern.push(escaped);
                        j += 2;
                        continue;
                    }
                    if ch == '*' || ch == '?' {
                        wild = true;
                    }
                    pattern.push(ch);
                    text.push(ch);
                    j += 1;
                }
                let keyword = match text.as_str() {
                    "AND" if !wild => Some(Tok::And),
                    "OR" if !wild => Some(Tok::Or),
                    "NOT" if !wild => Some(Tok::Not),
                    _ => None,
                };
                let tok = match keyword {
                    Some(tok) => tok,
                    None => Tok::Word {
                        text,
                        pattern: wild.then_some(pattern),
                    },
                };
                toks.push((tok, pos));
                i = j;
            }
        }
    }

    Ok(toks)
}

// ============ Parser ============

#[derive(Clone, Copy, PartialEq)]
enum Conj {
    None,
    And,
    Or,
}

#[derive(Clone, Copy, PartialEq)]
enum Modifier {
    None,
    Required,
    Prohibited,
}

/// Classic query-string parser bound to a default field, an analyzer and
/// a field catalog. The default operator is OR.
pub struct QueryParser<'a> {
    default_field: String,
    analyzer: Analyzer,
    catalog: &'a dyn FieldCatalog,
}

impl<'a> QueryParser<'a> {
    pub fn new(
        default_field: impl Into<String>,
        analyzer: Analyzer,
        catalog: &'a dyn FieldCatalog,
    ) -> Self {
        Self {
            default_field: default_field.into(),
            analyzer,
            catalog,
        }
    }

    /// Parse `expression` into an analyzed query tree.
    pub fn parse(&self, expression: &str) -> SearchResult<Query> {
        let toks = lex(expression)?;
        let mut cursor = Cursor { toks, pos: 0 };
        let field = self.default_field.clone();
        let query = self.parse_query(&mut cursor, &field)?;

        if let Some((_, pos)) = cursor.peek() {
            return Err(SearchError::parse("unexpected ')'", pos));
        }

        query.ok_or_else(|| SearchError::parse("query has no searchable terms", 0))
    }

    fn parse_query(&self, cursor: &mut Cursor, field: &str) -> SearchResult<Option<Query>> {
        let mut clauses: Vec<Clause> = Vec::new();
        let mut seen_any = false;

        loop {
            match cursor.peek() {
                None | Some((Tok::RParen, _)) => break,
                _ => {}
            }

            let mut conj = Conj::None;
            if let Some((tok, pos)) = cursor.peek() {
                if matches!(tok, Tok::And | Tok::Or) {
                    if !seen_any {
                        return Err(SearchError::parse("query cannot start with AND/OR", pos));
                    }
                    conj = if tok == Tok::And { Conj::And } else { Conj::Or };
                    cursor.advance();
                }
            }

            let mut modifier = Modifier::None;
            if let Some((tok, _)) = cursor.peek() {
                match tok {
                    Tok::Plus => {
                        modifier = Modifier::Required;
                        cursor.advance();
                    }
                    Tok::Minus | Tok::Not => {
                        modifier = Modifier::Prohibited;
                        cursor.advance();
                    }
                    _ => {}
                }
            }

            let query = self.parse_clause(cursor, field)?;
            add_clause(&mut clauses, conj, modifier, query);
            seen_any = true;
        }

        Ok(match clauses.len() {
            0 => None,
            1 if clauses[0].occur != Occur::MustNot => clauses.pop().map(|c| c.query),
            _ => Some(Query::Bool { clauses }),
        })
    }

    fn parse_clause(&self, cursor: &mut Cursor, default_field: &str) -> SearchResult<Option<Query>> {
        let mut field = default_field.to_string();

        if let (Some((Tok::Word { text, .. }, _)), Some((Tok::Colon, _))) =
            (cursor.peek(), cursor.peek_at(1))
        {
            field = text;
            cursor.advance();
            cursor.advance();
        }

        let (tok, pos) = cursor
            .next()
            .ok_or_else(|| SearchError::parse("expected a term after operator", cursor.end_pos()))?;

        let query = match tok {
            Tok::LParen => {
                let inner = self.parse_query(cursor, &field)?;
                match cursor.next() {
                    Some((Tok::RParen, _)) => inner,
                    _ => return Err(SearchError::parse("missing ')'", pos)),
                }
            }
            Tok::Quoted(text) => self.analyze_phrase(&field, &text),
            Tok::Word { text, pattern } => self.analyze_word(&field, &text, pattern),
            _ => return Err(SearchError::parse("expected a term", pos)),
        };

        if let Some((Tok::Caret(boost), _)) = cursor.peek() {
            cursor.advance();
            return Ok(query.map(|q| Query::Boost {
                query: Box::new(q),
                boost,
            }));
        }

        Ok(query)
    }

    fn analyze_word(&self, field: &str, text: &str, pattern: Option<String>) -> Option<Query> {
        if field == "*" && text == "*" {
            return Some(Query::MatchAll);
        }

        let kind = self.catalog.field_kind(field);

        if let Some(pattern) = pattern {
            let pattern = match kind {
                FieldKind::Exact => pattern,
                FieldKind::Analyzed | FieldKind::LowercaseExact => {
                    self.analyzer.normalize_pattern(&pattern)
                }
            };
            return Some(Query::Wildcard {
                field: field.to_string(),
                pattern,
            });
        }

        match kind {
            FieldKind::Exact => Some(Query::term(field, text)),
            FieldKind::LowercaseExact => Some(Query::term(field, text.to_lowercase())),
            FieldKind::Analyzed => {
                let mut terms = self.analyzer.terms(text);
                match terms.len() {
                    0 => None,
                    1 => terms.pop().map(|t| Query::term(field, t)),
                    _ => Some(Query::Bool {
                        clauses: terms
                            .into_iter()
                            .map(|t| Query::should(Query::term(field, t)))
                            .collect(),
                    }),
                }
            }
        }
    }

    fn analyze_phrase(&self, field: &str, text: &str) -> Option<Query> {
        match self.catalog.field_kind(field) {
            FieldKind::Exact => Some(Query::term(field, text)),
            FieldKind::LowercaseExact => Some(Query::term(field, text.to_lowercase())),
            FieldKind::Analyzed => {
                let mut terms = self.analyzer.terms(text);
                match terms.len() {
                    0 => None,
                    1 => terms.pop().map(|t| Query::term(field, t)),
                    _ => Some(Query::Phrase {
                        field: field.to_string(),
                        terms,
                    }),
                }
            }
        }
    }
}

fn add_clause(clauses: &mut Vec<Clause>, conj: Conj, modifier: Modifier, query: Option<Query>) {
    if conj == Conj::And {
        if let Some(last) = clauses.last_mut() {
            if last.occur != Occur::MustNot {
                last.occur = Occur::Must;
            }
        }
    }

    let Some(query) = query else {
        return;
    };

    let prohibited = modifier == Modifier::Prohibited;
    let required = modifier == Modifier::Required || (conj == Conj::And && !prohibited);

    let occur = if prohibited {
        Occur::MustNot
    } else if required {
        Occur::Must
    } else {
        Occur::Should
    };
    clauses.push(Clause { occur, query });
}

struct Cursor {
    toks: Vec<(Tok, usize)>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<(Tok, usize)> {
        self.toks.get(self.pos).cloned()
    }

    fn peek_at(&self, offset: usize) -> Option<(Tok, usize)> {
        self.toks.get(self.pos + offset).cloned()
    }

    fn next(&mut self) -> Option<(Tok, usize)> {
        let tok = self.peek();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn end_pos(&self) -> usize {
        self.toks.last().map(|(_, p)| *p + 1).unwrap_or(0)
    }
}
