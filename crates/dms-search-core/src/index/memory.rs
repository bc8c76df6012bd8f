//! In-memory [`SearchIndex`] implementation for tests and embedding.
//!
//! Documents live in a `HashMap` behind a `parking_lot::RwLock`. Analyzed
//! fields are tokenized once on write. Scoring is classic TF-IDF with
//! length normalization; exact matches and wildcards score a constant 1.0.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::analyzer::Analyzer;
use crate::error::SearchResult;
use crate::models::NodeKind;
use crate::projection::IndexDocument;
use crate::query::Query;

use super::{compose, contains_match_all, leaves, rank, wildcard_matcher, DocScores, IndexHit, SearchIndex};

struct Entry {
    seq: i64,
    doc: IndexDocument,
    /// Analyzed field → token terms per stored value.
    tokens: HashMap<String, Vec<Vec<String>>>,
}

#[derive(Default)]
struct State {
    next_seq: i64,
    entries: HashMap<String, Entry>,
}

/// In-memory text index.
pub struct InMemoryIndex {
    analyzer: Analyzer,
    state: RwLock<State>,
}

impl InMemoryIndex {
    pub fn new(analyzer: Analyzer) -> Self {
        Self {
            analyzer,
            state: RwLock::new(State::default()),
        }
    }

    fn tokenize(&self, doc: &IndexDocument) -> HashMap<String, Vec<Vec<String>>> {
        doc.fields
            .iter()
            .filter(|(_, f)| f.analyzed)
            .map(|(name, f)| {
                let per_value = f.values.iter().map(|v| self.analyzer.terms(v)).collect();
                (name.clone(), per_value)
            })
            .collect()
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new(Analyzer::default())
    }
}

fn idf(total_docs: usize, doc_freq: usize) -> f64 {
    1.0 + (total_docs as f64 / (doc_freq as f64 + 1.0)).ln()
}

fn phrase_count(values: &[Vec<String>], phrase: &[String]) -> usize {
    values
        .iter()
        .map(|tokens| {
            if phrase.is_empty() || phrase.len() > tokens.len() {
                0
            } else {
                tokens.windows(phrase.len()).filter(|w| *w == phrase).count()
            }
        })
        .sum()
}

fn evaluate_leaf(state: &State, leaf: &Query) -> SearchResult<DocScores> {
    let mut out = DocScores::new();
    let total_docs = state.entries.len();

    match leaf {
        Query::Term { field, value } => {
            // Frequencies first; idf needs the document frequency.
            let mut freqs: Vec<(i64, usize, usize)> = Vec::new();
            for entry in state.entries.values() {
                if let Some(values) = entry.tokens.get(field) {
                    let tf: usize = values.iter().flatten().filter(|t| *t == value).count();
                    if tf > 0 {
                        let len: usize = values.iter().map(Vec::len).sum();
                        freqs.push((entry.seq, tf, len));
                    }
                } else if entry.doc.values(field).iter().any(|v| v == value) {
                    out.insert(entry.seq, 1.0);
                }
            }
            let idf = idf(total_docs, freqs.len());
            for (seq, tf, len) in freqs {
                out.insert(seq, (tf as f64).sqrt() * idf / (len.max(1) as f64).sqrt());
            }
        }
        Query::Phrase { field, terms } => {
            let mut freqs: Vec<(i64, usize, usize)> = Vec::new();
            for entry in state.entries.values() {
                if let Some(values) = entry.tokens.get(field) {
                    let tf = phrase_count(values, terms);
                    if tf > 0 {
                        let len: usize = values.iter().map(Vec::len).sum();
                        freqs.push((entry.seq, tf, len));
                    }
                }
            }
            let idf = idf(total_docs, freqs.len());
            for (seq, tf, len) in freqs {
                out.insert(
                    seq,
                    (tf as f64).sqrt() * idf * terms.len() as f64 / (len.max(1) as f64).sqrt(),
                );
            }
        }
        Query::Wildcard { field, pattern } => {
            let matcher = wildcard_matcher(pattern)?;
            for entry in state.entries.values() {
                let hit = match entry.tokens.get(field) {
                    Some(values) => values.iter().flatten().any(|t| matcher.is_match(t)),
                    None => entry.doc.values(field).iter().any(|v| matcher.is_match(v)),
                };
                if hit {
                    out.insert(entry.seq, 1.0);
                }
            }
        }
        _ => {}
    }

    Ok(out)
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn upsert_batch(&self, docs: &[IndexDocument]) -> SearchResult<()> {
        let prepared: Vec<_> = docs.iter().map(|d| (d.clone(), self.tokenize(d))).collect();
        let mut state = self.state.write();
        for (doc, tokens) in prepared {
            let seq = match state.entries.get(&doc.uuid) {
                Some(existing) => existing.seq,
                None => {
                    state.next_seq += 1;
                    state.next_seq
                }
            };
            state.entries.insert(doc.uuid.clone(), Entry { seq, doc, tokens });
        }
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> SearchResult<bool> {
        Ok(self.state.write().entries.remove(uuid).is_some())
    }

    async fn purge_kind(&self, kind: NodeKind) -> SearchResult<u64> {
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.doc.kind != kind);
        Ok((before - state.entries.len()) as u64)
    }

    async fn search(&self, query: &Query, offset: u64, limit: u64) -> SearchResult<Vec<IndexHit>> {
        let state = self.state.read();

        let mut leaf_results = Vec::new();
        for leaf in leaves(query) {
            leaf_results.push(evaluate_leaf(&state, leaf)?);
        }
        let all: DocScores = if contains_match_all(query) {
            state.entries.values().map(|e| (e.seq, 1.0)).collect()
        } else {
            DocScores::new()
        };

        let scores = compose(query, &mut leaf_results.into_iter(), &all);
        let by_seq: HashMap<i64, &str> = state
            .entries
            .values()
            .map(|e| (e.seq, e.doc.uuid.as_str()))
            .collect();

        Ok(rank(scores, offset, limit)
            .into_iter()
            .filter_map(|(seq, score)| {
                by_seq.get(&seq).map(|uuid| IndexHit {
                    uuid: uuid.to_string(),
                    score,
                })
            })
            .collect())
    }

    async fn document(&self, uuid: &str) -> SearchResult<Option<IndexDocument>> {
        Ok(self.state.read().entries.get(uuid).map(|e| e.doc.clone()))
    }

    async fn count(&self, kind: Option<NodeKind>) -> SearchResult<u64> {
        let state = self.state.read();
        let n = match kind {
            Some(kind) => state.entries.values().filter(|e| e.doc.kind == kind).count(),
            None => state.entries.len(),
        };
        Ok(n as u64)
    }

    async fn field_values(&self, field: &str, offset: u64, limit: u64) -> SearchResult<Vec<String>> {
        let state = self.state.read();
        let mut entries: Vec<&Entry> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries
            .into_iter()
            .flat_map(|e| e.doc.values(field).iter().cloned())
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect())
    }
}
