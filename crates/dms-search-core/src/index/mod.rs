//! Text index abstraction.
//!
//! The [`SearchIndex`] trait is the contract an index backend must satisfy:
//! keyed by uuid, one partition for every node kind, hits returned in
//! strictly decreasing score order with ties broken by a stable
//! backend-internal sequence.
//!
//! Boolean composition is shared by every backend: a backend evaluates the
//! leaves of a query ([`leaves`]) into per-document scores, and [`compose`]
//! folds them back through the boolean structure.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;

use crate::error::{SearchError, SearchResult};
use crate::models::NodeKind;
use crate::projection::IndexDocument;
use crate::query::{Occur, Query};

/// Upper bound on the number of index terms a single wildcard expands to.
pub const MAX_WILDCARD_EXPANSION: usize = 1024;

/// One raw candidate returned by the index, before any access check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexHit {
    pub uuid: String,
    pub score: f64,
}

/// Abstract text index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_batch`](SearchIndex::upsert_batch) | Write or replace several documents in one flush |
/// | [`delete`](SearchIndex::delete) | Remove one document |
/// | [`purge_kind`](SearchIndex::purge_kind) | Remove every document of a kind |
/// | [`search`](SearchIndex::search) | Ranked hits for a query slice |
/// | [`document`](SearchIndex::document) | The stored projection of a node |
/// | [`field_values`](SearchIndex::field_values) | Stored values of one field, paged |
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Write every document, replacing existing entries with the same uuid.
    async fn upsert_batch(&self, docs: &[IndexDocument]) -> SearchResult<()>;

    async fn upsert(&self, doc: &IndexDocument) -> SearchResult<()> {
        self.upsert_batch(std::slice::from_ref(doc)).await
    }

    /// Returns whether a document was removed.
    async fn delete(&self, uuid: &str) -> SearchResult<bool>;

    /// Returns the number of removed documents.
    async fn purge_kind(&self, kind: NodeKind) -> SearchResult<u64>;

    /// Hits `offset..offset+limit` of the ranked match list.
    async fn search(&self, query: &Query, offset: u64, limit: u64) -> SearchResult<Vec<IndexHit>>;

    async fn document(&self, uuid: &str) -> SearchResult<Option<IndexDocument>>;

    /// Number of documents, optionally restricted to one kind.
    async fn count(&self, kind: Option<NodeKind>) -> SearchResult<u64>;

    /// Stored values of `field` across all documents, in index order.
    async fn field_values(&self, field: &str, offset: u64, limit: u64) -> SearchResult<Vec<String>>;

    /// Compact the index. Backends without segments do nothing.
    async fn optimize(&self) -> SearchResult<()> {
        Ok(())
    }
}

/// Per-document scores keyed by the backend's stable sequence number.
pub type DocScores = HashMap<i64, f64>;

/// Term, phrase and wildcard leaves of `query`, depth-first, including
/// prohibited ones. [`compose`] consumes leaf results in this order.
pub fn leaves(query: &Query) -> Vec<&Query> {
    let mut out = Vec::new();
    collect_leaves(query, &mut out);
    out
}

fn collect_leaves<'a>(query: &'a Query, out: &mut Vec<&'a Query>) {
    match query {
        Query::Bool { clauses } => {
            for clause in clauses {
                collect_leaves(&clause.query, out);
            }
        }
        Query::Boost { query, .. } => collect_leaves(query, out),
        Query::MatchAll => {}
        leaf => out.push(leaf),
    }
}

pub fn contains_match_all(query: &Query) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Bool { clauses } => clauses.iter().any(|c| contains_match_all(&c.query)),
        Query::Boost { query, .. } => contains_match_all(query),
        _ => false,
    }
}

/// Fold leaf scores through the boolean structure of `query`.
///
/// `leaf_scores` must yield one entry per element of [`leaves`]`(query)`, in
/// order. `all` holds every document (score 1.0) and is only read for
/// match-all clauses.
///
/// Required clauses intersect, optional ones union (or only add score when
/// a required clause exists), prohibited ones subtract. A boolean query with
/// prohibited clauses only matches nothing.
pub fn compose<I>(query: &Query, leaf_scores: &mut I, all: &DocScores) -> DocScores
where
    I: Iterator<Item = DocScores>,
{
    match query {
        Query::MatchAll => all.clone(),
        Query::Boost { query, boost } => {
            let mut scores = compose(query, leaf_scores, all);
            for score in scores.values_mut() {
                *score *= boost;
            }
            scores
        }
        Query::Bool { clauses } => {
            let mut musts: Vec<DocScores> = Vec::new();
            let mut shoulds: Vec<DocScores> = Vec::new();
            let mut nots: Vec<DocScores> = Vec::new();
            for clause in clauses {
                let scores = compose(&clause.query, leaf_scores, all);
                match clause.occur {
                    Occur::Must => musts.push(scores),
                    Occur::Should => shoulds.push(scores),
                    Occur::MustNot => nots.push(scores),
                }
            }

            let mut result: DocScores = if let Some((first, rest)) = musts.split_first() {
                first
                    .iter()
                    .filter_map(|(id, score)| {
                        let mut total = *score;
                        for other in rest {
                            total += other.get(id)?;
                        }
                        Some((*id, total))
                    })
                    .collect()
            } else {
                let mut union = DocScores::new();
                for scores in &shoulds {
                    for (id, score) in scores {
                        *union.entry(*id).or_insert(0.0) += score;
                    }
                }
                union
            };

            if !musts.is_empty() {
                for scores in &shoulds {
                    for (id, score) in scores {
                        if let Some(total) = result.get_mut(id) {
                            *total += score;
                        }
                    }
                }
            }

            for scores in &nots {
                result.retain(|id, _| !scores.contains_key(id));
            }
            result
        }
        _ => leaf_scores.next().unwrap_or_default(),
    }
}

/// Compile a wildcard pattern (`*`, `?`, backslash escapes) into a matcher.
pub fn wildcard_matcher(pattern: &str) -> SearchResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| SearchError::parse(e.to_string(), 0))
}

/// Sort by score descending, then sequence ascending, and take a slice.
pub fn rank(scores: DocScores, offset: u64, limit: u64) -> Vec<(i64, f64)> {
    let mut ranked: Vec<(i64, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .collect()
}
