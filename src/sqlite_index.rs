//! SQLite-backed [`SearchIndex`] implementation.
//!
//! Analyzed field values live in the FTS5 table `index_fts` and are scored
//! with `bm25`; exact values live in `index_terms` and score 1.0. Wildcards
//! expand against the `index_vocab` term list. Boolean composition and
//! ranking are the shared ones from the core crate, keyed by the stable
//! `index_documents.id`.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use dms_search_core::analyzer::Analyzer;
use dms_search_core::index::{
    compose, contains_match_all, leaves, rank, wildcard_matcher, DocScores, IndexHit, SearchIndex,
    MAX_WILDCARD_EXPANSION,
};
use dms_search_core::models::NodeKind;
use dms_search_core::projection::{IndexDocument, IndexField};
use dms_search_core::query::Query;
use dms_search_core::{SearchError, SearchResult};

use crate::snapshot::{reader, Reader};

fn io(e: sqlx::Error) -> SearchError {
    SearchError::IndexIo(e.to_string())
}

/// SQLite implementation of the [`SearchIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
    analyzer: Analyzer,
}

impl SqliteIndex {
    /// `analyzer` must be the one the schema was migrated with.
    pub fn new(pool: SqlitePool, analyzer: Analyzer) -> Self {
        Self { pool, analyzer }
    }

    async fn conn(&self) -> SearchResult<Reader> {
        reader(&self.pool).await.map_err(io)
    }

    /// FTS5 query for an exact token sequence.
    fn fts_phrase(terms: &[String]) -> String {
        let joined = terms.join(" ");
        format!("\"{}\"", joined.replace('"', "\"\""))
    }

    async fn fts_scores(&self, field: &str, expression: &str) -> SearchResult<DocScores> {
        let rows = sqlx::query(
            "SELECT doc_id, -bm25(index_fts) AS score FROM index_fts WHERE index_fts MATCH ? AND field = ?",
        )
        .bind(expression)
        .bind(field)
        .fetch_all(&mut *self.conn().await?)
        .await
        .map_err(io)?;

        let mut out = DocScores::new();
        for row in rows {
            let id: i64 = row.get("doc_id");
            let score: f64 = row.get("score");
            *out.entry(id).or_insert(0.0) += score;
        }
        Ok(out)
    }

    async fn exact_ids(&self, sql: &str, field: &str, value: &str) -> SearchResult<DocScores> {
        let ids: Vec<i64> = sqlx::query_scalar(sql)
            .bind(field)
            .bind(value)
            .fetch_all(&mut *self.conn().await?)
            .await
            .map_err(io)?;
        Ok(ids.into_iter().map(|id| (id, 1.0)).collect())
    }

    async fn evaluate_leaf(&self, leaf: &Query) -> SearchResult<DocScores> {
        match leaf {
            Query::Term { field, value } => {
                let mut out = self
                    .exact_ids(
                        "SELECT DISTINCT doc_id FROM index_terms WHERE field = ? AND value = ?",
                        field,
                        value,
                    )
                    .await?;
                let terms = self.analyzer.terms(value);
                if !terms.is_empty() {
                    for (id, score) in self.fts_scores(field, &Self::fts_phrase(&terms)).await? {
                        *out.entry(id).or_insert(0.0) += score;
                    }
                }
                Ok(out)
            }
            Query::Phrase { field, terms } => {
                if terms.is_empty() {
                    return Ok(DocScores::new());
                }
                self.fts_scores(field, &Self::fts_phrase(terms)).await
            }
            Query::Wildcard { field, pattern } => {
                let glob = to_sqlite_glob(pattern);
                let mut out = self
                    .exact_ids(
                        "SELECT DISTINCT doc_id FROM index_terms WHERE field = ? AND value GLOB ?",
                        field,
                        &glob,
                    )
                    .await?;

                let expansion = self.expand(pattern, &glob).await?;
                if !expansion.is_empty() {
                    let expression = expansion
                        .iter()
                        .map(|t| Self::fts_phrase(std::slice::from_ref(t)))
                        .collect::<Vec<_>>()
                        .join(" OR ");
                    for id in self.fts_scores(field, &expression).await?.into_keys() {
                        out.insert(id, 1.0);
                    }
                }
                Ok(out)
            }
            _ => Ok(DocScores::new()),
        }
    }

    /// Index terms matching a wildcard pattern, capped.
    async fn expand(&self, pattern: &str, glob: &str) -> SearchResult<Vec<String>> {
        let matcher = wildcard_matcher(pattern)?;
        let candidates: Vec<String> =
            sqlx::query_scalar("SELECT term FROM index_vocab WHERE term GLOB ? ORDER BY term")
                .bind(glob)
                .fetch_all(&mut *self.conn().await?)
                .await
                .map_err(io)?;
        let terms: Vec<String> = candidates
            .into_iter()
            .filter(|t| matcher.is_match(t))
            .take(MAX_WILDCARD_EXPANSION)
            .collect();
        debug!(pattern, expanded = terms.len(), "wildcard expansion");
        Ok(terms)
    }

    async fn uuids_for(&self, ids: &[i64]) -> SearchResult<HashMap<i64, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id, uuid FROM index_documents WHERE id IN ({})", placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&mut *self.conn().await?).await.map_err(io)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<i64, _>("id"), row.get::<String, _>("uuid")))
            .collect())
    }
}

/// Translate a wildcard pattern (`*`, `?`, backslash escapes) into SQLite
/// `GLOB` syntax, bracketing literal glob metacharacters.
fn to_sqlite_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(lit @ ('*' | '?' | '[')) => {
                    out.push('[');
                    out.push(lit);
                    out.push(']');
                }
                Some(lit) => out.push(lit),
                None => {}
            },
            '[' => out.push_str("[[]"),
            other => out.push(other),
        }
    }
    out
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn upsert_batch(&self, docs: &[IndexDocument]) -> SearchResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(io)?;

        for doc in docs {
            let fields_json =
                serde_json::to_string(&doc.fields).map_err(|e| SearchError::IndexIo(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO index_documents (uuid, kind, fields_json, indexed_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(uuid) DO UPDATE SET
                    kind = excluded.kind,
                    fields_json = excluded.fields_json,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(&doc.uuid)
            .bind(doc.kind.as_str())
            .bind(&fields_json)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(io)?;

            let id: i64 = sqlx::query_scalar("SELECT id FROM index_documents WHERE uuid = ?")
                .bind(&doc.uuid)
                .fetch_one(&mut *tx)
                .await
                .map_err(io)?;

            sqlx::query("DELETE FROM index_fts WHERE doc_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(io)?;
            sqlx::query("DELETE FROM index_terms WHERE doc_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(io)?;

            for (name, field) in &doc.fields {
                let sql = if field.analyzed {
                    "INSERT INTO index_fts (doc_id, field, value) VALUES (?, ?, ?)"
                } else {
                    "INSERT INTO index_terms (doc_id, field, value) VALUES (?, ?, ?)"
                };
                for value in &field.values {
                    sqlx::query(sql)
                        .bind(id)
                        .bind(name)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .map_err(io)?;
                }
            }
        }

        tx.commit().await.map_err(io)?;
        debug!(docs = docs.len(), "index batch written");
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> SearchResult<bool> {
        let mut tx = self.pool.begin().await.map_err(io)?;
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM index_documents WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await
            .map_err(io)?;
        let Some(id) = id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM index_fts WHERE doc_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(io)?;
        sqlx::query("DELETE FROM index_terms WHERE doc_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(io)?;
        sqlx::query("DELETE FROM index_documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(io)?;
        tx.commit().await.map_err(io)?;
        Ok(true)
    }

    async fn purge_kind(&self, kind: NodeKind) -> SearchResult<u64> {
        let mut tx = self.pool.begin().await.map_err(io)?;
        sqlx::query(
            "DELETE FROM index_fts WHERE doc_id IN (SELECT id FROM index_documents WHERE kind = ?)",
        )
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await
        .map_err(io)?;
        sqlx::query(
            "DELETE FROM index_terms WHERE doc_id IN (SELECT id FROM index_documents WHERE kind = ?)",
        )
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await
        .map_err(io)?;
        let removed = sqlx::query("DELETE FROM index_documents WHERE kind = ?")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await
            .map_err(io)?
            .rows_affected();
        tx.commit().await.map_err(io)?;
        Ok(removed)
    }

    async fn search(&self, query: &Query, offset: u64, limit: u64) -> SearchResult<Vec<IndexHit>> {
        let mut leaf_results = Vec::new();
        for leaf in leaves(query) {
            leaf_results.push(self.evaluate_leaf(leaf).await?);
        }

        let all: DocScores = if contains_match_all(query) {
            let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM index_documents")
                .fetch_all(&mut *self.conn().await?)
                .await
                .map_err(io)?;
            ids.into_iter().map(|id| (id, 1.0)).collect()
        } else {
            DocScores::new()
        };

        let scores = compose(query, &mut leaf_results.into_iter(), &all);
        let ranked = rank(scores, offset, limit);
        let ids: Vec<i64> = ranked.iter().map(|(id, _)| *id).collect();
        let uuids = self.uuids_for(&ids).await?;

        Ok(ranked
            .into_iter()
            .filter_map(|(id, score)| {
                uuids.get(&id).map(|uuid| IndexHit {
                    uuid: uuid.clone(),
                    score,
                })
            })
            .collect())
    }

    async fn document(&self, uuid: &str) -> SearchResult<Option<IndexDocument>> {
        let row = sqlx::query("SELECT kind, fields_json FROM index_documents WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *self.conn().await?)
            .await
            .map_err(io)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.get("kind");
        let fields_json: String = row.get("fields_json");
        let kind = NodeKind::from_str(&kind).map_err(SearchError::IndexIo)?;
        let fields: BTreeMap<String, IndexField> = serde_json::from_str(&fields_json)
            .map_err(|e| SearchError::IndexIo(format!("corrupt stored document {}: {}", uuid, e)))?;

        Ok(Some(IndexDocument {
            uuid: uuid.to_string(),
            kind,
            fields,
        }))
    }

    async fn count(&self, kind: Option<NodeKind>) -> SearchResult<u64> {
        let n: i64 = match kind {
            Some(kind) => sqlx::query_scalar("SELECT COUNT(*) FROM index_documents WHERE kind = ?")
                .bind(kind.as_str())
                .fetch_one(&mut *self.conn().await?)
                .await
                .map_err(io)?,
            None => sqlx::query_scalar("SELECT COUNT(*) FROM index_documents")
                .fetch_one(&mut *self.conn().await?)
                .await
                .map_err(io)?,
        };
        Ok(n as u64)
    }

    async fn field_values(&self, field: &str, offset: u64, limit: u64) -> SearchResult<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT value FROM (
                SELECT doc_id, 0 AS source, rowid AS seq, value FROM index_fts WHERE field = ?1
                UNION ALL
                SELECT doc_id, 1 AS source, rowid AS seq, value FROM index_terms WHERE field = ?1
            )
            ORDER BY doc_id, source, seq
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(field)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.conn().await?)
        .await
        .map_err(io)
    }

    async fn optimize(&self) -> SearchResult<()> {
        sqlx::query("INSERT INTO index_fts(index_fts) VALUES('optimize')")
            .execute(&self.pool)
            .await
            .map_err(io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate;
    use dms_search_core::query::{FieldCatalog, FieldKind, QueryParser};
    use sqlx::sqlite::SqliteConnectOptions;
    use tempfile::TempDir;

    struct Catalog;

    impl FieldCatalog for Catalog {
        fn field_kind(&self, field: &str) -> FieldKind {
            match field {
                "text" | "title" => FieldKind::Analyzed,
                "name" => FieldKind::LowercaseExact,
                _ => FieldKind::Exact,
            }
        }
    }

    async fn index(dir: &TempDir) -> SqliteIndex {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{}",
            dir.path().join("idx.sqlite").display()
        ))
        .unwrap()
        .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        migrate(&pool, Analyzer::Standard).await.unwrap();
        SqliteIndex::new(pool, Analyzer::Standard)
    }

    fn doc(uuid: &str, kind: NodeKind, name: &str, text: &str) -> IndexDocument {
        let mut d = IndexDocument::new(uuid, kind);
        d.add("uuid", false, uuid);
        d.add("kind", false, kind.as_str());
        d.add("name", false, name.to_lowercase());
        d.add("text", true, text);
        d
    }

    fn parse(expr: &str) -> Query {
        QueryParser::new("text", Analyzer::Standard, &Catalog)
            .parse(expr)
            .unwrap()
    }

    async fn uuids(index: &SqliteIndex, expr: &str) -> Vec<String> {
        index
            .search(&parse(expr), 0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.uuid)
            .collect()
    }

    #[tokio::test]
    async fn field_values_page_through_multi_valued_fields() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;
        let mut first = doc("a", NodeKind::Document, "a.txt", "alpha");
        for keyword in ["k1", "k2", "k3", "k4", "k5"] {
            first.add("keyword", false, keyword);
        }
        let mut second = doc("b", NodeKind::Document, "b.txt", "beta");
        second.add("keyword", false, "k6");
        index.upsert_batch(&[first, second]).await.unwrap();

        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = index.field_values("keyword", offset, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            seen.extend(page);
        }
        assert_eq!(seen, ["k1", "k2", "k3", "k4", "k5", "k6"]);

        let text = index.field_values("text", 0, 10).await.unwrap();
        assert_eq!(text, ["alpha", "beta"]);
    }

    #[tokio::test]
    async fn terms_phrases_and_exact_fields() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;
        index
            .upsert_batch(&[
                doc("a", NodeKind::Document, "Budget.txt", "the annual budget report"),
                doc("b", NodeKind::Document, "notes.txt", "report of the budget committee"),
                doc("c", NodeKind::Folder, "Reports", ""),
            ])
            .await
            .unwrap();

        let mut hits = uuids(&index, "budget").await;
        hits.sort();
        assert_eq!(hits, ["a", "b"]);
        assert_eq!(uuids(&index, "\"budget report\"").await, ["a"]);
        assert_eq!(uuids(&index, "kind:folder").await, ["c"]);
        assert_eq!(uuids(&index, "name:budget.txt").await, ["a"]);
        assert_eq!(uuids(&index, "+budget -committee").await, ["a"]);
        assert!(uuids(&index, "-budget").await.is_empty());
        assert_eq!(index.count(None).await.unwrap(), 3);
        assert_eq!(index.count(Some(NodeKind::Folder)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wildcards_expand_over_terms_and_values() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;
        index
            .upsert_batch(&[
                doc("a", NodeKind::Document, "alpha.pdf", "gamma ray"),
                doc("b", NodeKind::Document, "beta.pdf", "gamut of colour"),
                doc("c", NodeKind::Document, "alpha.doc", "unrelated"),
            ])
            .await
            .unwrap();

        let mut hits = uuids(&index, "gam*").await;
        hits.sort();
        assert_eq!(hits, ["a", "b"]);
        assert_eq!(uuids(&index, "gam?t").await, ["b"]);

        let mut hits = uuids(&index, "name:alpha.*").await;
        hits.sort();
        assert_eq!(hits, ["a", "c"]);
    }

    #[tokio::test]
    async fn upsert_keeps_sequence_and_replaces_terms() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;
        index
            .upsert_batch(&[
                doc("a", NodeKind::Document, "a", "shared"),
                doc("b", NodeKind::Document, "b", "shared"),
            ])
            .await
            .unwrap();
        index
            .upsert(&doc("a", NodeKind::Document, "a", "shared"))
            .await
            .unwrap();

        // Equal scores fall back to insertion order, which survives the rewrite.
        assert_eq!(uuids(&index, "kind:document").await, ["a", "b"]);

        index
            .upsert(&doc("a", NodeKind::Document, "a", "replaced"))
            .await
            .unwrap();
        assert_eq!(uuids(&index, "shared").await, ["b"]);
        assert_eq!(uuids(&index, "replaced").await, ["a"]);
    }

    #[tokio::test]
    async fn documents_round_trip_and_delete() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;
        let original = doc("a", NodeKind::Mail, "m", "hello");
        index.upsert(&original).await.unwrap();

        assert_eq!(index.document("a").await.unwrap(), Some(original));
        assert_eq!(index.field_values("text", 0, 10).await.unwrap(), ["hello"]);

        assert!(index.delete("a").await.unwrap());
        assert!(!index.delete("a").await.unwrap());
        assert!(index.document("a").await.unwrap().is_none());
        assert!(uuids(&index, "hello").await.is_empty());
    }

    #[tokio::test]
    async fn purge_removes_one_kind() {
        let dir = TempDir::new().unwrap();
        let index = index(&dir).await;
        index
            .upsert_batch(&[
                doc("a", NodeKind::Document, "a", "x"),
                doc("f", NodeKind::Folder, "f", ""),
            ])
            .await
            .unwrap();
        assert_eq!(index.purge_kind(NodeKind::Document).await.unwrap(), 1);
        assert_eq!(index.count(None).await.unwrap(), 1);
        index.optimize().await.unwrap();
    }

    #[test]
    fn glob_translation_brackets_literals() {
        assert_eq!(to_sqlite_glob("gam*"), "gam*");
        assert_eq!(to_sqlite_glob(r"a\*b"), "a[*]b");
        assert_eq!(to_sqlite_glob("x[1]"), "x[[]1]");
        assert_eq!(to_sqlite_glob(r"a\.b"), "a.b");
    }
}
