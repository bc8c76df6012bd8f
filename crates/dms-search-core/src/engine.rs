//! Secured query engine.
//!
//! The index only knows a coarse, possibly stale approximation of who may
//! read what. Every candidate hit is therefore re-checked against the
//! authoritative [`AccessDecision`] while a page is assembled:
//!
//! ```text
//! FETCH_PAGE -> FILTER_CANDIDATE -> (SKIP_FOR_OFFSET | EMIT_RESULT | COUNT_PENDING) -> DONE
//! ```
//!
//! Denied hits never count toward `offset` or `limit`. Once the page is full,
//! the first further granted hit switches to pending-count scanning, which
//! stops at a threshold chosen by the active [`CountStrategy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::analyzer::Analyzer;
use crate::collaborators::{run_in_unit, AccessDecision, NodeRepository, TagField, UnitOfWork};
use crate::error::{SearchError, SearchResult};
use crate::highlight::Highlighter;
use crate::index::SearchIndex;
use crate::models::{IndexableNode, NodeKind, NodePayload, Permission, Principal, QueryResult, ResultPage};
use crate::projection::{content_field_for, fields, IndexSchema};
use crate::query::{Query, QueryParser};
use crate::strategy::{CountStrategy, CountThresholds};

/// Tunables of the query engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub strategy: CountStrategy,
    pub thresholds: CountThresholds,
    /// Maximum excerpt length in characters.
    pub fragment_len: usize,
    /// Lower bound of the fetch page size (`max(limit * 2, fetch_page_min)`).
    pub fetch_page_min: u64,
    /// Page size used while counting pending hits.
    pub count_page_size: u64,
    /// Number of source terms used by more-like-this.
    pub mlt_max_terms: usize,
    pub cache_folders: bool,
    /// Serve category/keyword lookups from the node store instead of the index.
    pub native_sql_lookups: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            strategy: CountStrategy::default(),
            thresholds: CountThresholds::default(),
            fragment_len: 256,
            fetch_page_min: 50,
            count_page_size: 200,
            mlt_max_terms: 25,
            cache_folders: false,
            native_sql_lookups: false,
        }
    }
}

/// Executes text queries and filters them through the access decision.
pub struct SecuredQueryEngine {
    index: Arc<dyn SearchIndex>,
    nodes: Arc<dyn NodeRepository>,
    access: Arc<dyn AccessDecision>,
    uow: Arc<dyn UnitOfWork>,
    schema: Arc<IndexSchema>,
    analyzer: Analyzer,
    settings: EngineSettings,
    /// (user, parent) → readable descendant folders.
    folder_cache: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl SecuredQueryEngine {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        nodes: Arc<dyn NodeRepository>,
        access: Arc<dyn AccessDecision>,
        uow: Arc<dyn UnitOfWork>,
        schema: Arc<IndexSchema>,
        analyzer: Analyzer,
        settings: EngineSettings,
    ) -> Self {
        Self {
            index,
            nodes,
            access,
            uow,
            schema,
            analyzer,
            settings,
            folder_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn analyzer(&self) -> Analyzer {
        self.analyzer
    }

    /// Parse a query-string expression against the default `text` field.
    pub fn parse(&self, expression: &str) -> SearchResult<Query> {
        QueryParser::new(fields::TEXT, self.analyzer, self.schema.as_ref()).parse(expression)
    }

    /// Run `query` with the configured strategy.
    pub async fn search(
        &self,
        principal: &Principal,
        query: &Query,
        offset: u64,
        limit: u64,
    ) -> SearchResult<ResultPage> {
        self.search_with_strategy(principal, query, offset, limit, self.settings.strategy)
            .await
    }

    /// Run `query` with an explicit count strategy.
    pub async fn search_with_strategy(
        &self,
        principal: &Principal,
        query: &Query,
        offset: u64,
        limit: u64,
        strategy: CountStrategy,
    ) -> SearchResult<ResultPage> {
        debug!(query = %query, offset, limit, strategy = %strategy, user = %principal.user, "search");
        let started = Instant::now();

        let page = run_in_unit(self.uow.as_ref(), || {
            self.filter_and_collect(principal, query, offset, limit, strategy)
        })
        .await?;

        debug!(
            results = page.results.len(),
            total = page.total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search finished"
        );
        Ok(page)
    }

    /// Parse `expression` with the classic grammar and run it.
    pub async fn search_simple(
        &self,
        principal: &Principal,
        expression: &str,
        offset: u64,
        limit: u64,
    ) -> SearchResult<ResultPage> {
        debug!(expression, offset, limit, "search_simple");
        let query = self.parse(expression)?;
        self.search(principal, &query, offset, limit).await
    }

    async fn filter_and_collect(
        &self,
        principal: &Principal,
        query: &Query,
        offset: u64,
        limit: u64,
        strategy: CountStrategy,
    ) -> SearchResult<ResultPage> {
        let page_size = limit.saturating_mul(2).max(self.settings.fetch_page_min).max(1);
        let highlighter = Highlighter::new(self.analyzer, self.settings.fragment_len);

        let mut skipped = 0u64;
        let mut out: Vec<QueryResult> = Vec::new();
        let mut page = 0u64;

        loop {
            let hits = self.index.search(query, page * page_size, page_size).await?;
            if hits.is_empty() {
                break;
            }

            for (i, hit) in hits.iter().enumerate() {
                let Some(node) = self.nodes.get(&hit.uuid).await? else {
                    debug!(uuid = %hit.uuid, "index entry without node, skipping");
                    continue;
                };
                if !self.access.is_granted(principal, &node, Permission::Read).await? {
                    continue;
                }

                if skipped < offset {
                    skipped += 1;
                } else if (out.len() as u64) < limit {
                    out.push(self.assemble(query, hit.score, node, &highlighter).await?);
                } else {
                    let position = page * page_size + i as u64;
                    let target = strategy.target(offset, limit, &self.settings.thresholds);
                    let total = self
                        .count_until(principal, query, position, skipped + out.len() as u64, target)
                        .await?;
                    return Ok(ResultPage { results: out, total });
                }
            }

            if (hits.len() as u64) < page_size {
                break;
            }
            page += 1;
        }

        let total = skipped + out.len() as u64;
        Ok(ResultPage { results: out, total })
    }

    /// Count granted hits from absolute `position` on, starting from
    /// `already`, until `target` is reached or the hits run out.
    async fn count_until(
        &self,
        principal: &Principal,
        query: &Query,
        position: u64,
        already: u64,
        target: u64,
    ) -> SearchResult<u64> {
        let page_size = self.settings.count_page_size.max(1);
        let mut readable = already;
        let mut position = position;

        while readable < target {
            let hits = self.index.search(query, position, page_size).await?;
            if hits.is_empty() {
                break;
            }

            for hit in &hits {
                match self.is_readable(principal, &hit.uuid).await {
                    Ok(true) => {
                        readable += 1;
                        if readable >= target {
                            break;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(uuid = %hit.uuid, error = %e, "access check failed while counting, skipping");
                    }
                }
            }

            position += hits.len() as u64;
        }

        Ok(readable)
    }

    async fn is_readable(&self, principal: &Principal, uuid: &str) -> SearchResult<bool> {
        match self.nodes.get(uuid).await? {
            Some(node) => self.access.is_granted(principal, &node, Permission::Read).await,
            None => Ok(false),
        }
    }

    async fn assemble(
        &self,
        query: &Query,
        score: f64,
        node: IndexableNode,
        highlighter: &Highlighter,
    ) -> SearchResult<QueryResult> {
        let excerpt = self.excerpt(query, &node, highlighter).await?;

        let payload = match node.kind {
            NodeKind::Document => {
                if self.parent_is_mail(&node).await? {
                    NodePayload::Attachment(node)
                } else {
                    NodePayload::Document(node)
                }
            }
            NodeKind::Folder => NodePayload::Folder(node),
            NodeKind::Mail => NodePayload::Mail(node),
        };

        Ok(QueryResult {
            score,
            excerpt,
            payload,
        })
    }

    async fn parent_is_mail(&self, node: &IndexableNode) -> SearchResult<bool> {
        match &node.parent {
            Some(parent) => Ok(self
                .nodes
                .get(parent)
                .await?
                .is_some_and(|p| p.kind == NodeKind::Mail)),
            None => Ok(false),
        }
    }

    /// Highlighted fragment of the node's stored full text. Highlighting
    /// problems degrade to no excerpt.
    async fn excerpt(
        &self,
        query: &Query,
        node: &IndexableNode,
        highlighter: &Highlighter,
    ) -> SearchResult<Option<String>> {
        let Some(field) = content_field_for(node.kind) else {
            return Ok(None);
        };
        let Some(text) = self
            .index
            .document(&node.uuid)
            .await?
            .and_then(|d| d.content_text())
        else {
            return Ok(None);
        };

        // Mail bodies also highlight default-field terms.
        let scoped: &[&str] = if field == fields::TEXT {
            &[fields::TEXT]
        } else {
            &[field, fields::TEXT]
        };
        match highlighter.best_fragment(query, scoped, &text) {
            Ok(excerpt) => Ok(excerpt),
            Err(e) => {
                warn!(uuid = %node.uuid, error = %e, "highlighting failed");
                Ok(None)
            }
        }
    }

    /// Documents similar to `uuid`, built from the most frequent terms of its
    /// stored text. The source itself is excluded.
    pub async fn more_like_this(
        &self,
        principal: &Principal,
        uuid: &str,
        max_results: u64,
    ) -> SearchResult<ResultPage> {
        debug!(uuid, max_results, "more_like_this");

        run_in_unit(self.uow.as_ref(), || async {
            let text = self
                .index
                .document(uuid)
                .await?
                .and_then(|d| d.content_text())
                .unwrap_or_default();
            if text.trim().is_empty() {
                warn!(uuid, "document has no extracted text");
                return Ok(ResultPage::empty());
            }

            let terms = top_terms(&self.analyzer.terms(&text), self.settings.mlt_max_terms);
            if terms.is_empty() {
                return Ok(ResultPage::empty());
            }
            let similar = Query::bool(
                terms
                    .into_iter()
                    .map(|t| Query::should(Query::term(fields::TEXT, t)))
                    .collect(),
            );
            let query = Query::bool(vec![
                Query::must(similar),
                Query::must(Query::term(fields::KIND, NodeKind::Document.as_str())),
                Query::must_not(Query::term(fields::UUID, uuid)),
            ]);

            let results = self.collect_granted(principal, &query, max_results).await?;
            let total = results.len() as u64;
            Ok(ResultPage { results, total })
        })
        .await
    }

    /// Up to `max` granted results of `query`, in relevance order.
    async fn collect_granted(
        &self,
        principal: &Principal,
        query: &Query,
        max: u64,
    ) -> SearchResult<Vec<QueryResult>> {
        let highlighter = Highlighter::new(self.analyzer, self.settings.fragment_len);
        let page_size = max.saturating_mul(2).max(self.settings.fetch_page_min).max(1);
        let mut out = Vec::new();
        let mut position = 0u64;

        while (out.len() as u64) < max {
            let hits = self.index.search(query, position, page_size).await?;
            if hits.is_empty() {
                break;
            }
            for hit in &hits {
                if (out.len() as u64) >= max {
                    break;
                }
                let Some(node) = self.nodes.get(&hit.uuid).await? else {
                    continue;
                };
                if self.access.is_granted(principal, &node, Permission::Read).await? {
                    out.push(self.assemble(query, hit.score, node, &highlighter).await?);
                }
            }
            position += hits.len() as u64;
        }

        Ok(out)
    }

    /// Uuids of every readable folder below `parent`, in pre-order.
    pub async fn folders_in_depth(
        &self,
        principal: &Principal,
        parent: &str,
    ) -> SearchResult<Vec<String>> {
        debug!(parent, user = %principal.user, "folders_in_depth");
        let key = (principal.user.clone(), parent.to_string());

        if self.settings.cache_folders {
            if let Some(cached) = self.folder_cache.lock().get(&key) {
                debug!(parent, "folders_in_depth served from cache");
                return Ok(cached.clone());
            }
        }

        let started = Instant::now();
        let folders = run_in_unit(self.uow.as_ref(), || async {
            let node = self
                .nodes
                .get(parent)
                .await?
                .ok_or_else(|| SearchError::NotFound(parent.to_string()))?;
            if !self.access.is_granted(principal, &node, Permission::Read).await? {
                return Err(SearchError::AccessDenied(format!(
                    "{} cannot read {}",
                    principal.user, parent
                )));
            }
            self.descend(principal, parent).await
        })
        .await?;

        debug!(
            parent,
            folders = folders.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "folders_in_depth finished"
        );

        if self.settings.cache_folders {
            self.folder_cache.lock().insert(key, folders.clone());
        }
        Ok(folders)
    }

    async fn descend(&self, principal: &Principal, parent: &str) -> SearchResult<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = self.nodes.child_folders(parent).await?;
        stack.reverse();

        while let Some(folder) = stack.pop() {
            match self.access.is_granted(principal, &folder, Permission::Read).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(uuid = %folder.uuid, error = %e, "access check failed, skipping folder");
                    continue;
                }
            }
            out.push(folder.uuid.clone());
            match self.nodes.child_folders(&folder.uuid).await {
                Ok(mut children) => {
                    children.reverse();
                    stack.extend(children);
                }
                Err(e) => {
                    warn!(uuid = %folder.uuid, error = %e, "cannot list child folders, skipping subtree");
                }
            }
        }

        Ok(out)
    }

    pub fn clear_folder_cache(&self) {
        self.folder_cache.lock().clear();
    }

    /// Analyzer tokens of a document's text or a mail's body.
    pub async fn get_terms(&self, kind: NodeKind, uuid: &str) -> SearchResult<Vec<String>> {
        debug!(kind = %kind, uuid, "get_terms");
        if content_field_for(kind).is_none() {
            return Ok(Vec::new());
        }
        Ok(self
            .index
            .document(uuid)
            .await?
            .filter(|d| d.kind == kind)
            .and_then(|d| d.content_text())
            .map(|text| self.analyzer.terms(&text))
            .unwrap_or_default())
    }

    pub async fn find_by_category(
        &self,
        principal: &Principal,
        category: &str,
    ) -> SearchResult<ResultPage> {
        self.find_tagged(principal, TagField::Category, category).await
    }

    pub async fn find_by_keyword(
        &self,
        principal: &Principal,
        keyword: &str,
    ) -> SearchResult<ResultPage> {
        self.find_tagged(principal, TagField::Keyword, keyword).await
    }

    async fn find_tagged(
        &self,
        principal: &Principal,
        field: TagField,
        value: &str,
    ) -> SearchResult<ResultPage> {
        debug!(field = field.index_field(), value, native = self.settings.native_sql_lookups, "find_tagged");
        let cap = self.settings.thresholds.max_search_results;

        run_in_unit(self.uow.as_ref(), || async {
            if !self.settings.native_sql_lookups {
                let query = Query::term(field.index_field(), value);
                let results = self.collect_granted(principal, &query, cap).await?;
                let total = results.len() as u64;
                return Ok(ResultPage { results, total });
            }

            let highlighter = Highlighter::new(self.analyzer, self.settings.fragment_len);
            let query = Query::MatchAll;
            let mut results = Vec::new();
            for uuid in self.nodes.tagged(field, value).await? {
                if results.len() as u64 >= cap {
                    break;
                }
                let Some(node) = self.nodes.get(&uuid).await? else {
                    continue;
                };
                if self.access.is_granted(principal, &node, Permission::Read).await? {
                    results.push(self.assemble(&query, 1.0, node, &highlighter).await?);
                }
            }
            let total = results.len() as u64;
            Ok(ResultPage { results, total })
        })
        .await
    }
}

/// Most frequent terms first; ties in alphabetical order.
fn top_terms(terms: &[String], max: usize) -> Vec<String> {
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for term in terms {
        *freq.entry(term.as_str()).or_insert(0) += 1;
    }
    let mut ranked: Vec<(&str, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(max)
        .map(|(t, _)| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NoopUnitOfWork, PlainTextExtractor};
    use crate::index::memory::InMemoryIndex;
    use crate::memory_nodes::InMemoryNodes;
    use crate::models::ContentSource;
    use crate::projection::{FieldProjector, PropertyForms};

    struct Fixture {
        index: Arc<InMemoryIndex>,
        nodes: Arc<InMemoryNodes>,
        projector: FieldProjector,
        schema: Arc<IndexSchema>,
    }

    impl Fixture {
        fn new() -> Self {
            let schema = Arc::new(IndexSchema::standard(PropertyForms::default()));
            Self {
                index: Arc::new(InMemoryIndex::new(Analyzer::Standard)),
                nodes: Arc::new(InMemoryNodes::default()),
                projector: FieldProjector::new(schema.clone(), Arc::new(PlainTextExtractor)),
                schema,
            }
        }

        async fn add(&self, node: IndexableNode) {
            let doc = self.projector.project(&node);
            self.index.upsert(&doc).await.unwrap();
            self.nodes.insert(node);
        }

        async fn doc(&self, uuid: &str, text: &str, readers: &[&str]) {
            let mut node = IndexableNode::new(uuid, NodeKind::Document, format!("{uuid}.txt"));
            node.parent = Some("root".into());
            for r in readers {
                node.user_permissions.insert(r.to_string(), 1);
            }
            node.content = Some(ContentSource::Text(text.to_string()));
            self.add(node).await;
        }

        async fn folder(&self, uuid: &str, parent: &str, readers: &[&str]) {
            let mut node = IndexableNode::new(uuid, NodeKind::Folder, uuid);
            node.parent = Some(parent.to_string());
            for r in readers {
                node.user_permissions.insert(r.to_string(), 1);
            }
            self.add(node).await;
        }

        fn engine(&self, settings: EngineSettings) -> SecuredQueryEngine {
            SecuredQueryEngine::new(
                self.index.clone(),
                self.nodes.clone(),
                self.nodes.clone(),
                Arc::new(NoopUnitOfWork),
                self.schema.clone(),
                Analyzer::Standard,
                settings,
            )
        }
    }

    fn user(name: &str) -> Principal {
        Principal::new(name, Vec::<String>::new())
    }

    fn with_strategy(strategy: CountStrategy) -> EngineSettings {
        EngineSettings {
            strategy,
            ..EngineSettings::default()
        }
    }

    async fn greek() -> Fixture {
        let f = Fixture::new();
        f.doc("d1", "alpha beta", &["u"]).await;
        f.doc("d2", "beta gamma", &["u"]).await;
        f.doc("d3", "gamma delta", &["u"]).await;
        f
    }

    #[tokio::test]
    async fn beta_returns_two_documents_in_relevance_order() {
        let f = greek().await;
        let engine = f.engine(with_strategy(CountStrategy::More));
        let page = engine.search_simple(&user("u"), "beta", 0, 10).await.unwrap();
        assert_eq!(page.uuids(), ["d1", "d2"]);
        assert_eq!(page.total, 2);
        assert!(page.results[0].score >= page.results[1].score);
        assert_eq!(
            page.results[0].excerpt.as_deref(),
            Some("<span class='highlight'>beta</span>")
        );
    }

    #[tokio::test]
    async fn denied_document_is_neither_returned_nor_counted() {
        let f = greek().await;
        f.nodes.set_user_permission("d2", "u", 0).unwrap();
        let engine = f.engine(with_strategy(CountStrategy::More));
        let page = engine.search_simple(&user("u"), "beta", 0, 10).await.unwrap();
        assert_eq!(page.uuids(), ["d1"]);
        assert_eq!(page.total, 1);
    }

    async fn wide_corpus(n: usize) -> Fixture {
        let f = Fixture::new();
        for i in 0..n {
            // Every third document is unreadable.
            let readers: &[&str] = if i % 3 == 2 { &[] } else { &["u"] };
            f.doc(&format!("d{i:02}"), "common words here", readers).await;
        }
        f
    }

    #[tokio::test]
    async fn results_are_always_readable() {
        let f = wide_corpus(30).await;
        let engine = f.engine(EngineSettings::default());
        let page = engine.search_simple(&user("u"), "common", 0, 50).await.unwrap();
        assert_eq!(page.results.len(), 20);
        assert_eq!(page.total, 20);
        for r in &page.results {
            let node = r.payload.node();
            assert!(f.nodes.is_granted(&user("u"), node, Permission::Read).await.unwrap());
        }
    }

    #[tokio::test]
    async fn consecutive_pages_concatenate_to_a_larger_page() {
        let f = wide_corpus(30).await;
        let engine = f.engine(with_strategy(CountStrategy::Window));
        let p = user("u");
        let first = engine.search_simple(&p, "common", 0, 5).await.unwrap();
        let second = engine.search_simple(&p, "common", 5, 5).await.unwrap();
        let both = engine.search_simple(&p, "common", 0, 10).await.unwrap();

        let mut joined = first.uuids();
        joined.extend(second.uuids());
        assert_eq!(joined, both.uuids());
    }

    #[tokio::test]
    async fn totals_follow_strategy_thresholds_and_never_exceed_truth() {
        let f = wide_corpus(60).await;
        let p = user("u");
        let true_total = 40;

        let thresholds = CountThresholds {
            more_extra: 1,
            window_factor: 2,
            max_search_results: 25,
        };
        let mut totals = Vec::new();
        for strategy in [CountStrategy::More, CountStrategy::Window, CountStrategy::Limited] {
            let engine = f.engine(EngineSettings {
                strategy,
                thresholds,
                ..EngineSettings::default()
            });
            let page = engine.search_simple(&p, "common", 0, 5).await.unwrap();
            assert_eq!(page.results.len(), 5);
            assert!(page.total <= true_total);
            totals.push(page.total);
        }
        assert_eq!(totals, vec![6, 10, 25]);
    }

    #[tokio::test]
    async fn cap_below_page_end_reports_page_end() {
        let f = wide_corpus(60).await;
        let engine = f.engine(EngineSettings {
            thresholds: CountThresholds {
                max_search_results: 3,
                ..CountThresholds::default()
            },
            ..EngineSettings::default()
        });
        let page = engine.search_simple(&user("u"), "common", 5, 5).await.unwrap();
        assert_eq!(page.results.len(), 5);
        assert_eq!(page.total, 10);
    }

    #[tokio::test]
    async fn pending_count_continues_past_fetch_page() {
        let f = wide_corpus(60).await;
        let engine = f.engine(EngineSettings {
            fetch_page_min: 4,
            count_page_size: 3,
            ..EngineSettings::default()
        });
        let page = engine.search_simple(&user("u"), "common", 2, 2).await.unwrap();
        assert_eq!(page.uuids(), ["d03", "d04"]);
        assert_eq!(page.total, 40);
    }

    #[tokio::test]
    async fn access_errors_propagate_on_page_but_are_skipped_while_counting() {
        let f = wide_corpus(12).await;
        f.nodes.poison_access("d06");
        let engine = f.engine(EngineSettings::default());
        let p = user("u");

        let page = engine.search_simple(&p, "common", 0, 2).await.unwrap();
        assert_eq!(page.uuids(), ["d00", "d01"]);
        // 8 readable, one of them failing its check.
        assert_eq!(page.total, 7);

        let err = engine.search_simple(&p, "common", 0, 10).await.unwrap_err();
        assert!(matches!(err, SearchError::DataAccess(_)));
    }

    #[tokio::test]
    async fn malformed_expression_is_rejected() {
        let f = greek().await;
        let err = f
            .engine(EngineSettings::default())
            .search_simple(&user("u"), "beta AND (gamma", 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::ParseFailure { .. }));
    }

    #[tokio::test]
    async fn attachments_and_mail_payloads() {
        let f = Fixture::new();
        let mut mail = IndexableNode::new("m1", NodeKind::Mail, "budget");
        mail.parent = Some("root".into());
        mail.subject = Some("budget".into());
        mail.user_permissions.insert("u".into(), 1);
        mail.content = Some(ContentSource::Text("the budget draft".into()));
        f.add(mail).await;

        let mut att = IndexableNode::new("a1", NodeKind::Document, "budget.txt");
        att.parent = Some("m1".into());
        att.user_permissions.insert("u".into(), 1);
        att.content = Some(ContentSource::Text("budget numbers".into()));
        f.add(att).await;

        let engine = f.engine(EngineSettings::default());
        let page = engine
            .search_simple(&user("u"), "budget OR content:budget", 0, 10)
            .await
            .unwrap();
        let kinds: Vec<&str> = page.results.iter().map(|r| r.payload.type_name()).collect();
        assert_eq!(page.total, 2);
        assert!(kinds.contains(&"attachment"));
        assert!(kinds.contains(&"mail"));
        let mail_result = page
            .results
            .iter()
            .find(|r| r.payload.type_name() == "mail")
            .unwrap();
        assert_eq!(
            mail_result.excerpt.as_deref(),
            Some("<span class='highlight'>budget</span> draft")
        );
    }

    #[tokio::test]
    async fn more_like_this_excludes_source_and_filters_access() {
        let f = Fixture::new();
        f.doc("s", "invoice payment overdue invoice", &["u"]).await;
        f.doc("a", "invoice overdue reminder", &["u"]).await;
        f.doc("b", "invoice payment", &[]).await;
        f.doc("c", "holiday schedule", &["u"]).await;
        f.doc("empty", "", &["u"]).await;

        let engine = f.engine(EngineSettings::default());
        let p = user("u");
        let page = engine.more_like_this(&p, "s", 10).await.unwrap();
        assert_eq!(page.uuids(), ["a"]);
        assert_eq!(page.total, 1);

        let none = engine.more_like_this(&p, "empty", 10).await.unwrap();
        assert!(none.results.is_empty());
        assert_eq!(none.total, 0);
        assert_eq!(engine.more_like_this(&p, "missing", 10).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn folders_in_depth_prunes_unreadable_subtrees() {
        let f = Fixture::new();
        f.folder("root", "", &["u"]).await;
        f.folder("a", "root", &["u"]).await;
        f.folder("a1", "a", &["u"]).await;
        f.folder("b", "root", &[]).await;
        f.folder("b1", "b", &["u"]).await;
        f.folder("c", "root", &["u"]).await;
        f.folder("a2", "a", &["u"]).await;

        let engine = f.engine(EngineSettings::default());
        let p = user("u");
        assert_eq!(
            engine.folders_in_depth(&p, "root").await.unwrap(),
            ["a", "a1", "a2", "c"]
        );
        assert!(matches!(
            engine.folders_in_depth(&p, "nope").await.unwrap_err(),
            SearchError::NotFound(_)
        ));
        assert!(matches!(
            engine.folders_in_depth(&p, "b").await.unwrap_err(),
            SearchError::AccessDenied(_)
        ));
    }

    #[tokio::test]
    async fn folder_cache_is_per_user_and_clearable() {
        let f = Fixture::new();
        f.folder("root", "", &["u", "v"]).await;
        f.folder("a", "root", &["u", "v"]).await;
        let engine = f.engine(EngineSettings {
            cache_folders: true,
            ..EngineSettings::default()
        });
        let p = user("u");
        assert_eq!(engine.folders_in_depth(&p, "root").await.unwrap(), ["a"]);

        f.folder("b", "root", &["u", "v"]).await;
        assert_eq!(engine.folders_in_depth(&p, "root").await.unwrap(), ["a"]);
        assert_eq!(engine.folders_in_depth(&user("v"), "root").await.unwrap(), ["a", "b"]);

        engine.clear_folder_cache();
        assert_eq!(engine.folders_in_depth(&p, "root").await.unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn terms_of_documents_only() {
        let f = greek().await;
        f.folder("fld", "root", &["u"]).await;
        let engine = f.engine(EngineSettings::default());
        assert_eq!(
            engine.get_terms(NodeKind::Document, "d1").await.unwrap(),
            ["alpha", "beta"]
        );
        assert!(engine.get_terms(NodeKind::Folder, "fld").await.unwrap().is_empty());
        assert!(engine.get_terms(NodeKind::Mail, "d1").await.unwrap().is_empty());
        assert!(engine.get_terms(NodeKind::Document, "zzz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keyword_lookup_from_index_or_store() {
        let f = Fixture::new();
        for (uuid, readers) in [("k1", &["u"][..]), ("k2", &[][..]), ("k3", &["u"][..])] {
            let mut node = IndexableNode::new(uuid, NodeKind::Document, uuid);
            node.keywords.insert("tax".into());
            for r in readers {
                node.user_permissions.insert(r.to_string(), 1);
            }
            f.add(node).await;
        }

        let p = user("u");
        for native in [false, true] {
            let engine = f.engine(EngineSettings {
                native_sql_lookups: native,
                ..EngineSettings::default()
            });
            let page = engine.find_by_keyword(&p, "tax").await.unwrap();
            assert_eq!(page.uuids(), ["k1", "k3"], "native={native}");
            assert!(engine.find_by_category(&p, "tax").await.unwrap().results.is_empty());
        }
    }

    #[test]
    fn top_terms_by_frequency() {
        let terms: Vec<String> = ["b", "a", "b", "c", "a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(top_terms(&terms, 2), ["b", "a"]);
    }
}
