//! Keeps the text index consistent with the node store.
//!
//! Full rebuilds stream nodes in batches: each batch is loaded with bounded
//! parallelism, projected, and flushed to the index in one write before the
//! next batch is read. Flushed batches stay in the index if a later batch
//! fails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collaborators::{
    run_in_unit, NoopUnitOfWork, NodeRepository, OnDeleteHook, ProgressSink, UnitOfWork,
};
use crate::error::{SearchError, SearchResult};
use crate::index::SearchIndex;
use crate::models::{IndexableNode, NodeKind};
use crate::projection::{content_field_for, FieldProjector, IndexDocument};

/// Process-wide maintenance and read-only switches.
///
/// The write path consults [`is_read_only`](Self::is_read_only); the core
/// never enforces it on its own.
#[derive(Debug, Default)]
pub struct MaintenanceFlags {
    maintenance: AtomicBool,
    read_only: AtomicBool,
}

impl MaintenanceFlags {
    pub fn new(read_only: bool) -> Self {
        Self {
            maintenance: AtomicBool::new(false),
            read_only: AtomicBool::new(read_only),
        }
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    /// True while in maintenance mode or when statically read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst) || self.is_maintenance()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Enter maintenance mode until the guard is dropped.
    ///
    /// Returns `None` when another guard is already held; only the holder
    /// of the guard may clear the flag.
    pub fn try_enter(self: &Arc<Self>) -> Option<MaintenanceGuard> {
        self.maintenance
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(MaintenanceGuard {
            flags: Arc::clone(self),
        })
    }
}

/// Clears maintenance mode on drop.
#[must_use = "maintenance mode ends when the guard is dropped"]
pub struct MaintenanceGuard {
    flags: Arc<MaintenanceFlags>,
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.flags.maintenance.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaintainerSettings {
    /// Nodes projected per index flush.
    pub batch_size: usize,
    /// Concurrent node loads within a batch.
    pub threads: usize,
}

impl Default for MaintainerSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            threads: 4,
        }
    }
}

/// Outcome of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub total: u64,
    pub indexed: u64,
    pub failed: u64,
    pub purged: u64,
    pub batches: u64,
    pub elapsed_ms: u64,
}

pub struct IndexMaintainer {
    index: Arc<dyn SearchIndex>,
    nodes: Arc<dyn NodeRepository>,
    projector: Arc<FieldProjector>,
    hooks: Vec<Arc<dyn OnDeleteHook>>,
    uow: Arc<dyn UnitOfWork>,
    settings: MaintainerSettings,
    processed: AtomicU64,
    flags: Arc<MaintenanceFlags>,
}

impl IndexMaintainer {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        nodes: Arc<dyn NodeRepository>,
        projector: Arc<FieldProjector>,
        settings: MaintainerSettings,
        flags: Arc<MaintenanceFlags>,
    ) -> Self {
        Self {
            index,
            nodes,
            projector,
            hooks: Vec::new(),
            uow: Arc::new(NoopUnitOfWork),
            settings,
            processed: AtomicU64::new(0),
            flags,
        }
    }

    /// Register an on-delete hook. Hooks run in registration order.
    pub fn with_hook(mut self, hook: Arc<dyn OnDeleteHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Unit of work wrapping each node write and each rebuild batch.
    pub fn with_unit_of_work(mut self, uow: Arc<dyn UnitOfWork>) -> Self {
        self.uow = uow;
        self
    }

    pub fn flags(&self) -> &Arc<MaintenanceFlags> {
        &self.flags
    }

    /// Nodes processed by the current or last rebuild.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// [`reindex_all`](Self::reindex_all) inside maintenance mode.
    ///
    /// Returns `Ok(None)` without touching the index when another rebuild
    /// holds maintenance mode.
    pub async fn rebuild(
        &self,
        kinds: &[NodeKind],
        progress: &dyn ProgressSink,
    ) -> SearchResult<Option<RebuildStats>> {
        let Some(_guard) = self.flags.try_enter() else {
            warn!(kinds = ?kinds, "rebuild already running");
            return Ok(None);
        };
        self.reindex_all(kinds, progress).await.map(Some)
    }

    /// Purge and rebuild the index for `kinds`.
    pub async fn reindex_all(
        &self,
        kinds: &[NodeKind],
        progress: &dyn ProgressSink,
    ) -> SearchResult<RebuildStats> {
        let started = Instant::now();
        let batch_size = self.settings.batch_size.max(1);
        let threads = self.settings.threads.max(1);
        self.processed.store(0, Ordering::Relaxed);

        let mut stats = RebuildStats::default();
        for kind in kinds {
            stats.total += self.nodes.count(*kind).await?;
        }
        info!(kinds = ?kinds, total = stats.total, batch_size, threads, "rebuilding index");
        progress.started(stats.total);

        for kind in kinds {
            stats.purged += self.index.purge_kind(*kind).await?;

            let mut offset = 0u64;
            loop {
                let uuids = self
                    .nodes
                    .list_uuids(*kind, offset, batch_size as u64)
                    .await?;
                if uuids.is_empty() {
                    break;
                }
                offset += uuids.len() as u64;
                let batch_len = uuids.len() as u64;

                let (indexed, failed) =
                    run_in_unit(self.uow.as_ref(), || self.flush_batch(uuids, threads)).await?;
                stats.indexed += indexed;
                stats.failed += failed;
                stats.batches += 1;

                let processed = self.processed.fetch_add(batch_len, Ordering::Relaxed) + batch_len;
                progress.advanced(processed, stats.total);
            }
        }

        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        progress.finished(self.processed(), stats.failed);
        info!(
            indexed = stats.indexed,
            failed = stats.failed,
            purged = stats.purged,
            elapsed_ms = stats.elapsed_ms,
            "index rebuild finished"
        );
        Ok(stats)
    }

    /// Load, project and write one batch. Returns (indexed, failed).
    async fn flush_batch(&self, uuids: Vec<String>, threads: usize) -> SearchResult<(u64, u64)> {
        let loaded: Vec<(String, SearchResult<Option<IndexDocument>>)> = stream::iter(uuids)
            .map(|uuid| async move {
                let doc = self.load_and_project(&uuid).await;
                (uuid, doc)
            })
            .buffered(threads)
            .collect()
            .await;

        let mut failed = 0u64;
        let mut docs = Vec::with_capacity(loaded.len());
        for (uuid, result) in loaded {
            match result {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => debug!(uuid = %uuid, "node vanished during rebuild"),
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "skipping node that failed to load");
                    failed += 1;
                }
            }
        }

        self.index.upsert_batch(&docs).await?;
        Ok((docs.len() as u64, failed))
    }

    async fn load_and_project(&self, uuid: &str) -> SearchResult<Option<IndexDocument>> {
        let Some(mut node) = self.nodes.get(uuid).await? else {
            return Ok(None);
        };
        self.attach_content(&mut node).await?;
        Ok(Some(self.projector.project(&node)))
    }

    async fn attach_content(&self, node: &mut IndexableNode) -> SearchResult<()> {
        if node.content.is_none() && content_field_for(node.kind).is_some() {
            node.content = self.nodes.load_content(&node.uuid).await?;
        }
        Ok(())
    }

    /// Project and write one node, replacing any previous entry.
    pub async fn index_one(&self, node: &IndexableNode) -> SearchResult<()> {
        debug!(uuid = %node.uuid, kind = %node.kind, "index_one");
        run_in_unit(self.uow.as_ref(), || async {
            let doc = if node.content.is_none() && content_field_for(node.kind).is_some() {
                let mut loaded = node.clone();
                self.attach_content(&mut loaded).await?;
                self.projector.project(&loaded)
            } else {
                self.projector.project(node)
            };
            self.index.upsert(&doc).await
        })
        .await
    }

    pub async fn update_one(&self, node: &IndexableNode) -> SearchResult<()> {
        self.index_one(node).await
    }

    /// Load a node by uuid and index it.
    pub async fn index_uuid(&self, uuid: &str) -> SearchResult<()> {
        let node = self
            .nodes
            .get(uuid)
            .await?
            .ok_or_else(|| SearchError::NotFound(uuid.to_string()))?;
        self.index_one(&node).await
    }

    /// Run the on-delete hooks in order, then drop the index entry. A failing
    /// hook stops the removal. Returns whether an index entry existed.
    pub async fn remove_one(&self, uuid: &str) -> SearchResult<bool> {
        debug!(uuid, hooks = self.hooks.len(), "remove_one");
        run_in_unit(self.uow.as_ref(), || async {
            for hook in &self.hooks {
                hook.on_delete(uuid).await.map_err(|e| {
                    warn!(uuid, hook = hook.name(), error = %e, "on-delete hook failed");
                    e
                })?;
            }
            self.index.delete(uuid).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{NoProgress, PlainTextExtractor, WorkUnit};
    use crate::index::memory::InMemoryIndex;
    use crate::memory_nodes::InMemoryNodes;
    use crate::models::ContentSource;
    use crate::projection::{IndexSchema, PropertyForms};
    use crate::query::Query;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn projector() -> Arc<FieldProjector> {
        Arc::new(FieldProjector::new(
            Arc::new(IndexSchema::standard(PropertyForms::default())),
            Arc::new(PlainTextExtractor),
        ))
    }

    fn text_doc(uuid: &str, text: &str) -> IndexableNode {
        let mut n = IndexableNode::new(uuid, NodeKind::Document, uuid);
        n.content = Some(ContentSource::Text(text.to_string()));
        n
    }

    fn maintainer(
        index: Arc<dyn SearchIndex>,
        nodes: Arc<InMemoryNodes>,
        batch_size: usize,
    ) -> IndexMaintainer {
        IndexMaintainer::new(
            index,
            nodes,
            projector(),
            MaintainerSettings {
                batch_size,
                threads: 2,
            },
            Arc::new(MaintenanceFlags::default()),
        )
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<(u64, u64)>>,
        finished: Mutex<Option<(u64, u64)>>,
    }

    impl ProgressSink for RecordingProgress {
        fn advanced(&self, processed: u64, total: u64) {
            self.events.lock().push((processed, total));
        }

        fn finished(&self, processed: u64, failed: u64) {
            *self.finished.lock() = Some((processed, failed));
        }
    }

    #[tokio::test]
    async fn extraction_failure_still_indexes_every_node() {
        let nodes = Arc::new(InMemoryNodes::default());
        nodes.insert(text_doc("a", "alpha"));
        let mut broken = IndexableNode::new("b", NodeKind::Document, "b.pdf");
        broken.content = Some(ContentSource::Binary {
            data: b"%PDF-garbage".to_vec(),
            mime_type: "application/pdf".into(),
        });
        nodes.insert(broken);
        nodes.insert(text_doc("c", "gamma"));

        let index = Arc::new(InMemoryIndex::default());
        let m = maintainer(index.clone(), nodes, 25);
        let stats = m.reindex_all(&[NodeKind::Document], &NoProgress).await.unwrap();

        assert_eq!(stats.indexed, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(index.count(None).await.unwrap(), 3);
        let b = index.document("b").await.unwrap().unwrap();
        assert!(b.values("text").is_empty());
        assert_eq!(b.first("name"), Some("b.pdf"));
    }

    #[tokio::test]
    async fn batches_flush_and_report_progress() {
        let nodes = Arc::new(InMemoryNodes::default());
        for i in 0..5 {
            nodes.insert(text_doc(&format!("d{i}"), "text"));
        }
        let index = Arc::new(InMemoryIndex::default());
        let m = maintainer(index.clone(), nodes, 2);
        let progress = RecordingProgress::default();

        let stats = m.reindex_all(&[NodeKind::Document], &progress).await.unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(*progress.events.lock(), vec![(2, 5), (4, 5), (5, 5)]);
        assert_eq!(*progress.finished.lock(), Some((5, 0)));
        assert_eq!(m.processed(), 5);
    }

    #[tokio::test]
    async fn rebuild_purges_stale_entries() {
        let nodes = Arc::new(InMemoryNodes::default());
        nodes.insert(text_doc("live", "alpha"));
        let index = Arc::new(InMemoryIndex::default());
        let m = maintainer(index.clone(), nodes.clone(), 25);

        m.index_one(&text_doc("gone", "alpha")).await.unwrap();
        let stats = m.reindex_all(&[NodeKind::Document], &NoProgress).await.unwrap();
        assert_eq!(stats.purged, 1);
        assert!(index.document("gone").await.unwrap().is_none());
        assert!(index.document("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn index_one_is_idempotent() {
        let nodes = Arc::new(InMemoryNodes::default());
        let index = Arc::new(InMemoryIndex::default());
        let m = maintainer(index.clone(), nodes, 25);
        let node = text_doc("a", "alpha beta");

        m.index_one(&node).await.unwrap();
        let once = index.document("a").await.unwrap();
        m.index_one(&node).await.unwrap();
        assert_eq!(index.count(None).await.unwrap(), 1);
        assert_eq!(index.document("a").await.unwrap(), once);
    }

    #[tokio::test]
    async fn index_one_loads_content_when_missing() {
        let nodes = Arc::new(InMemoryNodes::default());
        nodes.insert(text_doc("a", "stored body"));
        let index = Arc::new(InMemoryIndex::default());
        let m = maintainer(index.clone(), nodes, 25);

        m.index_uuid("a").await.unwrap();
        assert_eq!(
            index.document("a").await.unwrap().unwrap().first("text"),
            Some("stored body")
        );
        assert!(matches!(
            m.index_uuid("missing").await.unwrap_err(),
            SearchError::NotFound(_)
        ));
    }

    struct Hook {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl OnDeleteHook for Hook {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_delete(&self, uuid: &str) -> SearchResult<()> {
            self.log.lock().push(format!("{}:{}", self.name, uuid));
            if self.fail {
                Err(SearchError::DataAccess("busy".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn remove_runs_hooks_in_order_and_stops_on_failure() {
        let nodes = Arc::new(InMemoryNodes::default());
        let index = Arc::new(InMemoryIndex::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let hook = |name, fail| -> Arc<dyn OnDeleteHook> {
            Arc::new(Hook {
                name,
                log: log.clone(),
                fail,
            })
        };

        let m = maintainer(index.clone(), nodes.clone(), 25)
            .with_hook(hook("bookmarks", false))
            .with_hook(hook("cache", false));
        m.index_one(&text_doc("a", "x")).await.unwrap();
        assert!(m.remove_one("a").await.unwrap());
        assert!(!m.remove_one("a").await.unwrap());
        assert_eq!(log.lock()[..2], ["bookmarks:a", "cache:a"]);

        let failing = maintainer(index.clone(), nodes, 25)
            .with_hook(hook("locks", true))
            .with_hook(hook("never", false));
        failing.index_one(&text_doc("b", "x")).await.unwrap();
        assert!(failing.remove_one("b").await.is_err());
        assert!(index.document("b").await.unwrap().is_some());
        assert!(!log.lock().iter().any(|e| e.starts_with("never")));
    }

    /// Fails every flush after the first `ok_flushes`.
    struct FlakyIndex {
        inner: InMemoryIndex,
        ok_flushes: usize,
        flushes: AtomicUsize,
    }

    #[async_trait]
    impl SearchIndex for FlakyIndex {
        async fn upsert_batch(&self, docs: &[IndexDocument]) -> SearchResult<()> {
            if self.flushes.fetch_add(1, Ordering::SeqCst) >= self.ok_flushes {
                return Err(SearchError::IndexIo("disk full".into()));
            }
            self.inner.upsert_batch(docs).await
        }

        async fn delete(&self, uuid: &str) -> SearchResult<bool> {
            self.inner.delete(uuid).await
        }

        async fn purge_kind(&self, kind: NodeKind) -> SearchResult<u64> {
            self.inner.purge_kind(kind).await
        }

        async fn search(&self, query: &Query, offset: u64, limit: u64) -> SearchResult<Vec<crate::index::IndexHit>> {
            self.inner.search(query, offset, limit).await
        }

        async fn document(&self, uuid: &str) -> SearchResult<Option<IndexDocument>> {
            self.inner.document(uuid).await
        }

        async fn count(&self, kind: Option<NodeKind>) -> SearchResult<u64> {
            self.inner.count(kind).await
        }

        async fn field_values(&self, field: &str, offset: u64, limit: u64) -> SearchResult<Vec<String>> {
            self.inner.field_values(field, offset, limit).await
        }
    }

    #[tokio::test]
    async fn index_failure_aborts_but_keeps_flushed_batches() {
        let nodes = Arc::new(InMemoryNodes::default());
        for i in 0..6 {
            nodes.insert(text_doc(&format!("d{i}"), "text"));
        }
        let index = Arc::new(FlakyIndex {
            inner: InMemoryIndex::default(),
            ok_flushes: 1,
            flushes: AtomicUsize::new(0),
        });
        let m = maintainer(index.clone(), nodes, 2);

        let err = m.reindex_all(&[NodeKind::Document], &NoProgress).await.unwrap_err();
        assert!(matches!(err, SearchError::IndexIo(_)));
        assert_eq!(index.count(None).await.unwrap(), 2);
        assert_eq!(m.processed(), 2);
    }

    #[tokio::test]
    async fn rebuild_holds_maintenance_mode() {
        let flags = Arc::new(MaintenanceFlags::new(false));
        assert!(!flags.is_read_only());
        {
            let _guard = flags.try_enter().unwrap();
            assert!(flags.is_maintenance());
            assert!(flags.is_read_only());
        }
        assert!(!flags.is_read_only());
        flags.set_read_only(true);
        assert!(flags.is_read_only());
        assert!(!flags.is_maintenance());

        let nodes = Arc::new(InMemoryNodes::default());
        let m = maintainer(Arc::new(InMemoryIndex::default()), nodes, 25);
        assert!(m.rebuild(&NodeKind::ALL, &NoProgress).await.unwrap().is_some());
        assert!(!m.flags().is_maintenance());
    }

    #[derive(Default)]
    struct CommitLog {
        commits: Arc<AtomicUsize>,
    }

    struct LoggedUnit {
        commits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkUnit for LoggedUnit {
        async fn commit(self: Box<Self>) -> SearchResult<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(self: Box<Self>) {}
    }

    #[async_trait]
    impl UnitOfWork for CommitLog {
        async fn begin(&self) -> SearchResult<Box<dyn WorkUnit>> {
            Ok(Box::new(LoggedUnit {
                commits: self.commits.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn writes_and_batches_run_in_units() {
        let nodes = Arc::new(InMemoryNodes::default());
        for i in 0..5 {
            nodes.insert(text_doc(&format!("d{i}"), "text"));
        }
        let log = Arc::new(CommitLog::default());
        let m = maintainer(Arc::new(InMemoryIndex::default()), nodes, 2)
            .with_unit_of_work(log.clone());

        let stats = m.reindex_all(&[NodeKind::Document], &NoProgress).await.unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(log.commits.load(Ordering::SeqCst), 3);

        m.index_one(&text_doc("d9", "more")).await.unwrap();
        assert!(m.remove_one("d9").await.unwrap());
        assert_eq!(log.commits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn second_guard_is_refused_while_one_is_held() {
        let flags = Arc::new(MaintenanceFlags::new(false));
        let first = flags.try_enter().unwrap();
        assert!(flags.try_enter().is_none());
        assert!(flags.is_maintenance());

        drop(first);
        assert!(!flags.is_maintenance());
        let again = flags.try_enter();
        assert!(again.is_some());
        assert!(flags.is_read_only());
    }

    #[tokio::test]
    async fn rebuild_is_refused_while_maintenance_is_held() {
        let nodes = Arc::new(InMemoryNodes::default());
        nodes.insert(text_doc("d1", "alpha"));
        let index = Arc::new(InMemoryIndex::default());
        let m = maintainer(index.clone(), nodes, 25);

        let guard = m.flags().try_enter().unwrap();
        assert!(m.rebuild(&NodeKind::ALL, &NoProgress).await.unwrap().is_none());
        assert_eq!(index.count(None).await.unwrap(), 0);
        assert!(m.flags().is_maintenance());

        drop(guard);
        let stats = m.rebuild(&NodeKind::ALL, &NoProgress).await.unwrap().unwrap();
        assert_eq!(stats.indexed, 1);
        assert!(!m.flags().is_maintenance());
    }
}
