//! Interfaces of the services the core calls into.
//!
//! The relational store, the access-control oracle, the transaction
//! boundary and the text extractor all live outside the core. They are
//! injected as trait objects by the composition root.

use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{SearchError, SearchResult};
use crate::models::{ContentSource, IndexableNode, NodeKind, Permission, Principal};

/// Authoritative permission check.
#[async_trait]
pub trait AccessDecision: Send + Sync {
    async fn is_granted(
        &self,
        principal: &Principal,
        node: &IndexableNode,
        permission: Permission,
    ) -> SearchResult<bool>;
}

/// Classification sets that can be looked up without the text index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagField {
    Category,
    Keyword,
}

impl TagField {
    /// Index field holding the same values.
    pub fn index_field(&self) -> &'static str {
        match self {
            TagField::Category => "category",
            TagField::Keyword => "keyword",
        }
    }
}

/// Read access to the relational node store.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Node metadata, without content.
    async fn get(&self, uuid: &str) -> SearchResult<Option<IndexableNode>>;

    /// Raw content of a document or mail, if any.
    async fn load_content(&self, uuid: &str) -> SearchResult<Option<ContentSource>>;

    /// Number of live nodes of `kind`.
    async fn count(&self, kind: NodeKind) -> SearchResult<u64>;

    /// A stable-ordered slice of node uuids of `kind`.
    async fn list_uuids(&self, kind: NodeKind, offset: u64, limit: u64)
        -> SearchResult<Vec<String>>;

    /// Direct folder children of `parent`.
    async fn child_folders(&self, parent: &str) -> SearchResult<Vec<IndexableNode>>;

    /// Uuids of nodes carrying `value` in the given classification set.
    async fn tagged(&self, field: TagField, value: &str) -> SearchResult<Vec<String>>;
}

/// Transactional session boundary.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> SearchResult<Box<dyn WorkUnit>>;
}

/// An open unit of work. Dropping it without commit discards it.
#[async_trait]
pub trait WorkUnit: Send {
    /// Run `work` against this unit's read view. Stores whose reads are
    /// not tied to a session run it unchanged.
    fn scope<'a>(&self, work: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        work
    }

    async fn commit(self: Box<Self>) -> SearchResult<()>;
    async fn rollback(self: Box<Self>);
}

/// Unit of work for collaborators without transactions.
pub struct NoopUnitOfWork;

struct NoopUnit;

#[async_trait]
impl WorkUnit for NoopUnit {
    async fn commit(self: Box<Self>) -> SearchResult<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}

#[async_trait]
impl UnitOfWork for NoopUnitOfWork {
    async fn begin(&self) -> SearchResult<Box<dyn WorkUnit>> {
        Ok(Box::new(NoopUnit))
    }
}

/// Run `op` inside a unit of work: commit on success, roll back on error.
///
/// Every read `op` makes goes through the unit's read view, so it observes
/// one consistent state of the store.
pub async fn run_in_unit<T, F, Fut>(uow: &dyn UnitOfWork, op: F) -> SearchResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SearchResult<T>> + Send,
    T: Send,
{
    let unit = uow.begin().await?;
    let work = op();
    let mut outcome = None;
    unit.scope(Box::pin(async {
        outcome = Some(work.await);
    }))
    .await;
    match outcome {
        Some(Ok(value)) => {
            unit.commit().await?;
            Ok(value)
        }
        Some(Err(e)) => {
            unit.rollback().await;
            Err(e)
        }
        None => {
            unit.rollback().await;
            Err(SearchError::DataAccess("unit of work did not run its work".into()))
        }
    }
}

/// Converts binary content to plain text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, data: &[u8], mime_type: &str) -> SearchResult<String>;
}

/// Extractor that only understands `text/*` payloads.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, data: &[u8], mime_type: &str) -> SearchResult<String> {
        if mime_type.starts_with("text/") {
            String::from_utf8(data.to_vec())
                .map_err(|e| SearchError::ExtractionFailure(e.to_string()))
        } else {
            Err(SearchError::ExtractionFailure(format!(
                "unsupported content-type: {}",
                mime_type
            )))
        }
    }
}

/// Collaborator invoked, in registration order, before a node leaves the index.
#[async_trait]
pub trait OnDeleteHook: Send + Sync {
    fn name(&self) -> &str;
    async fn on_delete(&self, uuid: &str) -> SearchResult<()>;
}

/// Observer of long-running rebuilds.
pub trait ProgressSink: Send + Sync {
    fn started(&self, _total: u64) {}
    fn advanced(&self, processed: u64, total: u64);
    fn finished(&self, _processed: u64, _failed: u64) {}
}

/// Sink that ignores every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn advanced(&self, _processed: u64, _total: u64) {}
}
