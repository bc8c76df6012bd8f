//! Read snapshots for units of work.
//!
//! A [`SqliteUnitOfWork`] unit holds one pooled connection inside an open
//! read transaction. While the unit's work runs, every store read made from
//! the same task goes through that connection, so it sees the database as
//! of the unit's start. Writes keep their own transactions on the pool.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

use dms_search_core::collaborators::{UnitOfWork, WorkUnit};
use dms_search_core::{SearchError, SearchResult};

type Snapshot = Arc<Mutex<Transaction<'static, Sqlite>>>;

tokio::task_local! {
    static SNAPSHOT: Snapshot;
}

fn data(e: sqlx::Error) -> SearchError {
    SearchError::DataAccess(e.to_string())
}

/// Connection for one read statement: the current unit's snapshot, or a
/// fresh pooled connection outside any unit.
///
/// Hold it for a single statement only; a second `reader` call in the same
/// unit waits for it to be dropped.
pub enum Reader {
    Snapshot(OwnedMutexGuard<Transaction<'static, Sqlite>>),
    Pooled(PoolConnection<Sqlite>),
}

impl Deref for Reader {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        match self {
            Reader::Snapshot(tx) => &***tx,
            Reader::Pooled(conn) => &**conn,
        }
    }
}

impl DerefMut for Reader {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match self {
            Reader::Snapshot(tx) => &mut ***tx,
            Reader::Pooled(conn) => &mut **conn,
        }
    }
}

pub async fn reader(pool: &SqlitePool) -> Result<Reader, sqlx::Error> {
    match SNAPSHOT.try_with(Arc::clone) {
        Ok(snapshot) => Ok(Reader::Snapshot(snapshot.lock_owned().await)),
        Err(_) => Ok(Reader::Pooled(pool.acquire().await?)),
    }
}

/// One read transaction per engine or maintainer operation.
pub struct SqliteUnitOfWork {
    pool: SqlitePool,
}

impl SqliteUnitOfWork {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

struct SqliteUnit {
    snapshot: Snapshot,
}

impl SqliteUnit {
    fn into_transaction(self) -> SearchResult<Transaction<'static, Sqlite>> {
        Arc::try_unwrap(self.snapshot)
            .map(Mutex::into_inner)
            .map_err(|_| SearchError::DataAccess("unit of work still in use".into()))
    }
}

#[async_trait]
impl WorkUnit for SqliteUnit {
    fn scope<'a>(&self, work: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        Box::pin(SNAPSHOT.scope(Arc::clone(&self.snapshot), work))
    }

    async fn commit(self: Box<Self>) -> SearchResult<()> {
        let unit = *self;
        unit.into_transaction()?.commit().await.map_err(data)
    }

    async fn rollback(self: Box<Self>) {
        let unit = *self;
        match unit.into_transaction() {
            Ok(tx) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(error = %e, "rollback failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "rollback skipped"),
        }
    }
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    async fn begin(&self) -> SearchResult<Box<dyn WorkUnit>> {
        let mut tx = self.pool.begin().await.map_err(data)?;
        // A deferred transaction takes its snapshot at the first read.
        sqlx::query("SELECT 1 FROM sqlite_master LIMIT 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(data)?;
        Ok(Box::new(SqliteUnit {
            snapshot: Arc::new(Mutex::new(tx)),
        }))
    }
}
