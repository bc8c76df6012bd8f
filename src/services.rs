//! Composition root: wires the SQLite stores into the core services.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use dms_search_core::collaborators::{NodeRepository, OnDeleteHook, ProgressSink};
use dms_search_core::engine::SecuredQueryEngine;
use dms_search_core::index::SearchIndex;
use dms_search_core::maintainer::{IndexMaintainer, MaintenanceFlags, RebuildStats};
use dms_search_core::models::{NodeKind, Principal};
use dms_search_core::projection::{FieldProjector, IndexSchema, PropertyForms};
use dms_search_core::read_filter::SecurityRoles;
use dms_search_core::suggest::SuggestionIndex;
use dms_search_core::SearchResult;

use crate::config::Config;
use crate::db;
use crate::extract::DocumentExtractor;
use crate::migrate;
use crate::snapshot::SqliteUnitOfWork;
use crate::sqlite_index::SqliteIndex;
use crate::sqlite_nodes::{RepositoryDeleteHook, SqliteNodes, SubjectKind};

/// Drops cached folder traversals when a node goes away.
pub struct FolderCacheHook {
    engine: Arc<SecuredQueryEngine>,
}

#[async_trait]
impl OnDeleteHook for FolderCacheHook {
    fn name(&self) -> &str {
        "folder-cache"
    }

    async fn on_delete(&self, _uuid: &str) -> SearchResult<()> {
        self.engine.clear_folder_cache();
        Ok(())
    }
}

/// Users and roles named in node permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSubjects {
    pub users: Vec<String>,
    pub roles: Vec<String>,
}

/// Outcome of removing one subject from every node's permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    pub nodes: u64,
    pub reindexed: u64,
    pub failed: u64,
}

pub struct Services {
    pub config: Config,
    pub pool: SqlitePool,
    /// Snapshot connections of open units. Writes made inside a unit use
    /// `pool`, so a unit never waits on its own snapshot.
    uow_pool: SqlitePool,
    pub index: Arc<SqliteIndex>,
    pub nodes: Arc<SqliteNodes>,
    pub schema: Arc<IndexSchema>,
    pub projector: Arc<FieldProjector>,
    pub engine: Arc<SecuredQueryEngine>,
    pub maintainer: Arc<IndexMaintainer>,
    pub suggest: Arc<SuggestionIndex>,
    pub flags: Arc<MaintenanceFlags>,
    pub security: SecurityRoles,
}

impl Services {
    /// Connect, migrate and build every service from configuration.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool, config.index.analyzer).await?;
        let uow_pool = db::connect(config).await?;

        let analyzer = config.index.analyzer;
        let security = config.security_roles();
        let schema = Arc::new(IndexSchema::standard(PropertyForms::from_groups(
            &config.property_groups,
        )));
        let projector = Arc::new(FieldProjector::new(
            schema.clone(),
            Arc::new(DocumentExtractor),
        ));

        let index = Arc::new(SqliteIndex::new(pool.clone(), analyzer));
        let nodes = Arc::new(SqliteNodes::new(pool.clone(), security.clone()));
        let flags = Arc::new(MaintenanceFlags::new(config.maintenance.read_only));
        let uow = Arc::new(SqliteUnitOfWork::new(uow_pool.clone()));

        let engine = Arc::new(SecuredQueryEngine::new(
            index.clone(),
            nodes.clone(),
            nodes.clone(),
            uow.clone(),
            schema.clone(),
            analyzer,
            config.engine_settings(),
        ));

        let maintainer = Arc::new(
            IndexMaintainer::new(
                index.clone(),
                nodes.clone(),
                projector.clone(),
                config.maintainer_settings(),
                flags.clone(),
            )
            .with_unit_of_work(uow)
            .with_hook(Arc::new(FolderCacheHook {
                engine: engine.clone(),
            }))
            .with_hook(Arc::new(RepositoryDeleteHook::new(nodes.clone()))),
        );

        let suggest = Arc::new(SuggestionIndex::new(config.suggest_path()));

        Ok(Self {
            config: config.clone(),
            pool,
            uow_pool,
            index,
            nodes,
            schema,
            projector,
            engine,
            maintainer,
            suggest,
            flags,
            security,
        })
    }

    /// The configured system user; bypasses permission checks.
    pub fn system_principal(&self) -> Principal {
        Principal::new(self.security.system_user.clone(), Vec::<String>::new())
    }

    /// `user` with `roles`, or the system principal when no user is given.
    pub fn principal(&self, user: Option<&str>, roles: &[String]) -> Principal {
        match user {
            Some(user) => Principal::new(user, roles.iter().cloned()),
            None => self.system_principal(),
        }
    }

    /// Rebuild the index for `kinds` (all kinds when empty), then the
    /// suggestion structure. `Ok(None)` when a rebuild is already running.
    pub async fn rebuild(
        &self,
        kinds: &[NodeKind],
        progress: &dyn ProgressSink,
    ) -> SearchResult<Option<RebuildStats>> {
        let kinds: &[NodeKind] = if kinds.is_empty() { &NodeKind::ALL } else { kinds };
        let Some(stats) = self.maintainer.rebuild(kinds, progress).await? else {
            return Ok(None);
        };
        self.engine.clear_folder_cache();
        match self.suggest.build(self.index.as_ref()).await {
            Ok(terms) => info!(terms, "suggestions rebuilt"),
            Err(e) => warn!(error = %e, "suggestion rebuild failed"),
        }
        Ok(Some(stats))
    }

    pub async fn permission_subjects(&self) -> SearchResult<PermissionSubjects> {
        Ok(PermissionSubjects {
            users: self.nodes.permission_subjects(SubjectKind::User).await?,
            roles: self.nodes.permission_subjects(SubjectKind::Role).await?,
        })
    }

    /// Remove a user or role from every node's permissions and reindex the
    /// affected nodes. Callers check the read-only flag first.
    pub async fn purge_permissions(&self, kind: SubjectKind, name: &str) -> SearchResult<PurgeStats> {
        let uuids = self.nodes.purge_subject(kind, name).await?;
        let mut stats = PurgeStats {
            nodes: uuids.len() as u64,
            ..PurgeStats::default()
        };
        for uuid in &uuids {
            let node = match self.nodes.get(uuid).await {
                Ok(Some(node)) => node,
                Ok(None) => continue,
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "purged node failed to load");
                    stats.failed += 1;
                    continue;
                }
            };
            match self.maintainer.update_one(&node).await {
                Ok(()) => stats.reindexed += 1,
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "purged node failed to reindex");
                    stats.failed += 1;
                }
            }
        }
        self.engine.clear_folder_cache();
        info!(
            kind = ?kind,
            name,
            nodes = stats.nodes,
            reindexed = stats.reindexed,
            failed = stats.failed,
            "permissions purged"
        );
        Ok(stats)
    }

    /// Rebuild when the index is empty and `rebuild_on_startup` is set.
    pub async fn startup_check(&self, progress: &dyn ProgressSink) -> SearchResult<Option<RebuildStats>> {
        if !self.config.indexer.rebuild_on_startup {
            return Ok(None);
        }
        if self.index.count(None).await? > 0 {
            return Ok(None);
        }
        info!("text index is empty, rebuilding");
        self.rebuild(&[], progress).await
    }

    pub async fn close(self) {
        self.pool.close().await;
        self.uow_pool.close().await;
    }
}
