//! SQLite-backed node store.
//!
//! Implements the core's [`NodeRepository`] and [`AccessDecision`] over the
//! node tables, plus the write operations used by import, node removal and
//! permission purges. Reads go through the current unit's snapshot when one
//! is open.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use dms_search_core::collaborators::{
    AccessDecision, NodeRepository, OnDeleteHook, TagField,
};
use dms_search_core::models::{
    ContentSource, IndexableNode, NodeKind, NodeProperty, Permission, Principal,
};
use dms_search_core::read_filter::SecurityRoles;
use dms_search_core::{SearchError, SearchResult};

use crate::snapshot::{reader, Reader};

fn data(e: sqlx::Error) -> SearchError {
    SearchError::DataAccess(e.to_string())
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Hex-encoded SHA-256 of stored content.
pub fn content_hash(content: &ContentSource) -> String {
    let mut hasher = Sha256::new();
    match content {
        ContentSource::Text(text) => hasher.update(text.as_bytes()),
        ContentSource::Binary { data, .. } => hasher.update(data),
    }
    hex::encode(hasher.finalize())
}

pub struct SqliteNodes {
    pool: SqlitePool,
    security: SecurityRoles,
}

impl SqliteNodes {
    pub fn new(pool: SqlitePool, security: SecurityRoles) -> Self {
        Self { pool, security }
    }

    /// Connection for one read, inside the current unit's snapshot if any.
    async fn conn(&self) -> SearchResult<Reader> {
        reader(&self.pool).await.map_err(data)
    }

    async fn strings(&self, sql: &str, uuid: &str) -> SearchResult<BTreeSet<String>> {
        let values: Vec<String> = sqlx::query_scalar(sql)
            .bind(uuid)
            .fetch_all(&mut *self.conn().await?)
            .await
            .map_err(data)?;
        Ok(values.into_iter().collect())
    }

    async fn masks(&self, sql: &str, uuid: &str) -> SearchResult<BTreeMap<String, u32>> {
        let rows = sqlx::query(sql)
            .bind(uuid)
            .fetch_all(&mut *self.conn().await?)
            .await
            .map_err(data)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1) as u32))
            .collect())
    }

    async fn hydrate(&self, row: SqliteRow) -> SearchResult<IndexableNode> {
        let uuid: String = row.get("uuid");
        let kind: String = row.get("kind");
        let kind: NodeKind = kind.parse().map_err(SearchError::DataAccess)?;

        let mut node = IndexableNode::new(uuid.clone(), kind, row.get::<String, _>("name"));
        node.parent = row.get("parent");
        node.author = row.get("author");
        node.created = timestamp(row.get("created"));
        node.last_modified = timestamp(row.get("last_modified"));
        node.title = row.get("title");
        node.mime_type = row.get("mime_type");
        node.subject = row.get("subject");
        node.from = row.get("mail_from");

        node.user_permissions = self
            .masks("SELECT principal, mask FROM node_user_permissions WHERE uuid = ?", &uuid)
            .await?;
        node.role_permissions = self
            .masks("SELECT role, mask FROM node_role_permissions WHERE uuid = ?", &uuid)
            .await?;
        node.keywords = self
            .strings("SELECT keyword FROM node_keywords WHERE uuid = ?", &uuid)
            .await?;
        node.categories = self
            .strings("SELECT category FROM node_categories WHERE uuid = ?", &uuid)
            .await?;
        node.subscriptors = self
            .strings("SELECT principal FROM node_subscriptors WHERE uuid = ?", &uuid)
            .await?;
        node.to = self
            .strings("SELECT address FROM mail_recipients WHERE uuid = ?", &uuid)
            .await?;

        let props = sqlx::query(
            "SELECT grp, name, value FROM node_properties WHERE uuid = ? ORDER BY grp, name",
        )
        .bind(&uuid)
        .fetch_all(&mut *self.conn().await?)
        .await
        .map_err(data)?;
        node.properties = props
            .into_iter()
            .map(|row| NodeProperty {
                group: row.get("grp"),
                name: row.get("name"),
                value: row.get("value"),
            })
            .collect();

        Ok(node)
    }

    /// Insert or replace a node with all of its sets and its content.
    pub async fn save(&self, node: &IndexableNode) -> SearchResult<()> {
        let mut tx = self.pool.begin().await.map_err(data)?;

        let (text, blob, mime) = match &node.content {
            Some(ContentSource::Text(text)) => (Some(text.as_str()), None, node.mime_type.clone()),
            Some(ContentSource::Binary { data, mime_type }) => {
                (None, Some(data.as_slice()), Some(mime_type.clone()))
            }
            None => (None, None, node.mime_type.clone()),
        };
        let hash = node.content.as_ref().map(content_hash);

        sqlx::query(
            r#"
            INSERT INTO nodes (uuid, parent, kind, name, author, created, last_modified,
                               title, mime_type, subject, mail_from,
                               content_text, content_blob, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uuid) DO UPDATE SET
                parent = excluded.parent,
                kind = excluded.kind,
                name = excluded.name,
                author = excluded.author,
                last_modified = excluded.last_modified,
                title = excluded.title,
                mime_type = excluded.mime_type,
                subject = excluded.subject,
                mail_from = excluded.mail_from,
                content_text = excluded.content_text,
                content_blob = excluded.content_blob,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(&node.uuid)
        .bind(&node.parent)
        .bind(node.kind.as_str())
        .bind(&node.name)
        .bind(&node.author)
        .bind(node.created.timestamp())
        .bind(node.last_modified.timestamp())
        .bind(&node.title)
        .bind(&mime)
        .bind(&node.subject)
        .bind(&node.from)
        .bind(text)
        .bind(blob)
        .bind(&hash)
        .execute(&mut *tx)
        .await
        .map_err(data)?;

        replace_sets(&mut tx, node).await.map_err(data)?;
        tx.commit().await.map_err(data)?;
        debug!(uuid = %node.uuid, kind = %node.kind, "node saved");
        Ok(())
    }

    /// Delete a node and its dependent rows. Returns whether it existed.
    pub async fn delete(&self, uuid: &str) -> SearchResult<bool> {
        let mut tx = self.pool.begin().await.map_err(data)?;
        for table in CHILD_TABLES {
            sqlx::query(&format!("DELETE FROM {} WHERE uuid = ?", table))
                .bind(uuid)
                .execute(&mut *tx)
                .await
                .map_err(data)?;
        }
        let removed = sqlx::query("DELETE FROM nodes WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(data)?
            .rows_affected();
        tx.commit().await.map_err(data)?;
        Ok(removed > 0)
    }

    /// Stored content hash, used to skip unchanged files on import.
    pub async fn stored_hash(&self, uuid: &str) -> SearchResult<Option<String>> {
        let hash: Option<Option<String>> =
            sqlx::query_scalar("SELECT content_hash FROM nodes WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(&mut *self.conn().await?)
                .await
                .map_err(data)?;
        Ok(hash.flatten())
    }

    /// Uuid of the child of `parent` named `name`, if any.
    pub async fn child_named(&self, parent: Option<&str>, name: &str) -> SearchResult<Option<String>> {
        sqlx::query_scalar("SELECT uuid FROM nodes WHERE parent IS ? AND name = ? ORDER BY rowid LIMIT 1")
            .bind(parent)
            .bind(name)
            .fetch_optional(&mut *self.conn().await?)
            .await
            .map_err(data)
    }

    /// Distinct subjects of `kind` named in any node's permissions, sorted.
    pub async fn permission_subjects(&self, kind: SubjectKind) -> SearchResult<Vec<String>> {
        let (table, column) = kind.table();
        let sql = format!("SELECT DISTINCT {column} FROM {table} ORDER BY {column}");
        sqlx::query_scalar(&sql)
            .fetch_all(&mut *self.conn().await?)
            .await
            .map_err(data)
    }

    /// Remove `name` from the permissions of every node. Returns the uuids
    /// of the affected nodes in storage order.
    pub async fn purge_subject(&self, kind: SubjectKind, name: &str) -> SearchResult<Vec<String>> {
        let (table, column) = kind.table();
        let mut tx = self.pool.begin().await.map_err(data)?;
        let uuids: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT p.uuid FROM {table} p JOIN nodes n ON n.uuid = p.uuid WHERE p.{column} = ? ORDER BY n.rowid"
        ))
        .bind(name)
        .fetch_all(&mut *tx)
        .await
        .map_err(data)?;
        sqlx::query(&format!("DELETE FROM {table} WHERE {column} = ?"))
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(data)?;
        tx.commit().await.map_err(data)?;
        debug!(kind = ?kind, name, nodes = uuids.len(), "permission subject purged");
        Ok(uuids)
    }
}

/// Whose grants a permission row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Role,
}

impl SubjectKind {
    fn table(&self) -> (&'static str, &'static str) {
        match self {
            SubjectKind::User => ("node_user_permissions", "principal"),
            SubjectKind::Role => ("node_role_permissions", "role"),
        }
    }
}

const CHILD_TABLES: [&str; 7] = [
    "node_user_permissions",
    "node_role_permissions",
    "node_keywords",
    "node_categories",
    "node_subscriptors",
    "node_properties",
    "mail_recipients",
];

async fn replace_sets(
    tx: &mut Transaction<'static, Sqlite>,
    node: &IndexableNode,
) -> Result<(), sqlx::Error> {
    for table in CHILD_TABLES {
        sqlx::query(&format!("DELETE FROM {} WHERE uuid = ?", table))
            .bind(&node.uuid)
            .execute(&mut **tx)
            .await?;
    }

    for (principal, mask) in &node.user_permissions {
        sqlx::query("INSERT INTO node_user_permissions (uuid, principal, mask) VALUES (?, ?, ?)")
            .bind(&node.uuid)
            .bind(principal)
            .bind(i64::from(*mask))
            .execute(&mut **tx)
            .await?;
    }
    for (role, mask) in &node.role_permissions {
        sqlx::query("INSERT INTO node_role_permissions (uuid, role, mask) VALUES (?, ?, ?)")
            .bind(&node.uuid)
            .bind(role)
            .bind(i64::from(*mask))
            .execute(&mut **tx)
            .await?;
    }

    let sets: [(&str, &BTreeSet<String>); 4] = [
        ("INSERT INTO node_keywords (uuid, keyword) VALUES (?, ?)", &node.keywords),
        ("INSERT INTO node_categories (uuid, category) VALUES (?, ?)", &node.categories),
        ("INSERT INTO node_subscriptors (uuid, principal) VALUES (?, ?)", &node.subscriptors),
        ("INSERT INTO mail_recipients (uuid, address) VALUES (?, ?)", &node.to),
    ];
    for (sql, values) in sets {
        for value in values {
            sqlx::query(sql)
                .bind(&node.uuid)
                .bind(value)
                .execute(&mut **tx)
                .await?;
        }
    }

    for prop in &node.properties {
        sqlx::query(
            r#"
            INSERT INTO node_properties (uuid, grp, name, value) VALUES (?, ?, ?, ?)
            ON CONFLICT(uuid, grp, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&node.uuid)
        .bind(&prop.group)
        .bind(&prop.name)
        .bind(&prop.value)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl NodeRepository for SqliteNodes {
    async fn get(&self, uuid: &str) -> SearchResult<Option<IndexableNode>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *self.conn().await?)
            .await
            .map_err(data)?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn load_content(&self, uuid: &str) -> SearchResult<Option<ContentSource>> {
        let row = sqlx::query("SELECT content_text, content_blob, mime_type FROM nodes WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *self.conn().await?)
            .await
            .map_err(data)?;
        let Some(row) = row else {
            return Ok(None);
        };

        if let Some(text) = row.get::<Option<String>, _>("content_text") {
            return Ok(Some(ContentSource::Text(text)));
        }
        Ok(row
            .get::<Option<Vec<u8>>, _>("content_blob")
            .map(|data| ContentSource::Binary {
                data,
                mime_type: row
                    .get::<Option<String>, _>("mime_type")
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            }))
    }

    async fn count(&self, kind: NodeKind) -> SearchResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&mut *self.conn().await?)
            .await
            .map_err(data)?;
        Ok(n as u64)
    }

    async fn list_uuids(&self, kind: NodeKind, offset: u64, limit: u64) -> SearchResult<Vec<String>> {
        sqlx::query_scalar("SELECT uuid FROM nodes WHERE kind = ? ORDER BY rowid LIMIT ? OFFSET ?")
            .bind(kind.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&mut *self.conn().await?)
            .await
            .map_err(data)
    }

    async fn child_folders(&self, parent: &str) -> SearchResult<Vec<IndexableNode>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE parent = ? AND kind = 'folder' ORDER BY rowid")
            .bind(parent)
            .fetch_all(&mut *self.conn().await?)
            .await
            .map_err(data)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }

    async fn tagged(&self, field: TagField, value: &str) -> SearchResult<Vec<String>> {
        let sql = match field {
            TagField::Category => {
                "SELECT c.uuid FROM node_categories c JOIN nodes n ON n.uuid = c.uuid WHERE c.category = ? ORDER BY n.rowid"
            }
            TagField::Keyword => {
                "SELECT k.uuid FROM node_keywords k JOIN nodes n ON n.uuid = k.uuid WHERE k.keyword = ? ORDER BY n.rowid"
            }
        };
        sqlx::query_scalar(sql)
            .bind(value)
            .fetch_all(&mut *self.conn().await?)
            .await
            .map_err(data)
    }
}

#[async_trait]
impl AccessDecision for SqliteNodes {
    /// Reads the permission rows as currently stored, not the caller's copy.
    async fn is_granted(
        &self,
        principal: &Principal,
        node: &IndexableNode,
        permission: Permission,
    ) -> SearchResult<bool> {
        if self.security.is_superuser(principal) {
            return Ok(true);
        }

        let user_mask: Option<i64> = sqlx::query_scalar(
            "SELECT mask FROM node_user_permissions WHERE uuid = ? AND principal = ?",
        )
        .bind(&node.uuid)
        .bind(&principal.user)
        .fetch_optional(&mut *self.conn().await?)
        .await
        .map_err(data)?;
        if user_mask.is_some_and(|mask| permission.is_set(mask as u32)) {
            return Ok(true);
        }

        let roles = self
            .masks("SELECT role, mask FROM node_role_permissions WHERE uuid = ?", &node.uuid)
            .await?;
        Ok(principal
            .roles
            .iter()
            .any(|role| roles.get(role).is_some_and(|mask| permission.is_set(*mask))))
    }
}

/// Deletes the node row when a node is removed.
pub struct RepositoryDeleteHook {
    nodes: Arc<SqliteNodes>,
}

impl RepositoryDeleteHook {
    pub fn new(nodes: Arc<SqliteNodes>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl OnDeleteHook for RepositoryDeleteHook {
    fn name(&self) -> &str {
        "repository"
    }

    async fn on_delete(&self, uuid: &str) -> SearchResult<()> {
        if !self.nodes.delete(uuid).await? {
            debug!(uuid, "no node row to delete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate;
    use dms_search_core::analyzer::Analyzer;
    use dms_search_core::models::ALL_PERMISSIONS;
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqliteNodes {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{}",
            dir.path().join("nodes.sqlite").display()
        ))
        .unwrap()
        .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        migrate(&pool, Analyzer::Standard).await.unwrap();
        SqliteNodes::new(pool, SecurityRoles::default())
    }

    fn mail() -> IndexableNode {
        let mut node = IndexableNode::new("m1", NodeKind::Mail, "Quarterly");
        node.parent = Some("f1".into());
        node.subject = Some("Quarterly numbers".into());
        node.from = Some("alice@example.com".into());
        node.to.insert("bob@example.com".into());
        node.keywords.insert("finance".into());
        node.categories.insert("cat-1".into());
        node.user_permissions.insert("alice".into(), ALL_PERMISSIONS);
        node.role_permissions.insert("ROLE_USER".into(), Permission::Read.bit());
        node.properties.push(NodeProperty {
            group: "okg:mail".into(),
            name: "okp:mail.priority".into(),
            value: "high".into(),
        });
        node.content = Some(ContentSource::Text("Numbers are up.".into()));
        node
    }

    #[tokio::test]
    async fn save_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let nodes = store(&dir).await;
        let original = mail();
        nodes.save(&original).await.unwrap();

        let loaded = nodes.get("m1").await.unwrap().unwrap();
        assert_eq!(loaded.subject, original.subject);
        assert_eq!(loaded.to, original.to);
        assert_eq!(loaded.keywords, original.keywords);
        assert_eq!(loaded.user_permissions, original.user_permissions);
        assert_eq!(loaded.properties, original.properties);
        assert!(loaded.content.is_none());
        assert_eq!(
            nodes.load_content("m1").await.unwrap(),
            Some(ContentSource::Text("Numbers are up.".into()))
        );
        assert_eq!(
            nodes.stored_hash("m1").await.unwrap(),
            original.content.as_ref().map(content_hash)
        );
    }

    #[tokio::test]
    async fn lookups_by_kind_parent_and_tag() {
        let dir = TempDir::new().unwrap();
        let nodes = store(&dir).await;
        let root = IndexableNode::new("f1", NodeKind::Folder, "root");
        let mut child = IndexableNode::new("f2", NodeKind::Folder, "child");
        child.parent = Some("f1".into());
        nodes.save(&root).await.unwrap();
        nodes.save(&child).await.unwrap();
        nodes.save(&mail()).await.unwrap();

        assert_eq!(nodes.count(NodeKind::Folder).await.unwrap(), 2);
        assert_eq!(nodes.list_uuids(NodeKind::Folder, 1, 10).await.unwrap(), ["f2"]);
        let children = nodes.child_folders("f1").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].uuid, "f2");
        assert_eq!(nodes.tagged(TagField::Keyword, "finance").await.unwrap(), ["m1"]);
        assert_eq!(nodes.child_named(None, "root").await.unwrap().as_deref(), Some("f1"));
        assert_eq!(nodes.child_named(Some("f1"), "child").await.unwrap().as_deref(), Some("f2"));
    }

    #[tokio::test]
    async fn access_uses_stored_permissions() {
        let dir = TempDir::new().unwrap();
        let nodes = store(&dir).await;
        let node = mail();
        nodes.save(&node).await.unwrap();

        let alice = Principal::new("alice", Vec::<String>::new());
        let user = Principal::new("carol", ["ROLE_USER"]);
        let stranger = Principal::new("mallory", ["ROLE_GUEST"]);
        let admin = Principal::new("root", ["ROLE_ADMIN"]);

        assert!(nodes.is_granted(&alice, &node, Permission::Delete).await.unwrap());
        assert!(nodes.is_granted(&user, &node, Permission::Read).await.unwrap());
        assert!(!nodes.is_granted(&user, &node, Permission::Write).await.unwrap());
        assert!(!nodes.is_granted(&stranger, &node, Permission::Read).await.unwrap());
        assert!(nodes.is_granted(&admin, &node, Permission::Security).await.unwrap());

        let mut revoked = node.clone();
        revoked.role_permissions.clear();
        nodes.save(&revoked).await.unwrap();
        // The caller's stale copy still lists the role; the store does not.
        assert!(!nodes.is_granted(&user, &node, Permission::Read).await.unwrap());
    }

    #[tokio::test]
    async fn purge_subject_strips_grants_from_every_node() {
        let dir = TempDir::new().unwrap();
        let nodes = store(&dir).await;
        nodes.save(&mail()).await.unwrap();
        let mut folder = IndexableNode::new("f1", NodeKind::Folder, "Inbox");
        folder.user_permissions.insert("alice".into(), Permission::Read.bit());
        folder.user_permissions.insert("carol".into(), Permission::Read.bit());
        nodes.save(&folder).await.unwrap();

        assert_eq!(
            nodes.permission_subjects(SubjectKind::User).await.unwrap(),
            ["alice", "carol"]
        );
        assert_eq!(
            nodes.permission_subjects(SubjectKind::Role).await.unwrap(),
            ["ROLE_USER"]
        );

        let affected = nodes.purge_subject(SubjectKind::User, "alice").await.unwrap();
        assert_eq!(affected, ["m1", "f1"]);
        assert_eq!(nodes.permission_subjects(SubjectKind::User).await.unwrap(), ["carol"]);
        let m1 = nodes.get("m1").await.unwrap().unwrap();
        assert!(m1.user_permissions.is_empty());
        assert_eq!(m1.role_permissions.get("ROLE_USER"), Some(&Permission::Read.bit()));

        assert!(nodes.purge_subject(SubjectKind::Role, "ROLE_NONE").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_dependents() {
        let dir = TempDir::new().unwrap();
        let nodes = store(&dir).await;
        nodes.save(&mail()).await.unwrap();

        assert!(nodes.delete("m1").await.unwrap());
        assert!(!nodes.delete("m1").await.unwrap());
        assert!(nodes.get("m1").await.unwrap().is_none());
        assert!(nodes.tagged(TagField::Keyword, "finance").await.unwrap().is_empty());
    }
}
