use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

use dms_search_core::analyzer::Analyzer;

use crate::config::Config;
use crate::db;

const NODE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        uuid TEXT PRIMARY KEY,
        parent TEXT,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        author TEXT,
        created INTEGER NOT NULL,
        last_modified INTEGER NOT NULL,
        title TEXT,
        mime_type TEXT,
        subject TEXT,
        mail_from TEXT,
        content_text TEXT,
        content_blob BLOB,
        content_hash TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_user_permissions (
        uuid TEXT NOT NULL REFERENCES nodes(uuid) ON DELETE CASCADE,
        principal TEXT NOT NULL,
        mask INTEGER NOT NULL,
        PRIMARY KEY (uuid, principal)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_role_permissions (
        uuid TEXT NOT NULL REFERENCES nodes(uuid) ON DELETE CASCADE,
        role TEXT NOT NULL,
        mask INTEGER NOT NULL,
        PRIMARY KEY (uuid, role)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_keywords (
        uuid TEXT NOT NULL REFERENCES nodes(uuid) ON DELETE CASCADE,
        keyword TEXT NOT NULL,
        PRIMARY KEY (uuid, keyword)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_categories (
        uuid TEXT NOT NULL REFERENCES nodes(uuid) ON DELETE CASCADE,
        category TEXT NOT NULL,
        PRIMARY KEY (uuid, category)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_subscriptors (
        uuid TEXT NOT NULL REFERENCES nodes(uuid) ON DELETE CASCADE,
        principal TEXT NOT NULL,
        PRIMARY KEY (uuid, principal)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_properties (
        uuid TEXT NOT NULL REFERENCES nodes(uuid) ON DELETE CASCADE,
        grp TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (uuid, grp, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mail_recipients (
        uuid TEXT NOT NULL REFERENCES nodes(uuid) ON DELETE CASCADE,
        address TEXT NOT NULL,
        PRIMARY KEY (uuid, address)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind)",
    "CREATE INDEX IF NOT EXISTS idx_node_keywords_keyword ON node_keywords(keyword)",
    "CREATE INDEX IF NOT EXISTS idx_node_categories_category ON node_categories(category)",
];

const INDEX_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS index_documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        fields_json TEXT NOT NULL,
        indexed_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_terms (
        doc_id INTEGER NOT NULL REFERENCES index_documents(id) ON DELETE CASCADE,
        field TEXT NOT NULL,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_index_terms_field_value ON index_terms(field, value)",
    "CREATE INDEX IF NOT EXISTS idx_index_terms_doc_id ON index_terms(doc_id)",
    "CREATE INDEX IF NOT EXISTS idx_index_documents_kind ON index_documents(kind)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool, config.index.analyzer).await?;
    pool.close().await;
    Ok(())
}

/// Create every node and index table. Safe to run repeatedly.
///
/// The FTS5 table is bound to one tokenizer. When the recorded analyzer
/// differs from `analyzer`, the text index is dropped and recreated empty;
/// node tables are never touched.
pub async fn migrate(pool: &SqlitePool, analyzer: Analyzer) -> Result<()> {
    for stmt in NODE_TABLES.iter().chain(INDEX_TABLES) {
        sqlx::query(stmt).execute(pool).await?;
    }

    let recorded: Option<String> =
        sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'analyzer'")
            .fetch_optional(pool)
            .await?;

    if let Some(previous) = recorded.as_deref() {
        if previous != analyzer.name() {
            warn!(
                previous,
                configured = analyzer.name(),
                "analyzer changed, dropping the text index; run `reindex` to rebuild"
            );
            let mut tx = pool.begin().await?;
            sqlx::query("DROP TABLE IF EXISTS index_vocab")
                .execute(&mut *tx)
                .await?;
            sqlx::query("DROP TABLE IF EXISTS index_fts")
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM index_terms").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM index_documents")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='index_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(&format!(
            "CREATE VIRTUAL TABLE index_fts USING fts5(doc_id UNINDEXED, field UNINDEXED, value, tokenize = \"{}\")",
            analyzer.fts5_tokenizer()
        ))
        .execute(pool)
        .await?;
        info!(analyzer = analyzer.name(), "created text index");
    }

    let vocab_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='index_vocab'",
    )
    .fetch_one(pool)
    .await?;

    if !vocab_exists {
        sqlx::query("CREATE VIRTUAL TABLE index_vocab USING fts5vocab(index_fts, 'row')")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO index_meta (key, value) VALUES ('analyzer', ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(analyzer.name())
    .execute(pool)
    .await?;

    Ok(())
}
