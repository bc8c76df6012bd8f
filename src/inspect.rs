//! Index diagnostics: stored documents, raw index hits and counts.
//!
//! These commands read the text index directly and never consult the
//! access decision. `index search --as` applies the index-side permission
//! filter instead, which shows what that approximation admits.

use anyhow::{bail, Result};

use dms_search_core::collaborators::NodeRepository;
use dms_search_core::index::SearchIndex;
use dms_search_core::models::{NodeKind, Principal};
use dms_search_core::projection::fields;
use dms_search_core::query::Query;
use dms_search_core::read_filter::ReadAccessFilter;

use crate::services::Services;

/// Hits shown by `index search`.
pub const MAX_DIAGNOSTIC_HITS: u64 = 50;

pub async fn run_show(services: &Services, uuid: &str) -> Result<()> {
    let Some(doc) = services.index.document(uuid).await? else {
        bail!("Not indexed: {}", uuid);
    };

    println!("--- Index document ---");
    println!("uuid:  {}", doc.uuid);
    println!("kind:  {}", doc.kind);
    for (name, field) in &doc.fields {
        let marker = if field.analyzed { "analyzed" } else { "exact" };
        for value in &field.values {
            println!("{:<16} [{}] {}", name, marker, preview(value, 120));
        }
    }

    let terms = services.engine.get_terms(doc.kind, uuid).await?;
    println!();
    println!("--- Terms ({}) ---", terms.len());
    if !terms.is_empty() {
        println!("{}", terms.join(" "));
    }
    Ok(())
}

pub async fn run_search(services: &Services, target: &str, filter: Option<&Principal>) -> Result<()> {
    let query = if uuid::Uuid::parse_str(target).is_ok() {
        Query::term(fields::UUID, target)
    } else {
        services.engine.parse(target)?
    };
    let query = match filter {
        Some(principal) => ReadAccessFilter::apply(query, principal, &services.security),
        None => query,
    };

    let hits = services.index.search(&query, 0, MAX_DIAGNOSTIC_HITS).await?;
    if hits.is_empty() {
        println!("No hits.");
        return Ok(());
    }

    for hit in &hits {
        let (name, kind) = match services.index.document(&hit.uuid).await? {
            Some(doc) => (
                doc.first(fields::NAME).unwrap_or_default().to_string(),
                doc.kind.to_string(),
            ),
            None => (String::new(), "?".to_string()),
        };
        println!("{:.4}  {}  {:<8} {}", hit.score, hit.uuid, kind, name);
    }
    Ok(())
}

pub async fn run_stats(services: &Services) -> Result<()> {
    let db_size = std::fs::metadata(&services.config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("DMS Search — Index Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", services.config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Analyzer:    {}", services.config.index.analyzer);
    println!();
    println!("  {:<10} {:>10} {:>10}", "KIND", "NODES", "INDEXED");
    for kind in NodeKind::ALL {
        let nodes = services.nodes.count(kind).await?;
        let indexed = services.index.count(Some(kind)).await?;
        println!("  {:<10} {:>10} {:>10}", kind, nodes, indexed);
    }
    println!("  {:<10} {:>10} {:>10}", "total", "", services.index.count(None).await?);
    println!();
    Ok(())
}

fn preview(value: &str, max_chars: usize) -> String {
    let flat = value.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
