//! Query commands: search, more-like-this, folder traversal, term and tag
//! lookups. Results go to stdout, either as readable listings or as JSON.

use anyhow::Result;

use dms_search_core::models::{NodeKind, Principal, ResultPage};
use dms_search_core::strategy::CountStrategy;

use crate::services::Services;

pub async fn run_search(
    services: &Services,
    principal: &Principal,
    expression: &str,
    offset: u64,
    limit: u64,
    strategy: Option<CountStrategy>,
    json: bool,
) -> Result<()> {
    let engine = &services.engine;
    let query = engine.parse(expression)?;
    let strategy = strategy.unwrap_or(engine.settings().strategy);
    let page = engine
        .search_with_strategy(principal, &query, offset, limit, strategy)
        .await?;
    print_page(&page, offset, json)
}

pub async fn run_more_like_this(
    services: &Services,
    principal: &Principal,
    uuid: &str,
    max: u64,
    json: bool,
) -> Result<()> {
    let page = services.engine.more_like_this(principal, uuid, max).await?;
    print_page(&page, 0, json)
}

pub async fn run_folders(services: &Services, principal: &Principal, uuid: &str) -> Result<()> {
    let folders = services.engine.folders_in_depth(principal, uuid).await?;
    if folders.is_empty() {
        println!("No readable folders below {}.", uuid);
    }
    for folder in folders {
        println!("{}", folder);
    }
    Ok(())
}

pub async fn run_terms(services: &Services, kind: NodeKind, uuid: &str) -> Result<()> {
    for term in services.engine.get_terms(kind, uuid).await? {
        println!("{}", term);
    }
    Ok(())
}

pub async fn run_category(
    services: &Services,
    principal: &Principal,
    category: &str,
    json: bool,
) -> Result<()> {
    let page = services.engine.find_by_category(principal, category).await?;
    print_page(&page, 0, json)
}

pub async fn run_keyword(
    services: &Services,
    principal: &Principal,
    keyword: &str,
    json: bool,
) -> Result<()> {
    let page = services.engine.find_by_keyword(principal, keyword).await?;
    print_page(&page, 0, json)
}

fn print_page(page: &ResultPage, offset: u64, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(page)?);
        return Ok(());
    }

    if page.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in page.results.iter().enumerate() {
        let node = result.payload.node();
        let title = node
            .title
            .as_deref()
            .or(node.subject.as_deref())
            .unwrap_or(node.name.as_str());

        println!(
            "{}. [{:.2}] {} / {}",
            offset + i as u64 + 1,
            result.score,
            result.payload.type_name(),
            title
        );
        println!("    modified: {}", node.last_modified.format("%Y-%m-%d"));
        if let Some(author) = &node.author {
            println!("    author: {}", author);
        }
        if let Some(excerpt) = &result.excerpt {
            println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        }
        println!("    uuid: {}", node.uuid);
        println!();
    }
    println!("{} of ~{} results", page.results.len(), page.total);
    Ok(())
}
