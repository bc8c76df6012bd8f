//! # DMS Search CLI (`dms-search`)
//!
//! The `dms-search` binary drives the document-management search service:
//! database setup, filesystem import, index maintenance, secured queries and
//! the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! dms-search --config ./config/dms.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dms-search init` | Create the SQLite database and run schema migrations |
//! | `dms-search import <dir>` | Import a directory tree as folders and documents |
//! | `dms-search reindex` | Purge and rebuild the text index |
//! | `dms-search search "<expr>"` | Run an access-filtered query |
//! | `dms-search mlt <uuid>` | Documents similar to a document |
//! | `dms-search folders <uuid>` | Readable descendant folders |
//! | `dms-search suggest query <prefix>` | Term suggestions |
//! | `dms-search index stats` | Index diagnostics |
//! | `dms-search perms purge --user <name>` | Remove a user from all node permissions |
//! | `dms-search serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! dms-search init
//! dms-search import ./contracts --as alice --role ROLE_USER
//! dms-search search 'title:budget AND -draft' --as alice --role ROLE_USER
//! dms-search search '"quarterly report"' --strategy am_window --json
//! dms-search serve
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dms_search::config;
use dms_search::extract;
use dms_search::import;
use dms_search::inspect;
use dms_search::migrate;
use dms_search::progress::ProgressMode;
use dms_search::search;
use dms_search::server;
use dms_search::services::Services;
use dms_search::sqlite_nodes::SubjectKind;
use dms_search_core::index::SearchIndex;
use dms_search_core::models::{NodeKind, Principal};
use dms_search_core::strategy::CountStrategy;

/// DMS Search: secured full-text search over a document repository.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dms.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dms-search",
    about = "DMS Search — secured full-text search over documents, folders and mail",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dms.toml")]
    config: PathBuf,

    /// Progress reporting on stderr for import and reindex.
    ///
    /// Defaults to `human` when stderr is a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Identity the command runs as. Without `--as` the configured system
/// user is used, which bypasses permission checks.
#[derive(Args)]
struct AsArgs {
    /// User to run as.
    #[arg(long = "as")]
    user: Option<String>,

    /// Role of that user (repeatable).
    #[arg(long = "role")]
    roles: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file, the node tables and the text index
    /// tables. Running it multiple times is safe.
    Init,

    /// Import a directory tree.
    ///
    /// Sub-directories become folders, files become documents and `.eml`
    /// files become mails. Unchanged files are skipped on re-import.
    Import {
        /// Directory to import.
        dir: PathBuf,

        /// Folder uuid to import below (defaults to a new root folder).
        #[arg(long)]
        parent: Option<String>,

        #[command(flatten)]
        identity: AsArgs,
    },

    /// Purge and rebuild the text index.
    Reindex {
        /// Restrict the rebuild to these kinds (repeatable).
        #[arg(long = "kind")]
        kinds: Vec<NodeKind>,
    },

    /// Run a query expression, filtered by read access.
    Search {
        /// Query expression (classic syntax).
        expression: String,

        #[arg(long, default_value = "0")]
        offset: u64,

        #[arg(long, default_value = "10")]
        limit: u64,

        /// Count strategy: lucene, am_more, am_window or am_limited.
        #[arg(long)]
        strategy: Option<CountStrategy>,

        #[command(flatten)]
        identity: AsArgs,

        /// Print the result page as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Documents similar to a document.
    Mlt {
        uuid: String,

        #[arg(long, default_value = "10")]
        max: u64,

        #[command(flatten)]
        identity: AsArgs,

        #[arg(long)]
        json: bool,
    },

    /// Readable folders below a folder.
    Folders {
        uuid: String,

        #[command(flatten)]
        identity: AsArgs,
    },

    /// Analyzed terms of a node's indexed text.
    Terms { kind: NodeKind, uuid: String },

    /// Nodes classified under a category.
    Category {
        id: String,

        #[command(flatten)]
        identity: AsArgs,

        #[arg(long)]
        json: bool,
    },

    /// Nodes tagged with a keyword.
    Keyword {
        word: String,

        #[command(flatten)]
        identity: AsArgs,

        #[arg(long)]
        json: bool,
    },

    /// Build or query term suggestions.
    Suggest {
        #[command(subcommand)]
        action: SuggestAction,
    },

    /// Inspect the text index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Extract text from a file and print it.
    Extract {
        file: PathBuf,

        /// MIME type (guessed from the extension when omitted).
        #[arg(long)]
        mime: Option<String>,
    },

    /// Merge the full-text index segments.
    Optimize,

    /// Remove a node and its index entry.
    Delete { uuid: String },

    /// List or purge users and roles in node permissions.
    Perms {
        #[command(subcommand)]
        action: PermsAction,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum SuggestAction {
    /// Rebuild the suggestion structure from the indexed terms.
    Build,
    /// Print suggestions for a prefix.
    Query {
        prefix: String,

        #[arg(long, default_value = "10")]
        max: usize,
    },
}

#[derive(Subcommand)]
enum PermsAction {
    /// Users and roles named in any node's permissions.
    List,
    /// Remove one subject from every node and reindex those nodes.
    Purge {
        #[command(flatten)]
        subject: SubjectArgs,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SubjectArgs {
    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    role: Option<String>,
}

impl SubjectArgs {
    fn subject(self) -> (SubjectKind, String) {
        match (self.user, self.role) {
            (Some(user), _) => (SubjectKind::User, user),
            (None, role) => (SubjectKind::Role, role.unwrap_or_default()),
        }
    }
}

#[derive(Subcommand)]
enum IndexAction {
    /// Stored fields and terms of one index document.
    Show { uuid: String },
    /// Raw index hits for a uuid or an expression, without access checks.
    Search {
        target: String,

        /// Apply the index-side permission filter for this identity.
        #[command(flatten)]
        identity: AsArgs,
    },
    /// Document counts per kind.
    Stats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dms_search=info,dms_search_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn principal_for(services: &Services, identity: &AsArgs) -> Principal {
    services.principal(identity.user.as_deref(), &identity.roles)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    // Commands that don't need a database.
    if let Commands::Extract { file, mime } = &cli.command {
        let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        let mime = mime
            .clone()
            .unwrap_or_else(|| extract::guess_mime(file).to_string());
        let text = extract::extract_text(&data, &mime)?;
        println!("{}", text);
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let services = Services::open(&cfg).await?;

    match cli.command {
        Commands::Init | Commands::Extract { .. } => {}
        Commands::Import {
            dir,
            parent,
            identity,
        } => {
            let principal = principal_for(&services, &identity);
            let reporter = progress.reporter("import");
            let stats = import::run_import(
                &services,
                &dir,
                parent.as_deref(),
                &principal,
                reporter.as_ref(),
            )
            .await?;
            println!(
                "Imported {} folders, {} documents, {} mails ({} unchanged, {} failed).",
                stats.folders, stats.documents, stats.mails, stats.unchanged, stats.failed
            );
        }
        Commands::Reindex { kinds } => {
            let reporter = progress.reporter("reindex");
            let Some(stats) = services.rebuild(&kinds, reporter.as_ref()).await? else {
                bail!("A rebuild is already running");
            };
            println!(
                "Indexed {} of {} nodes in {} batches ({} failed, {} purged, {} ms).",
                stats.indexed, stats.total, stats.batches, stats.failed, stats.purged, stats.elapsed_ms
            );
        }
        Commands::Search {
            expression,
            offset,
            limit,
            strategy,
            identity,
            json,
        } => {
            let principal = principal_for(&services, &identity);
            search::run_search(&services, &principal, &expression, offset, limit, strategy, json)
                .await?;
        }
        Commands::Mlt {
            uuid,
            max,
            identity,
            json,
        } => {
            let principal = principal_for(&services, &identity);
            search::run_more_like_this(&services, &principal, &uuid, max, json).await?;
        }
        Commands::Folders { uuid, identity } => {
            let principal = principal_for(&services, &identity);
            search::run_folders(&services, &principal, &uuid).await?;
        }
        Commands::Terms { kind, uuid } => {
            search::run_terms(&services, kind, &uuid).await?;
        }
        Commands::Category { id, identity, json } => {
            let principal = principal_for(&services, &identity);
            search::run_category(&services, &principal, &id, json).await?;
        }
        Commands::Keyword {
            word,
            identity,
            json,
        } => {
            let principal = principal_for(&services, &identity);
            search::run_keyword(&services, &principal, &word, json).await?;
        }
        Commands::Suggest { action } => match action {
            SuggestAction::Build => {
                let terms = services.suggest.build(services.index.as_ref()).await?;
                println!("Suggestion index rebuilt with {} terms.", terms);
            }
            SuggestAction::Query { prefix, max } => {
                for term in services.suggest.suggest(&prefix, max) {
                    println!("{}", term);
                }
            }
        },
        Commands::Index { action } => match action {
            IndexAction::Show { uuid } => {
                inspect::run_show(&services, &uuid).await?;
            }
            IndexAction::Search { target, identity } => {
                let filter = identity
                    .user
                    .as_deref()
                    .map(|user| Principal::new(user, identity.roles.iter().cloned()));
                inspect::run_search(&services, &target, filter.as_ref()).await?;
            }
            IndexAction::Stats => {
                inspect::run_stats(&services).await?;
            }
        },
        Commands::Optimize => {
            services.index.optimize().await?;
            println!("Index optimized.");
        }
        Commands::Delete { uuid } => {
            if services.flags.is_read_only() {
                bail!("Repository is read-only; delete refused");
            }
            let existed = services.maintainer.remove_one(&uuid).await?;
            if existed {
                println!("Deleted {}.", uuid);
            } else {
                println!("Deleted {} (it was not indexed).", uuid);
            }
        }
        Commands::Perms { action } => match action {
            PermsAction::List => {
                let subjects = services.permission_subjects().await?;
                for user in &subjects.users {
                    println!("user\t{}", user);
                }
                for role in &subjects.roles {
                    println!("role\t{}", role);
                }
            }
            PermsAction::Purge { subject } => {
                if services.flags.is_read_only() {
                    bail!("Repository is read-only; purge refused");
                }
                let (kind, name) = subject.subject();
                let stats = services.purge_permissions(kind, &name).await?;
                println!(
                    "Purged {} from {} nodes ({} reindexed, {} failed).",
                    name, stats.nodes, stats.reindexed, stats.failed
                );
            }
        },
        Commands::Serve => {
            server::run_server(services).await?;
            return Ok(());
        }
    }

    services.close().await;
    Ok(())
}
