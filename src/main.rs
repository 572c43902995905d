//! # dirsense CLI (`dsense`)
//!
//! The `dsense` binary exposes search, the relationship graph, entropy
//! scoring and the suggestion lifecycle over a local file index.
//!
//! ## Usage
//!
//! ```bash
//! dsense --config ./config/dsense.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dsense init` | Create the SQLite tables |
//! | `dsense stats` | Coverage, edge and suggestion counts |
//! | `dsense search "<query>"` | Hybrid file search |
//! | `dsense related <path>` | Files related through the graph |
//! | `dsense duplicates` | Duplicate pairs |
//! | `dsense hash` | Fingerprint new or changed files |
//! | `dsense embed pending` | Embed missing or stale files |
//! | `dsense graph build` / `prune` | Run the analyzers / drop weak edges |
//! | `dsense entropy <dir>` | Score one directory |
//! | `dsense suggest run` / `list` / `accept` / `dismiss` / `defer` | Suggestion lifecycle |
//! | `dsense undo <dir>` | Restore a staged operation |
//! | `dsense staging purge` | Discard expired staging directories |
//! | `dsense watch` | Run the idle scheduler |
//! | `dsense pass` | Run one background pass now |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dirsense::{
    config, embed_cmd, entropy, graph, hasher, logging, migrate, scheduler, search, staging,
    stats, suggest,
};

/// dirsense: hybrid file search, a file relationship graph and directory
/// cleanup suggestions over a local file index.
#[derive(Parser)]
#[command(
    name = "dsense",
    about = "Local file intelligence: search, relationships and cleanup suggestions",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dsense.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database tables. Safe to run repeatedly.
    Init,

    /// Show index, graph and suggestion statistics.
    Stats,

    /// Search files by name and meaning.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List files related to a path through the graph.
    Related {
        path: String,

        /// Maximum number of hops.
        #[arg(long, default_value_t = 2)]
        depth: usize,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List duplicate file pairs.
    Duplicates,

    /// Fingerprint files that are new or changed.
    Hash,

    /// Manage embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Build or maintain the relationship graph.
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Score a directory's organizational entropy.
    Entropy { path: String },

    /// Generate and manage cleanup suggestions.
    Suggest {
        #[command(subcommand)]
        action: SuggestAction,
    },

    /// Restore every file recorded in a staging directory's manifest.
    Undo { manifest_dir: PathBuf },

    /// Maintain the staging area.
    Staging {
        #[command(subcommand)]
        action: StagingAction,
    },

    /// Run the idle scheduler until Ctrl-C. Each line typed on stdin counts
    /// as user activity.
    Watch,

    /// Run one background pass immediately.
    Pass,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed files that are missing or have stale embeddings.
    Pending {
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum GraphAction {
    /// Run every analyzer and upsert edges.
    Build,
    /// Remove edges below the configured strength.
    Prune,
}

#[derive(Subcommand)]
enum SuggestAction {
    /// Evaluate stored scores and record new suggestions.
    Run,
    /// List suggestions.
    List {
        /// pending, dismissed, deferred, accepted, completed or reverted.
        #[arg(long)]
        status: Option<String>,
    },
    /// Accept a suggestion: stage, verify, then apply.
    Accept { id: i64 },
    /// Dismiss a suggestion.
    Dismiss { id: i64 },
    /// Hide a suggestion for a number of days.
    Defer {
        id: i64,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
}

#[derive(Subcommand)]
enum StagingAction {
    /// Permanently discard staging directories past the retention window.
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Search { query, limit } => search::run_search(&cfg, &query, limit).await?,
        Commands::Related { path, depth, limit } => {
            graph::run_related(&cfg, &path, depth, limit).await?
        }
        Commands::Duplicates => graph::run_duplicates(&cfg).await?,
        Commands::Hash => hasher::run_hash(&cfg).await?,
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit } => embed_cmd::run_embed_pending(&cfg, limit).await?,
        },
        Commands::Graph { action } => match action {
            GraphAction::Build => graph::run_graph_build(&cfg).await?,
            GraphAction::Prune => graph::run_graph_prune(&cfg).await?,
        },
        Commands::Entropy { path } => entropy::run_entropy(&cfg, &path).await?,
        Commands::Suggest { action } => match action {
            SuggestAction::Run => suggest::run_suggest(&cfg).await?,
            SuggestAction::List { status } => suggest::run_list(&cfg, status.as_deref()).await?,
            SuggestAction::Accept { id } => staging::run_accept(&cfg, id).await?,
            SuggestAction::Dismiss { id } => suggest::run_dismiss(&cfg, id).await?,
            SuggestAction::Defer { id, days } => suggest::run_defer(&cfg, id, days).await?,
        },
        Commands::Undo { manifest_dir } => staging::run_undo(&cfg, &manifest_dir).await?,
        Commands::Staging { action } => match action {
            StagingAction::Purge => staging::run_purge(&cfg).await?,
        },
        Commands::Watch => scheduler::run_watch(&cfg).await?,
        Commands::Pass => scheduler::run_once(&cfg).await?,
    }

    Ok(())
}
