//! # RAG Harness CLI (`rh`)
//!
//! ## Usage
//!
//! ```bash
//! rh --config ./config/rh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rh init` | Create the SQLite database and run schema migrations |
//! | `rh ingest <paths...>` | Load, chunk, embed and store files or directories |
//! | `rh search "<query>"` | Query the index |
//! | `rh documents list` | List documents and their ingestion status |
//! | `rh documents show <id>` | Print a document record, optionally with chunks |
//! | `rh documents delete <id>` | Delete a document and its chunks |
//! | `rh tools list` | List the tools the gateway serves |
//! | `rh tools call <name>` | Run one tool and print its result |
//! | `rh serve` | Start the HTTP and MCP tool server |
//!
//! ## Examples
//!
//! ```bash
//! rh ingest ./handbook.pdf ./policies/
//! rh search "refund policy" --top-k 3 --mode hybrid
//! rh search "refund policy" --mode hybrid --merge rrf --max-per-doc 2 --dedupe
//! rh tools call search --args '{"query": "refund policy", "topK": 3}'
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rag_harness::commands::{self, SearchArgs};
use rag_harness::config;
use rag_harness::core::models::{DocumentStatus, SourceFormat};
use rag_harness::core::search::{MergeStrategy, SearchMode};
use rag_harness::logging;
use rag_harness::server;

/// RAG Harness: document ingestion and retrieval for AI tools.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rh",
    version,
    about = "RAG Harness: document ingestion and retrieval for AI tools"
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest files. Directories are walked recursively and every file with
    /// a recognised extension is ingested; a file ingested again under the
    /// same path replaces its earlier version.
    Ingest {
        /// Files or directories.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Force a source format instead of detecting it.
        #[arg(long)]
        format: Option<SourceFormat>,
    },

    /// Search ingested documents.
    Search {
        query: String,

        /// Maximum number of results (defaults to `retrieval.default_top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// `semantic`, `keyword`, or `hybrid`.
        #[arg(long, default_value = "semantic")]
        mode: SearchMode,

        /// Restrict to a document id. Repeatable.
        #[arg(long = "document")]
        documents: Vec<String>,

        /// Drop results scoring below this value.
        #[arg(long)]
        threshold: Option<f64>,

        /// Show the neighbouring chunks of every result.
        #[arg(long)]
        context: bool,

        /// Keep at most this many results per document.
        #[arg(long)]
        max_per_doc: Option<usize>,

        /// Drop near-duplicate results.
        #[arg(long)]
        dedupe: bool,

        /// Hybrid merge: `weighted_sum`, `max_score`, or `rrf`.
        #[arg(long)]
        merge: Option<MergeStrategy>,
    },

    /// Inspect and manage ingested documents.
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Inspect and call gateway tools.
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },

    /// Start the HTTP tool server with the MCP endpoint at `/mcp`.
    Serve,
}

#[derive(Subcommand)]
enum DocumentsAction {
    List {
        /// Only documents in this status.
        #[arg(long)]
        status: Option<DocumentStatus>,
    },
    /// Accepts a document id or an exact name.
    Show {
        id: String,
        /// Also print every chunk.
        #[arg(long)]
        chunks: bool,
    },
    /// Accepts a document id or an exact name.
    Delete { id: String },
}

#[derive(Subcommand)]
enum ToolsAction {
    List,
    Call {
        name: String,
        /// Tool arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging);

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Ingest { paths, format } => {
            commands::run_ingest(&cfg, &paths, format).await?;
        }
        Commands::Search {
            query,
            top_k,
            mode,
            documents,
            threshold,
            context,
            max_per_doc,
            dedupe,
            merge,
        } => {
            let args = SearchArgs {
                query,
                top_k,
                mode,
                documents,
                threshold,
                context,
                max_per_document: max_per_doc,
                dedupe,
                merge_strategy: merge,
            };
            commands::run_search(&cfg, args).await?;
        }
        Commands::Documents { action } => match action {
            DocumentsAction::List { status } => {
                commands::run_documents_list(&cfg, status).await?;
            }
            DocumentsAction::Show { id, chunks } => {
                commands::run_documents_show(&cfg, &id, chunks).await?;
            }
            DocumentsAction::Delete { id } => {
                commands::run_documents_delete(&cfg, &id).await?;
            }
        },
        Commands::Tools { action } => match action {
            ToolsAction::List => commands::run_tools_list(&cfg)?,
            ToolsAction::Call { name, args } => {
                commands::run_tools_call(&cfg, &name, args.as_deref()).await?;
            }
        },
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
