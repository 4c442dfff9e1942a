//! # docchat CLI
//!
//! The `docchat` binary provides commands for database initialization,
//! token minting, document ingestion, retrieval debugging, and starting
//! the HTTP/WebSocket server.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and run schema migrations |
//! | `docchat token --user <id>` | Mint a bearer token for a user |
//! | `docchat ingest <file> --user <id>` | Ingest a document synchronously |
//! | `docchat search "<q>" --user <id>` | Run a retrieval search and print hits |
//! | `docchat serve` | Start the HTTP/WebSocket server |

mod auth;
mod chunk;
mod config;
mod db;
mod error;
mod extract;
mod generate;
mod index;
mod ingest;
mod migrate;
mod models;
mod retrieval;
mod server;
mod session;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::auth::HmacTokenValidator;
use crate::models::Principal;
use crate::retrieval::RetrievalService;

/// docchat: chat with your documents over WebSocket.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Chat with your documents: TF-IDF retrieval plus LLM generation over WebSocket",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent; running it multiple times is safe.
    Init,

    /// Mint a bearer token for a user.
    Token {
        /// User id the token is issued for.
        #[arg(long)]
        user: String,
    },

    /// Ingest a document synchronously: extract, chunk, and index it.
    ///
    /// The server ingests uploads in the background; this command runs the
    /// same pipeline inline, which is handy for local setup and debugging.
    Ingest {
        /// Path to the document (.pdf, .txt, .md).
        file: PathBuf,

        /// Owning user id.
        #[arg(long)]
        user: String,

        /// Document title (defaults to the file name).
        #[arg(long)]
        title: Option<String>,
    },

    /// Run a retrieval search and print the ranked chunk texts.
    Search {
        /// The search query string.
        query: String,

        /// User whose documents are searched.
        #[arg(long)]
        user: String,

        /// Restrict the search to one document id.
        #[arg(long)]
        document: Option<String>,

        /// Maximum number of chunks to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Start the HTTP/WebSocket server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Token { user } => {
            let validator = HmacTokenValidator::new(&cfg.auth.secret);
            let token = validator.issue(&user, cfg.auth.token_ttl_secs)?;
            println!("{}", token);
        }
        Commands::Ingest { file, user, title } => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;

            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("invalid file name"))?
                .to_string();
            let title = title.unwrap_or_else(|| filename.clone());
            let bytes = tokio::fs::read(&file).await?;

            let document = ingest::create_document(
                &pool,
                &cfg.storage.upload_root,
                &user,
                &title,
                &filename,
                &bytes,
            )
            .await?;

            match ingest::run_pipeline(&pool, &cfg, &document).await {
                Ok(chunks) => {
                    println!("ingest {}", document.id);
                    println!("  title: {}", document.title);
                    println!("  chunks indexed: {}", chunks);
                    println!("ok");
                }
                Err(e) => {
                    ingest::rollback(&pool, &cfg.storage.index_root, &document).await;
                    anyhow::bail!("ingestion failed: {}", e);
                }
            }
            pool.close().await;
        }
        Commands::Search {
            query,
            user,
            document,
            limit,
        } => {
            let pool = db::connect(&cfg.db.path).await?;
            let retrieval = RetrievalService::new(pool.clone(), &cfg.storage.index_root);
            let principal = Principal { user_id: user };
            let k = limit.unwrap_or(cfg.retrieval.top_k);

            let hits = retrieval
                .search(&principal, document.as_deref(), &query, k)
                .await?;

            if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, text) in hits.iter().enumerate() {
                    println!("{}. \"{}\"", i + 1, text.replace('\n', " "));
                }
            }
            pool.close().await;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
