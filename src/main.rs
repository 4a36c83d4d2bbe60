//! # Medical RAG CLI (`medrag`)
//!
//! ## Usage
//!
//! ```bash
//! medrag --config ./config/medrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `medrag ingest <path>` | Index a JSON array, JSONL file, or directory of text files |
//! | `medrag query "<question>"` | Answer a question (`--stream` for incremental output) |
//! | `medrag chat --message user:<text> ...` | Answer the last turn of a conversation |
//! | `medrag search "<query>"` | Retrieve without generating |
//! | `medrag batch <file>` | Answer every question in a file, as JSON |
//! | `medrag stats` | Index and embedder statistics |
//! | `medrag docs --category <c>` | List indexed documents by category or source |
//! | `medrag show <document_id>` | Show one indexed document |
//! | `medrag update <document_id> --category <c>` | Patch a document's metadata |
//! | `medrag delete <document_id>` | Remove one document |
//! | `medrag clear` | Remove every indexed entry |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use medical_rag::commands;
use medical_rag::config::{self, Config};
use medical_rag::generation::prompt::ResponseType;
use medical_rag::logging;
use medical_rag::pipeline::{QueryOptions, SearchType};
use medrag_core::models::{MetadataPatch, RetrievalFilters};
use medrag_core::retrieval::RetrievalStrategy;

/// Medical RAG CLI: retrieval-augmented answers over a medical knowledge base.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means the built-in defaults.
#[derive(Parser)]
#[command(name = "medrag", version, about = "Medical retrieval-augmented question answering")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/medrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk, embed, and index documents.
    Ingest {
        /// A `.json` array, a `.jsonl` file, a text file, or a directory.
        path: PathBuf,

        /// Embed `image` documents from their `image_path`.
        #[arg(long)]
        vectorize_images: bool,
    },

    /// Answer a question.
    Query {
        question: String,

        #[arg(long)]
        top_k: Option<usize>,

        /// diagnosis, advice, explanation, or general.
        #[arg(long, default_value = "general")]
        response_type: String,

        #[arg(long)]
        threshold: Option<f32>,

        /// semantic, hybrid, or rerank.
        #[arg(long)]
        strategy: Option<RetrievalStrategy>,

        #[arg(long)]
        category: Option<String>,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Answer the last user turn of a conversation.
    Chat {
        /// `user:<text>` or `assistant:<text>`, oldest first.
        #[arg(long = "message", required = true)]
        messages: Vec<String>,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Retrieve matching chunks without generating an answer.
    Search {
        query: String,

        /// semantic, keyword, or hybrid.
        #[arg(long, default_value = "semantic")]
        mode: SearchType,

        #[arg(long, default_value = "10")]
        top_k: usize,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        source: Option<String>,
    },

    /// Answer every question in a file (JSON array or one per line).
    Batch {
        file: PathBuf,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show index and embedder statistics.
    Stats,

    /// List indexed documents by category or source.
    Docs {
        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        source: Option<String>,
    },

    /// Show one indexed document.
    Show { document_id: String },

    /// Patch the metadata of one indexed document.
    Update {
        document_id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        source: Option<String>,

        /// Replaces the document's tags. Repeat for several.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Remove one document from the index.
    Delete { document_id: String },

    /// Remove every indexed entry.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    let pipeline = commands::open_pipeline(&cfg).await?;

    match cli.command {
        Commands::Ingest {
            path,
            vectorize_images,
        } => {
            commands::run_ingest(&pipeline, &path, vectorize_images).await?;
        }
        Commands::Query {
            question,
            top_k,
            response_type,
            threshold,
            strategy,
            category,
            stream,
        } => {
            let options = QueryOptions {
                top_k,
                response_type: ResponseType::from_name(&response_type),
                similarity_threshold: threshold,
                strategy,
                filters: RetrievalFilters {
                    category,
                    ..Default::default()
                },
            };
            commands::run_query(&pipeline, &question, options, stream).await?;
        }
        Commands::Chat { messages, top_k } => {
            commands::run_chat(&pipeline, &messages, top_k).await?;
        }
        Commands::Search {
            query,
            mode,
            top_k,
            category,
            source,
        } => {
            let filters = RetrievalFilters {
                category,
                source,
                tags: Vec::new(),
            };
            commands::run_search(&pipeline, &query, mode, top_k, filters).await?;
        }
        Commands::Batch { file, top_k } => {
            let options = QueryOptions {
                top_k,
                ..Default::default()
            };
            commands::run_batch(&pipeline, &file, options).await?;
        }
        Commands::Stats => {
            commands::run_stats(&pipeline).await?;
        }
        Commands::Docs { category, source } => {
            commands::run_documents(&pipeline, category.as_deref(), source.as_deref()).await?;
        }
        Commands::Show { document_id } => {
            commands::run_show(&pipeline, &document_id).await?;
        }
        Commands::Update {
            document_id,
            title,
            category,
            source,
            tags,
        } => {
            let patch = MetadataPatch {
                title,
                source,
                category,
                tags: (!tags.is_empty()).then_some(tags),
                ..Default::default()
            };
            commands::run_update(&pipeline, &document_id, &patch).await?;
        }
        Commands::Delete { document_id } => {
            commands::run_delete(&pipeline, &document_id).await?;
        }
        Commands::Clear => {
            commands::run_clear(&pipeline).await?;
        }
    }

    Ok(())
}
