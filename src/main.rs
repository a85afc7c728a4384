//! # ragbase CLI
//!
//! Drives the ingestion and answering library from the command line.
//! Command output goes to stdout; logs go to stderr (`RUST_LOG` overrides
//! the default `ragbase=info` filter).
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragbase ingest <files...>` | Upload files, wait for ingestion, print final states |
//! | `ragbase status <id>` | Show one document's status record |
//! | `ragbase documents` | List all documents |
//! | `ragbase ask "<question>"` | Answer a question from the indexed documents |
//! | `ragbase delete <id>` | Remove a document and rebuild the index |
//! | `ragbase reset` | Empty the index and forget all documents |
//! | `ragbase size` | Print the number of indexed chunks |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use ragbase::completion::create_completion_provider;
use ragbase::config::{self, Config};
use ragbase::extract::FileExtractor;
use ragbase::ingest::{IngestQueue, Ingestor};
use ragbase::knowledge_base::KnowledgeBase;
use ragbase::models::{DocumentRecord, StreamEvent};
use ragbase::rag::RagPipeline;

#[derive(Parser)]
#[command(
    name = "ragbase",
    about = "Ingest documents and answer questions from them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "./ragbase.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload and ingest files.
    ///
    /// Each file is stored under the upload directory and queued. The command
    /// waits until every queued document reaches `completed` or `failed`.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show the status record of one document.
    Status { id: String },

    /// List every document with its state.
    Documents,

    /// Ask a question.
    Ask {
        question: String,

        /// Number of passages to retrieve (defaults to `retrieval.top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Only use passages from this document.
        #[arg(long)]
        document: Option<String>,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Delete a document and rebuild the index without it.
    Delete { id: String },

    /// Delete every indexed chunk and status record.
    Reset,

    /// Print the number of indexed chunks.
    Size,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
        config::parse_config("")?
    };

    let kb = Arc::new(KnowledgeBase::from_config(cfg.clone())?);
    let ingestor = Arc::new(Ingestor::new(kb.clone(), Arc::new(FileExtractor)));

    match cli.command {
        Commands::Ingest { files } => {
            let queue = IngestQueue::start(ingestor, &cfg.ingest);
            let mut accepted = Vec::new();
            for path in &files {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("Invalid file name: {}", path.display()))?;
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let record = queue.accept_upload(name, &bytes).await?;
                println!("accepted {} ({} bytes)", record.id, record.file_size);
                accepted.push(record.id);
            }

            queue.shutdown().await;

            for id in accepted {
                if let Some(record) = kb.status().get(&id) {
                    print_record(&record);
                }
            }
        }
        Commands::Status { id } => {
            let record = kb
                .status()
                .get(&id)
                .with_context(|| format!("Unknown document: {}", id))?;
            print_record(&record);
        }
        Commands::Documents => {
            let listing = kb.status().listing();
            if listing.documents.is_empty() {
                println!("No documents.");
            }
            for record in &listing.documents {
                print_record(record);
            }
            if let Some(ts) = listing.last_updated {
                println!("last updated: {}", ts.to_rfc3339());
            }
        }
        Commands::Ask {
            question,
            top_k,
            document,
            stream,
        } => {
            ask(&cfg, kb, &question, top_k, document.as_deref(), stream).await?;
        }
        Commands::Delete { id } => {
            ingestor.delete_document(&id).await?;
            println!("deleted {}", id);
            println!("index size: {}", kb.size().await?);
        }
        Commands::Reset => {
            ingestor.reset_all().await?;
            println!("knowledge base reset");
        }
        Commands::Size => {
            println!("{}", kb.size().await?);
        }
    }

    Ok(())
}

async fn ask(
    cfg: &Config,
    kb: Arc<KnowledgeBase>,
    question: &str,
    top_k: Option<usize>,
    document: Option<&str>,
    stream: bool,
) -> anyhow::Result<()> {
    let llm = create_completion_provider(&cfg.generation)?;
    let pipeline = RagPipeline::new(kb, llm);
    let k = top_k.unwrap_or(cfg.retrieval.top_k);

    if !stream {
        let answer = pipeline.answer(question, k, document).await?;
        println!("{}", answer.answer);
        print_sources(&answer.sources);
        return Ok(());
    }

    let mut events = pipeline.answer_stream(question, k, document).await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Token(text) => {
                print!("{}", text);
                stdout.flush()?;
            }
            StreamEvent::Error(text) => println!("\n{}", text),
            StreamEvent::Sources(sources) => {
                println!();
                print_sources(&sources);
            }
            StreamEvent::Done => break,
        }
    }
    Ok(())
}

fn print_record(record: &DocumentRecord) {
    println!(
        "{}  {}  {}%  chunks={}  uploaded={}",
        record.id,
        record.state.name(),
        record.progress,
        record.chunk_count,
        record.upload_time.to_rfc3339()
    );
    if let Some(error) = record.error() {
        println!("  error: {}", error);
    }
}

fn print_sources(sources: &[String]) {
    if sources.is_empty() {
        return;
    }
    println!("sources:");
    for source in sources {
        println!("  - {}", source);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ragbase=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
