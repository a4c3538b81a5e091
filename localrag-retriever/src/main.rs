use clap::{Parser, Subcommand};
use localrag_embed::{OnnxEmbeddingPipeline, Reranker, StopCoordinator};
use localrag_retriever::{
    config::{DEFAULT_CONFIG_FILE, RagConfig},
    events::{EventSink, RagEvent},
    retrieval::{
        build_mode::BuildMode,
        build_worker::BuildWorker,
        builder::{BuildRequest, BuildStage, KnowledgeBaseBuilder, collect_input_files},
        query::QueryPipeline,
        query_worker::QueryWorker,
        repoint::{repoint_models, set_model_dirs},
    },
    storage::{SqliteVectorStore, VectorStore},
};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Build local knowledge bases and ask questions against them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults apply when it does not exist)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Directory holding the knowledge bases, overrides the config file
    #[arg(long)]
    kb_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build or extend a knowledge base from files and directories
    Build {
        /// Knowledge base name
        name: String,
        /// Files or directories to index
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// overwrite or append
        #[arg(short, long, default_value = "overwrite")]
        mode: BuildMode,
        /// Embedding model directory (defaults to the one the knowledge base was built with)
        #[arg(long)]
        model: Option<PathBuf>,
        /// Reranker model directory recorded for queries
        #[arg(long)]
        reranker: Option<PathBuf>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Ask a question against a knowledge base
    Query {
        name: String,
        question: String,
        /// Candidates fetched by vector search
        #[arg(long)]
        depth: Option<usize>,
        /// Passages returned
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Skip cross-encoder reranking
        #[arg(long)]
        no_rerank: bool,
        /// Embedding model directory override
        #[arg(long)]
        model: Option<PathBuf>,
        /// Reranker model directory override
        #[arg(long)]
        reranker: Option<PathBuf>,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show metadata and stored sources of a knowledge base
    Info {
        name: String,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Point a knowledge base at moved model directories
    Repoint {
        name: String,
        /// New embedding model directory
        #[arg(long)]
        model: Option<PathBuf>,
        /// New reranker directory, or "none"
        #[arg(long)]
        reranker: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct InfoOutput {
    metadata: localrag_retriever::storage::KnowledgeBaseMetadata,
    stored_chunks: usize,
    sources: Vec<localrag_retriever::storage::SourceSummary>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = RagConfig::load(&args.config)?;
    if let Some(kb_root) = args.kb_root {
        config.paths.knowledge_bases = kb_root;
    }

    match args.command {
        Commands::Build {
            name,
            paths,
            mode,
            model,
            reranker,
            format,
        } => {
            let kb_dir = config.kb_dir(&name);
            let model_dir = match model {
                Some(model) => model,
                None => localrag_retriever::storage::KnowledgeBaseMetadata::load(&kb_dir)?
                    .map(|m| m.model_dir)
                    .ok_or_else(|| anyhow::anyhow!("--model is required for a new knowledge base"))?,
            };
            let files = collect_input_files(&paths)?;
            if files.is_empty() {
                anyhow::bail!("No files found to index");
            }

            let embedder = OnnxEmbeddingPipeline::load(config.embed_config(&model_dir)).await?;
            let (events, receiver) = EventSink::channel();
            let builder = KnowledgeBaseBuilder::new(
                config.paths.knowledge_bases.clone(),
                config.splitter(),
                Arc::new(embedder),
            )
            .with_events(events);

            let coordinator = StopCoordinator::new();
            let worker = BuildWorker::spawn(Arc::new(builder), coordinator.clone());
            let printer = tokio::spawn(print_events(receiver, format));
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nStopping build...");
                    coordinator.request_stop();
                }
            });

            let mut request = BuildRequest::new(name, files, mode);
            if let Some(reranker) = reranker {
                request = request.with_reranker_dir(reranker);
            }
            let result = worker.run(request).await;
            worker.shutdown().await?;
            interrupt.abort();
            printer.await?;

            let task = result?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
                OutputFormat::Summary => {
                    let outcome = if task.stage == BuildStage::Completed {
                        "Built".to_string()
                    } else {
                        format!("Stopped at {:.0}% building", task.percentage())
                    };
                    println!(
                        "{} '{}': {} chunks from {} files ({} skipped, {} warnings) in {}s",
                        outcome,
                        task.kb_name,
                        task.chunks_written,
                        task.files_processed,
                        task.files_skipped,
                        task.warnings.len(),
                        task.elapsed().num_seconds()
                    );
                }
            }
            Ok(())
        }
        Commands::Query {
            name,
            question,
            depth,
            top_k,
            no_rerank,
            model,
            reranker,
            format,
        } => {
            let store = SqliteVectorStore::open(&config.kb_dir(&name)).await?;
            let metadata = store.metadata();

            let model_dir = model.unwrap_or_else(|| metadata.model_dir.clone());
            let embedder = OnnxEmbeddingPipeline::load(config.embed_config(&model_dir)).await?;

            let reranker_dir = if no_rerank {
                None
            } else {
                reranker.or_else(|| metadata.reranker_dir.clone())
            };
            let reranker: Option<Arc<Reranker>> = match reranker_dir {
                Some(dir) => match Reranker::load(config.rerank_config(&dir)).await {
                    Ok(reranker) => Some(Arc::new(reranker)),
                    Err(e) => {
                        warn!("Reranker unavailable, using search order: {}", e);
                        None
                    }
                },
                None => None,
            };

            let mut retrieval = config.retrieval.clone();
            if let Some(depth) = depth {
                retrieval.search_depth = depth;
            }
            if let Some(top_k) = top_k {
                retrieval.rerank_count = top_k;
            }

            let (events, receiver) = EventSink::channel();
            let pipeline = QueryPipeline::new(Arc::new(embedder), reranker, &retrieval).with_events(events);
            let store = Arc::new(store);
            let worker = QueryWorker::spawn(
                Arc::new(pipeline),
                Arc::clone(&store) as Arc<dyn VectorStore>,
                StopCoordinator::new(),
            );
            let result = worker.ask(question).await;
            worker.shutdown().await?;
            let passages = result?;
            for event in receiver.drain() {
                if let RagEvent::Warning { message } = event {
                    eprintln!("Warning: {message}");
                }
            }
            store.close().await;

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&passages)?),
                OutputFormat::Summary => {
                    if passages.is_empty() {
                        println!("No passages found");
                    }
                    for (rank, passage) in passages.iter().enumerate() {
                        println!(
                            "{}. [{:.3}] {} (similarity {:.3})",
                            rank + 1,
                            passage.score,
                            passage.source,
                            passage.similarity
                        );
                        println!("   {}", passage.text.replace('\n', "\n   "));
                    }
                }
            }
            Ok(())
        }
        Commands::Info { name, format } => {
            let store = SqliteVectorStore::open(&config.kb_dir(&name)).await?;
            let info = InfoOutput {
                metadata: store.metadata(),
                stored_chunks: store.chunk_count().await?,
                sources: store.sources().await?,
            };
            store.close().await;

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
                OutputFormat::Summary => {
                    let metadata = &info.metadata;
                    println!("Knowledge base: {name}");
                    println!(
                        "Embedding model: {} ({} dimensions)",
                        metadata.embedding_model, metadata.embedding_dimension
                    );
                    println!("Model directory: {}", metadata.model_dir.display());
                    match &metadata.reranker_dir {
                        Some(dir) => println!("Reranker directory: {}", dir.display()),
                        None => println!("Reranker directory: none"),
                    }
                    println!("Chunks: {} ({} stored)", metadata.chunk_count, info.stored_chunks);
                    println!("Files: {}", metadata.file_count);
                    println!(
                        "Created: {}, last modified: {}",
                        metadata.created_at.format("%Y-%m-%d %H:%M:%S"),
                        metadata.last_modified.format("%Y-%m-%d %H:%M:%S")
                    );
                    for source in &info.sources {
                        println!("  {} [{}…] {} chunks", source.source, &source.file_hash[..12], source.chunks);
                    }
                }
            }
            Ok(())
        }
        Commands::Repoint {
            name,
            model,
            reranker,
        } => {
            let kb_dir = config.kb_dir(&name);
            if model.is_some() || reranker.is_some() {
                let reranker = reranker.map(|r| {
                    if r.eq_ignore_ascii_case("none") {
                        None
                    } else {
                        Some(PathBuf::from(r))
                    }
                });
                let metadata = set_model_dirs(&kb_dir, model, reranker)?;
                println!("Model directory: {}", metadata.model_dir.display());
                match &metadata.reranker_dir {
                    Some(dir) => println!("Reranker directory: {}", dir.display()),
                    None => println!("Reranker directory: none"),
                }
                return Ok(());
            }

            let report = repoint_models(&kb_dir, &config.paths.embedding_models, &config.paths.reranker_models)?;
            for warning in &report.warnings {
                eprintln!("Warning: {warning}");
            }
            if let Some(change) = &report.model_dir {
                println!("Model: {} -> {}", change.from.display(), change.to.display());
            }
            if let Some(change) = &report.reranker_dir {
                println!("Reranker: {} -> {}", change.from.display(), change.to.display());
            }
            if !report.changed() {
                println!("Nothing to repoint");
            }
            Ok(())
        }
    }
}

async fn print_events(receiver: flume::Receiver<RagEvent>, format: OutputFormat) {
    while let Ok(event) = receiver.recv_async().await {
        if format == OutputFormat::Json {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{line}");
            }
            continue;
        }
        match event {
            RagEvent::Progress {
                stage,
                processed,
                total,
                percentage,
            } => eprint!("\r{stage}: {processed}/{total} ({percentage:.0}%)   "),
            RagEvent::ExtractionComplete { chunks } => eprintln!("\nExtracted {chunks} chunks"),
            RagEvent::VectorizationComplete { vectors } => eprintln!("\nStored {vectors} vectors"),
            RagEvent::Warning { message } => eprintln!("\nWarning: {message}"),
            RagEvent::Error { message } => eprintln!("\nError: {message}"),
            RagEvent::Cancelled { stage } => eprintln!("\nStopped during {stage}"),
            RagEvent::RerankProgress { .. }
            | RagEvent::BuildCompleted { .. }
            | RagEvent::TaskCompleted { .. } => {}
        }
    }
}
