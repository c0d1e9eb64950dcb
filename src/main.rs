//! CLI for the graph-augmented retrieval engine

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use graphrag::config::AppConfig;
use graphrag::embedding::FastembedEmbedder;
use graphrag::ingest::IngestionPipeline;
use graphrag::llm::{build_provider, LlmGateway};
use graphrag::router::{OutputFormat, SearchOptions, SearchRouter};
use graphrag::store::ArtifactStore;
use graphrag::{Error, SearchMode};

#[derive(Parser)]
#[command(name = "graphrag", about = "Graph-augmented retrieval over a document corpus")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config/config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add documents from the input directory to the index
    Add,

    /// Search the index
    Search {
        /// The search query
        query: String,

        /// Search mode: local, global, drift or auto
        #[arg(long, default_value = "global")]
        mode: String,

        /// Requested shape of the answer (e.g. "multiple paragraphs")
        #[arg(long = "response-type", default_value = "multiple paragraphs")]
        response_type: String,

        /// Output format: markdown or json
        #[arg(long = "output-format", default_value = "markdown")]
        output_format: String,

        /// Minimum community rank to include
        #[arg(long = "min-community-rank")]
        min_community_rank: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    graphrag::init().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ Error::Config(_)) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = AppConfig::load(&cli.config)?;
    config.validate_credentials()?;

    let provider = build_provider(&config).await?;
    let gateway = LlmGateway::new(provider, config.max_continuation_attempts);
    let embedder = Arc::new(FastembedEmbedder::new(&config.embedding_model.name)?);

    match cli.command {
        Command::Add => {
            let pipeline = IngestionPipeline::new(config, gateway, embedder);
            let report = pipeline.add_documents().await?;
            println!(
                "Processed {} new documents ({} chunks, {} entities, {} relationships, \
                 {} communities, {} summaries).",
                report.new_documents,
                report.chunks,
                report.entities,
                report.relationships,
                report.communities,
                report.summaries,
            );
        }
        Command::Search {
            query,
            mode,
            response_type,
            output_format,
            min_community_rank,
        } => {
            let options = SearchOptions {
                mode: mode.parse::<SearchMode>()?,
                response_type: Some(response_type),
                output_format: output_format.parse::<OutputFormat>()?,
                min_community_rank,
            };

            let store = ArtifactStore::new(config.output_dir.clone(), embedder);
            let router = SearchRouter::new(&store, gateway, config);
            let result = router.search(&query, &options).await?;

            if result.nodes.is_empty() {
                println!("No results found.");
                return Ok(());
            }

            match options.output_format {
                OutputFormat::Json => {
                    let rendered = serde_json::json!({
                        "metadata": result.metadata,
                        "nodes": result.nodes.iter().map(|n| serde_json::json!({
                            "text": n.text,
                            "score": n.score,
                            "metadata": n.metadata,
                        })).collect::<Vec<_>>(),
                    });
                    println!("{}", serde_json::to_string_pretty(&rendered)?);
                }
                OutputFormat::Markdown => {
                    for (i, node) in result.nodes.iter().enumerate() {
                        if i == 0 {
                            println!("{}", node.text);
                        } else {
                            println!("\n--- Key Point {i} (score: {:.2}) ---", node.score);
                            println!("{}", node.text);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
