use anyhow::Result;
use clap::Parser;

use federated_search_engine::orchestrator::{Engine, SearchRequest};
use federated_search_engine::output::{format_output, OutputFormat};
use federated_search_engine::EngineConfig;

/// Federated product-search CLI
#[derive(Parser)]
#[command(name = "federated-search")]
#[command(about = "Federated product-search aggregator")]
#[command(version)]
struct Cli {
    /// Search query
    query: String,

    /// Comma-separated source names to search (defaults to the full set)
    #[arg(short, long)]
    sources: Option<String>,

    /// Result offset
    #[arg(short, long, default_value = "0")]
    offset: usize,

    /// Max results to return
    #[arg(short, long, default_value = "20")]
    limit: usize,

    /// Paginate each source independently instead of merging by price
    #[arg(long)]
    per_source: bool,

    /// Return whatever is ready within the timeout instead of waiting for
    /// every source
    #[arg(long)]
    partial: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    output: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let engine = Engine::new(EngineConfig::default());

    let sources = cli
        .sources
        .as_deref()
        .map(|s| s.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect());

    let response = engine
        .search_products(SearchRequest {
            query: cli.query,
            offset: cli.offset,
            limit: cli.limit,
            sources,
            per_source: cli.per_source,
            partial: cli.partial,
        })
        .await?;

    if response.items.is_empty() {
        println!("No products found.");
        if !response.pending_sources.is_empty() {
            eprintln!("Still pending: {}", response.pending_sources.join(", "));
        }
        return Ok(());
    }

    let output = format_output(&response.items, &cli.output)?;
    println!("{}", output);
    if !response.pending_sources.is_empty() {
        eprintln!("Still pending: {}", response.pending_sources.join(", "));
    }

    Ok(())
}
