//! Query Resolve CLI
//!
//! Resolves a target type from a schema, a facts document and stubbed
//! operation responses, printing each result with its provenance.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use familiar_query::facts::load_facts;
use familiar_query::{FailureBehaviour, QueryConfig, QueryEngine, Schema, StubOperationInvoker};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "query-resolve")]
#[command(about = "Resolve a target type from known facts")]
struct Cli {
    /// Schema file, or a directory of schema documents
    #[arg(short, long)]
    schema: PathBuf,

    /// Facts document: a JSON array of {"type", "value"} entries
    #[arg(short, long)]
    facts: Option<PathBuf>,

    /// Stubbed operation responses, keyed by Service.operation
    #[arg(long)]
    stubs: Option<PathBuf>,

    /// Type to resolve
    #[arg(short, long)]
    target: String,

    /// Construct the target from the facts instead of discovering it
    #[arg(long, conflicts_with = "gather")]
    build: bool,

    /// Return every value of the target rather than the first
    #[arg(long)]
    gather: bool,

    /// Emit failure markers instead of failing
    #[arg(long)]
    failure_marker: bool,

    /// Config file (defaults to the standard search locations)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = QueryConfig::load_from(cli.config.as_deref().and_then(|p| p.to_str()))
        .context("loading configuration")?;
    if cli.failure_marker {
        config = config.with_failure_behaviour(FailureBehaviour::SendFailureMarker);
    }

    let schema = Arc::new(
        Schema::load(&cli.schema).with_context(|| format!("loading schema from {:?}", cli.schema))?,
    );
    let facts = match &cli.facts {
        Some(path) => load_facts(&schema, path).with_context(|| format!("loading facts from {:?}", path))?,
        None => Vec::new(),
    };
    let invoker = match &cli.stubs {
        Some(path) => StubOperationInvoker::from_file(schema.clone(), path)
            .with_context(|| format!("loading stubs from {:?}", path))?,
        None => StubOperationInvoker::new(schema.clone()),
    };
    let invoker = Arc::new(invoker);

    let engine = QueryEngine::with_config(schema, invoker.clone(), config);
    let mut result = if cli.build {
        engine.build(&cli.target, facts)?
    } else if cli.gather {
        engine.gather(&cli.target, facts)?
    } else {
        engine.find(&cli.target, facts)?
    };

    let values = if cli.gather {
        result.collect().await?
    } else {
        vec![result.first().await?]
    };
    for value in &values {
        println!("{}", serde_json::to_string_pretty(value)?);
    }

    eprintln!(
        "{} result(s), fully resolved: {}, {} operation call(s)",
        values.len(),
        result.is_fully_resolved(),
        invoker.total_invocations()
    );
    Ok(())
}
