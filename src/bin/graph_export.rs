use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use familiar_query::facts::load_facts;
use familiar_query::{GraphBuilder, QueryConfig, Schema};

#[derive(Parser)]
#[command(name = "query-graph-export")]
#[command(about = "Export the discovery graph of a schema to DOT format")]
struct Cli {
    /// Schema file, or a directory of schema documents
    #[arg(short, long)]
    schema: PathBuf,

    /// Facts to add to the graph as known instances
    #[arg(short, long)]
    facts: Option<PathBuf>,

    /// Output file (defaults to discovery.dot)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    println!("Loading schema from: {:?}", cli.schema);
    let schema = Arc::new(Schema::load(&cli.schema)?);
    let facts = match &cli.facts {
        Some(path) => load_facts(&schema, path)?,
        None => Vec::new(),
    };

    let config = QueryConfig::default();
    let builder = GraphBuilder::new(schema, config.cache.graph_capacity);
    let graph = builder.build(&facts, &BTreeSet::new(), &BTreeSet::new());

    println!(
        "Graph built: {} nodes, {} edges ({} facts)",
        graph.node_count(),
        graph.edge_count(),
        facts.len()
    );

    let output_path = cli.output.unwrap_or_else(|| PathBuf::from("discovery.dot"));
    std::fs::write(&output_path, graph.to_dot())?;
    println!("✅ Exported DOT to: {:?}", output_path);

    Ok(())
}
