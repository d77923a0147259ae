//! Sosa Report Binary
//!
//! Numbers the ancestors of a proband in a JSON pedigree and prints the
//! resulting statistics as JSON on stdout.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `SOSA_BATCH_SIZE`, `SOSA_MAX_GENERATION`, `SOSA_COMPUTE_TIMEOUT_SECS`,
//!   `SOSA_STATS_CACHE_ENTRIES`: see [`sosa_lineage::SosaConfig`]
//! - `RUST_LOG`: Log level filter (default: info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//!
//! Logs go to stderr so stdout stays a single JSON document.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin sosa_report -- --pedigree family.json --proband I1 --changed I7
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sosa_lineage::{
    AncestorDispersion, ComputeReport, DuplicatedAncestor, GenerationStats, InMemoryLineageGraph,
    InMemorySosaStore, IndividualId, PedigreeDocument, Scope, SosaCalculator, SosaConfig, StatisticsEngine,
    StatsSummary, REPORT_SCHEMA_VERSION,
};

#[derive(Debug, Parser)]
#[command(name = "sosa_report")]
#[command(about = "Sosa-Stradonitz ancestor numbering and statistics for a JSON pedigree")]
struct Cli {
    /// Pedigree document (individuals and families) as JSON.
    #[arg(long)]
    pedigree: PathBuf,
    /// Reference of the proband (Sosa 1).
    #[arg(long)]
    proband: String,
    /// Tree identifier of the scope.
    #[arg(long, default_value_t = 1)]
    tree_id: u32,
    /// User identifier of the scope.
    #[arg(long, default_value_t = 1)]
    user_id: u32,
    /// Individual whose ancestry changed; its subtrees are rebuilt after the full run.
    #[arg(long)]
    changed: Option<String>,
    /// Reference generation for branch dispersion.
    #[arg(long, default_value_t = 2)]
    dispersion_generation: u32,
    /// Number of duplicated root ancestors to list.
    #[arg(long, default_value_t = 10)]
    top: usize,
    /// Traversal depth cap (overrides `SOSA_MAX_GENERATION`).
    #[arg(long)]
    max_generation: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Report {
    schema_version: &'static str,
    full: ComputeReport,
    incremental: Option<ComputeReport>,
    summary: StatsSummary,
    generations: Vec<GenerationStats>,
    dispersion: AncestorDispersion,
    top_duplicates: Vec<DuplicatedAncestor>,
}

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "sosa_report=info,sosa_lineage=info".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SosaConfig::from_env();
    if cli.max_generation.is_some() {
        config.max_generation = cli.max_generation;
    }

    let raw = std::fs::read_to_string(&cli.pedigree)?;
    let document: PedigreeDocument = serde_json::from_str(&raw)?;
    let graph = InMemoryLineageGraph::from_document(document)?;
    info!(
        path = %cli.pedigree.display(),
        individuals = graph.num_individuals(),
        families = graph.num_families(),
        "Loaded pedigree"
    );

    let scope = Scope::new(cli.tree_id, cli.user_id);
    let store = Arc::new(InMemorySosaStore::new());
    let calculator = SosaCalculator::new(Arc::new(graph), store.clone(), config.clone());
    let engine = StatisticsEngine::new(store, config.stats_cache_entries);

    let full = calculator.compute_all(&scope, &IndividualId::parse(&cli.proband)?).await?;
    let incremental = match &cli.changed {
        Some(changed) => Some(
            calculator
                .compute_from_individual(&scope, &IndividualId::parse(changed)?)
                .await?,
        ),
        None => None,
    };

    let report = Report {
        schema_version: REPORT_SCHEMA_VERSION,
        full,
        incremental,
        summary: engine.summary(&scope).await?,
        generations: engine.per_generation_stats(&scope).await?.as_ref().clone(),
        dispersion: engine.ancestor_dispersion(&scope, cli.dispersion_generation).await?,
        top_duplicates: engine.top_duplicated_root_ancestors(&scope, cli.top).await?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
