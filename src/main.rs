//! Bitcoin AML Ledger Graph CLI
//!
//! Ingests blocks from a Bitcoin Core node into a ledger graph and runs
//! heuristic AML analyses over it.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use btc_aml_graph::analysis::{run_analysis, AnalysisKind, AnalysisReport};
use btc_aml_graph::clustering::{apply_common_input_ownership, entity_clusters};
use btc_aml_graph::config::AnalyzerConfig;
use btc_aml_graph::graph::{GraphStore, MemoryGraph};
use btc_aml_graph::ingest::Ingestor;
use btc_aml_graph::rpc::BitcoinRpcClient;
use btc_aml_graph::schemas::RunMetadata;
use btc_aml_graph::snapshot::{load_snapshot, save_snapshot, snapshot_exists};

/// Findings printed per section; the JSON report has all of them
const MAX_PRINTED: usize = 20;

#[derive(Parser)]
#[command(name = "btc-aml-graph")]
#[command(version)]
#[command(about = "Bitcoin ledger graph ETL and AML heuristics", long_about = None)]
struct Cli {
    /// Path to configuration file (optional, uses env vars if not provided)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (graph snapshot and run metadata)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest an inclusive block range, cluster, and run every analysis
    Etl {
        #[arg(long)]
        start_block: u64,

        #[arg(long)]
        end_block: u64,
    },

    /// Run analyses over the stored graph
    Analyze {
        /// Analysis to run
        #[arg(short = 't', long = "type", value_enum, default_value = "all")]
        kind: AnalysisKind,

        /// Dormancy threshold in years (default from config)
        #[arg(short, long)]
        years: Option<u32>,
    },

    /// Show graph counts and entity clusters
    Status,

    /// Delete every node and edge of the stored graph
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => AnalyzerConfig::load().context("Failed to load config from environment")?,
    };
    config
        .analysis
        .validate()
        .context("Invalid analysis settings")?;

    if let Some(data_dir) = &cli.data_dir {
        config.set_data_dir(data_dir.clone());
    }
    config.ensure_directories()?;

    match cli.command {
        Commands::Etl {
            start_block,
            end_block,
        } => {
            cmd_etl(&config, start_block, end_block).await?;
        }
        Commands::Analyze { kind, years } => {
            cmd_analyze(&config, kind, years)?;
        }
        Commands::Status => {
            cmd_status(&config)?;
        }
        Commands::Clear => {
            cmd_clear(&config)?;
        }
    }

    Ok(())
}

/// Graph from the last snapshot, or an empty one
fn open_graph(config: &AnalyzerConfig) -> Result<Arc<MemoryGraph>> {
    let graph = Arc::new(MemoryGraph::new());
    if snapshot_exists(&config.paths.snapshot_dir) {
        load_snapshot(graph.as_ref(), &config.paths.snapshot_dir)
            .context("Failed to load graph snapshot")?;
    } else {
        info!(
            "No snapshot in {:?}, starting with an empty graph",
            config.paths.snapshot_dir
        );
    }
    Ok(graph)
}

async fn cmd_etl(config: &AnalyzerConfig, start_block: u64, end_block: u64) -> Result<()> {
    info!("=== ETL: blocks {} to {} ===", start_block, end_block);

    if start_block > end_block {
        anyhow::bail!(
            "--start-block ({}) must not be greater than --end-block ({})",
            start_block,
            end_block
        );
    }
    let end_exclusive = end_block
        .checked_add(1)
        .context("--end-block is out of range")?;

    let client = BitcoinRpcClient::new(&config.node, config.rate_limits.clone())
        .context("Failed to build RPC client")?;
    let tip = client
        .ping()
        .await
        .with_context(|| format!("Bitcoin node at {} is unreachable", config.node.rpc_url()))?;
    info!("Connected to node at {} (tip height {})", config.node.rpc_url(), tip);
    if end_block > tip {
        warn!(
            "End block {} is above the node tip {}; missing heights will fail",
            end_block, tip
        );
    }

    let graph = open_graph(config)?;

    // Step 1: Ingest
    info!("\n--- Step 1: Ingest Blocks ---");
    let ingestor = Ingestor::new(
        Arc::new(client),
        graph.clone(),
        config.ingest.block_concurrency,
    );
    let ingest = ingestor.ingest_range(start_block..end_exclusive).await;
    if !ingest.is_complete() {
        warn!(
            "{} blocks failed and were skipped: {:?}",
            ingest.failed_heights.len(),
            ingest.failed_heights
        );
    }

    // Step 2: Cluster
    info!("\n--- Step 2: Common-Input Clustering ---");
    apply_common_input_ownership(graph.as_ref()).context("Clustering failed")?;

    save_snapshot(graph.as_ref(), &config.paths.snapshot_dir)
        .context("Failed to save graph snapshot")?;

    // Step 3: Analyze
    info!("\n--- Step 3: Analyze ---");
    let report = run_analysis(graph.as_ref(), &config.analysis, AnalysisKind::All, None)
        .context("Analysis failed")?;
    print_report(&report);
    save_report(config, &report)?;

    // Write metadata
    let mut metadata = RunMetadata::new(graph.stats()?);
    metadata.block_range = Some((start_block, end_block));
    metadata.failed_blocks = ingest.failed_heights.clone();
    let metadata_path = config.paths.metadata_dir.join("etl_metadata.json");
    metadata.save(&metadata_path)?;
    info!("Metadata saved to {:?}", metadata_path);

    info!("\n=== ETL Complete ===");
    Ok(())
}

fn cmd_analyze(config: &AnalyzerConfig, kind: AnalysisKind, years: Option<u32>) -> Result<()> {
    info!("=== Analyze: {:?} ===", kind);

    let graph = open_graph(config)?;
    let stats = graph.stats()?;
    if stats.transactions == 0 {
        warn!("Graph is empty; run `etl` first");
    }

    // Clustering is idempotent; rerun so SAME_ENTITY reflects the latest ingest
    apply_common_input_ownership(graph.as_ref()).context("Clustering failed")?;
    save_snapshot(graph.as_ref(), &config.paths.snapshot_dir)
        .context("Failed to save graph snapshot")?;

    let report = run_analysis(graph.as_ref(), &config.analysis, kind, years)
        .context("Analysis failed")?;
    print_report(&report);
    save_report(config, &report)?;

    let metadata = RunMetadata::new(graph.stats()?);
    let metadata_path = config.paths.metadata_dir.join("analyze_metadata.json");
    metadata.save(&metadata_path)?;

    Ok(())
}

fn cmd_status(config: &AnalyzerConfig) -> Result<()> {
    info!("=== Graph Status ===");
    info!("Data directory: {:?}", config.paths.data_dir);

    if !snapshot_exists(&config.paths.snapshot_dir) {
        info!("  {} snapshot: not found", "✗");
        return Ok(());
    }

    let graph = open_graph(config)?;
    let stats = graph.stats()?;
    info!("  {} snapshot: {:?}", "✓", config.paths.snapshot_dir);
    info!("  Addresses:     {}", stats.addresses);
    info!("  Transactions:  {} ({} incomplete)", stats.transactions, stats.incomplete_transactions);
    info!("  Blocks:        {}", stats.blocks);
    info!("  SENT:          {}", stats.sent_edges);
    info!("  RECEIVED:      {}", stats.received_edges);
    info!("  INCLUDED_IN:   {}", stats.included_in_edges);
    info!("  SAME_ENTITY:   {}", stats.same_entity_edges);

    let blocks = graph.blocks()?;
    if let (Some(first), Some(last)) = (blocks.first(), blocks.last()) {
        info!("  Height range:  {} - {}", first.height, last.height);
    }

    let clusters = entity_clusters(graph.as_ref())?;
    info!("  Entity clusters (>= 2 addresses): {}", clusters.len());
    if let Some(largest) = clusters.first() {
        info!("  Largest cluster: {} addresses", largest.len());
    }

    info!("\nMetadata files:");
    for file in ["etl_metadata.json", "analyze_metadata.json"] {
        let path = config.paths.metadata_dir.join(file);
        if path.exists() {
            info!("  {} {}", "✓", file);
        } else {
            info!("  {} {}", "✗", file);
        }
    }

    Ok(())
}

fn cmd_clear(config: &AnalyzerConfig) -> Result<()> {
    info!("=== Clearing Graph ===");

    let graph = open_graph(config)?;
    let before = graph.stats()?;
    graph.clear()?;
    save_snapshot(graph.as_ref(), &config.paths.snapshot_dir)
        .context("Failed to save graph snapshot")?;

    info!(
        "Removed {} transactions and {} addresses",
        before.transactions, before.addresses
    );
    Ok(())
}

fn print_report(report: &AnalysisReport) {
    if matches!(report.kind, AnalysisKind::Fan | AnalysisKind::All) {
        info!("Fan-out transactions: {}", report.fan_out.len());
        for f in report.fan_out.iter().take(MAX_PRINTED) {
            info!("  {}: {} in -> {} out", f.txid, f.inputs, f.outputs);
        }
        info!("Fan-in transactions: {}", report.fan_in.len());
        for f in report.fan_in.iter().take(MAX_PRINTED) {
            info!("  {}: {} in -> {} out", f.txid, f.inputs, f.outputs);
        }
    }

    for chains in [&report.self_change_chains, &report.ratio_chains] {
        for chain in chains.iter().take(MAX_PRINTED) {
            info!(
                "Peel chain ({}, {} hops): {}",
                chain.heuristic,
                chain.len(),
                chain.txids.join(" -> ")
            );
        }
    }
    if matches!(report.kind, AnalysisKind::PeelSelfChange | AnalysisKind::All) {
        info!("Self-change peel chains: {}", report.self_change_chains.len());
    }
    if matches!(report.kind, AnalysisKind::PeelHeuristic | AnalysisKind::All) {
        info!("Ratio peel chains: {}", report.ratio_chains.len());
    }

    for d in report.dormant.iter().take(MAX_PRINTED) {
        info!(
            "  Dormant: {} spent {:.8} BTC from {} after {:.0} days",
            d.txid, d.value, d.from_address, d.age_days
        );
    }

    if report.total_findings() == 0 {
        info!("No findings");
    }
}

fn save_report(config: &AnalyzerConfig, report: &AnalysisReport) -> Result<()> {
    let path = config.paths.metadata_dir.join(format!(
        "analysis_{}.json",
        Utc::now().format("%Y%m%dT%H%M%S")
    ));
    report.save(&path).context("Failed to write analysis report")?;
    info!("Report saved to {:?}", path);
    Ok(())
}
