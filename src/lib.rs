//! Bitcoin AML Ledger Graph Library
//!
//! Builds a graph of addresses, transactions and blocks from a Bitcoin Core
//! node and runs money-laundering heuristics over it.
//!
//! # Stages
//!
//! 1. **Ingestion** ([`ingest`]): blocks from the node become graph nodes and
//!    SENT / RECEIVED / INCLUDED_IN edges
//! 2. **Clustering** ([`clustering`]): common-input-ownership SAME_ENTITY links
//! 3. **Detectors** ([`detectors`]): fan-out, fan-in and dormant funds scans
//! 4. **Peel chains** ([`peel_chain`]): ratio and self-change chain reconstruction
//!
//! The graph lives in a [`graph::GraphStore`]; the CLI persists it between
//! runs as a Parquet [`snapshot`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use btc_aml_graph::config::AnalyzerConfig;
//! use btc_aml_graph::graph::MemoryGraph;
//! use btc_aml_graph::ingest::Ingestor;
//! use btc_aml_graph::rpc::BitcoinRpcClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AnalyzerConfig::load()?;
//!     let client = BitcoinRpcClient::new(&config.node, config.rate_limits.clone())?;
//!     let graph = Arc::new(MemoryGraph::new());
//!     let report = Ingestor::new(Arc::new(client), graph.clone(), 1)
//!         .ingest_range(800_000..800_010)
//!         .await;
//!     println!("Ingested {} transactions", report.transactions);
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod analysis;
pub mod clustering;
pub mod config;
pub mod detectors;
pub mod graph;
pub mod ingest;
pub mod peel_chain;
pub mod rpc;
pub mod schemas;
pub mod snapshot;

// Re-export commonly used types
pub use analysis::{run_analysis, AnalysisError, AnalysisKind, AnalysisReport};
pub use config::AnalyzerConfig;
pub use graph::{GraphError, GraphStore, MemoryGraph};
pub use schemas::{DormantFinding, FanFinding, GraphStats, PeelChain, RunMetadata};
