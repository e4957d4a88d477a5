//! Data schemas for the ledger graph.
//!
//! Nodes, edges and finding records shared by the store, the detectors and
//! the CLI. This module serves as the canonical schema definition for the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version for tracking changes
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Seconds in one day, used for `age_days`
pub const SECONDS_PER_DAY: f64 = 86_400.0;

// ============================================================================
// PART A: Nodes
// ============================================================================

/// Transaction node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionNode {
    /// Transaction id (hex)
    pub txid: String,

    /// Height of the including block, unknown until linked
    pub block_height: Option<u64>,

    /// Discovery order within the store (first upsert wins)
    pub ordinal: u64,

    /// All edges of the transaction were written by ingestion
    pub complete: bool,
}

/// Block node, keyed by height
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockNode {
    pub height: u64,
    pub hash: String,
    /// Time of inclusion
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// PART B: Edges
// ============================================================================

/// SENT: an address was consumed as an input of a transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentEdge {
    pub address: String,
    pub txid: String,
    /// Value in BTC
    pub value: f64,
    /// Days between the source output's creation and this spend
    pub age_days: Option<f64>,
}

/// RECEIVED: a transaction created an output paying an address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceivedEdge {
    pub txid: String,
    pub address: String,
    /// Value in BTC
    pub value: f64,
}

/// Node and edge counts of a graph
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub addresses: usize,
    pub transactions: usize,
    pub blocks: usize,
    pub sent_edges: usize,
    pub received_edges: usize,
    pub included_in_edges: usize,
    pub same_entity_edges: usize,
    pub incomplete_transactions: usize,
}

// ============================================================================
// PART C: Findings
// ============================================================================

/// Fan-out / fan-in match with both degrees
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanFinding {
    pub txid: String,
    pub inputs: usize,
    pub outputs: usize,
}

/// A SENT edge whose source output sat unspent for a long time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DormantFinding {
    pub txid: String,
    pub from_address: String,
    pub value: f64,
    pub age_days: f64,
}

/// Which link predicate produced a chain
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeelHeuristic {
    /// Small/large output split relative to total input
    Ratio,
    /// One output returns to the single input address
    SelfChange,
}

impl std::fmt::Display for PeelHeuristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeelHeuristic::Ratio => write!(f, "ratio"),
            PeelHeuristic::SelfChange => write!(f, "self-change"),
        }
    }
}

/// Reconstructed peeling chain, in spend order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeelChain {
    pub heuristic: PeelHeuristic,
    pub txids: Vec<String>,
    /// `change_addresses[i]` is the change address of `txids[i]`
    pub change_addresses: Vec<String>,
}

impl PeelChain {
    pub fn len(&self) -> usize {
        self.txids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txids.is_empty()
    }
}

// ============================================================================
// Metadata Schema
// ============================================================================

/// Run metadata for reproducibility and auditing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Schema version used
    pub schema_version: String,

    /// Run timestamp
    pub run_timestamp: DateTime<Utc>,

    /// Ingested heights, inclusive
    pub block_range: Option<(u64, u64)>,

    /// Heights that failed and were skipped
    pub failed_blocks: Vec<u64>,

    /// Graph counts after the run
    pub graph: GraphStats,

    /// Git commit hash (if available)
    pub git_commit: Option<String>,

    /// Tool version
    pub pipeline_version: String,
}

impl RunMetadata {
    pub fn new(graph: GraphStats) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_timestamp: Utc::now(),
            block_range: None,
            failed_blocks: Vec::new(),
            graph,
            git_commit: get_git_commit(),
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn get_git_commit() -> Option<String> {
    std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
}
