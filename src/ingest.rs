//! Block ingestion.
//!
//! Turns decoded blocks from a [`BlockSource`] into graph mutations:
//! - transaction nodes and their INCLUDED_IN block link
//! - RECEIVED edges for outputs with a standard address
//! - SENT edges for inputs, resolved through the spent transaction
//!
//! Each height is an independent unit of work. A block that fails to fetch
//! or write is logged and reported, and the rest of the range continues.

use crate::address::resolve_address;
use crate::graph::{GraphError, GraphStore};
use crate::rpc::{BlockSource, RpcError, Transaction};
use crate::schemas::SECONDS_PER_DAY;
use chrono::DateTime;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Block {height} has invalid timestamp {time}")]
    InvalidTimestamp { height: u64, time: i64 },
}

/// Outcome of one `ingest_range` call
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub blocks_requested: usize,
    pub blocks_ingested: usize,
    pub transactions: usize,
    pub received_edges: usize,
    pub sent_edges: usize,
    /// Outputs without a standard address
    pub skipped_outputs: usize,
    /// Inputs whose spent output has no standard address or could not be found
    pub skipped_inputs: usize,
    /// Heights that failed, ascending
    pub failed_heights: Vec<u64>,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.failed_heights.is_empty()
    }

    fn absorb(&mut self, counts: &BlockCounts) {
        self.blocks_ingested += 1;
        self.transactions += counts.transactions;
        self.received_edges += counts.received_edges;
        self.sent_edges += counts.sent_edges;
        self.skipped_outputs += counts.skipped_outputs;
        self.skipped_inputs += counts.skipped_inputs;
    }
}

#[derive(Debug, Default)]
struct BlockCounts {
    transactions: usize,
    received_edges: usize,
    sent_edges: usize,
    skipped_outputs: usize,
    skipped_inputs: usize,
}

/// Block ingestion pipeline
pub struct Ingestor {
    source: Arc<dyn BlockSource>,
    store: Arc<dyn GraphStore>,
    concurrency: usize,
}

impl Ingestor {
    /// `concurrency` is the number of blocks in flight; 1 processes heights in order
    pub fn new(
        source: Arc<dyn BlockSource>,
        store: Arc<dyn GraphStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Ingest every height in the half-open range `heights`
    pub async fn ingest_range(&self, heights: Range<u64>) -> IngestReport {
        let total = heights.end.saturating_sub(heights.start) as usize;
        let mut report = IngestReport {
            blocks_requested: total,
            ..IngestReport::default()
        };
        if total == 0 {
            return report;
        }

        info!(
            "Ingesting blocks {} to {} ({} blocks, concurrency {})",
            heights.start,
            heights.end - 1,
            total,
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<u64> = heights.clone().collect();

        for height in heights {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let source = Arc::clone(&self.source);
            let store = Arc::clone(&self.store);
            tasks.spawn(async move {
                let _permit = permit;
                let result = ingest_block(source.as_ref(), store.as_ref(), height).await;
                (height, result)
            });

            // Reap finished blocks so progress is visible on long ranges
            while let Some(joined) = tasks.try_join_next() {
                self.record(joined, &mut report, &mut pending, total);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.record(joined, &mut report, &mut pending, total);
        }

        // Anything still pending never reported back (panicked task)
        for height in &pending {
            warn!("Block {} did not finish, marking as failed", height);
        }
        report.failed_heights.extend(pending);
        report.failed_heights.sort_unstable();

        info!(
            "Ingested {}/{} blocks: {} transactions, {} RECEIVED, {} SENT, {} failed",
            report.blocks_ingested,
            report.blocks_requested,
            report.transactions,
            report.received_edges,
            report.sent_edges,
            report.failed_heights.len()
        );
        report
    }

    fn record(
        &self,
        joined: Result<(u64, Result<BlockCounts, IngestError>), tokio::task::JoinError>,
        report: &mut IngestReport,
        pending: &mut BTreeSet<u64>,
        total: usize,
    ) {
        let (height, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!("Ingestion task failed: {}", e);
                return;
            }
        };
        pending.remove(&height);

        match result {
            Ok(counts) => {
                debug!(
                    "Block {}: {} transactions, {} RECEIVED, {} SENT",
                    height, counts.transactions, counts.received_edges, counts.sent_edges
                );
                report.absorb(&counts);
                let done = report.blocks_ingested + report.failed_heights.len();
                if done % 100 == 0 || done == total {
                    info!(
                        "Progress: {}/{} blocks ({:.1}% complete)",
                        done,
                        total,
                        done as f64 / total as f64 * 100.0
                    );
                }
            }
            Err(e) => {
                warn!("Failed to ingest block {}: {} - skipping", height, e);
                report.failed_heights.push(height);
            }
        }
    }
}

/// Write one block. Transactions are marked complete as soon as all of their
/// edges are in the store, so a failure part-way leaves the rest incomplete.
async fn ingest_block(
    source: &dyn BlockSource,
    store: &dyn GraphStore,
    height: u64,
) -> Result<BlockCounts, IngestError> {
    let block = source.block_by_height(height).await?;
    let timestamp = DateTime::from_timestamp(block.time, 0).ok_or(IngestError::InvalidTimestamp {
        height,
        time: block.time,
    })?;

    let mut counts = BlockCounts::default();
    // Outputs spent within the same block resolve without a node round trip
    let in_block: HashMap<&str, &Transaction> = block
        .transactions
        .iter()
        .map(|tx| (tx.txid.as_str(), tx))
        .collect();
    let mut fetched: HashMap<String, Transaction> = HashMap::new();

    for tx in &block.transactions {
        store.upsert_transaction(&tx.txid, Some(height))?;
        store.link_block(&tx.txid, height, &block.hash, timestamp)?;
        counts.transactions += 1;

        for (address, value) in group_outputs(tx, &mut counts) {
            store.link_received(&tx.txid, &address, value)?;
            counts.received_edges += 1;
        }

        if !tx.is_coinbase() {
            // (address, summed value, oldest age)
            let mut inputs: Vec<(String, f64, f64)> = Vec::new();

            for input in &tx.vin {
                let (Some(prev_txid), Some(vout)) = (input.txid.as_deref(), input.vout) else {
                    counts.skipped_inputs += 1;
                    continue;
                };

                if !in_block.contains_key(prev_txid) && !fetched.contains_key(prev_txid) {
                    let prev = source.transaction(prev_txid).await?;
                    fetched.insert(prev_txid.to_string(), prev);
                }
                let Some(prev) = in_block
                    .get(prev_txid)
                    .copied()
                    .or_else(|| fetched.get(prev_txid))
                else {
                    counts.skipped_inputs += 1;
                    continue;
                };

                let Some(output) = prev.output(vout) else {
                    debug!("{}: spent output {}:{} not found", tx.txid, prev_txid, vout);
                    counts.skipped_inputs += 1;
                    continue;
                };
                let address = match resolve_address(&output.script_pub_key) {
                    Ok(address) => address,
                    Err(e) => {
                        debug!("{}: input {}:{} skipped ({})", tx.txid, prev_txid, vout, e);
                        counts.skipped_inputs += 1;
                        continue;
                    }
                };

                let created = prev.confirmed_at().unwrap_or(block.time);
                let age_days = ((block.time - created) as f64 / SECONDS_PER_DAY).max(0.0);

                match inputs.iter_mut().find(|(a, _, _)| *a == address) {
                    Some(entry) => {
                        entry.1 += output.value;
                        entry.2 = entry.2.max(age_days);
                    }
                    None => inputs.push((address, output.value, age_days)),
                }
            }

            for (address, value, age_days) in inputs {
                store.link_sent(&address, &tx.txid, value, Some(age_days))?;
                counts.sent_edges += 1;
            }
        }

        store.mark_complete(&tx.txid)?;
    }

    Ok(counts)
}

/// Outputs summed per address, in order of first appearance
fn group_outputs(tx: &Transaction, counts: &mut BlockCounts) -> Vec<(String, f64)> {
    let mut grouped: Vec<(String, f64)> = Vec::new();
    for output in &tx.vout {
        match resolve_address(&output.script_pub_key) {
            Ok(address) => match grouped.iter_mut().find(|(a, _)| *a == address) {
                Some(entry) => entry.1 += output.value,
                None => grouped.push((address, output.value)),
            },
            Err(e) => {
                debug!("{}: output {} skipped ({})", tx.txid, output.n, e);
                counts.skipped_outputs += 1;
            }
        }
    }
    grouped
}
