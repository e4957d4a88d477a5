//! Ledger graph store.
//!
//! [`GraphStore`] is the contract every analysis component works against:
//! merge-by-key mutation primitives plus the read scans the detectors need.
//! [`MemoryGraph`] is the in-process implementation; it is persisted between
//! runs by [`crate::snapshot`].
//!
//! All mutations are idempotent. Writing an edge for a transaction or address
//! that does not exist yet creates the missing node, so blocks may be ingested
//! partially or out of order.

use crate::schemas::{BlockNode, GraphStats, ReceivedEdge, SentEdge, TransactionNode};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("Invalid {field} for {key}: {value}")]
    InvalidValue {
        field: &'static str,
        key: String,
        value: f64,
    },

    #[error("Conflicting value for {edge} {from} -> {to}: stored {stored}, got {got}")]
    ValueConflict {
        edge: &'static str,
        from: String,
        to: String,
        stored: f64,
        got: f64,
    },

    #[error("SAME_ENTITY self-loop on {0}")]
    SelfLoop(String),

    #[error("Graph lock poisoned")]
    Poisoned,
}

/// Storage contract for the ledger graph.
///
/// Implementations must be safe to call concurrently; ingestion may write
/// several blocks at once.
pub trait GraphStore: Send + Sync {
    // --------------------------------------------------------------------
    // Mutation
    // --------------------------------------------------------------------

    /// Create the transaction if missing; a known height refreshes the attribute
    fn upsert_transaction(&self, txid: &str, block_height: Option<u64>) -> Result<(), GraphError>;

    fn upsert_address(&self, address: &str) -> Result<(), GraphError>;

    /// RECEIVED (transaction -> address)
    fn link_received(&self, txid: &str, address: &str, value: f64) -> Result<(), GraphError>;

    /// SENT (address -> transaction)
    fn link_sent(
        &self,
        address: &str,
        txid: &str,
        value: f64,
        age_days: Option<f64>,
    ) -> Result<(), GraphError>;

    /// INCLUDED_IN (transaction -> block); creates or refreshes the block
    fn link_block(
        &self,
        txid: &str,
        height: u64,
        hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), GraphError>;

    /// Undirected SAME_ENTITY; returns `true` if the edge is new
    fn link_same_entity(&self, a: &str, b: &str) -> Result<bool, GraphError>;

    /// Flag a transaction whose edges have all been written
    fn mark_complete(&self, txid: &str) -> Result<(), GraphError>;

    /// Drop every node and edge
    fn clear(&self) -> Result<(), GraphError>;

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    fn transaction(&self, txid: &str) -> Result<Option<TransactionNode>, GraphError>;

    /// All transactions in discovery order
    fn transactions(&self) -> Result<Vec<TransactionNode>, GraphError>;

    fn block(&self, height: u64) -> Result<Option<BlockNode>, GraphError>;

    /// All blocks by ascending height
    fn blocks(&self) -> Result<Vec<BlockNode>, GraphError>;

    /// All addresses in discovery order
    fn addresses(&self) -> Result<Vec<String>, GraphError>;

    fn sent_in_degree(&self, txid: &str) -> Result<usize, GraphError>;

    fn received_out_degree(&self, txid: &str) -> Result<usize, GraphError>;

    /// SENT edges into a transaction, in write order
    fn inputs(&self, txid: &str) -> Result<Vec<SentEdge>, GraphError>;

    /// RECEIVED edges out of a transaction, in write order
    fn outputs(&self, txid: &str) -> Result<Vec<ReceivedEdge>, GraphError>;

    /// Transactions that consumed the address as an input, in write order
    fn spenders_of(&self, address: &str) -> Result<Vec<String>, GraphError>;

    /// SENT edges with a known `age_days >= min_age_days`
    fn sent_edges_min_age(&self, min_age_days: f64) -> Result<Vec<SentEdge>, GraphError>;

    /// Every SENT edge, grouped by transaction in discovery order
    fn sent_edges(&self) -> Result<Vec<SentEdge>, GraphError>;

    /// Every RECEIVED edge, grouped by transaction in discovery order
    fn received_edges(&self) -> Result<Vec<ReceivedEdge>, GraphError>;

    /// SAME_ENTITY pairs as `(smaller, larger)`
    fn same_entity_pairs(&self) -> Result<Vec<(String, String)>, GraphError>;

    fn stats(&self) -> Result<GraphStats, GraphError>;
}

fn check_value(field: &'static str, key: &str, value: f64) -> Result<(), GraphError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(GraphError::InvalidValue {
            field,
            key: key.to_string(),
            value,
        })
    }
}

#[derive(Debug, Default)]
struct TxEntry {
    block_height: Option<u64>,
    ordinal: u64,
    complete: bool,
    /// (address, value, age_days)
    inputs: Vec<(String, f64, Option<f64>)>,
    /// (address, value)
    outputs: Vec<(String, f64)>,
}

#[derive(Debug, Default)]
struct GraphInner {
    tx_index: HashMap<String, TxEntry>,
    tx_order: Vec<String>,
    address_index: HashSet<String>,
    address_order: Vec<String>,
    /// address -> spending txids
    spenders: HashMap<String, Vec<String>>,
    blocks: HashMap<u64, (String, DateTime<Utc>)>,
    same_entity: HashSet<(String, String)>,
    same_entity_order: Vec<(String, String)>,
}

impl GraphInner {
    fn tx_entry(&mut self, txid: &str) -> &mut TxEntry {
        let order = &mut self.tx_order;
        self.tx_index.entry(txid.to_string()).or_insert_with(|| {
            let ordinal = order.len() as u64;
            order.push(txid.to_string());
            TxEntry {
                ordinal,
                ..TxEntry::default()
            }
        })
    }

    fn ensure_address(&mut self, address: &str) {
        if self.address_index.insert(address.to_string()) {
            self.address_order.push(address.to_string());
        }
    }

    fn node(&self, txid: &str) -> Option<TransactionNode> {
        self.tx_index.get(txid).map(|e| TransactionNode {
            txid: txid.to_string(),
            block_height: e.block_height,
            ordinal: e.ordinal,
            complete: e.complete,
        })
    }
}

/// In-memory [`GraphStore`] guarded by a single `RwLock`
#[derive(Debug, Default)]
pub struct MemoryGraph {
    inner: RwLock<GraphInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GraphInner>, GraphError> {
        self.inner.read().map_err(|_| GraphError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GraphInner>, GraphError> {
        self.inner.write().map_err(|_| GraphError::Poisoned)
    }
}

impl GraphStore for MemoryGraph {
    fn upsert_transaction(&self, txid: &str, block_height: Option<u64>) -> Result<(), GraphError> {
        let mut g = self.write()?;
        let entry = g.tx_entry(txid);
        if block_height.is_some() {
            entry.block_height = block_height;
        }
        Ok(())
    }

    fn upsert_address(&self, address: &str) -> Result<(), GraphError> {
        self.write()?.ensure_address(address);
        Ok(())
    }

    fn link_received(&self, txid: &str, address: &str, value: f64) -> Result<(), GraphError> {
        check_value("value", txid, value)?;
        let mut g = self.write()?;
        g.ensure_address(address);
        let entry = g.tx_entry(txid);
        match entry.outputs.iter().position(|(a, _)| a == address) {
            Some(i) if entry.outputs[i].1 != value => Err(GraphError::ValueConflict {
                edge: "RECEIVED",
                from: txid.to_string(),
                to: address.to_string(),
                stored: entry.outputs[i].1,
                got: value,
            }),
            Some(_) => Ok(()),
            None => {
                entry.outputs.push((address.to_string(), value));
                Ok(())
            }
        }
    }

    fn link_sent(
        &self,
        address: &str,
        txid: &str,
        value: f64,
        age_days: Option<f64>,
    ) -> Result<(), GraphError> {
        check_value("value", txid, value)?;
        if let Some(age) = age_days {
            check_value("age_days", txid, age)?;
        }
        let mut g = self.write()?;
        g.ensure_address(address);
        let entry = g.tx_entry(txid);
        if let Some(existing) = entry.inputs.iter_mut().find(|(a, _, _)| a == address) {
            if existing.1 != value {
                return Err(GraphError::ValueConflict {
                    edge: "SENT",
                    from: address.to_string(),
                    to: txid.to_string(),
                    stored: existing.1,
                    got: value,
                });
            }
            if age_days.is_some() {
                existing.2 = age_days;
            }
            return Ok(());
        }
        entry.inputs.push((address.to_string(), value, age_days));
        g.spenders
            .entry(address.to_string())
            .or_default()
            .push(txid.to_string());
        Ok(())
    }

    fn link_block(
        &self,
        txid: &str,
        height: u64,
        hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let mut g = self.write()?;
        g.blocks.insert(height, (hash.to_string(), timestamp));
        g.tx_entry(txid).block_height = Some(height);
        Ok(())
    }

    fn link_same_entity(&self, a: &str, b: &str) -> Result<bool, GraphError> {
        if a == b {
            return Err(GraphError::SelfLoop(a.to_string()));
        }
        let key = if a < b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        let mut g = self.write()?;
        g.ensure_address(a);
        g.ensure_address(b);
        if g.same_entity.insert(key.clone()) {
            g.same_entity_order.push(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn mark_complete(&self, txid: &str) -> Result<(), GraphError> {
        self.write()?.tx_entry(txid).complete = true;
        Ok(())
    }

    fn clear(&self) -> Result<(), GraphError> {
        *self.write()? = GraphInner::default();
        Ok(())
    }

    fn transaction(&self, txid: &str) -> Result<Option<TransactionNode>, GraphError> {
        Ok(self.read()?.node(txid))
    }

    fn transactions(&self) -> Result<Vec<TransactionNode>, GraphError> {
        let g = self.read()?;
        Ok(g.tx_order.iter().filter_map(|txid| g.node(txid)).collect())
    }

    fn block(&self, height: u64) -> Result<Option<BlockNode>, GraphError> {
        Ok(self
            .read()?
            .blocks
            .get(&height)
            .map(|(hash, timestamp)| BlockNode {
                height,
                hash: hash.clone(),
                timestamp: *timestamp,
            }))
    }

    fn blocks(&self) -> Result<Vec<BlockNode>, GraphError> {
        let g = self.read()?;
        let mut blocks: Vec<BlockNode> = g
            .blocks
            .iter()
            .map(|(height, (hash, timestamp))| BlockNode {
                height: *height,
                hash: hash.clone(),
                timestamp: *timestamp,
            })
            .collect();
        blocks.sort_by_key(|b| b.height);
        Ok(blocks)
    }

    fn addresses(&self) -> Result<Vec<String>, GraphError> {
        Ok(self.read()?.address_order.clone())
    }

    fn sent_in_degree(&self, txid: &str) -> Result<usize, GraphError> {
        Ok(self.read()?.tx_index.get(txid).map_or(0, |e| e.inputs.len()))
    }

    fn received_out_degree(&self, txid: &str) -> Result<usize, GraphError> {
        Ok(self.read()?.tx_index.get(txid).map_or(0, |e| e.outputs.len()))
    }

    fn inputs(&self, txid: &str) -> Result<Vec<SentEdge>, GraphError> {
        let g = self.read()?;
        Ok(g.tx_index.get(txid).map_or_else(Vec::new, |e| {
            e.inputs
                .iter()
                .map(|(address, value, age_days)| SentEdge {
                    address: address.clone(),
                    txid: txid.to_string(),
                    value: *value,
                    age_days: *age_days,
                })
                .collect()
        }))
    }

    fn outputs(&self, txid: &str) -> Result<Vec<ReceivedEdge>, GraphError> {
        let g = self.read()?;
        Ok(g.tx_index.get(txid).map_or_else(Vec::new, |e| {
            e.outputs
                .iter()
                .map(|(address, value)| ReceivedEdge {
                    txid: txid.to_string(),
                    address: address.clone(),
                    value: *value,
                })
                .collect()
        }))
    }

    fn spenders_of(&self, address: &str) -> Result<Vec<String>, GraphError> {
        Ok(self.read()?.spenders.get(address).cloned().unwrap_or_default())
    }

    fn sent_edges_min_age(&self, min_age_days: f64) -> Result<Vec<SentEdge>, GraphError> {
        Ok(self
            .sent_edges()?
            .into_iter()
            .filter(|e| e.age_days.is_some_and(|age| age >= min_age_days))
            .collect())
    }

    fn sent_edges(&self) -> Result<Vec<SentEdge>, GraphError> {
        let g = self.read()?;
        let mut edges = Vec::new();
        for txid in &g.tx_order {
            if let Some(entry) = g.tx_index.get(txid) {
                edges.extend(entry.inputs.iter().map(|(address, value, age_days)| SentEdge {
                    address: address.clone(),
                    txid: txid.clone(),
                    value: *value,
                    age_days: *age_days,
                }));
            }
        }
        Ok(edges)
    }

    fn received_edges(&self) -> Result<Vec<ReceivedEdge>, GraphError> {
        let g = self.read()?;
        let mut edges = Vec::new();
        for txid in &g.tx_order {
            if let Some(entry) = g.tx_index.get(txid) {
                edges.extend(entry.outputs.iter().map(|(address, value)| ReceivedEdge {
                    txid: txid.clone(),
                    address: address.clone(),
                    value: *value,
                }));
            }
        }
        Ok(edges)
    }

    fn same_entity_pairs(&self) -> Result<Vec<(String, String)>, GraphError> {
        Ok(self.read()?.same_entity_order.clone())
    }

    fn stats(&self) -> Result<GraphStats, GraphError> {
        let g = self.read()?;
        let mut stats = GraphStats {
            addresses: g.address_order.len(),
            transactions: g.tx_order.len(),
            blocks: g.blocks.len(),
            same_entity_edges: g.same_entity.len(),
            ..GraphStats::default()
        };
        for entry in g.tx_index.values() {
            stats.sent_edges += entry.inputs.len();
            stats.received_edges += entry.outputs.len();
            if entry.block_height.is_some_and(|h| g.blocks.contains_key(&h)) {
                stats.included_in_edges += 1;
            }
            if !entry.complete {
                stats.incomplete_transactions += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let g = MemoryGraph::new();
        g.upsert_transaction("t1", Some(5)).unwrap();
        g.upsert_transaction("t1", None).unwrap();
        g.upsert_address("a").unwrap();
        g.upsert_address("a").unwrap();

        let stats = g.stats().unwrap();
        assert_eq!(stats.transactions, 1);
        assert_eq!(stats.addresses, 1);
        // Unknown height does not erase a known one
        assert_eq!(g.transaction("t1").unwrap().unwrap().block_height, Some(5));
    }

    #[test]
    fn test_edges_create_missing_nodes() {
        let g = MemoryGraph::new();
        g.link_received("t1", "a", 1.5).unwrap();
        g.link_sent("b", "t2", 0.5, Some(3.0)).unwrap();

        let stats = g.stats().unwrap();
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.addresses, 2);
        assert_eq!(g.transaction("t1").unwrap().unwrap().block_height, None);
    }

    #[test]
    fn test_duplicate_edges_are_merged() {
        let g = MemoryGraph::new();
        g.link_received("t1", "a", 1.0).unwrap();
        g.link_received("t1", "a", 1.0).unwrap();
        g.link_sent("b", "t1", 2.0, Some(1.0)).unwrap();
        g.link_sent("b", "t1", 2.0, Some(1.0)).unwrap();

        assert_eq!(g.received_out_degree("t1").unwrap(), 1);
        assert_eq!(g.sent_in_degree("t1").unwrap(), 1);
        assert_eq!(g.spenders_of("b").unwrap(), vec!["t1".to_string()]);
    }

    #[test]
    fn test_value_conflict_is_rejected() {
        let g = MemoryGraph::new();
        g.link_received("t1", "a", 1.0).unwrap();
        let err = g.link_received("t1", "a", 2.0).unwrap_err();
        assert!(matches!(err, GraphError::ValueConflict { edge: "RECEIVED", .. }));

        g.link_sent("b", "t1", 1.0, None).unwrap();
        let err = g.link_sent("b", "t1", 1.1, None).unwrap_err();
        assert!(matches!(err, GraphError::ValueConflict { edge: "SENT", .. }));
    }

    #[test]
    fn test_negative_values_rejected() {
        let g = MemoryGraph::new();
        assert!(g.link_received("t1", "a", -1.0).is_err());
        assert!(g.link_sent("a", "t1", 1.0, Some(-2.0)).is_err());
        assert!(g.link_sent("a", "t1", f64::NAN, None).is_err());
        assert_eq!(g.stats().unwrap().transactions, 0);
    }

    #[test]
    fn test_same_entity_symmetric_and_no_self_loop() {
        let g = MemoryGraph::new();
        assert!(g.link_same_entity("b", "a").unwrap());
        assert!(!g.link_same_entity("a", "b").unwrap());
        assert_eq!(
            g.same_entity_pairs().unwrap(),
            vec![("a".to_string(), "b".to_string())]
        );
        assert_eq!(
            g.link_same_entity("a", "a"),
            Err(GraphError::SelfLoop("a".to_string()))
        );
    }

    #[test]
    fn test_link_block_sets_height() {
        let g = MemoryGraph::new();
        g.upsert_transaction("t1", None).unwrap();
        g.link_block("t1", 100, "h100", ts(1_000)).unwrap();
        g.link_block("t1", 100, "h100", ts(1_000)).unwrap();

        assert_eq!(g.transaction("t1").unwrap().unwrap().block_height, Some(100));
        let block = g.block(100).unwrap().unwrap();
        assert_eq!(block.hash, "h100");
        assert_eq!(block.timestamp, ts(1_000));
        let stats = g.stats().unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.included_in_edges, 1);
    }

    #[test]
    fn test_discovery_order_and_spenders() {
        let g = MemoryGraph::new();
        g.upsert_transaction("t2", Some(2)).unwrap();
        g.upsert_transaction("t1", Some(1)).unwrap();
        g.link_sent("a", "t1", 1.0, None).unwrap();
        g.link_sent("a", "t2", 1.0, None).unwrap();

        let order: Vec<_> = g.transactions().unwrap().into_iter().map(|t| t.txid).collect();
        assert_eq!(order, vec!["t2", "t1"]);
        assert_eq!(g.transaction("t1").unwrap().unwrap().ordinal, 1);
        assert_eq!(g.spenders_of("a").unwrap(), vec!["t1", "t2"]);
        assert!(g.spenders_of("zzz").unwrap().is_empty());
    }

    #[test]
    fn test_min_age_scan() {
        let g = MemoryGraph::new();
        g.link_sent("a", "t1", 1.0, Some(2000.0)).unwrap();
        g.link_sent("b", "t1", 1.0, Some(1800.0)).unwrap();
        g.link_sent("c", "t2", 1.0, None).unwrap();

        let old = g.sent_edges_min_age(1825.0).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].address, "a");
    }

    #[test]
    fn test_complete_flag_and_clear() {
        let g = MemoryGraph::new();
        g.upsert_transaction("t1", Some(1)).unwrap();
        g.upsert_transaction("t2", Some(1)).unwrap();
        g.mark_complete("t1").unwrap();
        assert_eq!(g.stats().unwrap().incomplete_transactions, 1);

        g.clear().unwrap();
        assert_eq!(g.stats().unwrap(), GraphStats::default());
    }
}
