//! Parquet persistence for the ledger graph.
//!
//! A snapshot is a directory with one Parquet table per node and edge kind.
//! Loading replays the rows through the [`GraphStore`] primitives so that
//! discovery order survives a reload. SENT rows carry each edge's rank in its
//! address's spender list, so spender order survives too, even when blocks
//! were ingested concurrently. A row with a missing field fails the load.

use crate::graph::{GraphError, GraphStore};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

const TRANSACTIONS_FILE: &str = "transactions.parquet";
const BLOCKS_FILE: &str = "blocks.parquet";
const ADDRESSES_FILE: &str = "addresses.parquet";
const SENT_FILE: &str = "sent.parquet";
const RECEIVED_FILE: &str = "received.parquet";
const SAME_ENTITY_FILE: &str = "same_entity.parquet";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),
}

/// True when every table of a snapshot is present in `dir`
pub fn snapshot_exists(dir: &Path) -> bool {
    [
        TRANSACTIONS_FILE,
        BLOCKS_FILE,
        ADDRESSES_FILE,
        SENT_FILE,
        RECEIVED_FILE,
        SAME_ENTITY_FILE,
    ]
    .iter()
    .all(|f| dir.join(f).exists())
}

fn write_parquet(mut df: DataFrame, path: &Path) -> Result<(), SnapshotError> {
    let file = std::fs::File::create(path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df)?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<DataFrame, SnapshotError> {
    let file = std::fs::File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}

fn to_height(value: Option<i64>) -> Result<Option<u64>, SnapshotError> {
    value
        .map(|h| u64::try_from(h).map_err(|_| SnapshotError::Corrupt(format!("negative height {h}"))))
        .transpose()
}

fn required<T>(
    value: Option<T>,
    table: &str,
    row: usize,
    column: &str,
) -> Result<T, SnapshotError> {
    value.ok_or_else(|| SnapshotError::Corrupt(format!("{table} row {row} has no {column}")))
}

/// Write the whole graph to `dir`, replacing any previous snapshot
pub fn save_snapshot(store: &dyn GraphStore, dir: &Path) -> Result<(), SnapshotError> {
    std::fs::create_dir_all(dir)?;

    let txs = store.transactions()?;
    let df = DataFrame::new(vec![
        Column::new(
            "txid".into(),
            txs.iter().map(|t| t.txid.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "block_height".into(),
            txs.iter()
                .map(|t| t.block_height.map(|h| h as i64))
                .collect::<Vec<_>>(),
        ),
        Column::new(
            "complete".into(),
            txs.iter().map(|t| t.complete).collect::<Vec<_>>(),
        ),
    ])?;
    write_parquet(df, &dir.join(TRANSACTIONS_FILE))?;

    let blocks = store.blocks()?;
    let df = DataFrame::new(vec![
        Column::new(
            "height".into(),
            blocks.iter().map(|b| b.height as i64).collect::<Vec<_>>(),
        ),
        Column::new(
            "hash".into(),
            blocks.iter().map(|b| b.hash.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "timestamp".into(),
            blocks
                .iter()
                .map(|b| b.timestamp.timestamp())
                .collect::<Vec<_>>(),
        ),
    ])?;
    write_parquet(df, &dir.join(BLOCKS_FILE))?;

    let addresses = store.addresses()?;
    let df = DataFrame::new(vec![Column::new(
        "address".into(),
        addresses.iter().map(String::as_str).collect::<Vec<_>>(),
    )])?;
    write_parquet(df, &dir.join(ADDRESSES_FILE))?;

    let sent = store.sent_edges()?;
    let mut spenders: HashMap<&str, Vec<String>> = HashMap::new();
    let mut spend_ranks = Vec::with_capacity(sent.len());
    for edge in &sent {
        if !spenders.contains_key(edge.address.as_str()) {
            spenders.insert(edge.address.as_str(), store.spenders_of(&edge.address)?);
        }
        let rank = spenders
            .get(edge.address.as_str())
            .and_then(|txids| txids.iter().position(|t| *t == edge.txid))
            .ok_or_else(|| {
                SnapshotError::Corrupt(format!(
                    "{} -> {} missing from spender index",
                    edge.address, edge.txid
                ))
            })?;
        spend_ranks.push(rank as i64);
    }
    let df = DataFrame::new(vec![
        Column::new(
            "address".into(),
            sent.iter().map(|e| e.address.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "txid".into(),
            sent.iter().map(|e| e.txid.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "value".into(),
            sent.iter().map(|e| e.value).collect::<Vec<_>>(),
        ),
        Column::new(
            "age_days".into(),
            sent.iter().map(|e| e.age_days).collect::<Vec<_>>(),
        ),
        Column::new("spend_rank".into(), spend_ranks),
    ])?;
    write_parquet(df, &dir.join(SENT_FILE))?;

    let received = store.received_edges()?;
    let df = DataFrame::new(vec![
        Column::new(
            "txid".into(),
            received.iter().map(|e| e.txid.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "address".into(),
            received.iter().map(|e| e.address.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "value".into(),
            received.iter().map(|e| e.value).collect::<Vec<_>>(),
        ),
    ])?;
    write_parquet(df, &dir.join(RECEIVED_FILE))?;

    let pairs = store.same_entity_pairs()?;
    let df = DataFrame::new(vec![
        Column::new(
            "address_a".into(),
            pairs.iter().map(|(a, _)| a.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "address_b".into(),
            pairs.iter().map(|(_, b)| b.as_str()).collect::<Vec<_>>(),
        ),
    ])?;
    write_parquet(df, &dir.join(SAME_ENTITY_FILE))?;

    info!(
        "Saved snapshot to {:?}: {} transactions, {} addresses, {} blocks",
        dir,
        txs.len(),
        addresses.len(),
        blocks.len()
    );
    Ok(())
}

/// Replay a snapshot from `dir` into `store`
pub fn load_snapshot(store: &dyn GraphStore, dir: &Path) -> Result<(), SnapshotError> {
    let blocks_df = read_parquet(&dir.join(BLOCKS_FILE))?;
    let heights = blocks_df.column("height")?.i64()?;
    let hashes = blocks_df.column("hash")?.str()?;
    let timestamps = blocks_df.column("timestamp")?.i64()?;

    let mut blocks: HashMap<u64, (String, DateTime<Utc>)> = HashMap::new();
    for i in 0..blocks_df.height() {
        let Some(height) = to_height(heights.get(i))? else {
            return Err(SnapshotError::Corrupt(format!("block row {i} has no height")));
        };
        let secs = required(timestamps.get(i), "block", i, "timestamp")?;
        let timestamp = DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| SnapshotError::Corrupt(format!("bad timestamp {secs}")))?;
        let hash = required(hashes.get(i), "block", i, "hash")?;
        blocks.insert(height, (hash.to_string(), timestamp));
    }

    // Transactions first, in saved order, to keep ordinals stable
    let tx_df = read_parquet(&dir.join(TRANSACTIONS_FILE))?;
    let txids = tx_df.column("txid")?.str()?;
    let tx_heights = tx_df.column("block_height")?.i64()?;
    let completes = tx_df.column("complete")?.bool()?;

    let mut complete = Vec::new();
    for i in 0..tx_df.height() {
        let Some(txid) = txids.get(i) else {
            return Err(SnapshotError::Corrupt(format!("transaction row {i} has no txid")));
        };
        let height = to_height(tx_heights.get(i))?;
        store.upsert_transaction(txid, height)?;
        if let Some((h, (hash, timestamp))) = height.and_then(|h| blocks.get(&h).map(|b| (h, b))) {
            store.link_block(txid, h, hash, *timestamp)?;
        }
        if required(completes.get(i), "transaction", i, "complete")? {
            complete.push(txid.to_string());
        }
    }

    let addr_df = read_parquet(&dir.join(ADDRESSES_FILE))?;
    let addresses = addr_df.column("address")?.str()?;
    for (i, address) in addresses.into_iter().enumerate() {
        store.upsert_address(required(address, "address", i, "address")?)?;
    }

    let sent_df = read_parquet(&dir.join(SENT_FILE))?;
    let sent_addrs = sent_df.column("address")?.str()?;
    let sent_txids = sent_df.column("txid")?.str()?;
    let sent_values = sent_df.column("value")?.f64()?;
    let sent_ages = sent_df.column("age_days")?.f64()?;
    let sent_ranks = sent_df.column("spend_rank")?.i64()?;
    let mut sent = Vec::with_capacity(sent_df.height());
    for i in 0..sent_df.height() {
        sent.push((
            required(sent_ranks.get(i), "SENT", i, "spend_rank")?,
            required(sent_addrs.get(i), "SENT", i, "address")?,
            required(sent_txids.get(i), "SENT", i, "txid")?,
            required(sent_values.get(i), "SENT", i, "value")?,
            sent_ages.get(i),
        ));
    }
    // Stable: rank restores each address's spender order, ties keep tx order
    sent.sort_by_key(|(rank, ..)| *rank);
    for (_, address, txid, value, age_days) in sent {
        store.link_sent(address, txid, value, age_days)?;
    }

    let recv_df = read_parquet(&dir.join(RECEIVED_FILE))?;
    let recv_txids = recv_df.column("txid")?.str()?;
    let recv_addrs = recv_df.column("address")?.str()?;
    let recv_values = recv_df.column("value")?.f64()?;
    for i in 0..recv_df.height() {
        store.link_received(
            required(recv_txids.get(i), "RECEIVED", i, "txid")?,
            required(recv_addrs.get(i), "RECEIVED", i, "address")?,
            required(recv_values.get(i), "RECEIVED", i, "value")?,
        )?;
    }

    let pair_df = read_parquet(&dir.join(SAME_ENTITY_FILE))?;
    let lefts = pair_df.column("address_a")?.str()?;
    let rights = pair_df.column("address_b")?.str()?;
    for i in 0..pair_df.height() {
        store.link_same_entity(
            required(lefts.get(i), "SAME_ENTITY", i, "address_a")?,
            required(rights.get(i), "SAME_ENTITY", i, "address_b")?,
        )?;
    }

    for txid in &complete {
        store.mark_complete(txid)?;
    }

    let stats = store.stats()?;
    info!(
        "Loaded snapshot from {:?}: {} transactions, {} addresses, {} blocks",
        dir, stats.transactions, stats.addresses, stats.blocks
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn sample_graph() -> MemoryGraph {
        let g = MemoryGraph::new();
        let ts = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        g.upsert_transaction("t2", Some(11)).unwrap();
        g.link_block("t2", 11, "h11", ts).unwrap();
        g.upsert_transaction("t1", Some(10)).unwrap();
        g.link_block("t1", 10, "h10", ts).unwrap();
        g.upsert_transaction("orphan", None).unwrap();
        g.link_received("t1", "a", 1.0).unwrap();
        g.link_sent("a", "t2", 1.0, Some(0.5)).unwrap();
        g.link_sent("b", "t2", 2.0, None).unwrap();
        g.link_received("t2", "c", 2.9).unwrap();
        g.link_same_entity("b", "a").unwrap();
        g.mark_complete("t1").unwrap();
        g.mark_complete("t2").unwrap();
        g
    }

    #[test]
    fn test_save_and_load_preserves_graph() {
        let dir = tempfile::tempdir().unwrap();
        let original = sample_graph();
        save_snapshot(&original, dir.path()).unwrap();
        assert!(snapshot_exists(dir.path()));

        let restored = MemoryGraph::new();
        load_snapshot(&restored, dir.path()).unwrap();

        assert_eq!(restored.stats().unwrap(), original.stats().unwrap());
        assert_eq!(
            restored.transactions().unwrap(),
            original.transactions().unwrap()
        );
        assert_eq!(restored.inputs("t2").unwrap(), original.inputs("t2").unwrap());
        assert_eq!(
            restored.same_entity_pairs().unwrap(),
            vec![("a".to_string(), "b".to_string())]
        );
        assert_eq!(restored.block(10).unwrap(), original.block(10).unwrap());
    }

    #[test]
    fn test_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let original = sample_graph();
        save_snapshot(&original, dir.path()).unwrap();

        let restored = MemoryGraph::new();
        load_snapshot(&restored, dir.path()).unwrap();
        load_snapshot(&restored, dir.path()).unwrap();
        assert_eq!(restored.stats().unwrap(), original.stats().unwrap());
    }

    #[test]
    fn test_empty_graph_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        save_snapshot(&MemoryGraph::new(), dir.path()).unwrap();

        let restored = MemoryGraph::new();
        load_snapshot(&restored, dir.path()).unwrap();
        assert_eq!(restored.stats().unwrap().transactions, 0);
    }

    #[test]
    fn test_spender_order_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let original = MemoryGraph::new();
        original.upsert_transaction("t1", Some(1)).unwrap();
        original.upsert_transaction("t2", Some(2)).unwrap();
        // Spent out of discovery order, as with concurrent ingestion
        original.link_sent("a", "t2", 1.0, None).unwrap();
        original.link_sent("b", "t1", 3.0, None).unwrap();
        original.link_sent("a", "t1", 2.0, None).unwrap();
        assert_eq!(original.spenders_of("a").unwrap(), vec!["t2", "t1"]);
        save_snapshot(&original, dir.path()).unwrap();

        let restored = MemoryGraph::new();
        load_snapshot(&restored, dir.path()).unwrap();
        assert_eq!(restored.spenders_of("a").unwrap(), vec!["t2", "t1"]);
        assert_eq!(restored.spenders_of("b").unwrap(), vec!["t1"]);
        assert_eq!(
            restored.transactions().unwrap(),
            original.transactions().unwrap()
        );
    }

    #[test]
    fn test_row_with_missing_field_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        save_snapshot(&sample_graph(), dir.path()).unwrap();

        let df = DataFrame::new(vec![
            Column::new("txid".into(), vec![None::<&str>]),
            Column::new("address".into(), vec![Some("a")]),
            Column::new("value".into(), vec![Some(1.0f64)]),
        ])
        .unwrap();
        write_parquet(df, &dir.path().join(RECEIVED_FILE)).unwrap();

        let err = load_snapshot(&MemoryGraph::new(), dir.path()).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt(_)), "{err}");
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!snapshot_exists(dir.path()));
        assert!(load_snapshot(&MemoryGraph::new(), dir.path()).is_err());
    }
}
