//! Stateless pattern scans over the ledger graph.

use crate::analysis::AnalysisError;
use crate::graph::GraphStore;
use crate::schemas::{DormantFinding, FanFinding};
use tracing::debug;

/// Transactions with few inputs and many outputs (single-source distribution).
///
/// Matches `inputs <= max_inputs && outputs >= min_outputs`.
pub fn fan_out(
    store: &dyn GraphStore,
    max_inputs: usize,
    min_outputs: usize,
) -> Result<Vec<FanFinding>, AnalysisError> {
    if min_outputs == 0 {
        return Err(AnalysisError::invalid("min_outputs", "must be >= 1"));
    }
    scan_degrees(store, |inputs, outputs| {
        inputs <= max_inputs && outputs >= min_outputs
    })
}

/// Transactions with many inputs and few outputs (consolidation / sweeping).
///
/// Matches `inputs >= min_inputs && outputs <= max_outputs`.
pub fn fan_in(
    store: &dyn GraphStore,
    min_inputs: usize,
    max_outputs: usize,
) -> Result<Vec<FanFinding>, AnalysisError> {
    if min_inputs == 0 {
        return Err(AnalysisError::invalid("min_inputs", "must be >= 1"));
    }
    scan_degrees(store, |inputs, outputs| {
        inputs >= min_inputs && outputs <= max_outputs
    })
}

fn scan_degrees(
    store: &dyn GraphStore,
    matches: impl Fn(usize, usize) -> bool,
) -> Result<Vec<FanFinding>, AnalysisError> {
    let mut findings = Vec::new();
    for tx in store.transactions()? {
        let inputs = store.sent_in_degree(&tx.txid)?;
        let outputs = store.received_out_degree(&tx.txid)?;
        if matches(inputs, outputs) {
            findings.push(FanFinding {
                txid: tx.txid,
                inputs,
                outputs,
            });
        }
    }
    debug!("Degree scan matched {} transactions", findings.len());
    Ok(findings)
}

/// SENT edges whose source output was held at least `min_age_days`,
/// oldest first
pub fn dormant_funds(
    store: &dyn GraphStore,
    min_age_days: f64,
) -> Result<Vec<DormantFinding>, AnalysisError> {
    if !min_age_days.is_finite() || min_age_days < 0.0 {
        return Err(AnalysisError::invalid(
            "min_age_days",
            format!("must be a non-negative number, got {min_age_days}"),
        ));
    }

    let mut findings: Vec<DormantFinding> = store
        .sent_edges_min_age(min_age_days)?
        .into_iter()
        .filter_map(|edge| {
            edge.age_days.map(|age_days| DormantFinding {
                txid: edge.txid,
                from_address: edge.address,
                value: edge.value,
                age_days,
            })
        })
        .collect();
    findings.sort_by(|a, b| b.age_days.total_cmp(&a.age_days));
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn fan_graph() -> MemoryGraph {
        let g = MemoryGraph::new();
        // Distributor: 1 in, 12 out
        g.link_sent("src", "spray", 12.0, None).unwrap();
        for i in 0..12 {
            g.link_received("spray", &format!("dst{i}"), 0.9).unwrap();
        }
        // Sweeper: 10 in, 1 out
        for i in 0..10 {
            g.link_sent(&format!("dep{i}"), "sweep", 1.0, None).unwrap();
        }
        g.link_received("sweep", "hot", 9.9).unwrap();
        // Ordinary payment
        g.link_sent("x", "pay", 1.0, None).unwrap();
        g.link_received("pay", "y", 0.4).unwrap();
        g.link_received("pay", "x2", 0.59).unwrap();
        g
    }

    #[test]
    fn test_fan_out() {
        let g = fan_graph();
        let found = fan_out(&g, 2, 10).unwrap();
        assert_eq!(
            found,
            vec![FanFinding {
                txid: "spray".to_string(),
                inputs: 1,
                outputs: 12,
            }]
        );
    }

    #[test]
    fn test_fan_in() {
        let g = fan_graph();
        let found = fan_in(&g, 10, 2).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].txid, "sweep");
        assert_eq!(found[0].inputs, g.sent_in_degree("sweep").unwrap());
        assert_eq!(found[0].outputs, g.received_out_degree("sweep").unwrap());
    }

    #[test]
    fn test_fan_thresholds_inclusive() {
        let g = fan_graph();
        assert_eq!(fan_out(&g, 1, 12).unwrap().len(), 1);
        assert!(fan_out(&g, 0, 12).unwrap().is_empty());
        assert!(fan_in(&g, 11, 2).unwrap().is_empty());
    }

    #[test]
    fn test_dormant_threshold_and_order() {
        let g = MemoryGraph::new();
        g.link_sent("a", "t1", 1.0, Some(2000.0)).unwrap();
        g.link_sent("b", "t2", 2.0, Some(1800.0)).unwrap();
        g.link_sent("c", "t3", 3.0, Some(4000.0)).unwrap();
        g.link_sent("d", "t4", 4.0, None).unwrap();

        let found = dormant_funds(&g, 1825.0).unwrap();
        let order: Vec<_> = found.iter().map(|f| f.from_address.as_str()).collect();
        assert_eq!(order, vec!["c", "a"]);
        assert_eq!(found[1].txid, "t1");
        assert_eq!(found[1].value, 1.0);
        assert_eq!(found[1].age_days, 2000.0);
    }

    #[test]
    fn test_empty_graph_no_findings() {
        let g = MemoryGraph::new();
        assert!(fan_out(&g, 2, 10).unwrap().is_empty());
        assert!(dormant_funds(&g, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_parameters() {
        let g = MemoryGraph::new();
        assert!(matches!(
            dormant_funds(&g, f64::NAN),
            Err(AnalysisError::InvalidParameter { .. })
        ));
        assert!(fan_out(&g, 2, 0).is_err());
        assert!(fan_in(&g, 0, 2).is_err());
    }
}
