//! Analysis orchestration.
//!
//! Runs the detectors and chain reconstructors selected on the command line
//! and collects their findings into one serializable report.

use crate::config::{dormant_years_to_days, AnalysisConfig};
use crate::detectors::{dormant_funds, fan_in, fan_out};
use crate::graph::{GraphError, GraphStore};
use crate::peel_chain::{ratio_chains, self_change_chains};
use crate::schemas::{DormantFinding, FanFinding, PeelChain};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

impl AnalysisError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Which analysis to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisKind {
    /// Fan-out and fan-in
    Fan,
    /// Self-change peel chains
    #[value(name = "peel-sc")]
    #[serde(rename = "peel-sc")]
    PeelSelfChange,
    /// Ratio-based peel chains
    PeelHeuristic,
    /// Dormant funds
    Dormant,
    All,
}

impl AnalysisKind {
    fn includes(self, other: AnalysisKind) -> bool {
        self == AnalysisKind::All || self == other
    }
}

/// Findings of one analysis run; sections not requested stay empty
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub kind: AnalysisKind,
    pub fan_out: Vec<FanFinding>,
    pub fan_in: Vec<FanFinding>,
    pub dormant_min_age_days: Option<f64>,
    pub dormant: Vec<DormantFinding>,
    pub ratio_chains: Vec<PeelChain>,
    pub self_change_chains: Vec<PeelChain>,
}

impl AnalysisReport {
    fn empty(kind: AnalysisKind) -> Self {
        Self {
            generated_at: Utc::now(),
            kind,
            fan_out: Vec::new(),
            fan_in: Vec::new(),
            dormant_min_age_days: None,
            dormant: Vec::new(),
            ratio_chains: Vec::new(),
            self_change_chains: Vec::new(),
        }
    }

    pub fn total_findings(&self) -> usize {
        self.fan_out.len()
            + self.fan_in.len()
            + self.dormant.len()
            + self.ratio_chains.len()
            + self.self_change_chains.len()
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Run the selected analysis. `dormant_years` overrides the configured
/// dormancy threshold when given.
pub fn run_analysis(
    store: &dyn GraphStore,
    config: &AnalysisConfig,
    kind: AnalysisKind,
    dormant_years: Option<u32>,
) -> Result<AnalysisReport, AnalysisError> {
    let mut report = AnalysisReport::empty(kind);

    if kind.includes(AnalysisKind::Fan) {
        report.fan_out = fan_out(store, config.fan_out_max_inputs, config.fan_out_min_outputs)?;
        report.fan_in = fan_in(store, config.fan_in_min_inputs, config.fan_in_max_outputs)?;
        info!(
            "Fan-out: {} transactions, fan-in: {} transactions",
            report.fan_out.len(),
            report.fan_in.len()
        );
    }

    if kind.includes(AnalysisKind::PeelSelfChange) {
        report.self_change_chains = self_change_chains(store, config)?;
    }

    if kind.includes(AnalysisKind::PeelHeuristic) {
        report.ratio_chains = ratio_chains(store, config)?;
    }

    if kind.includes(AnalysisKind::Dormant) {
        let min_age_days = dormant_years
            .map(dormant_years_to_days)
            .unwrap_or_else(|| config.dormant_min_age_days());
        report.dormant = dormant_funds(store, min_age_days)?;
        report.dormant_min_age_days = Some(min_age_days);
        info!(
            "Dormant funds (>= {:.0} days): {} edges",
            min_age_days,
            report.dormant.len()
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn sample() -> MemoryGraph {
        let g = MemoryGraph::new();
        g.link_sent("old", "t1", 2.0, Some(3000.0)).unwrap();
        g.link_sent("young", "t1", 1.0, Some(10.0)).unwrap();
        g.link_received("t1", "dst", 2.9).unwrap();
        g
    }

    #[test]
    fn test_single_kind_leaves_other_sections_empty() {
        let g = sample();
        let report =
            run_analysis(&g, &AnalysisConfig::default(), AnalysisKind::Dormant, None).unwrap();
        assert_eq!(report.dormant.len(), 1);
        assert_eq!(report.dormant_min_age_days, Some(1825.0));
        assert!(report.fan_out.is_empty());
        assert!(report.ratio_chains.is_empty());
    }

    #[test]
    fn test_years_override() {
        let g = sample();
        let report =
            run_analysis(&g, &AnalysisConfig::default(), AnalysisKind::Dormant, Some(10)).unwrap();
        assert_eq!(report.dormant_min_age_days, Some(3650.0));
        assert!(report.dormant.is_empty());
    }

    #[test]
    fn test_all_on_empty_graph() {
        let g = MemoryGraph::new();
        let report =
            run_analysis(&g, &AnalysisConfig::default(), AnalysisKind::All, None).unwrap();
        assert_eq!(report.total_findings(), 0);
    }

    #[test]
    fn test_invalid_config_propagates() {
        let g = sample();
        let config = AnalysisConfig {
            peel_ratio: 2.0,
            ..AnalysisConfig::default()
        };
        let err = run_analysis(&g, &config, AnalysisKind::PeelHeuristic, None).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidParameter { name: "peel_ratio", .. }));
    }

    #[test]
    fn test_report_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report =
            run_analysis(&sample(), &AnalysisConfig::default(), AnalysisKind::All, None).unwrap();
        report.save(&path).unwrap();

        let loaded: AnalysisReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.kind, AnalysisKind::All);
        assert_eq!(loaded.dormant.len(), 1);
    }
}
