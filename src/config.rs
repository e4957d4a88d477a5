//! Configuration management for the graph analyzer.
//!
//! Loads from `.env` and environment variables, or a TOML file with env overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main analyzer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Bitcoin Core JSON-RPC endpoint
    #[serde(default)]
    pub node: NodeConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Output directory paths
    #[serde(default)]
    pub paths: PathConfig,

    /// Block ingestion settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Heuristic thresholds for the detectors
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_rpc_host")]
    pub host: String,

    #[serde(default = "default_rpc_port")]
    pub port: u16,

    /// RPC username (rpcuser / cookie user)
    #[serde(default)]
    pub user: Option<String>,

    /// RPC password
    #[serde(default)]
    pub password: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            port: default_rpc_port(),
            user: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl NodeConfig {
    /// Full RPC URL (credentials are sent as basic auth, not embedded)
    pub fn rpc_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,

    /// Maximum retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Parquet snapshot of the graph, reloaded between runs
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_dir: default_snapshot_dir(),
            metadata_dir: default_metadata_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Number of blocks processed concurrently (1 = strictly sequential)
    #[serde(default = "default_block_concurrency")]
    pub block_concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            block_concurrency: default_block_concurrency(),
        }
    }
}

/// Thresholds for clustering, pattern detectors and peel chain reconstruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Peeled output must be below `peel_ratio * total_input`
    #[serde(default = "default_peel_ratio")]
    pub peel_ratio: f64,

    /// Transactions with less total input are never peel links (BTC)
    #[serde(default = "default_min_input_value")]
    pub min_input_value: f64,

    /// Minimum links for a ratio-based chain
    #[serde(default = "default_min_chain_length")]
    pub min_chain_length: usize,

    /// Minimum links for a self-change chain
    #[serde(default = "default_self_change_min_chain_length")]
    pub self_change_min_chain_length: usize,

    /// Which spender continues a chain when a change address is spent more than once
    #[serde(default)]
    pub spender_policy: SpenderPolicy,

    #[serde(default = "default_fan_out_max_inputs")]
    pub fan_out_max_inputs: usize,

    #[serde(default = "default_fan_out_min_outputs")]
    pub fan_out_min_outputs: usize,

    #[serde(default = "default_fan_in_min_inputs")]
    pub fan_in_min_inputs: usize,

    #[serde(default = "default_fan_in_max_outputs")]
    pub fan_in_max_outputs: usize,

    /// Minimum dormancy, in years of 365 days
    #[serde(default = "default_dormant_years")]
    pub dormant_years: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            peel_ratio: default_peel_ratio(),
            min_input_value: default_min_input_value(),
            min_chain_length: default_min_chain_length(),
            self_change_min_chain_length: default_self_change_min_chain_length(),
            spender_policy: SpenderPolicy::default(),
            fan_out_max_inputs: default_fan_out_max_inputs(),
            fan_out_min_outputs: default_fan_out_min_outputs(),
            fan_in_min_inputs: default_fan_in_min_inputs(),
            fan_in_max_outputs: default_fan_in_max_outputs(),
            dormant_years: default_dormant_years(),
        }
    }
}

impl AnalysisConfig {
    /// Validate heuristic thresholds
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.peel_ratio > 0.0 && self.peel_ratio < 1.0) {
            anyhow::bail!("peel_ratio must be in (0, 1), got {}", self.peel_ratio);
        }
        if !self.min_input_value.is_finite() || self.min_input_value < 0.0 {
            anyhow::bail!("min_input_value must be a non-negative number");
        }
        if self.min_chain_length == 0 || self.self_change_min_chain_length == 0 {
            anyhow::bail!("chain lengths must be >= 1");
        }
        if self.fan_out_min_outputs == 0 || self.fan_in_min_inputs == 0 {
            anyhow::bail!("fan thresholds must be >= 1");
        }
        Ok(())
    }

    pub fn dormant_min_age_days(&self) -> f64 {
        dormant_years_to_days(self.dormant_years)
    }
}

/// Dormancy threshold in days for a number of 365-day years
pub fn dormant_years_to_days(years: u32) -> f64 {
    f64::from(years) * 365.0
}

/// Strategy for picking the next hop when several transactions spend from
/// the same change address
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpenderPolicy {
    /// First spender in discovery order among those later in the ledger
    /// than the current transaction
    FirstSeen,
    /// Earliest spender strictly after the current transaction in
    /// (block height, discovery order)
    #[default]
    NextInLedger,
}

// Default value functions
fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_port() -> u16 {
    8332
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_rps() -> u32 {
    50 // Local node, no billing
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("data/graph")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("data/metadata")
}

fn default_block_concurrency() -> usize {
    1
}

fn default_peel_ratio() -> f64 {
    0.2
}

fn default_min_input_value() -> f64 {
    0.01
}

fn default_min_chain_length() -> usize {
    3
}

fn default_self_change_min_chain_length() -> usize {
    2
}

fn default_fan_out_max_inputs() -> usize {
    2
}

fn default_fan_out_min_outputs() -> usize {
    10
}

fn default_fan_in_min_inputs() -> usize {
    10
}

fn default_fan_in_max_outputs() -> usize {
    2
}

fn default_dormant_years() -> u32 {
    5
}

impl AnalyzerConfig {
    /// Load configuration from environment (and `.env` if present)
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from a TOML config file with environment overrides
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = ::toml::from_str(&contents)?;

        // Environment variables override file settings
        config.apply_env_overrides()?;
        config.analysis.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(user) = std::env::var("RPC_USER") {
            self.node.user = Some(user);
        }
        if let Ok(pass) = std::env::var("RPC_PASS") {
            self.node.password = Some(pass);
        }
        if let Ok(host) = std::env::var("RPC_HOST") {
            self.node.host = host;
        }
        if let Ok(port) = std::env::var("RPC_PORT") {
            self.node.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("RPC_PORT is not a valid port: {}", port))?;
        }
        Ok(())
    }

    /// Re-root all output directories under `data_dir`
    pub fn set_data_dir(&mut self, data_dir: PathBuf) {
        self.paths.snapshot_dir = data_dir.join("graph");
        self.paths.metadata_dir = data_dir.join("metadata");
        self.paths.data_dir = data_dir;
    }

    /// Ensure all output directories exist
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.paths.snapshot_dir)?;
        std::fs::create_dir_all(&self.paths.metadata_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_defaults() {
        let cfg = AnalysisConfig::default();
        assert_eq!(cfg.peel_ratio, 0.2);
        assert_eq!(cfg.min_input_value, 0.01);
        assert_eq!(cfg.min_chain_length, 3);
        assert_eq!(cfg.self_change_min_chain_length, 2);
        assert_eq!(cfg.spender_policy, SpenderPolicy::NextInLedger);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_dormant_years_to_days() {
        assert_eq!(dormant_years_to_days(5), 1825.0);
        assert_eq!(AnalysisConfig::default().dormant_min_age_days(), 1825.0);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let mut cfg = AnalysisConfig::default();
        cfg.peel_ratio = 1.0;
        assert!(cfg.validate().is_err());
        cfg.peel_ratio = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rpc_url() {
        let node = NodeConfig::default();
        assert_eq!(node.rpc_url(), "http://127.0.0.1:8332");

        let node = NodeConfig {
            host: "https://node.example".to_string(),
            port: 18332,
            ..NodeConfig::default()
        };
        assert_eq!(node.rpc_url(), "https://node.example:18332");
    }

    #[test]
    fn test_partial_toml() {
        let cfg: AnalyzerConfig = toml::from_str(
            r#"
            [node]
            port = 18443

            [analysis]
            peel_ratio = 0.1
            spender_policy = "first_seen"
            "#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.node.port, 18443);
        assert_eq!(cfg.node.host, "127.0.0.1");
        assert_eq!(cfg.analysis.peel_ratio, 0.1);
        assert_eq!(cfg.analysis.spender_policy, SpenderPolicy::FirstSeen);
        assert_eq!(cfg.ingest.block_concurrency, 1);
    }

    #[test]
    fn test_set_data_dir() {
        let mut cfg = AnalyzerConfig::default();
        cfg.set_data_dir(PathBuf::from("/tmp/run"));
        assert_eq!(cfg.paths.snapshot_dir, PathBuf::from("/tmp/run/graph"));
        assert_eq!(cfg.paths.metadata_dir, PathBuf::from("/tmp/run/metadata"));
    }
}
