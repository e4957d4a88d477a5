//! Peeling chain reconstruction.
//!
//! A peel link is a transaction that splits its input into a small peeled
//! payment and a larger change output. A chain follows each link's change
//! address to the transaction that spends it, for as long as that spender is
//! itself a peel link.
//!
//! Two link rules are provided:
//! - [`RatioRule`]: one output below `peel_ratio * total_input`, the other above
//! - [`SelfChangeRule`]: one output pays back the single input address
//!
//! The walk itself is shared by both rules (see [`PeelChainReconstructor`]).

use crate::analysis::AnalysisError;
use crate::config::{AnalysisConfig, SpenderPolicy};
use crate::graph::{GraphError, GraphStore};
use crate::schemas::{PeelChain, PeelHeuristic};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Decides whether a transaction is a peel link
pub trait PeelLinkRule {
    fn heuristic(&self) -> PeelHeuristic;

    /// The change address of `txid`, or `None` if it is not a peel link
    fn change_address(
        &self,
        store: &dyn GraphStore,
        txid: &str,
    ) -> Result<Option<String>, GraphError>;
}

/// Ratio-based peel link test
#[derive(Debug, Clone, Copy)]
pub struct RatioRule {
    peel_ratio: f64,
    min_input_value: f64,
}

impl RatioRule {
    pub fn new(peel_ratio: f64, min_input_value: f64) -> Result<Self, AnalysisError> {
        if !(peel_ratio > 0.0 && peel_ratio < 1.0) {
            return Err(AnalysisError::invalid(
                "peel_ratio",
                format!("must be in (0, 1), got {peel_ratio}"),
            ));
        }
        if !min_input_value.is_finite() || min_input_value < 0.0 {
            return Err(AnalysisError::invalid(
                "min_input_value",
                format!("must be a non-negative number, got {min_input_value}"),
            ));
        }
        Ok(Self {
            peel_ratio,
            min_input_value,
        })
    }
}

impl PeelLinkRule for RatioRule {
    fn heuristic(&self) -> PeelHeuristic {
        PeelHeuristic::Ratio
    }

    fn change_address(
        &self,
        store: &dyn GraphStore,
        txid: &str,
    ) -> Result<Option<String>, GraphError> {
        let outputs = store.outputs(txid)?;
        let [first, second] = outputs.as_slice() else {
            return Ok(None);
        };
        let inputs = store.inputs(txid)?;
        if inputs.len() > 2 {
            return Ok(None);
        }

        let total_input: f64 = inputs.iter().map(|e| e.value).sum();
        if total_input < self.min_input_value {
            return Ok(None);
        }
        if first.value + second.value > total_input {
            return Ok(None);
        }

        // Strict on both sides: equal-ish splits and exact boundaries are not links
        let threshold = self.peel_ratio * total_input;
        let change = if first.value < threshold && second.value > threshold {
            second
        } else if second.value < threshold && first.value > threshold {
            first
        } else {
            return Ok(None);
        };
        Ok(Some(change.address.clone()))
    }
}

/// Self-change peel link test: a single input address that is also one of
/// exactly two outputs. No value ratio is involved.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfChangeRule;

impl PeelLinkRule for SelfChangeRule {
    fn heuristic(&self) -> PeelHeuristic {
        PeelHeuristic::SelfChange
    }

    fn change_address(
        &self,
        store: &dyn GraphStore,
        txid: &str,
    ) -> Result<Option<String>, GraphError> {
        let inputs = store.inputs(txid)?;
        let [input] = inputs.as_slice() else {
            return Ok(None);
        };
        let outputs = store.outputs(txid)?;
        if outputs.len() != 2 {
            return Ok(None);
        }
        Ok(outputs
            .iter()
            .any(|o| o.address == input.address)
            .then(|| input.address.clone()))
    }
}

/// Walks peel links into chains.
///
/// Every peel link not yet visited starts a chain, in discovery order. A
/// chain grows while the next spender of the tail's change address is a
/// peel link that is not already in the chain. Chains shorter than
/// `min_length`, and chains contained in a longer one, are dropped.
pub struct PeelChainReconstructor<'a, R: PeelLinkRule> {
    store: &'a dyn GraphStore,
    rule: R,
    policy: SpenderPolicy,
    min_length: usize,
}

/// Ledger position (height, ordinal); unconfirmed sorts last
type LedgerKey = (u64, u64);

impl<'a, R: PeelLinkRule> PeelChainReconstructor<'a, R> {
    pub fn new(
        store: &'a dyn GraphStore,
        rule: R,
        policy: SpenderPolicy,
        min_length: usize,
    ) -> Result<Self, AnalysisError> {
        if min_length == 0 {
            return Err(AnalysisError::invalid("min_chain_length", "must be >= 1"));
        }
        Ok(Self {
            store,
            rule,
            policy,
            min_length,
        })
    }

    /// Peel links in discovery order with their change addresses
    pub fn link_map(&self) -> Result<Vec<(String, String)>, GraphError> {
        let mut links = Vec::new();
        for tx in self.store.transactions()? {
            if let Some(change) = self.rule.change_address(self.store, &tx.txid)? {
                links.push((tx.txid, change));
            }
        }
        Ok(links)
    }

    pub fn reconstruct(&self) -> Result<Vec<PeelChain>, AnalysisError> {
        let heuristic = self.rule.heuristic();
        let ledger: HashMap<String, LedgerKey> = self
            .store
            .transactions()?
            .into_iter()
            .map(|t| (t.txid, (t.block_height.unwrap_or(u64::MAX), t.ordinal)))
            .collect();

        let starts = self.link_map()?;
        let links: HashMap<&str, &str> = starts
            .iter()
            .map(|(txid, change)| (txid.as_str(), change.as_str()))
            .collect();
        debug!("{} peel links ({})", links.len(), heuristic);

        let mut processed: HashSet<&str> = HashSet::new();
        let mut chains = Vec::new();

        for (start, _) in &starts {
            if processed.contains(start.as_str()) {
                continue;
            }

            let mut txids = vec![start.clone()];
            let mut change_addresses = Vec::new();
            let mut members: HashSet<String> = HashSet::from([start.clone()]);

            while let Some(current) = txids.last().cloned() {
                let Some((&current_key, &change)) = links.get_key_value(current.as_str()) else {
                    break;
                };
                change_addresses.push(change.to_string());
                processed.insert(current_key);

                let Some(next) = self.next_spender(&current, change, &ledger)? else {
                    break;
                };
                if !links.contains_key(next.as_str()) || members.contains(&next) {
                    break;
                }
                members.insert(next.clone());
                txids.push(next);
            }

            chains.push(PeelChain {
                heuristic,
                txids,
                change_addresses,
            });
        }

        let found = chains.len();
        chains.retain(|c| c.len() >= self.min_length);
        chains.sort_by(|a, b| b.len().cmp(&a.len()));

        let mut kept: Vec<PeelChain> = Vec::with_capacity(chains.len());
        for chain in chains {
            let subsumed = kept.iter().any(|longer| {
                longer.len() > chain.len()
                    && longer
                        .txids
                        .windows(chain.len())
                        .any(|w| w == chain.txids.as_slice())
            });
            if !subsumed {
                kept.push(chain);
            }
        }

        info!(
            "Peel chains ({}): {} walked, {} with >= {} links",
            heuristic,
            found,
            kept.len(),
            self.min_length
        );
        Ok(kept)
    }

    /// Later transaction that continues the chain from `change`
    fn next_spender(
        &self,
        current: &str,
        change: &str,
        ledger: &HashMap<String, LedgerKey>,
    ) -> Result<Option<String>, GraphError> {
        let Some(&here) = ledger.get(current) else {
            return Ok(None);
        };
        // Only a later transaction can spend the change `current` created
        let mut later = self
            .store
            .spenders_of(change)?
            .into_iter()
            .filter_map(|s| ledger.get(&s).map(|&key| (key, s)))
            .filter(|(key, _)| *key > here);

        Ok(match self.policy {
            SpenderPolicy::FirstSeen => later.next().map(|(_, s)| s),
            SpenderPolicy::NextInLedger => later.min_by_key(|(key, _)| *key).map(|(_, s)| s),
        })
    }
}

/// Ratio-based chains with thresholds from `config`
pub fn ratio_chains(
    store: &dyn GraphStore,
    config: &AnalysisConfig,
) -> Result<Vec<PeelChain>, AnalysisError> {
    let rule = RatioRule::new(config.peel_ratio, config.min_input_value)?;
    PeelChainReconstructor::new(
        store,
        rule,
        config.spender_policy,
        config.min_chain_length,
    )?
    .reconstruct()
}

/// Self-change chains with thresholds from `config`
pub fn self_change_chains(
    store: &dyn GraphStore,
    config: &AnalysisConfig,
) -> Result<Vec<PeelChain>, AnalysisError> {
    PeelChainReconstructor::new(
        store,
        SelfChangeRule,
        config.spender_policy,
        config.self_change_min_chain_length,
    )?
    .reconstruct()
}
