//! Backup-chain selection
//!
//! Scores candidate chains with a weighted multi-factor model (cost, speed,
//! congestion, reliability) and ranks them for failover. Selection is
//! deterministic for fixed inputs: ties break toward the lower chain id.

use crate::config::SelectionConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ledger::IntentAction;
use ethers::types::U256;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Block time at which the speed sub-score bottoms out
const SPEED_REFERENCE_SECS: f64 = 15.0;

/// Weight shifted between cost and speed by urgency
const URGENCY_DELTA: f64 = 0.1;

/// Transaction kind driving the default weight profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxKind {
    Transfer,
    Swap,
    ContractCall,
}

impl From<IntentAction> for TxKind {
    fn from(action: IntentAction) -> Self {
        match action {
            IntentAction::Transfer => TxKind::Transfer,
            IntentAction::Swap => TxKind::Swap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Static per-chain priors
#[derive(Debug, Clone)]
pub struct ChainProfile {
    pub chain_id: u64,
    pub name: String,
    pub avg_block_time_secs: f64,
    /// Reliability prior in [0,1]
    pub reliability: f64,
}

/// Live metrics sampled per selection call
#[derive(Debug, Clone, Copy)]
pub struct ChainMetrics {
    pub gas_price_gwei: f64,
    /// Congestion index 0-100
    pub congestion: u8,
}

/// Source of live per-chain metrics. A chain whose sample fails is treated
/// as unreachable for that selection call.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ChainMetricsSource: Send + Sync {
    async fn sample(&self, chain_id: u64) -> OrchestratorResult<ChainMetrics>;
}

/// Fixed metrics table, used for offline operation and tests
pub struct StaticMetrics {
    table: HashMap<u64, ChainMetrics>,
}

impl StaticMetrics {
    pub fn new(table: HashMap<u64, ChainMetrics>) -> Self {
        Self { table }
    }
}

#[async_trait::async_trait]
impl ChainMetricsSource for StaticMetrics {
    async fn sample(&self, chain_id: u64) -> OrchestratorResult<ChainMetrics> {
        self.table
            .get(&chain_id)
            .copied()
            .ok_or(OrchestratorError::ChainNotFound { chain_id })
    }
}

/// Factor weights, always normalized to sum to 1 before scoring
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SelectionWeights {
    pub cost: f64,
    pub speed: f64,
    pub congestion: f64,
    pub reliability: f64,
}

impl SelectionWeights {
    pub fn defaults_for(kind: TxKind) -> Self {
        match kind {
            TxKind::Transfer => Self {
                cost: 0.45,
                speed: 0.20,
                congestion: 0.15,
                reliability: 0.20,
            },
            TxKind::Swap => Self {
                cost: 0.30,
                speed: 0.30,
                congestion: 0.20,
                reliability: 0.20,
            },
            TxKind::ContractCall => Self {
                cost: 0.20,
                speed: 0.20,
                congestion: 0.25,
                reliability: 0.35,
            },
        }
    }

    /// Shift weight between cost and speed according to urgency
    fn perturbed(self, urgency: Urgency) -> Self {
        let (cost, speed) = match urgency {
            Urgency::Low => (self.cost + URGENCY_DELTA, self.speed - URGENCY_DELTA),
            Urgency::Medium => (self.cost, self.speed),
            Urgency::High => (self.cost - URGENCY_DELTA, self.speed + URGENCY_DELTA),
        };
        Self {
            cost: cost.max(0.0),
            speed: speed.max(0.0),
            ..self
        }
    }

    fn normalized(self) -> Self {
        let sum = self.cost + self.speed + self.congestion + self.reliability;
        if sum <= 0.0 {
            return Self {
                cost: 0.25,
                speed: 0.25,
                congestion: 0.25,
                reliability: 0.25,
            };
        }
        Self {
            cost: self.cost / sum,
            speed: self.speed / sum,
            congestion: self.congestion / sum,
            reliability: self.reliability / sum,
        }
    }
}

/// Inputs to one selection call
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub kind: TxKind,
    pub urgency: Urgency,
    pub amount: Option<U256>,
    /// Chains whose gas price exceeds this are not viable
    pub max_gas_price_gwei: Option<f64>,
    /// Chains excluded from this call (already tried, or the current chain)
    pub exclude: Vec<u64>,
}

/// Normalized sub-scores, each in [0,1]
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScoreBreakdown {
    pub cost: f64,
    pub speed: f64,
    pub congestion: f64,
    pub reliability: f64,
}

/// One candidate's composite score
#[derive(Debug, Clone, Serialize)]
pub struct ChainScore {
    pub chain_id: u64,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub gas_price_gwei: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GasSavings {
    pub gwei: f64,
    /// Rounded percentage saved against the most expensive viable chain
    pub percentage: f64,
}

/// Ranked result of a selection call
#[derive(Debug, Clone)]
pub struct ChainSelection {
    pub recommended: ChainScore,
    /// Remaining viable chains in descending score order
    pub alternatives: Vec<ChainScore>,
    /// Present only when the recommended chain is strictly cheaper than the
    /// most expensive viable alternative
    pub gas_savings: Option<GasSavings>,
    pub weights: SelectionWeights,
}

/// Scores and ranks candidate chains for failover
pub struct ChainSelector {
    profiles: Vec<ChainProfile>,
    metrics: Arc<dyn ChainMetricsSource>,
    config: SelectionConfig,
}

impl ChainSelector {
    pub fn new(
        profiles: Vec<ChainProfile>,
        metrics: Arc<dyn ChainMetricsSource>,
        config: SelectionConfig,
    ) -> Self {
        Self {
            profiles,
            metrics,
            config,
        }
    }

    pub fn known_chains(&self) -> Vec<u64> {
        self.profiles.iter().map(|p| p.chain_id).collect()
    }

    /// Rank viable candidate chains. Fails with `NoViableChain` when every
    /// candidate is excluded, unreachable, or over the caller's gas cap.
    pub async fn select_optimal_chain(
        &self,
        ctx: &SelectionContext,
        weights: Option<SelectionWeights>,
    ) -> OrchestratorResult<ChainSelection> {
        let weights = weights
            .unwrap_or_else(|| SelectionWeights::defaults_for(ctx.kind))
            .perturbed(ctx.urgency)
            .normalized();

        let mut scored = Vec::new();

        for profile in &self.profiles {
            if ctx.exclude.contains(&profile.chain_id) {
                continue;
            }

            let metrics = match self.metrics.sample(profile.chain_id).await {
                Ok(m) => m,
                Err(e) => {
                    debug!(
                        "Chain {} unreachable for selection: {}",
                        profile.chain_id, e
                    );
                    continue;
                }
            };

            if let Some(cap) = ctx.max_gas_price_gwei {
                if metrics.gas_price_gwei > cap {
                    debug!(
                        "Chain {} over gas cap: {} > {} gwei",
                        profile.chain_id, metrics.gas_price_gwei, cap
                    );
                    continue;
                }
            }

            let breakdown = ScoreBreakdown {
                cost: 1.0
                    - (metrics.gas_price_gwei / self.config.reference_max_gas_gwei).min(1.0),
                speed: 1.0 - (profile.avg_block_time_secs / SPEED_REFERENCE_SECS).min(1.0),
                congestion: 1.0 - f64::from(metrics.congestion.min(100)) / 100.0,
                reliability: profile.reliability.clamp(0.0, 1.0),
            };

            let score = weights.cost * breakdown.cost
                + weights.speed * breakdown.speed
                + weights.congestion * breakdown.congestion
                + weights.reliability * breakdown.reliability;

            scored.push(ChainScore {
                chain_id: profile.chain_id,
                score,
                breakdown,
                gas_price_gwei: metrics.gas_price_gwei,
            });
        }

        if scored.is_empty() {
            return Err(OrchestratorError::NoViableChain(
                "all candidates excluded, unreachable, or over the gas cap".to_string(),
            ));
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chain_id.cmp(&b.chain_id))
        });

        let most_expensive = scored
            .iter()
            .map(|s| s.gas_price_gwei)
            .fold(f64::MIN, f64::max);

        let recommended = scored.remove(0);

        let gas_savings = if recommended.gas_price_gwei < most_expensive {
            let gwei = most_expensive - recommended.gas_price_gwei;
            Some(GasSavings {
                gwei,
                percentage: (gwei / most_expensive * 100.0).round(),
            })
        } else {
            None
        };

        Ok(ChainSelection {
            recommended,
            alternatives: scored,
            gas_savings,
            weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(chain_id: u64, block_time: f64, reliability: f64) -> ChainProfile {
        ChainProfile {
            chain_id,
            name: format!("chain-{}", chain_id),
            avg_block_time_secs: block_time,
            reliability,
        }
    }

    fn metrics(entries: &[(u64, f64, u8)]) -> Arc<StaticMetrics> {
        Arc::new(StaticMetrics::new(
            entries
                .iter()
                .map(|&(id, gas, congestion)| {
                    (
                        id,
                        ChainMetrics {
                            gas_price_gwei: gas,
                            congestion,
                        },
                    )
                })
                .collect(),
        ))
    }

    fn transfer_ctx(urgency: Urgency) -> SelectionContext {
        SelectionContext {
            kind: TxKind::Transfer,
            urgency,
            amount: None,
            max_gas_price_gwei: None,
            exclude: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_cheapest_chain_wins_for_low_urgency_transfer() {
        // Identical block times and congestion; only gas prices differ
        let selector = ChainSelector::new(
            vec![
                profile(1, 2.0, 0.9),
                profile(2, 2.0, 0.9),
                profile(3, 2.0, 0.9),
            ],
            metrics(&[(1, 1.0, 20), (2, 5.0, 20), (3, 20.0, 20)]),
            SelectionConfig::default(),
        );

        let selection = selector
            .select_optimal_chain(&transfer_ctx(Urgency::Low), None)
            .await
            .unwrap();

        assert_eq!(selection.recommended.chain_id, 1);
        let savings = selection.gas_savings.expect("cheaper than the field");
        assert_eq!(savings.percentage, 95.0);
        assert!((savings.gwei - 19.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ranking_is_deterministic() {
        let selector = ChainSelector::new(
            vec![
                profile(10, 2.0, 0.95),
                profile(20, 12.0, 0.85),
                profile(30, 0.4, 0.99),
            ],
            metrics(&[(10, 8.0, 40), (20, 3.0, 70), (30, 15.0, 10)]),
            SelectionConfig::default(),
        );

        let ctx = SelectionContext {
            kind: TxKind::Swap,
            urgency: Urgency::Medium,
            amount: None,
            max_gas_price_gwei: None,
            exclude: Vec::new(),
        };

        let first = selector.select_optimal_chain(&ctx, None).await.unwrap();
        let second = selector.select_optimal_chain(&ctx, None).await.unwrap();

        let order = |s: &ChainSelection| {
            std::iter::once(s.recommended.chain_id)
                .chain(s.alternatives.iter().map(|a| a.chain_id))
                .collect::<Vec<_>>()
        };
        assert_eq!(order(&first), order(&second));
    }

    #[tokio::test]
    async fn test_ties_break_toward_lower_chain_id() {
        let selector = ChainSelector::new(
            vec![profile(84532, 2.0, 0.9), profile(421614, 2.0, 0.9)],
            metrics(&[(84532, 5.0, 30), (421614, 5.0, 30)]),
            SelectionConfig::default(),
        );

        let selection = selector
            .select_optimal_chain(&transfer_ctx(Urgency::Medium), None)
            .await
            .unwrap();

        assert_eq!(selection.recommended.chain_id, 84532);
        assert_eq!(selection.alternatives[0].chain_id, 421614);
        // Identical metrics: no savings to report
        assert!(selection.gas_savings.is_none());
    }

    #[tokio::test]
    async fn test_gas_cap_and_unreachable_chains_yield_no_viable_chain() {
        let selector = ChainSelector::new(
            vec![profile(1, 2.0, 0.9), profile(2, 2.0, 0.9)],
            // Chain 2 has no metrics entry at all: unreachable
            metrics(&[(1, 80.0, 30)]),
            SelectionConfig::default(),
        );

        let mut ctx = transfer_ctx(Urgency::Medium);
        ctx.max_gas_price_gwei = Some(50.0);

        let err = selector.select_optimal_chain(&ctx, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoViableChain(_)));
    }

    #[tokio::test]
    async fn test_excluded_chains_are_skipped() {
        let selector = ChainSelector::new(
            vec![profile(1, 2.0, 0.9), profile(2, 2.0, 0.9)],
            metrics(&[(1, 1.0, 10), (2, 9.0, 50)]),
            SelectionConfig::default(),
        );

        let mut ctx = transfer_ctx(Urgency::Medium);
        ctx.exclude = vec![1];

        let selection = selector.select_optimal_chain(&ctx, None).await.unwrap();
        assert_eq!(selection.recommended.chain_id, 2);
        assert!(selection.alternatives.is_empty());
    }

    #[test]
    fn test_urgency_shifts_weight_between_cost_and_speed() {
        let base = SelectionWeights::defaults_for(TxKind::Transfer);
        let low = base.perturbed(Urgency::Low).normalized();
        let high = base.perturbed(Urgency::High).normalized();
        let medium = base.perturbed(Urgency::Medium).normalized();

        assert!(low.cost > medium.cost);
        assert!(low.speed < medium.speed);
        assert!(high.cost < medium.cost);
        assert!(high.speed > medium.speed);

        for w in [low, medium, high] {
            let sum = w.cost + w.speed + w.congestion + w.reliability;
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }
}
