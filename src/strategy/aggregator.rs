// Multi-asset signal aggregation: evaluate every symbol in parallel with
// bounded concurrency, score against regime alignment, and keep the best.

use std::sync::Arc;

use log::info;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::venue::types::{Candle, Regime};

use super::{Manager, Signal};

const MAX_CONCURRENT_EVALUATIONS: usize = 8;

/// Inputs needed to evaluate one asset.
#[derive(Debug, Clone)]
pub struct AssetData {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub regime: Regime,
    pub hmm_confidence: f64,
}

/// A scored signal for one asset.
#[derive(Debug, Clone)]
pub struct AssetSignal {
    pub symbol: String,
    pub signal: Signal,
    pub regime: Regime,
    pub hmm_confidence: f64,
    pub total_score: f64,
}

pub struct SignalAggregator {
    manager: Arc<Manager>,
    pub min_confidence: f64,
    pub min_hmm_confidence: f64,
    pub min_total_score: f64,
}

impl SignalAggregator {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            min_confidence: 0.5,
            min_hmm_confidence: 0.7,
            min_total_score: 0.6,
        }
    }

    pub fn set_thresholds(&mut self, min_confidence: f64, min_hmm_confidence: f64) {
        self.min_confidence = min_confidence;
        self.min_hmm_confidence = min_hmm_confidence;
    }

    /// Evaluates all assets and returns the qualifying signals ranked by
    /// total score, highest first. Tie ordering is unspecified.
    pub async fn evaluate_assets(&self, assets: Vec<AssetData>) -> Vec<AssetSignal> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_EVALUATIONS));
        let mut set = JoinSet::new();

        for asset in assets {
            let manager = self.manager.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let signal = manager.get_signal(&asset.candles, asset.regime);
                if signal.is_none() {
                    return None;
                }

                let mut total_score = signal.confidence * 0.6 + asset.hmm_confidence * 0.4;
                total_score *= regime_multiplier(asset.regime, &signal.side);

                Some(AssetSignal {
                    symbol: asset.symbol,
                    signal,
                    regime: asset.regime,
                    hmm_confidence: asset.hmm_confidence,
                    total_score,
                })
            });
        }

        let mut signals = Vec::new();
        while let Some(result) = set.join_next().await {
            let Ok(Some(sig)) = result else { continue };

            if sig.signal.confidence < self.min_confidence {
                info!(
                    "  {}: strategy confidence {:.2} below threshold {:.2}",
                    sig.symbol, sig.signal.confidence, self.min_confidence
                );
                continue;
            }
            if sig.hmm_confidence < self.min_hmm_confidence {
                info!(
                    "  {}: HMM confidence {:.2} below threshold {:.2}",
                    sig.symbol, sig.hmm_confidence, self.min_hmm_confidence
                );
                continue;
            }
            if sig.total_score < self.min_total_score {
                info!(
                    "  {}: total score {:.2} below threshold {:.2}",
                    sig.symbol, sig.total_score, self.min_total_score
                );
                continue;
            }
            signals.push(sig);
        }

        signals.sort_by(|a, b| {
            b.total_score
                .partial_cmp(&a.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        signals
    }

    /// The single best signal across all assets, if any qualify.
    pub async fn select_best_signal(&self, assets: Vec<AssetData>) -> Option<AssetSignal> {
        let signals = self.evaluate_assets(assets).await;
        let best = signals.first()?.clone();

        info!(
            "Best signal: {} {} (score: {:.3}, regime: {}, confidence: {:.2})",
            best.symbol, best.signal.side, best.total_score, best.regime, best.signal.confidence
        );
        for other in signals.iter().skip(1) {
            info!(
                "  - {} {} (score: {:.3})",
                other.symbol, other.signal.side, other.total_score
            );
        }

        Some(best)
    }
}

/// Boosts trades aligned with the regime, penalizes trades against it, and
/// shades everything down slightly in high volatility.
fn regime_multiplier(regime: Regime, side: &str) -> f64 {
    match regime {
        Regime::Bull => {
            if side == "buy" {
                1.2
            } else {
                0.8
            }
        }
        Regime::Bear => {
            if side == "sell" {
                1.2
            } else {
                0.8
            }
        }
        Regime::HighVol => 0.9,
        _ => 1.0,
    }
}
