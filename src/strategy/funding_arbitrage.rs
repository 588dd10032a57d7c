// Funding-rate carry: short when annualized funding is rich, long when it is
// deeply negative, exit on convergence or after the holding timeout. Entry
// signals are flagged hedged so the execution layer places the futures leg
// first and aborts the perpetual leg if the hedge fails.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::features::MarketFeatures;
use crate::venue::types::Candle;

use super::{opposite_side, Params, Signal, SignalAction, StructuralStrategy};

#[derive(Debug, Clone)]
pub struct FundingArbitrageConfig {
    /// Annualized funding magnitude to enter (0.15 = 15%).
    pub entry_threshold_annualized: f64,
    /// Annualized funding magnitude to exit (0.05 = 5%).
    pub exit_threshold_annualized: f64,
    pub max_holding_hours: f64,
    pub max_position_pct: f64,
    pub enabled: bool,
}

impl Default for FundingArbitrageConfig {
    fn default() -> Self {
        Self {
            entry_threshold_annualized: 0.15,
            exit_threshold_annualized: 0.05,
            max_holding_hours: 24.0,
            max_position_pct: 33.0,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FundingPosition {
    pub symbol: String,
    pub side: String,
    pub entry_time: DateTime<Utc>,
    pub entry_rate: f64,
}

pub struct FundingArbitrageStrategy {
    cfg: FundingArbitrageConfig,
    positions: HashMap<String, FundingPosition>,
}

impl FundingArbitrageStrategy {
    pub fn new(cfg: FundingArbitrageConfig) -> Self {
        Self {
            cfg,
            positions: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn record_entry(&mut self, symbol: &str, side: &str, rate: f64) {
        self.record_entry_at(symbol, side, rate, Utc::now());
    }

    pub fn record_entry_at(&mut self, symbol: &str, side: &str, rate: f64, at: DateTime<Utc>) {
        self.positions.insert(
            symbol.to_string(),
            FundingPosition {
                symbol: symbol.to_string(),
                side: side.to_string(),
                entry_time: at,
                entry_rate: rate,
            },
        );
    }

    pub fn record_exit(&mut self, symbol: &str) {
        self.positions.remove(symbol);
    }

    pub fn open_positions(&self) -> Vec<&FundingPosition> {
        self.positions.values().collect()
    }

    fn analyze_at(&self, f: &MarketFeatures, now: DateTime<Utc>) -> Signal {
        if !self.cfg.enabled {
            return Signal::none("funding arb disabled");
        }

        let funding_ann = f.basis_annualized;

        if let Some(pos) = self.positions.get(&f.symbol) {
            if funding_ann.abs() < self.cfg.exit_threshold_annualized {
                return Signal {
                    action: SignalAction::Close,
                    side: opposite_side(&pos.side).to_string(),
                    confidence: 0.8,
                    reason: "funding dropped below exit threshold".to_string(),
                    ..Default::default()
                };
            }
            let held_hours =
                now.signed_duration_since(pos.entry_time).num_seconds() as f64 / 3600.0;
            if held_hours > self.cfg.max_holding_hours {
                return Signal {
                    action: SignalAction::Close,
                    side: opposite_side(&pos.side).to_string(),
                    confidence: 0.7,
                    reason: "max holding time exceeded".to_string(),
                    ..Default::default()
                };
            }
            return Signal::none("holding funding position");
        }

        if funding_ann.abs() > self.cfg.entry_threshold_annualized {
            // Positive funding: shorts earn. Negative funding: longs earn.
            let (action, side) = if funding_ann < 0.0 {
                (SignalAction::Buy, "buy")
            } else {
                (SignalAction::Sell, "sell")
            };
            let price = if f.mid() > 0.0 { f.mid() } else { f.spot_price };
            return Signal {
                action,
                side: side.to_string(),
                confidence: 0.65,
                price,
                reason: "high funding rate opportunity".to_string(),
                is_hedged: true,
                ..Default::default()
            };
        }

        Signal::none("funding below threshold")
    }
}

impl StructuralStrategy for FundingArbitrageStrategy {
    fn name(&self) -> &'static str {
        "funding_arbitrage"
    }

    fn analyze(&mut self, f: &MarketFeatures, _candles: &[Candle]) -> Signal {
        // The feature timestamp is the wall clock live and the bar time in
        // replay, so holding-time checks follow the data.
        self.analyze_at(f, f.timestamp)
    }

    fn update_params(&mut self, params: &Params) {
        if let Some(v) = params.get("entry_threshold").and_then(|v| v.as_f64()) {
            self.cfg.entry_threshold_annualized = v;
        }
        if let Some(v) = params.get("exit_threshold").and_then(|v| v.as_f64()) {
            self.cfg.exit_threshold_annualized = v;
        }
        if let Some(v) = params.get("enabled").and_then(|v| v.as_bool()) {
            self.cfg.enabled = v;
        }
    }

    fn on_position_opened(&mut self, symbol: &str, side: &str, at: DateTime<Utc>) {
        self.record_entry_at(symbol, side, 0.0, at);
    }

    fn on_position_closed(&mut self, symbol: &str) {
        self.record_exit(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn features(funding_annualized: f64) -> MarketFeatures {
        MarketFeatures {
            symbol: "BTCUSD".into(),
            basis_annualized: funding_annualized,
            ..Default::default()
        }
    }

    #[test]
    fn funding_below_entry_threshold_is_none() {
        let strategy = FundingArbitrageStrategy::new(FundingArbitrageConfig::default());
        let sig = strategy.analyze_at(&features(0.10), Utc::now());
        assert!(sig.is_none());
    }

    #[test]
    fn rich_positive_funding_sells_negative_buys() {
        let strategy = FundingArbitrageStrategy::new(FundingArbitrageConfig::default());

        let sig = strategy.analyze_at(&features(0.20), Utc::now());
        assert_eq!(sig.action, SignalAction::Sell);
        assert!(sig.is_hedged);

        let sig = strategy.analyze_at(&features(-0.20), Utc::now());
        assert_eq!(sig.action, SignalAction::Buy);
        assert!(sig.is_hedged);
    }

    #[test]
    fn converged_funding_closes_position() {
        let mut strategy = FundingArbitrageStrategy::new(FundingArbitrageConfig::default());
        strategy.record_entry("BTCUSD", "buy", -0.20);

        let sig = strategy.analyze_at(&features(-0.04), Utc::now());
        assert_eq!(sig.action, SignalAction::Close);
        assert_eq!(sig.side, "sell");
        assert_eq!(sig.reason, "funding dropped below exit threshold");
    }

    #[test]
    fn still_rich_funding_keeps_holding() {
        let mut strategy = FundingArbitrageStrategy::new(FundingArbitrageConfig::default());
        strategy.record_entry("BTCUSD", "sell", 0.20);
        let sig = strategy.analyze_at(&features(0.18), Utc::now());
        assert!(sig.is_none());
        assert_eq!(sig.reason, "holding funding position");
    }

    #[test]
    fn holding_timeout_closes_position() {
        let now = Utc::now();
        let mut strategy = FundingArbitrageStrategy::new(FundingArbitrageConfig::default());
        strategy.record_entry_at("BTCUSD", "sell", 0.20, now - Duration::hours(25));

        let sig = strategy.analyze_at(&features(0.10), now);
        assert_eq!(sig.action, SignalAction::Close);
        assert_eq!(sig.side, "buy");
        assert_eq!(sig.reason, "max holding time exceeded");
    }
}
