// Strategy family: regime-specialized strategies composed under a Manager,
// structural strategies composed under the prioritized selector.
//
// Two narrow capability sets instead of one super-trait: regime strategies
// analyze (candles, regime); structural strategies analyze (features,
// candles). The selector adapts at the call site.

pub mod aggregator;
pub mod bear_trend;
pub mod bull_trend;
pub mod filter;
pub mod funding_arbitrage;
pub mod grid;
pub mod high_vol_breakout;
pub mod low_vol_prep;
pub mod ranging;
pub mod scalper;
pub mod selector;

use std::collections::HashMap;
use std::sync::RwLock;

use crate::features::MarketFeatures;
use crate::venue::types::{Candle, Regime};

/// Runtime parameter bag for `update_params`; per-strategy configuration
/// structs stay fully typed.
pub type Params = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    None,
    Buy,
    Sell,
    Close,
    Reduce,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalAction::None => "none",
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Close => "close",
            SignalAction::Reduce => "reduce",
        };
        f.write_str(s)
    }
}

/// A trading signal. `is_hedged` tells the execution layer to place the
/// futures hedge leg first and abort the perpetual leg if it fails.
#[derive(Debug, Clone)]
pub struct Signal {
    pub action: SignalAction,
    pub side: String,
    pub confidence: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub reason: String,
    pub is_hedged: bool,
}

impl Default for Signal {
    fn default() -> Self {
        Self {
            action: SignalAction::None,
            side: String::new(),
            confidence: 0.0,
            price: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            reason: String::new(),
            is_hedged: false,
        }
    }
}

impl Signal {
    pub fn none(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            ..Default::default()
        }
    }

    pub fn is_none(&self) -> bool {
        self.action == SignalAction::None
    }
}

pub fn opposite_side(side: &str) -> &'static str {
    if side == "buy" {
        "sell"
    } else {
        "buy"
    }
}

/// Regime-specialized strategies: pure over (candles, regime).
pub trait RegimeStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn analyze(&self, candles: &[Candle], regime: Regime) -> Signal;
    fn update_params(&mut self, _params: &Params) {}
}

/// Structural strategies: read the feature view and may carry per-symbol
/// state across calls (entry times, grid levels). The position hooks let
/// the execution side report fills back into that state; `at` is the fill
/// time (wall clock live, bar time in replay).
pub trait StructuralStrategy: Send {
    fn name(&self) -> &'static str;
    fn analyze(&mut self, features: &MarketFeatures, candles: &[Candle]) -> Signal;
    fn update_params(&mut self, _params: &Params) {}
    fn on_position_opened(&mut self, _symbol: &str, _side: &str, _at: chrono::DateTime<chrono::Utc>) {}
    fn on_position_closed(&mut self, _symbol: &str) {}
}

/// Price series extracted from candles in a single pass.
pub struct CandleSeries {
    pub opens: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl CandleSeries {
    pub fn extract(candles: &[Candle]) -> Self {
        let n = candles.len();
        let mut series = Self {
            opens: Vec::with_capacity(n),
            highs: Vec::with_capacity(n),
            lows: Vec::with_capacity(n),
            closes: Vec::with_capacity(n),
            volumes: Vec::with_capacity(n),
        };
        for c in candles {
            series.opens.push(c.open);
            series.highs.push(c.high);
            series.lows.push(c.low);
            series.closes.push(c.close);
            series.volumes.push(c.volume);
        }
        series
    }
}

/// Keeps a name -> strategy mapping and a regime -> strategy-name mapping.
pub struct Manager {
    strategies: RwLock<HashMap<String, Box<dyn RegimeStrategy>>>,
    regime_strategies: RwLock<HashMap<Regime, String>>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            regime_strategies: RwLock::new(HashMap::new()),
        }
    }

    /// A manager with all five regime strategies registered and mapped.
    pub fn with_default_strategies() -> Self {
        let mgr = Self::new();
        mgr.register(Box::new(bull_trend::BullTrendStrategy::new()));
        mgr.register(Box::new(bear_trend::BearTrendStrategy::new()));
        mgr.register(Box::new(ranging::RangingStrategy::new()));
        mgr.register(Box::new(high_vol_breakout::HighVolBreakoutStrategy::new()));
        mgr.register(Box::new(low_vol_prep::LowVolPrepStrategy::new()));

        mgr.set_regime_strategy(Regime::Bull, "bull_trend_following");
        mgr.set_regime_strategy(Regime::Bear, "bear_trend_following");
        mgr.set_regime_strategy(Regime::Ranging, "ranging_mean_reversion");
        mgr.set_regime_strategy(Regime::HighVol, "high_vol_breakout");
        mgr.set_regime_strategy(Regime::LowVol, "low_vol_preparation");
        mgr
    }

    pub fn register(&self, strategy: Box<dyn RegimeStrategy>) {
        let mut strategies = self.strategies.write().expect("strategy map poisoned");
        strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn set_regime_strategy(&self, regime: Regime, strategy_name: &str) {
        let mut map = self.regime_strategies.write().expect("regime map poisoned");
        map.insert(regime, strategy_name.to_string());
    }

    /// Looks up the strategy mapped to the regime, falling back to an
    /// arbitrary registered strategy when unmapped.
    pub fn get_signal(&self, candles: &[Candle], regime: Regime) -> Signal {
        let name = {
            let map = self.regime_strategies.read().expect("regime map poisoned");
            map.get(&regime).cloned()
        };

        let strategies = self.strategies.read().expect("strategy map poisoned");
        let name = match name {
            Some(n) => n,
            None => match strategies.keys().next() {
                Some(n) => n.clone(),
                None => return Signal::none("no strategy available"),
            },
        };

        match strategies.get(&name) {
            Some(strategy) => strategy.analyze(candles, regime),
            None => Signal::none("no strategy available"),
        }
    }

    /// Convenience wrapper used where a feature view is already in hand.
    pub fn get_signal_for_features(&self, features: &MarketFeatures, candles: &[Candle]) -> Signal {
        self.get_signal(candles, features.regime)
    }

    pub fn update_params(&self, strategy_name: &str, params: &Params) {
        let mut strategies = self.strategies.write().expect("strategy map poisoned");
        if let Some(strategy) = strategies.get_mut(strategy_name) {
            strategy.update_params(params);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_side_flips() {
        assert_eq!(opposite_side("buy"), "sell");
        assert_eq!(opposite_side("sell"), "buy");
    }

    #[test]
    fn empty_manager_yields_none() {
        let mgr = Manager::new();
        let sig = mgr.get_signal(&[], Regime::Bull);
        assert!(sig.is_none());
        assert_eq!(sig.reason, "no strategy available");
    }

    #[test]
    fn default_manager_maps_every_regime() {
        let mgr = Manager::with_default_strategies();
        // With no candles, every mapped strategy reports insufficient data
        // rather than falling through to the arbitrary fallback.
        for regime in [
            Regime::Bull,
            Regime::Bear,
            Regime::Ranging,
            Regime::HighVol,
            Regime::LowVol,
        ] {
            let sig = mgr.get_signal(&[], regime);
            assert!(sig.is_none(), "{regime} produced {:?}", sig.action);
            assert_eq!(sig.reason, "insufficient data");
        }
    }
}
