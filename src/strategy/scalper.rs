// Fee-aware scalper: trades persistent order-book imbalance inside the
// venue's fee-free scalp window, with spread gates and mid-price
// confirmation before entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::features::{Engine, MarketFeatures, ObiSnapshot};
use crate::venue::types::Candle;

use super::{Params, Signal, SignalAction, StructuralStrategy};

#[derive(Debug, Clone)]
pub struct ScalperConfig {
    pub imbalance_threshold: f64,
    pub persistence_snapshots: usize,
    pub min_spread_bps: f64,
    pub max_spread_bps: f64,
    pub target_profit_bps: f64,
    pub max_loss_bps: f64,
    pub scalp_window_btc: Duration,
    pub scalp_window_other: Duration,
    /// Absolute mid-price move (percent) required to confirm the direction.
    pub confirmation_price_pct: f64,
    pub enabled: bool,
}

impl Default for ScalperConfig {
    fn default() -> Self {
        Self {
            imbalance_threshold: 0.5,
            persistence_snapshots: 2,
            min_spread_bps: 1.0,
            max_spread_bps: 10.0,
            target_profit_bps: 20.0,
            max_loss_bps: 15.0,
            scalp_window_btc: Duration::from_secs(30 * 60),
            scalp_window_other: Duration::from_secs(15 * 60),
            confirmation_price_pct: 0.02,
            enabled: true,
        }
    }
}

pub struct FeeAwareScalper {
    cfg: ScalperConfig,
    engine: Arc<Engine>,
    entry_times: HashMap<String, DateTime<Utc>>,
}

impl FeeAwareScalper {
    pub fn new(cfg: ScalperConfig, engine: Arc<Engine>) -> Self {
        Self {
            cfg,
            engine,
            entry_times: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Fee-free window for the symbol: 30 minutes for BTC, 15 for the rest.
    pub fn fee_window(&self, symbol: &str) -> Duration {
        if symbol == "BTCUSD" || symbol == "BTCINR" {
            self.cfg.scalp_window_btc
        } else {
            self.cfg.scalp_window_other
        }
    }

    pub fn record_entry(&mut self, symbol: &str) {
        self.record_entry_at(symbol, Utc::now());
    }

    pub fn record_entry_at(&mut self, symbol: &str, at: DateTime<Utc>) {
        self.entry_times.insert(symbol.to_string(), at);
    }

    pub fn record_exit(&mut self, symbol: &str) {
        self.entry_times.remove(symbol);
    }

    pub fn entry_time(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.entry_times.get(symbol).copied()
    }

    /// True while the position is still inside its fee-free window.
    pub fn should_close_for_fees(&self, symbol: &str) -> bool {
        self.should_close_for_fees_at(symbol, Utc::now())
    }

    pub fn should_close_for_fees_at(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.entry_times.get(symbol) else {
            return false;
        };
        let window = chrono::Duration::from_std(self.fee_window(symbol)).unwrap_or_default();
        now.signed_duration_since(*entry) < window
    }

    /// Requires the last N snapshots all past the threshold on one side.
    fn check_persistence(&self, snapshots: &[ObiSnapshot]) -> (bool, &'static str) {
        let required = self.cfg.persistence_snapshots;
        if snapshots.len() < required {
            return (false, "");
        }
        let window = &snapshots[snapshots.len() - required..];
        let bullish = window
            .iter()
            .filter(|s| s.imbalance > self.cfg.imbalance_threshold)
            .count();
        let bearish = window
            .iter()
            .filter(|s| s.imbalance < -self.cfg.imbalance_threshold)
            .count();

        if bullish >= required {
            (true, "bullish")
        } else if bearish >= required {
            (true, "bearish")
        } else {
            (false, "")
        }
    }

    /// Mid-price must already have moved in the signalled direction.
    fn check_price_confirmation(&self, snapshots: &[ObiSnapshot], direction: &str) -> bool {
        let required = self.cfg.persistence_snapshots;
        if snapshots.len() < required {
            return false;
        }
        let start = snapshots[snapshots.len() - required].mid_price;
        let end = snapshots[snapshots.len() - 1].mid_price;
        if start == 0.0 {
            return false;
        }
        let change = (end - start) / start;
        if direction == "bullish" {
            change > self.cfg.confirmation_price_pct / 100.0
        } else {
            change < -self.cfg.confirmation_price_pct / 100.0
        }
    }
}

impl StructuralStrategy for FeeAwareScalper {
    fn name(&self) -> &'static str {
        "fee_aware_scalper"
    }

    fn analyze(&mut self, f: &MarketFeatures, _candles: &[Candle]) -> Signal {
        if !self.cfg.enabled {
            return Signal::none("scalper disabled");
        }

        if f.historical_vol < 0.10 {
            return Signal::none("volatility too low for scalping");
        }

        if f.spread_bps < self.cfg.min_spread_bps {
            return Signal::none("spread too tight");
        }
        if f.spread_bps > self.cfg.max_spread_bps {
            return Signal::none("spread too wide");
        }

        let snapshots = self.engine.obi_snapshots();
        if snapshots.len() < self.cfg.persistence_snapshots {
            return Signal::none("insufficient OBI history");
        }

        let (persistent, direction) = self.check_persistence(&snapshots);
        if !persistent {
            return Signal::none("imbalance not persistent");
        }

        if !self.check_price_confirmation(&snapshots, direction) {
            return Signal::none("no price confirmation");
        }

        let mid = f.mid();
        // Half the spread is given up on the round trip.
        let effective_target = self.cfg.target_profit_bps - f.spread_bps / 2.0;

        if direction == "bullish" {
            Signal {
                action: SignalAction::Buy,
                side: "buy".to_string(),
                confidence: 0.7,
                price: mid,
                stop_loss: mid * (1.0 - self.cfg.max_loss_bps / 10_000.0),
                take_profit: mid * (1.0 + effective_target / 10_000.0),
                reason: "persistent bullish OBI with price confirmation".to_string(),
                ..Default::default()
            }
        } else {
            Signal {
                action: SignalAction::Sell,
                side: "sell".to_string(),
                confidence: 0.7,
                price: mid,
                stop_loss: mid * (1.0 + self.cfg.max_loss_bps / 10_000.0),
                take_profit: mid * (1.0 - effective_target / 10_000.0),
                reason: "persistent bearish OBI with price confirmation".to_string(),
                ..Default::default()
            }
        }
    }

    fn update_params(&mut self, params: &Params) {
        if let Some(v) = params.get("imbalance_threshold").and_then(|v| v.as_f64()) {
            self.cfg.imbalance_threshold = v;
        }
        if let Some(v) = params.get("persistence_snapshots").and_then(|v| v.as_u64()) {
            self.cfg.persistence_snapshots = v as usize;
        }
        if let Some(v) = params.get("enabled").and_then(|v| v.as_bool()) {
            self.cfg.enabled = v;
        }
    }

    fn on_position_opened(&mut self, symbol: &str, _side: &str, at: DateTime<Utc>) {
        self.record_entry_at(symbol, at);
    }

    fn on_position_closed(&mut self, symbol: &str) {
        self.record_exit(symbol);
    }
}
