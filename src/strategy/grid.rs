// Grid trading for calm markets: equally spaced levels around a center
// price, recentering when price drifts to the grid edge and shutting down
// when volatility expands. Levels are kept as an array plus an
// order-id -> level-index map; no back-pointers.

use std::collections::HashMap;

use crate::features::MarketFeatures;
use crate::venue::types::Candle;

use super::{Params, Signal, SignalAction, StructuralStrategy};

#[derive(Debug, Clone)]
pub struct GridConfig {
    pub grid_levels: usize,
    /// Percent each side of the center price.
    pub grid_range_pct: f64,
    pub position_size_per_level: i64,
    /// Deactivate when volatility exceeds this (percent).
    pub max_volatility_pct: f64,
    /// Activate when volatility is below this (percent).
    pub min_volatility_pct: f64,
    pub enabled: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_levels: 10,
            grid_range_pct: 3.0,
            position_size_per_level: 1,
            max_volatility_pct: 200.0,
            min_volatility_pct: 150.0,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GridLevel {
    pub price: f64,
    pub side: String,
    pub order_id: Option<i64>,
    pub is_active: bool,
}

pub struct GridTradingStrategy {
    cfg: GridConfig,
    levels: Vec<GridLevel>,
    order_levels: HashMap<i64, usize>,
    pub is_active: bool,
    symbol: String,
    center_price: f64,
}

impl GridTradingStrategy {
    pub fn new(cfg: GridConfig, symbol: &str) -> Self {
        Self {
            cfg,
            levels: Vec::new(),
            order_levels: HashMap::new(),
            is_active: false,
            symbol: symbol.to_string(),
            center_price: 0.0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn center_price(&self) -> f64 {
        self.center_price
    }

    /// Equally spaced levels over center * (1 +/- range_pct); buys below the
    /// center, sells above it.
    pub fn calculate_levels(&self, mid_price: f64) -> Vec<GridLevel> {
        if self.cfg.grid_levels < 2 {
            return Vec::new();
        }
        let range_amt = mid_price * (self.cfg.grid_range_pct / 100.0);
        let step = (range_amt * 2.0) / (self.cfg.grid_levels as f64 - 1.0);
        let start = mid_price - range_amt;

        (0..self.cfg.grid_levels)
            .map(|i| {
                let price = start + i as f64 * step;
                GridLevel {
                    price,
                    side: if price > mid_price { "sell" } else { "buy" }.to_string(),
                    order_id: None,
                    is_active: true,
                }
            })
            .collect()
    }

    /// Associates a placed order with a grid level for fill tracking.
    pub fn bind_order(&mut self, level_index: usize, order_id: i64) {
        if let Some(level) = self.levels.get_mut(level_index) {
            level.order_id = Some(order_id);
            self.order_levels.insert(order_id, level_index);
        }
    }

    pub fn tracked_orders(&self) -> Vec<i64> {
        self.order_levels.keys().copied().collect()
    }

    /// Marks the filled level inactive. A counter-order at the adjacent
    /// level is the runtime's responsibility.
    pub fn on_fill(&mut self, order_id: i64) -> Signal {
        if let Some(index) = self.order_levels.remove(&order_id) {
            if let Some(level) = self.levels.get_mut(index) {
                level.is_active = false;
                return Signal::none(&format!("level at {} filled", level.price));
            }
        }
        Signal::none("")
    }
}

impl StructuralStrategy for GridTradingStrategy {
    fn name(&self) -> &'static str {
        "grid_trading"
    }

    fn analyze(&mut self, f: &MarketFeatures, _candles: &[Candle]) -> Signal {
        if !self.cfg.enabled {
            return Signal::none("grid disabled");
        }

        let vol_pct = f.historical_vol * 100.0;
        let mid_price = f.mid();

        if !self.is_active {
            if vol_pct < self.cfg.min_volatility_pct && vol_pct > 5.0 {
                self.is_active = true;
                self.center_price = mid_price;
                self.levels = self.calculate_levels(mid_price);
                self.order_levels.clear();
                return Signal::none("grid activated, placing levels");
            }
            return Signal::none("conditions not met for grid");
        }

        if vol_pct > self.cfg.max_volatility_pct {
            self.is_active = false;
            return Signal {
                action: SignalAction::Close,
                reason: "grid deactivated: high volatility".to_string(),
                ..Default::default()
            };
        }

        // Recenter when price drifts toward the grid edge.
        let drift_pct = (mid_price - self.center_price).abs() / self.center_price * 100.0;
        if drift_pct > self.cfg.grid_range_pct * 0.8 {
            self.is_active = false;
            return Signal {
                action: SignalAction::Close,
                reason: "grid recentering".to_string(),
                ..Default::default()
            };
        }

        // Single-order semantics for the backtest: buy below the grid's
        // lower bound, sell above its upper bound.
        if !self.levels.is_empty() {
            let mut lower = self.levels[0].price;
            let mut upper = self.levels[self.levels.len() - 1].price;
            if lower > upper {
                std::mem::swap(&mut lower, &mut upper);
            }

            if mid_price < lower {
                return Signal {
                    action: SignalAction::Buy,
                    side: "buy".to_string(),
                    price: mid_price,
                    confidence: 0.8,
                    reason: "price below grid lower bound".to_string(),
                    ..Default::default()
                };
            }
            if mid_price > upper {
                return Signal {
                    action: SignalAction::Sell,
                    side: "sell".to_string(),
                    price: mid_price,
                    confidence: 0.8,
                    reason: "price above grid upper bound".to_string(),
                    ..Default::default()
                };
            }
        }

        Signal::none("grid monitoring")
    }

    fn update_params(&mut self, params: &Params) {
        if let Some(v) = params.get("grid_levels").and_then(|v| v.as_u64()) {
            self.cfg.grid_levels = v as usize;
        }
        if let Some(v) = params.get("grid_range").and_then(|v| v.as_f64()) {
            self.cfg.grid_range_pct = v;
        }
        if let Some(v) = params.get("enabled").and_then(|v| v.as_bool()) {
            self.cfg.enabled = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(vol: f64, mid: f64) -> MarketFeatures {
        MarketFeatures {
            symbol: "BTCUSD".into(),
            historical_vol: vol,
            best_bid: mid - 0.5,
            best_ask: mid + 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn levels_span_the_configured_range() {
        let grid = GridTradingStrategy::new(GridConfig::default(), "BTCUSD");
        let levels = grid.calculate_levels(50_000.0);
        assert_eq!(levels.len(), 10);
        assert!((levels[0].price - 48_500.0).abs() < 1e-6);
        assert!((levels[9].price - 51_500.0).abs() < 1e-6);
        let step = levels[1].price - levels[0].price;
        assert!((step - 3000.0 / 9.0).abs() < 1e-6);
        assert_eq!(levels[0].side, "buy");
        assert_eq!(levels[9].side, "sell");
    }

    #[test]
    fn activates_in_the_calm_window() {
        let mut grid = GridTradingStrategy::new(GridConfig::default(), "BTCUSD");
        let sig = grid.analyze(&features(0.20, 50_000.0), &[]);
        assert!(grid.is_active);
        assert_eq!(sig.reason, "grid activated, placing levels");
        assert_eq!(grid.levels().len(), 10);
    }

    #[test]
    fn high_volatility_deactivates_with_close() {
        let cfg = GridConfig {
            max_volatility_pct: 50.0,
            min_volatility_pct: 30.0,
            ..Default::default()
        };
        let mut grid = GridTradingStrategy::new(cfg, "BTCUSD");
        grid.analyze(&features(0.20, 50_000.0), &[]);
        assert!(grid.is_active);

        let sig = grid.analyze(&features(0.70, 50_000.0), &[]);
        assert_eq!(sig.action, SignalAction::Close);
        assert!(!grid.is_active);
        assert_eq!(sig.reason, "grid deactivated: high volatility");
    }

    #[test]
    fn drift_past_edge_recenters() {
        let mut grid = GridTradingStrategy::new(GridConfig::default(), "BTCUSD");
        grid.analyze(&features(0.20, 50_000.0), &[]);

        // 0.8 * 3% = 2.4% drift triggers a recenter close.
        let sig = grid.analyze(&features(0.20, 51_300.0), &[]);
        assert_eq!(sig.action, SignalAction::Close);
        assert_eq!(sig.reason, "grid recentering");
        assert!(!grid.is_active);
    }

    #[test]
    fn fill_marks_level_inactive() {
        let mut grid = GridTradingStrategy::new(GridConfig::default(), "BTCUSD");
        grid.analyze(&features(0.20, 50_000.0), &[]);
        grid.bind_order(0, 777);
        assert_eq!(grid.tracked_orders(), vec![777]);

        let sig = grid.on_fill(777);
        assert!(sig.reason.contains("filled"));
        assert!(!grid.levels()[0].is_active);
        assert!(grid.tracked_orders().is_empty());
    }

    #[test]
    fn too_quiet_market_does_not_activate() {
        let mut grid = GridTradingStrategy::new(GridConfig::default(), "BTCUSD");
        let sig = grid.analyze(&features(0.03, 50_000.0), &[]);
        assert!(!grid.is_active);
        assert_eq!(sig.reason, "conditions not met for grid");
    }
}
