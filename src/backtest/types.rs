// Backtest domain types: configuration, simulated positions, completed
// trades, and equity-curve points.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::venue::types::{mock_product, Product};

use super::slippage::SlippageModel;

/// Backtesting parameters.
pub struct BacktestConfig {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    pub symbols: Vec<String>,
    pub resolution: String,

    pub initial_capital: f64,
    pub leverage: u32,

    /// Realistic costs in basis points (1 bps = 0.01%).
    pub maker_fee_bps: f64,
    pub taker_fee_bps: f64,
    pub slippage_model: Box<dyn SlippageModel>,

    pub simulate_funding: bool,
    pub data_cache_dir: String,

    /// Product metadata for contract conversions.
    pub products: HashMap<String, Product>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        let symbols = vec!["BTCUSD".to_string(), "ETHUSD".to_string(), "SOLUSD".to_string()];
        let mut products = HashMap::new();
        for sym in &symbols {
            products.insert(sym.clone(), mock_product(sym));
        }

        Self {
            start_time: Utc::now() - chrono::Duration::days(90),
            end_time: Utc::now(),
            symbols,
            resolution: "5m".to_string(),
            initial_capital: 200.0,
            leverage: 10,
            maker_fee_bps: 2.0,
            taker_fee_bps: 5.0,
            slippage_model: Box::new(super::slippage::VolatilitySlippage::new(1.5, 0.5)),
            simulate_funding: true,
            data_cache_dir: ".backtest_cache".to_string(),
            products,
        }
    }
}

impl BacktestConfig {
    pub fn product(&self, symbol: &str) -> Product {
        self.products
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| mock_product(symbol))
    }
}

/// An open position during simulation. `size` is a whole contract count.
#[derive(Debug, Clone)]
pub struct SimPosition {
    pub symbol: String,
    pub side: String,
    pub size: i64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,

    pub initial_margin: f64,

    pub entry_fee: f64,
    pub entry_slip: f64,
    /// Positive means funding paid out, negative means received.
    pub funding_paid: f64,
}

impl SimPosition {
    /// Linear-futures mark-to-market:
    /// contracts * contract_value * (mark - entry) * direction.
    pub fn unrealized_pnl(&self, current_price: f64, contract_value: f64) -> f64 {
        let direction = if self.side == "sell" { -1.0 } else { 1.0 };
        self.size as f64 * contract_value * (current_price - self.entry_price) * direction
    }
}

/// A completed round trip with its full cost breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub size: f64,

    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_fee: f64,
    pub entry_slip: f64,

    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_fee: f64,
    pub exit_slip: f64,

    /// Slippage costs in dollars, not price units.
    pub entry_slip_cost: f64,
    pub exit_slip_cost: f64,

    pub funding_paid: f64,

    pub gross_pnl: f64,
    pub net_pnl: f64,

    /// "stop_loss", "take_profit", "signal", "signal_reversal",
    /// "signal_close", "timeout".
    pub reason: String,
}

/// A funding payment event; rate is the 8-hourly rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    /// Fraction of peak equity given back (0.1 = 10%).
    pub drawdown: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrealized_pnl_long_and_short() {
        let long = SimPosition {
            symbol: "BTCUSD".into(),
            side: "buy".into(),
            size: 10,
            entry_price: 50_000.0,
            entry_time: Utc::now(),
            stop_loss: 0.0,
            take_profit: 0.0,
            initial_margin: 0.0,
            entry_fee: 0.0,
            entry_slip: 0.0,
            funding_paid: 0.0,
        };
        // 10 contracts * 0.001 * 500 = 5.0
        assert!((long.unrealized_pnl(50_500.0, 0.001) - 5.0).abs() < 1e-9);

        let mut short = long.clone();
        short.side = "sell".into();
        assert!((short.unrealized_pnl(49_500.0, 0.001) - 5.0).abs() < 1e-9);
        assert!((short.unrealized_pnl(50_500.0, 0.001) + 5.0).abs() < 1e-9);
    }
}
