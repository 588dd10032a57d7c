// Preparation mode for low-volatility regimes: monitor range extremes and
// wait for expansion. Optional scalping mode fades RSI extremes with tight
// ATR-based stops and tiny confidence.

use crate::indicators::{atr, max_of, min_of, rsi};
use crate::venue::types::{Candle, Regime};

use super::{CandleSeries, Params, RegimeStrategy, Signal, SignalAction};

pub struct LowVolPrepStrategy {
    pub range_lookback: usize,
    pub scalping_mode: bool,
    pub scalp_atr_mult: f64,
    pub prep_order_dist: f64,
}

impl Default for LowVolPrepStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl LowVolPrepStrategy {
    pub fn new() -> Self {
        Self {
            range_lookback: 30,
            scalping_mode: false,
            scalp_atr_mult: 0.5,
            prep_order_dist: 0.02,
        }
    }

    fn scalping_analysis(&self, current_price: f64, atr_value: f64, rsi_value: f64) -> Signal {
        if rsi_value < 25.0 {
            return Signal {
                action: SignalAction::Buy,
                side: "buy".to_string(),
                confidence: 0.35,
                price: current_price,
                stop_loss: current_price - atr_value * self.scalp_atr_mult,
                take_profit: current_price + atr_value * self.scalp_atr_mult,
                reason: "low vol scalp: RSI oversold bounce".to_string(),
                ..Default::default()
            };
        }

        if rsi_value > 75.0 {
            return Signal {
                action: SignalAction::Sell,
                side: "sell".to_string(),
                confidence: 0.35,
                price: current_price,
                stop_loss: current_price + atr_value * self.scalp_atr_mult,
                take_profit: current_price - atr_value * self.scalp_atr_mult,
                reason: "low vol scalp: RSI overbought fade".to_string(),
                ..Default::default()
            };
        }

        Signal::none("no scalp setup")
    }
}

impl RegimeStrategy for LowVolPrepStrategy {
    fn name(&self) -> &'static str {
        "low_vol_preparation"
    }

    fn analyze(&self, candles: &[Candle], _regime: Regime) -> Signal {
        if candles.len() < self.range_lookback + 10 {
            return Signal::none("insufficient data");
        }

        let series = CandleSeries::extract(candles);
        let n = series.closes.len();
        let current_price = series.closes[n - 1];

        let atr_series = atr(&series.highs, &series.lows, &series.closes, 14);
        let current_atr = atr_series[n - 1];
        let rsi_series = rsi(&series.closes, 14);
        let current_rsi = rsi_series[n - 1];

        let range_high = max_of(&series.highs[n - self.range_lookback..]);
        let range_low = min_of(&series.lows[n - self.range_lookback..]);
        let range_size = range_high - range_low;

        if range_size <= 0.0 {
            return Signal::none("invalid range");
        }

        if self.scalping_mode {
            return self.scalping_analysis(current_price, current_atr, current_rsi);
        }

        let dist_to_low = (current_price - range_low) / range_size;
        let dist_to_high = (range_high - current_price) / range_size;

        if dist_to_low < 0.2 {
            return Signal::none("low vol: monitoring near support, await breakout");
        }
        if dist_to_high < 0.2 {
            return Signal::none("low vol: monitoring near resistance, await breakout");
        }

        Signal::none("low vol: monitoring for opportunity at range extremes")
    }

    fn update_params(&mut self, params: &Params) {
        if let Some(v) = params.get("scalping_mode").and_then(|v| v.as_bool()) {
            self.scalping_mode = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descending_candles(n: usize) -> Vec<Candle> {
        // Persistent sell-off drives RSI well below 25.
        (0..n)
            .map(|i| {
                let close = 200.0 - i as f64;
                Candle {
                    time: i as i64 * 300,
                    open: close + 1.0,
                    high: close + 1.5,
                    low: close - 0.5,
                    close,
                    volume: 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn default_mode_only_monitors() {
        let strategy = LowVolPrepStrategy::new();
        let sig = strategy.analyze(&descending_candles(60), Regime::LowVol);
        assert!(sig.is_none());
    }

    #[test]
    fn scalping_mode_fades_rsi_extremes() {
        let mut strategy = LowVolPrepStrategy::new();
        let mut params = Params::new();
        params.insert("scalping_mode".into(), serde_json::json!(true));
        strategy.update_params(&params);

        let sig = strategy.analyze(&descending_candles(60), Regime::LowVol);
        assert_eq!(sig.action, SignalAction::Buy);
        assert!((sig.confidence - 0.35).abs() < 1e-9);
        let half_atr = (sig.price - sig.stop_loss).abs();
        let half_atr_tp = (sig.take_profit - sig.price).abs();
        assert!((half_atr - half_atr_tp).abs() < 1e-9);
    }
}
