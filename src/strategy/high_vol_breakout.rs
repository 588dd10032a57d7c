// Momentum breakout for high-volatility regimes.
// Entry: strong candle close outside the prior 20-bar range with volume
// confirmation. Moves already extended past the broken level are not chased.

use crate::indicators::{atr, average, max_of, min_of};
use crate::venue::types::{Candle, Regime};

use super::{CandleSeries, Params, RegimeStrategy, Signal, SignalAction};

pub struct HighVolBreakoutStrategy {
    pub range_lookback: usize,
    pub volume_threshold: f64,
    pub max_chase_percent: f64,
    pub atr_multiplier: f64,
}

impl Default for HighVolBreakoutStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl HighVolBreakoutStrategy {
    pub fn new() -> Self {
        Self {
            range_lookback: 20,
            volume_threshold: 2.0,
            max_chase_percent: 0.015,
            atr_multiplier: 2.0,
        }
    }

    fn confidence(&self, volume_ok: bool, strong_candle: bool, chase_distance: f64) -> f64 {
        let mut confidence = 0.5;
        if volume_ok {
            confidence += 0.2;
        }
        if strong_candle {
            confidence += 0.15;
        }
        if chase_distance > 0.01 {
            confidence -= 0.1;
        }
        confidence
    }
}

impl RegimeStrategy for HighVolBreakoutStrategy {
    fn name(&self) -> &'static str {
        "high_vol_breakout"
    }

    fn analyze(&self, candles: &[Candle], _regime: Regime) -> Signal {
        if candles.len() < self.range_lookback + 10 {
            return Signal::none("insufficient data");
        }

        let series = CandleSeries::extract(candles);
        let n = series.closes.len();
        let current_price = series.closes[n - 1];
        let current_high = series.highs[n - 1];
        let current_low = series.lows[n - 1];

        let atr_series = atr(&series.highs, &series.lows, &series.closes, 14);
        let current_atr = atr_series[n - 1];

        // Range before the current candle.
        let range_high = max_of(&series.highs[n - self.range_lookback - 1..n - 1]);
        let range_low = min_of(&series.lows[n - self.range_lookback - 1..n - 1]);

        let avg_volume = average(&series.volumes[n - 21..n - 1]);
        let volume_confirm = series.volumes[n - 1] >= avg_volume * self.volume_threshold;

        let breakout_up = current_price > range_high && current_high > range_high;
        let breakout_down = current_price < range_low && current_low < range_low;

        let chase_distance = if breakout_up {
            (current_price - range_high) / range_high
        } else if breakout_down {
            (range_low - current_price) / range_low
        } else {
            0.0
        };

        if chase_distance > self.max_chase_percent {
            return Signal::none("price too extended from breakout point - false breakout risk");
        }

        let candle_body = (series.closes[n - 1] - series.opens[n - 1]).abs();
        let candle_range = current_high - current_low;
        let strong_candle = candle_range > 0.0 && candle_body / candle_range > 0.6;

        if breakout_up && volume_confirm && strong_candle {
            return Signal {
                action: SignalAction::Buy,
                side: "buy".to_string(),
                confidence: self.confidence(volume_confirm, strong_candle, chase_distance),
                price: current_price,
                // Re-entry past the broken level means a failed breakout.
                stop_loss: range_high - 0.5 * current_atr,
                take_profit: current_price + current_atr * 3.0,
                reason: "high vol breakout UP with volume confirmation".to_string(),
                ..Default::default()
            };
        }

        if breakout_down && volume_confirm && strong_candle {
            return Signal {
                action: SignalAction::Sell,
                side: "sell".to_string(),
                confidence: self.confidence(volume_confirm, strong_candle, chase_distance),
                price: current_price,
                stop_loss: range_low + 0.5 * current_atr,
                take_profit: current_price - current_atr * 3.0,
                reason: "high vol breakout DOWN with volume confirmation".to_string(),
                ..Default::default()
            };
        }

        Signal::none("no valid breakout signal")
    }

    fn update_params(&mut self, params: &Params) {
        if let Some(v) = params.get("volume_threshold").and_then(|v| v.as_f64()) {
            self.volume_threshold = v;
        }
        if let Some(v) = params.get("max_chase").and_then(|v| v.as_f64()) {
            self.max_chase_percent = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakout_candles(extension_pct: f64, volume_mult: f64) -> Vec<Candle> {
        // 40 flat bars around 100, then a strong breakout bar.
        let mut candles: Vec<Candle> = (0..40)
            .map(|i| Candle {
                time: i as i64 * 300,
                open: 100.0,
                high: 100.5,
                low: 99.5,
                close: 100.0,
                volume: 10.0,
            })
            .collect();
        let breakout_close = 100.5 * (1.0 + extension_pct);
        candles.push(Candle {
            time: 40 * 300,
            open: 100.4,
            high: breakout_close + 0.05,
            low: 100.3,
            close: breakout_close,
            volume: 10.0 * volume_mult,
        });
        candles
    }

    #[test]
    fn clean_breakout_with_volume_buys() {
        let strategy = HighVolBreakoutStrategy::new();
        let candles = breakout_candles(0.005, 3.0);
        let sig = strategy.analyze(&candles, Regime::HighVol);
        assert_eq!(sig.action, SignalAction::Buy);
        assert!(sig.stop_loss < sig.price);
        assert!(sig.take_profit > sig.price);
    }

    #[test]
    fn extended_move_is_not_chased() {
        let strategy = HighVolBreakoutStrategy::new();
        let candles = breakout_candles(0.03, 3.0);
        let sig = strategy.analyze(&candles, Regime::HighVol);
        assert!(sig.is_none());
        assert!(sig.reason.contains("too extended"));
    }

    #[test]
    fn breakout_without_volume_is_ignored() {
        let strategy = HighVolBreakoutStrategy::new();
        let candles = breakout_candles(0.005, 1.0);
        let sig = strategy.analyze(&candles, Regime::HighVol);
        assert!(sig.is_none());
    }
}
