// Trend-following shorts, or capital preservation, for bear markets.
// Entry: relief rally into the 20EMA with rejection, trend down on the 50EMA.
// Safe mode skips shorts and signals exposure reduction instead.

use crate::indicators::{atr, average, ema, max_of, min_of, rsi};
use crate::venue::types::{Candle, Regime};

use super::{CandleSeries, Params, RegimeStrategy, Signal, SignalAction};

pub struct BearTrendStrategy {
    pub fast_ema: usize,
    pub slow_ema: usize,
    pub rsi_low: f64,
    pub rsi_high: f64,
    pub atr_multiplier: f64,
    pub safe_mode: bool,
}

impl Default for BearTrendStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl BearTrendStrategy {
    pub fn new() -> Self {
        Self {
            fast_ema: 20,
            slow_ema: 50,
            rsi_low: 55.0,
            rsi_high: 70.0,
            atr_multiplier: 3.0,
            safe_mode: false,
        }
    }

    /// Price making a lower low while RSI makes a higher low.
    fn bullish_divergence(&self, closes: &[f64], rsi_series: &[f64], lookback: usize) -> bool {
        let n = closes.len();
        if n < lookback * 2 {
            return false;
        }
        let price_low1 = min_of(&closes[n - lookback..]);
        let price_low2 = min_of(&closes[n - lookback * 2..n - lookback]);
        let rsi_low1 = min_of(&rsi_series[n - lookback..]);
        let rsi_low2 = min_of(&rsi_series[n - lookback * 2..n - lookback]);
        price_low1 < price_low2 && rsi_low1 > rsi_low2
    }

    fn confidence(
        &self,
        trend_down: bool,
        rsi_ok: bool,
        volume_ok: bool,
        bearish_candle: bool,
    ) -> f64 {
        let mut confidence = 0.5;
        if trend_down {
            confidence += 0.15;
        }
        if rsi_ok {
            confidence += 0.15;
        }
        if volume_ok {
            confidence += 0.1;
        }
        if bearish_candle {
            confidence += 0.1;
        }
        confidence
    }
}

impl RegimeStrategy for BearTrendStrategy {
    fn name(&self) -> &'static str {
        "bear_trend_following"
    }

    fn analyze(&self, candles: &[Candle], _regime: Regime) -> Signal {
        if candles.len() < self.slow_ema + 10 {
            return Signal::none("insufficient data");
        }

        if self.safe_mode {
            return Signal {
                action: SignalAction::Reduce,
                confidence: 0.8,
                reason: "bear regime - capital preservation mode".to_string(),
                ..Default::default()
            };
        }

        let series = CandleSeries::extract(candles);
        let n = series.closes.len();
        let current_price = series.closes[n - 1];

        let ema20 = ema(&series.closes, self.fast_ema);
        let ema50 = ema(&series.closes, self.slow_ema);
        let rsi_series = rsi(&series.closes, 14);
        let atr_series = atr(&series.highs, &series.lows, &series.closes, 14);

        let current_ema20 = ema20[n - 1];
        let current_ema50 = ema50[n - 1];
        let current_rsi = rsi_series[n - 1];
        let current_atr = atr_series[n - 1];

        let avg_volume = average(&series.volumes[n - 20..]);
        let volume_ok = series.volumes[n - 1] >= avg_volume;

        let bearish_candle = series.closes[n - 1] < series.opens[n - 1];
        let prev_close = series.closes[n - 2];
        let prev_bearish =
            prev_close < series.opens[n - 2] && prev_close < series.closes[n - 3];
        let consecutive_bearish = bearish_candle && prev_bearish;

        // Near the 20EMA resistance, or just rejected from above it.
        let near_ema20 = (current_price - current_ema20).abs() / current_ema20 < 0.005
            || (current_price < current_ema20 && series.closes[n - 2] > ema20[n - 2]);

        let trend_down = current_price < current_ema50 && current_ema20 < current_ema50;
        let rsi_in_range = current_rsi >= self.rsi_low && current_rsi <= self.rsi_high;

        if self.bullish_divergence(&series.closes, &rsi_series, 10) {
            return Signal {
                action: SignalAction::Close,
                side: "buy".to_string(),
                confidence: 0.7,
                reason: "bullish divergence detected - cover shorts".to_string(),
                ..Default::default()
            };
        }

        if trend_down && near_ema20 && rsi_in_range && consecutive_bearish && volume_ok {
            // Stop just above the rally high, tightened by the ATR stop.
            let recent_high = max_of(&series.highs[n - 5..]);
            let mut stop_loss = recent_high + 0.001 * current_price;
            let atr_stop = current_price + self.atr_multiplier * current_atr;
            if atr_stop < stop_loss {
                stop_loss = atr_stop;
            }
            let take_profit = current_price - 4.0 * current_atr;

            return Signal {
                action: SignalAction::Sell,
                side: "sell".to_string(),
                confidence: self.confidence(trend_down, rsi_in_range, volume_ok, bearish_candle),
                price: current_price,
                stop_loss,
                take_profit,
                reason: "bear rally to 20EMA resistance with rejection".to_string(),
                ..Default::default()
            };
        }

        Signal::none("no valid bear entry signal")
    }

    fn update_params(&mut self, params: &Params) {
        if let Some(v) = params.get("safe_mode").and_then(|v| v.as_bool()) {
            self.safe_mode = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                time: i as i64,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn safe_mode_reduces_with_high_confidence() {
        let mut strategy = BearTrendStrategy::new();
        let mut params = Params::new();
        params.insert("safe_mode".into(), serde_json::json!(true));
        strategy.update_params(&params);

        let sig = strategy.analyze(&flat_candles(80), Regime::Bear);
        assert_eq!(sig.action, SignalAction::Reduce);
        assert!((sig.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn safe_mode_still_requires_data() {
        let mut strategy = BearTrendStrategy::new();
        strategy.safe_mode = true;
        let sig = strategy.analyze(&flat_candles(10), Regime::Bear);
        assert!(sig.is_none());
    }
}
