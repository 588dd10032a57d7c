// Trend following for bull markets.
// Entry: pullback to the 20EMA with RSI confirming, trend up on the 50EMA,
// two consecutive bullish candles, volume above average.

use crate::indicators::{atr, average, ema, max_of, min_of, rsi};
use crate::venue::types::{Candle, Regime};

use super::{CandleSeries, Params, RegimeStrategy, Signal, SignalAction};

pub struct BullTrendStrategy {
    pub fast_ema: usize,
    pub slow_ema: usize,
    pub rsi_low: f64,
    pub rsi_high: f64,
    pub atr_multiplier: f64,
    pub volume_ratio: f64,
}

impl Default for BullTrendStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl BullTrendStrategy {
    pub fn new() -> Self {
        Self {
            fast_ema: 20,
            slow_ema: 50,
            rsi_low: 30.0,
            rsi_high: 45.0,
            atr_multiplier: 3.0,
            volume_ratio: 1.2,
        }
    }

    /// Price making a higher high while RSI makes a lower high.
    fn bearish_divergence(&self, closes: &[f64], rsi_series: &[f64], lookback: usize) -> bool {
        let n = closes.len();
        if n < lookback * 2 {
            return false;
        }
        let price_high1 = max_of(&closes[n - lookback..]);
        let price_high2 = max_of(&closes[n - lookback * 2..n - lookback]);
        let rsi_high1 = max_of(&rsi_series[n - lookback..]);
        let rsi_high2 = max_of(&rsi_series[n - lookback * 2..n - lookback]);
        price_high1 > price_high2 && rsi_high1 < rsi_high2
    }

    fn confidence(&self, trend_up: bool, rsi_ok: bool, volume_ok: bool, bullish_candle: bool) -> f64 {
        let mut confidence = 0.5;
        if trend_up {
            confidence += 0.15;
        }
        if rsi_ok {
            confidence += 0.15;
        }
        if volume_ok {
            confidence += 0.1;
        }
        if bullish_candle {
            confidence += 0.1;
        }
        confidence
    }
}

impl RegimeStrategy for BullTrendStrategy {
    fn name(&self) -> &'static str {
        "bull_trend_following"
    }

    fn analyze(&self, candles: &[Candle], _regime: Regime) -> Signal {
        if candles.len() < self.slow_ema + 10 {
            return Signal::none("insufficient data");
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
        let volume_ok = series.volumes[n - 1] >= avg_volume * self.volume_ratio;

        // Two consecutive bullish candles, each closing above its prior close.
        let prev_close = series.closes[n - 2];
        let bullish_candle =
            series.closes[n - 1] > series.opens[n - 1] && series.closes[n - 1] > prev_close;
        let prev_bullish =
            prev_close > series.opens[n - 2] && prev_close > series.closes[n - 3];
        let consecutive_bullish = bullish_candle && prev_bullish;

        // Within 0.5% of the 20EMA, or price just crossed above it.
        let near_ema20 = (current_price - current_ema20).abs() / current_ema20 < 0.005
            || (current_price > current_ema20 && prev_close < ema20[n - 2]);

        let trend_up = current_price > current_ema50 && current_ema20 > current_ema50;
        let rsi_in_range = current_rsi >= self.rsi_low && current_rsi <= self.rsi_high;

        if self.bearish_divergence(&series.closes, &rsi_series, 10) {
            return Signal {
                action: SignalAction::Close,
                side: "sell".to_string(),
                confidence: 0.7,
                reason: "bearish divergence detected".to_string(),
                ..Default::default()
            };
        }

        if trend_up && near_ema20 && rsi_in_range && consecutive_bullish && volume_ok {
            let mut stop_loss = current_price - self.atr_multiplier * current_atr;
            let recent_low = min_of(&series.lows[n - 5..]);
            if recent_low > stop_loss {
                stop_loss = recent_low - 0.001 * current_price;
            }
            let take_profit = current_price + 4.0 * current_atr;

            return Signal {
                action: SignalAction::Buy,
                side: "buy".to_string(),
                confidence: self.confidence(trend_up, rsi_in_range, volume_ok, bullish_candle),
                price: current_price,
                stop_loss,
                take_profit,
                reason: "bull pullback to 20EMA with RSI confirming".to_string(),
                ..Default::default()
            };
        }

        Signal::none("no valid bull entry signal")
    }

    fn update_params(&mut self, params: &Params) {
        if let Some(v) = params.get("fast_ema").and_then(|v| v.as_u64()) {
            self.fast_ema = v as usize;
        }
        if let Some(v) = params.get("slow_ema").and_then(|v| v.as_u64()) {
            self.slow_ema = v as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::types::Regime;

    #[test]
    fn too_few_candles_is_none() {
        let strategy = BullTrendStrategy::new();
        let candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                time: i,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        let sig = strategy.analyze(&candles, Regime::Bull);
        assert!(sig.is_none());
        assert_eq!(sig.reason, "insufficient data");
    }

    #[test]
    fn update_params_overrides_periods() {
        let mut strategy = BullTrendStrategy::new();
        let mut params = Params::new();
        params.insert("slow_ema".into(), serde_json::json!(30));
        strategy.update_params(&params);
        assert_eq!(strategy.slow_ema, 30);
    }
}
