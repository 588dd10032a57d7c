// Pre-trade signal filter: a 4-hour trend gate in the high-volatility
// regime, and stricter entry rules for longs (which underperform
// historically).

use crate::indicators::ema_last;
use crate::venue::types::{Candle, Regime};

use super::Signal;

const LONG_MIN_CONFIDENCE: f64 = 0.70;

#[derive(Debug, Default)]
pub struct SignalFilter;

impl SignalFilter {
    pub fn new() -> Self {
        Self
    }

    /// Returns whether the signal should trade, with a reason when blocked.
    pub fn should_trade(
        &self,
        signal: &Signal,
        candles: &[Candle],
        regime: Regime,
    ) -> (bool, String) {
        if signal.is_none() {
            return (false, "no signal".to_string());
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        // 4H multi-timeframe filter, only in the high-volatility regime:
        // sample every 4th close to approximate 4H bars from 1H data.
        if regime == Regime::HighVol && closes.len() >= 80 {
            let closes_4h: Vec<f64> = closes.iter().step_by(4).copied().collect();
            if closes_4h.len() >= 20 {
                let ema20 = ema_last(&closes_4h, 20);
                let trend_up = closes_4h[closes_4h.len() - 1] > ema20;

                if signal.side == "buy" && !trend_up {
                    return (false, "4H trend down, skipping long in high_vol".to_string());
                }
                if signal.side == "sell" && trend_up {
                    return (false, "4H trend up, skipping short in high_vol".to_string());
                }
            }
        }

        if signal.side == "buy" {
            if signal.confidence < LONG_MIN_CONFIDENCE {
                return (
                    false,
                    format!(
                        "long confidence {:.2} < {LONG_MIN_CONFIDENCE:.2} threshold",
                        signal.confidence
                    ),
                );
            }
            if regime == Regime::Bear {
                return (false, "no longs in bear regime".to_string());
            }
        }

        (true, String::new())
    }
}
