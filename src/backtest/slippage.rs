// Slippage models. All return slippage in price terms (always positive);
// buys fill higher, sells lower.

use crate::venue::types::Candle;

pub trait SlippageModel: Send + Sync {
    /// `size` is the order's notional value in dollars.
    fn calculate(&self, side: &str, size: f64, candle: &Candle, volatility: f64) -> f64;
}

/// Constant slippage in basis points of the bar's mid.
pub struct FixedSlippage {
    pub bps: f64,
}

impl FixedSlippage {
    pub fn new(bps: f64) -> Self {
        Self { bps }
    }
}

impl SlippageModel for FixedSlippage {
    fn calculate(&self, _side: &str, _size: f64, candle: &Candle, _volatility: f64) -> f64 {
        let mid = (candle.high + candle.low) / 2.0;
        mid * (self.bps / 10_000.0)
    }
}

/// Slippage that widens with intrabar volatility: the high-low range as a
/// percentage of mid feeds a capped volatility component on top of the base.
pub struct VolatilitySlippage {
    pub base_bps: f64,
    pub vol_factor: f64,
}

impl VolatilitySlippage {
    pub fn new(base_bps: f64, vol_factor: f64) -> Self {
        Self { base_bps, vol_factor }
    }
}

impl SlippageModel for VolatilitySlippage {
    fn calculate(&self, _side: &str, _size: f64, candle: &Candle, _volatility: f64) -> f64 {
        let mid = (candle.high + candle.low) / 2.0;
        let intrabar_pct = (candle.high - candle.low) / mid * 100.0;

        // Volatility contribution capped at 10x base.
        let vol_contribution = (intrabar_pct * self.vol_factor).min(self.base_bps * 10.0);
        let total_bps = self.base_bps + vol_contribution;

        mid * (total_bps / 10_000.0)
    }
}

/// Square-root market-impact model: larger orders relative to bar volume
/// slip more.
pub struct VolumeImpactSlippage {
    pub base_bps: f64,
    pub impact_coeff: f64,
}

impl VolumeImpactSlippage {
    pub fn new(base_bps: f64, impact_coeff: f64) -> Self {
        Self { base_bps, impact_coeff }
    }
}

impl SlippageModel for VolumeImpactSlippage {
    fn calculate(&self, _side: &str, size: f64, candle: &Candle, _volatility: f64) -> f64 {
        let mid = (candle.high + candle.low) / 2.0;
        let base = mid * (self.base_bps / 10_000.0);

        if candle.volume > 0.0 {
            let participation = size / candle.volume;
            base + self.impact_coeff * participation.sqrt() * mid
        } else {
            base
        }
    }
}

/// Sums a set of models.
pub struct CompositeSlippage {
    pub models: Vec<Box<dyn SlippageModel>>,
}

impl CompositeSlippage {
    pub fn new(models: Vec<Box<dyn SlippageModel>>) -> Self {
        Self { models }
    }
}

impl SlippageModel for CompositeSlippage {
    fn calculate(&self, side: &str, size: f64, candle: &Candle, volatility: f64) -> f64 {
        self.models
            .iter()
            .map(|m| m.calculate(side, size, candle, volatility))
            .sum()
    }
}

/// Adjusts a fill price for slippage in the adverse direction.
pub fn apply_slippage(price: f64, slippage: f64, side: &str) -> f64 {
    if side == "buy" {
        price + slippage
    } else {
        price - slippage
    }
}

/// Trading fee on notional value in dollars.
pub fn calculate_fee(notional: f64, fee_bps: f64) -> f64 {
    notional * (fee_bps / 10_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64) -> Candle {
        Candle {
            time: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 100.0,
        }
    }

    #[test]
    fn fixed_slippage_is_bps_of_mid() {
        let model = FixedSlippage::new(2.0);
        let slip = model.calculate("buy", 1.0, &candle(50_100.0, 49_900.0), 0.0);
        assert!((slip - 10.0).abs() < 0.01);
    }

    #[test]
    fn wider_bars_slip_at_least_as_much() {
        let model = VolatilitySlippage::new(1.5, 0.5);
        let low_vol = model.calculate("buy", 1.0, &candle(50_100.0, 50_000.0), 0.0);
        let high_vol = model.calculate("buy", 1.0, &candle(51_000.0, 49_000.0), 0.0);
        assert!(high_vol >= low_vol);
    }

    #[test]
    fn volatility_contribution_is_capped() {
        let model = VolatilitySlippage::new(1.0, 10.0);
        // Enormous intrabar range: contribution caps at 10x base.
        let slip = model.calculate("buy", 1.0, &candle(60_000.0, 40_000.0), 0.0);
        let mid = 50_000.0;
        assert!((slip - mid * (11.0 / 10_000.0)).abs() < 1e-6);
    }

    #[test]
    fn apply_slippage_is_adverse() {
        assert_eq!(apply_slippage(50_000.0, 10.0, "buy"), 50_010.0);
        assert_eq!(apply_slippage(50_000.0, 10.0, "sell"), 49_990.0);
    }

    #[test]
    fn fee_on_notional() {
        assert!((calculate_fee(10_000.0, 5.0) - 5.0).abs() < 0.01);
    }

    #[test]
    fn composite_sums_components() {
        let model = CompositeSlippage::new(vec![
            Box::new(FixedSlippage::new(1.0)),
            Box::new(FixedSlippage::new(2.0)),
        ]);
        let c = candle(50_100.0, 49_900.0);
        let expected = 50_000.0 * (3.0 / 10_000.0);
        assert!((model.calculate("buy", 1.0, &c, 0.0) - expected).abs() < 1e-6);
    }
}
