// Structural strategy selector: a fixed priority chain over objective
// market data. Funding carry outranks the grid, which outranks the scalper.

use std::sync::Arc;

use crate::features::{DriverType, Engine, MarketFeatures};
use crate::venue::types::Candle;

use super::funding_arbitrage::{FundingArbitrageConfig, FundingArbitrageStrategy};
use super::grid::{GridConfig, GridTradingStrategy};
use super::scalper::{FeeAwareScalper, ScalperConfig};
use super::{Signal, StructuralStrategy};

const FUNDING_PRIORITY_THRESHOLD: f64 = 0.15;

/// The strategy chosen for a symbol in this cycle.
#[derive(Debug, Clone)]
pub struct SelectedStrategy {
    pub name: &'static str,
    pub driver: DriverType,
    pub driver_strength: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DriverSelectorConfig {
    pub scalper: ScalperConfig,
    pub funding: FundingArbitrageConfig,
    pub grid: GridConfig,
}

/// Owns the structural strategies by value and the shared feature engine.
pub struct DriverSelector {
    scalper: FeeAwareScalper,
    funding_arb: FundingArbitrageStrategy,
    grid_trader: GridTradingStrategy,
    feature_engine: Arc<Engine>,
}

impl DriverSelector {
    pub fn new(cfg: DriverSelectorConfig) -> Self {
        let engine = Arc::new(Engine::new());
        Self {
            scalper: FeeAwareScalper::new(cfg.scalper, engine.clone()),
            funding_arb: FundingArbitrageStrategy::new(cfg.funding),
            grid_trader: GridTradingStrategy::new(cfg.grid, ""),
            feature_engine: engine,
        }
    }

    pub fn feature_engine(&self) -> Arc<Engine> {
        self.feature_engine.clone()
    }

    pub fn scalper(&self) -> &FeeAwareScalper {
        &self.scalper
    }

    pub fn scalper_mut(&mut self) -> &mut FeeAwareScalper {
        &mut self.scalper
    }

    pub fn funding_arb(&self) -> &FundingArbitrageStrategy {
        &self.funding_arb
    }

    pub fn funding_arb_mut(&mut self) -> &mut FundingArbitrageStrategy {
        &mut self.funding_arb
    }

    pub fn grid_trader(&self) -> &GridTradingStrategy {
        &self.grid_trader
    }

    pub fn grid_trader_mut(&mut self) -> &mut GridTradingStrategy {
        &mut self.grid_trader
    }

    /// Chooses the best structural strategy for the bar.
    ///
    /// Priority order, stopping at the first non-none (or active) component:
    /// 1. funding arbitrage when |annualized basis| > 15%;
    /// 2. the grid trader while enabled and active;
    /// 3. the fee-aware scalper as the default.
    pub fn select_best(&mut self, f: &MarketFeatures, candles: &[Candle]) -> (&'static str, Signal) {
        if f.basis_annualized.abs() > FUNDING_PRIORITY_THRESHOLD {
            let sig = self.funding_arb.analyze(f, candles);
            if !sig.is_none() {
                return ("funding_arbitrage", sig);
            }
        }

        if self.grid_trader.is_enabled() {
            let sig = self.grid_trader.analyze(f, candles);
            if self.grid_trader.is_active {
                return ("grid_trading", sig);
            }
        }

        let sig = self.scalper.analyze(f, candles);
        ("fee_aware_scalper", sig)
    }

    pub fn select_strategy(
        &mut self,
        f: &MarketFeatures,
        candles: &[Candle],
    ) -> (SelectedStrategy, Signal) {
        let (name, signal) = self.select_best(f, candles);
        (
            SelectedStrategy {
                name,
                driver: f.dominant_driver,
                driver_strength: f.driver_strength,
            },
            signal,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SignalAction;

    fn selector() -> DriverSelector {
        DriverSelector::new(DriverSelectorConfig::default())
    }

    fn features(basis: f64, vol: f64) -> MarketFeatures {
        MarketFeatures {
            symbol: "BTCUSD".into(),
            basis_annualized: basis,
            historical_vol: vol,
            best_bid: 49_999.5,
            best_ask: 50_000.5,
            spread_bps: 0.2,
            ..Default::default()
        }
    }

    #[test]
    fn rich_funding_outranks_everything() {
        let mut sel = selector();
        let (name, sig) = sel.select_best(&features(0.20, 0.20), &[]);
        assert_eq!(name, "funding_arbitrage");
        assert_eq!(sig.action, SignalAction::Sell);
    }

    #[test]
    fn active_grid_outranks_scalper() {
        let mut sel = selector();
        // First pass activates the grid in the calm-vol window.
        let (name, _) = sel.select_best(&features(0.0, 0.20), &[]);
        assert_eq!(name, "grid_trading");
        assert!(sel.grid_trader().is_active);
    }

    #[test]
    fn scalper_is_the_fallback() {
        let mut sel = selector();
        // Volatility far above the grid activation window.
        let (name, sig) = sel.select_best(&features(0.0, 3.0), &[]);
        assert_eq!(name, "fee_aware_scalper");
        // Spread too tight for the scalper, so the signal itself is none.
        assert!(sig.is_none());
    }
}
