// Per-symbol market feature computation: spread, depth imbalance, OBI
// persistence, historical volatility, annualized funding basis, and the
// dominant structural driver for the bar.

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::venue::types::{Candle, Orderbook, Regime, Ticker};

const BASIS_THRESHOLD: f64 = 0.15;
const IV_PREMIUM_THRESHOLD: f64 = 0.10;
const IMBALANCE_THRESHOLD: f64 = 0.6;
const PERSISTENCE_REQUIRED: usize = 5;
const DEPTH_LEVELS: usize = 10;
const MAX_OBI_SNAPSHOTS: usize = 60;
const IMBALANCE_PERIOD: usize = 10;
const HV_PERIOD: usize = 20;

/// The single most-salient structural feature of the bar, or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    None,
    HighIv,
    HighBasis,
    OrderImbalance,
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriverType::None => "none",
            DriverType::HighIv => "high_iv",
            DriverType::HighBasis => "high_basis",
            DriverType::OrderImbalance => "order_imbalance",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct MarketFeatures {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,

    pub spot_price: f64,
    pub mark_price: f64,

    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub spread_bps: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub imbalance: f64,
    pub imbalance_ma: f64,

    pub historical_vol: f64,
    pub implied_vol: f64,
    pub iv_premium: f64,

    pub basis_abs: f64,
    pub basis_pct: f64,
    pub basis_annualized: f64,

    pub dominant_driver: DriverType,
    pub driver_strength: f64,

    pub regime: Regime,
    pub regime_confidence: f64,
}

impl Default for MarketFeatures {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            timestamp: Utc::now(),
            spot_price: 0.0,
            mark_price: 0.0,
            best_bid: 0.0,
            best_ask: 0.0,
            spread: 0.0,
            spread_bps: 0.0,
            bid_depth: 0.0,
            ask_depth: 0.0,
            imbalance: 0.0,
            imbalance_ma: 0.0,
            historical_vol: 0.0,
            implied_vol: 0.0,
            iv_premium: 0.0,
            basis_abs: 0.0,
            basis_pct: 0.0,
            basis_annualized: 0.0,
            dominant_driver: DriverType::None,
            driver_strength: 0.0,
            regime: Regime::Ranging,
            regime_confidence: 0.0,
        }
    }
}

impl MarketFeatures {
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }
}

/// One entry of the rolling order-book-imbalance window.
#[derive(Debug, Clone, Copy)]
pub struct ObiSnapshot {
    pub timestamp: DateTime<Utc>,
    pub imbalance: f64,
    pub mid_price: f64,
}

/// Feature engine. The OBI ring is guarded; everything else is pure.
pub struct Engine {
    obi: RwLock<Vec<ObiSnapshot>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            obi: RwLock::new(Vec::new()),
        }
    }

    /// Computes features and folds the ticker's 8-hour funding rate into the
    /// annualized basis (rate * 3 * 365).
    pub fn compute_features_with_funding(
        &self,
        orderbook: Option<&Orderbook>,
        ticker: Option<&Ticker>,
        candles: &[Candle],
    ) -> MarketFeatures {
        let rate = ticker.map(|t| t.funding_rate).unwrap_or(0.0);
        self.compute_features_with_funding_rate(orderbook, ticker, candles, rate)
    }

    pub fn compute_features_with_funding_rate(
        &self,
        orderbook: Option<&Orderbook>,
        ticker: Option<&Ticker>,
        candles: &[Candle],
        funding_rate: f64,
    ) -> MarketFeatures {
        let mut f = self.compute_features(orderbook, ticker, candles);

        if funding_rate != 0.0 {
            f.basis_annualized = funding_rate * 3.0 * 365.0;
            f.basis_pct = funding_rate;
            f.basis_abs = funding_rate;
        }

        let (driver, strength) = self.detect_dominant_driver(&f);
        f.dominant_driver = driver;
        f.driver_strength = strength;
        f
    }

    pub fn compute_features(
        &self,
        orderbook: Option<&Orderbook>,
        ticker: Option<&Ticker>,
        candles: &[Candle],
    ) -> MarketFeatures {
        let mut f = MarketFeatures {
            timestamp: Utc::now(),
            ..Default::default()
        };

        if let Some(t) = ticker {
            f.symbol = t.symbol.clone();
            f.spot_price = t.close;
            f.mark_price = t.mark_price;
        }

        if let Some(ob) = orderbook {
            if !ob.buy.is_empty() && !ob.sell.is_empty() {
                f.best_bid = ob.buy[0].price_f64();
                f.best_ask = ob.sell[0].price_f64();
                f.spread = f.best_ask - f.best_bid;
                let mid = (f.best_bid + f.best_ask) / 2.0;
                if mid > 0.0 {
                    f.spread_bps = (f.spread / mid) * 10_000.0;
                }

                let (bid_depth, ask_depth) = compute_depth(ob, DEPTH_LEVELS);
                f.bid_depth = bid_depth;
                f.ask_depth = ask_depth;
                if bid_depth + ask_depth > 0.0 {
                    f.imbalance = (bid_depth - ask_depth) / (bid_depth + ask_depth);
                }

                self.push_obi(ObiSnapshot {
                    timestamp: f.timestamp,
                    imbalance: f.imbalance,
                    mid_price: mid,
                });
                f.imbalance_ma = self.imbalance_ma();
            }
        }

        if candles.len() >= HV_PERIOD {
            f.historical_vol = historical_volatility(candles, HV_PERIOD);
        }

        f
    }

    pub fn add_obi_snapshot(&self, snapshot: ObiSnapshot) {
        self.push_obi(snapshot);
    }

    fn push_obi(&self, snapshot: ObiSnapshot) {
        let mut ring = self.obi.write().expect("OBI ring poisoned");
        ring.push(snapshot);
        if ring.len() > MAX_OBI_SNAPSHOTS {
            let excess = ring.len() - MAX_OBI_SNAPSHOTS;
            ring.drain(..excess);
        }
    }

    /// Mean imbalance over the last `IMBALANCE_PERIOD` snapshots, clamped to
    /// however many are available.
    pub fn imbalance_ma(&self) -> f64 {
        let ring = self.obi.read().expect("OBI ring poisoned");
        if ring.is_empty() {
            return 0.0;
        }
        let period = IMBALANCE_PERIOD.min(ring.len());
        let sum: f64 = ring[ring.len() - period..].iter().map(|s| s.imbalance).sum();
        sum / period as f64
    }

    pub fn obi_snapshots(&self) -> Vec<ObiSnapshot> {
        self.obi.read().expect("OBI ring poisoned").clone()
    }

    pub fn imbalance_direction(&self) -> &'static str {
        let avg = self.imbalance_ma();
        if avg > 0.3 {
            "bullish"
        } else if avg < -0.3 {
            "bearish"
        } else {
            "neutral"
        }
    }

    /// Driver precedence: basis, then IV premium, then OBI persistence.
    fn detect_dominant_driver(&self, f: &MarketFeatures) -> (DriverType, f64) {
        if f.basis_annualized.abs() > BASIS_THRESHOLD {
            let strength = (f.basis_annualized.abs() / BASIS_THRESHOLD).min(2.0) - 1.0;
            return (DriverType::HighBasis, strength);
        }

        if f.iv_premium > IV_PREMIUM_THRESHOLD {
            let strength = (f.iv_premium / IV_PREMIUM_THRESHOLD).min(2.0) - 1.0;
            return (DriverType::HighIv, strength);
        }

        if self.is_imbalance_persistent(IMBALANCE_THRESHOLD, PERSISTENCE_REQUIRED) {
            let strength = (f.imbalance_ma.abs() / IMBALANCE_THRESHOLD).min(1.0);
            return (DriverType::OrderImbalance, strength);
        }

        (DriverType::None, 0.0)
    }

    /// True when the last `required` snapshots all exceed the threshold with
    /// the same sign.
    fn is_imbalance_persistent(&self, threshold: f64, required: usize) -> bool {
        let ring = self.obi.read().expect("OBI ring poisoned");
        if ring.len() < required {
            return false;
        }
        let window = &ring[ring.len() - required..];
        let positive = window.iter().filter(|s| s.imbalance > threshold).count();
        let negative = window.iter().filter(|s| s.imbalance < -threshold).count();
        positive >= required || negative >= required
    }
}

fn compute_depth(ob: &Orderbook, levels: usize) -> (f64, f64) {
    let bid: f64 = ob
        .buy
        .iter()
        .take(levels)
        .map(|l| l.size as f64 * l.price_f64())
        .sum();
    let ask: f64 = ob
        .sell
        .iter()
        .take(levels)
        .map(|l| l.size as f64 * l.price_f64())
        .sum();
    (bid, ask)
}

/// Annualized close-to-close volatility over the trailing `period` bars:
/// sample variance of log returns, scaled by sqrt(periods/day) * sqrt(365).
pub fn historical_volatility(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < period + 1 {
        return 0.0;
    }

    let mut returns = vec![0.0; period];
    for (i, r) in returns.iter_mut().enumerate() {
        let idx = candles.len() - period + i;
        if candles[idx - 1].close > 0.0 {
            *r = (candles[idx].close / candles[idx - 1].close).ln();
        }
    }

    let mean = returns.iter().sum::<f64>() / period as f64;
    let variance = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / period as f64;

    let daily_vol = variance.sqrt() * (periods_per_day(candles) as f64).sqrt();
    daily_vol * 365f64.sqrt()
}

fn periods_per_day(candles: &[Candle]) -> i64 {
    if candles.len() < 2 {
        return 288;
    }
    let interval = candles[1].time - candles[0].time;
    if interval <= 0 {
        return 288;
    }
    86_400 / interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::types::OrderbookLevel;

    fn level(price: &str, size: i64) -> OrderbookLevel {
        OrderbookLevel {
            price: price.to_string(),
            size,
            ..Default::default()
        }
    }

    fn book() -> Orderbook {
        Orderbook {
            buy: vec![level("50000", 10), level("49999", 20)],
            sell: vec![level("50010", 5), level("50011", 5)],
            symbol: "BTCUSD".into(),
            ..Default::default()
        }
    }

    fn flat_candles(n: usize, interval: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                time: 1_700_000_000 + i as i64 * interval,
                open: 50_000.0,
                high: 50_000.0,
                low: 50_000.0,
                close: 50_000.0,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn spread_and_imbalance() {
        let engine = Engine::new();
        let f = engine.compute_features(Some(&book()), None, &[]);
        assert!((f.spread - 10.0).abs() < 1e-9);
        let mid = (50_000.0 + 50_010.0) / 2.0;
        assert!((f.spread_bps - 10.0 / mid * 10_000.0).abs() < 1e-9);
        // Bid depth dominates, imbalance positive.
        assert!(f.imbalance > 0.0);
        assert!(f.bid_depth > f.ask_depth);
    }

    #[test]
    fn flat_closes_have_zero_volatility() {
        let candles = flat_candles(30, 300);
        assert_eq!(historical_volatility(&candles, 20), 0.0);
    }

    #[test]
    fn imbalance_ma_clamps_to_available() {
        let engine = Engine::new();
        for _ in 0..3 {
            engine.add_obi_snapshot(ObiSnapshot {
                timestamp: Utc::now(),
                imbalance: 0.9,
                mid_price: 100.0,
            });
        }
        assert!((engine.imbalance_ma() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn obi_ring_is_capped() {
        let engine = Engine::new();
        for i in 0..100 {
            engine.add_obi_snapshot(ObiSnapshot {
                timestamp: Utc::now(),
                imbalance: i as f64 / 100.0,
                mid_price: 100.0,
            });
        }
        assert_eq!(engine.obi_snapshots().len(), MAX_OBI_SNAPSHOTS);
    }

    #[test]
    fn basis_driver_takes_precedence_and_uses_magnitude() {
        let engine = Engine::new();
        let ticker = Ticker {
            symbol: "BTCUSD".into(),
            close: 50_000.0,
            mark_price: 50_000.0,
            // Negative 8h funding, |annualized| = 0.0002 * 3 * 365 = 0.219.
            funding_rate: -0.0002,
            ..Default::default()
        };
        let f = engine.compute_features_with_funding(Some(&book()), Some(&ticker), &[]);
        assert_eq!(f.dominant_driver, DriverType::HighBasis);
        let expected = (0.219f64 / 0.15).min(2.0) - 1.0;
        assert!((f.driver_strength - expected).abs() < 1e-9);
    }

    #[test]
    fn persistent_imbalance_detected_after_five_snapshots() {
        let engine = Engine::new();
        for _ in 0..5 {
            engine.add_obi_snapshot(ObiSnapshot {
                timestamp: Utc::now(),
                imbalance: 0.75,
                mid_price: 100.0,
            });
        }
        let f = MarketFeatures {
            imbalance_ma: 0.75,
            ..Default::default()
        };
        let (driver, strength) = engine.detect_dominant_driver(&f);
        assert_eq!(driver, DriverType::OrderImbalance);
        assert!((strength - (0.75f64 / 0.6).min(1.0)).abs() < 1e-9);
    }

    #[test]
    fn four_snapshots_are_not_persistent() {
        let engine = Engine::new();
        for _ in 0..4 {
            engine.add_obi_snapshot(ObiSnapshot {
                timestamp: Utc::now(),
                imbalance: 0.75,
                mid_price: 100.0,
            });
        }
        let f = MarketFeatures::default();
        let (driver, _) = engine.detect_dominant_driver(&f);
        assert_eq!(driver, DriverType::None);
    }

    #[test]
    fn periods_per_day_follows_candle_interval() {
        assert_eq!(periods_per_day(&flat_candles(3, 300)), 288);
        assert_eq!(periods_per_day(&flat_candles(3, 3600)), 24);
        assert_eq!(periods_per_day(&flat_candles(1, 300)), 288);
    }
}
