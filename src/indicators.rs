// Technical indicator kit: EMA, SMA, RSI, ATR, Bollinger Bands.
// Full-series variants return a vector aligned with the input (zeroed before
// the warm-up index); *_last variants compute only the final value without
// allocating the series.

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    if period == 0 || n < period {
        return vec![0.0; n];
    }

    let mut out = vec![0.0; n];
    let multiplier = 2.0 / (period as f64 + 1.0);

    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;

    for i in period..n {
        out[i] = (closes[i] - out[i - 1]) * multiplier + out[i - 1];
    }
    out
}

pub fn ema_last(closes: &[f64], period: usize) -> f64 {
    let n = closes.len();
    if period == 0 || n < period {
        return 0.0;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut value: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    for close in &closes[period..] {
        value = (close - value) * multiplier + value;
    }
    value
}

/// Simple moving average.
pub fn sma(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    if period == 0 || n < period {
        return vec![0.0; n];
    }
    let mut out = vec![0.0; n];
    for i in (period - 1)..n {
        out[i] = closes[i + 1 - period..=i].iter().sum::<f64>() / period as f64;
    }
    out
}

/// Relative Strength Index with Wilder smoothing.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    if period == 0 || n < period + 1 {
        return vec![0.0; n];
    }

    let mut out = vec![0.0; n];
    let mut gains = vec![0.0; n];
    let mut losses = vec![0.0; n];

    for i in 1..n {
        let diff = closes[i] - closes[i - 1];
        if diff > 0.0 {
            gains[i] = diff;
        } else {
            losses[i] = -diff;
        }
    }

    let mut avg_gain: f64 = gains[1..=period].iter().sum::<f64>() / period as f64;
    let mut avg_loss: f64 = losses[1..=period].iter().sum::<f64>() / period as f64;

    for i in period..n {
        if i > period {
            avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
            avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
        }
        out[i] = if avg_loss == 0.0 {
            100.0
        } else {
            100.0 - (100.0 / (1.0 + avg_gain / avg_loss))
        };
    }
    out
}

pub fn rsi_last(closes: &[f64], period: usize) -> f64 {
    let n = closes.len();
    if period == 0 || n < period + 1 {
        return 50.0;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let diff = closes[i] - closes[i - 1];
        if diff > 0.0 {
            avg_gain += diff;
        } else {
            avg_loss -= diff;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for i in (period + 1)..n {
        let diff = closes[i] - closes[i - 1];
        let (g, l) = if diff > 0.0 { (diff, 0.0) } else { (0.0, -diff) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + g) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + l) / period as f64;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - (100.0 / (1.0 + avg_gain / avg_loss))
}

/// Average True Range with Wilder smoothing.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    if n < 2 || period == 0 {
        return vec![0.0; n];
    }

    let mut out = vec![0.0; n];
    let tr = true_ranges(highs, lows, closes);

    if n >= period {
        let mut value: f64 = tr[..period].iter().sum::<f64>() / period as f64;
        out[period - 1] = value;
        for i in period..n {
            value = (value * (period as f64 - 1.0) + tr[i]) / period as f64;
            out[i] = value;
        }
    }
    out
}

pub fn atr_last(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let n = closes.len();
    if n < 2 || period == 0 || n < period {
        return 0.0;
    }
    let tr = true_ranges(highs, lows, closes);
    let mut value: f64 = tr[..period].iter().sum::<f64>() / period as f64;
    for item in &tr[period..] {
        value = (value * (period as f64 - 1.0) + item) / period as f64;
    }
    value
}

fn true_ranges(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    let n = closes.len();
    let mut tr = vec![0.0; n];
    tr[0] = highs[0] - lows[0];
    for i in 1..n {
        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        tr[i] = hl.max(hc).max(lc);
    }
    tr
}

/// Bollinger Bands over a population standard deviation.
/// Returns (upper, middle, lower).
pub fn bollinger_bands(
    closes: &[f64],
    period: usize,
    std_dev: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = closes.len();
    let mut upper = vec![0.0; n];
    let mut middle = vec![0.0; n];
    let mut lower = vec![0.0; n];

    if period == 0 || n < period {
        return (upper, middle, lower);
    }

    for i in (period - 1)..n {
        let window = &closes[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / period as f64;
        let std = variance.sqrt();
        middle[i] = mean;
        upper[i] = mean + std * std_dev;
        lower[i] = mean - std * std_dev;
    }

    (upper, middle, lower)
}

pub fn average(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

pub fn min_of(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().copied().fold(f64::INFINITY, f64::min)
}

pub fn max_of(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn ema_seeds_with_sma() {
        let closes = ramp(10);
        let out = ema(&closes, 5);
        // Seed at index 4 is the SMA of the first five values.
        assert!((out[4] - 102.0).abs() < 1e-9);
        assert_eq!(out[0], 0.0);
        // A monotone ramp keeps EMA strictly below the last close.
        assert!(out[9] < closes[9]);
        assert!(out[9] > out[4]);
    }

    #[test]
    fn ema_last_matches_series() {
        let closes = ramp(30);
        let series = ema(&closes, 10);
        let last = ema_last(&closes, 10);
        assert!((series[29] - last).abs() < 1e-9);
    }

    #[test]
    fn sma_window_average() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let out = sma(&closes, 3);
        assert!((out[2] - 2.0).abs() < 1e-9);
        assert!((out[4] - 4.0).abs() < 1e-9);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn rsi_extremes() {
        // Strictly rising closes: no losses, RSI pegs at 100.
        let rising = ramp(20);
        assert!((rsi_last(&rising, 14) - 100.0).abs() < 1e-9);

        // Strictly falling closes: RSI approaches 0.
        let falling: Vec<f64> = (0..20).map(|i| 200.0 - i as f64).collect();
        assert!(rsi_last(&falling, 14) < 1.0);

        // Too few candles: neutral default.
        assert_eq!(rsi_last(&rising[..5], 14), 50.0);
    }

    #[test]
    fn rsi_last_matches_series() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let series = rsi(&closes, 14);
        let last = rsi_last(&closes, 14);
        assert!((series[39] - last).abs() < 1e-9);
    }

    #[test]
    fn atr_uses_true_range_against_prior_close() {
        let highs = vec![11.0, 15.0, 12.0];
        let lows = vec![9.0, 13.0, 10.0];
        let closes = vec![10.0, 14.0, 11.0];
        let out = atr(&highs, &lows, &closes, 2);
        // TR: [2, 5 (gap up), 4 (gap down)]; ATR(2) seed = 3.5, then Wilder.
        assert!((out[1] - 3.5).abs() < 1e-9);
        assert!((out[2] - (3.5 + 4.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn bollinger_bands_bracket_the_mean() {
        let closes: Vec<f64> = (0..25)
            .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let (upper, middle, lower) = bollinger_bands(&closes, 20, 2.0);
        let i = 24;
        assert!(upper[i] > middle[i]);
        assert!(lower[i] < middle[i]);
        assert!((upper[i] - middle[i] - 2.0).abs() < 0.2);
    }
}
