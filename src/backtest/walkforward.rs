// Walk-forward analysis: slide (or anchor) train/test windows across the
// history, run a fresh engine per test window, and combine the
// out-of-sample results into one metric set plus a stability score.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use super::metrics::{Metrics, MetricsCalculator};
use super::types::{EquityPoint, Trade};
use super::Engine;

#[derive(Debug, Clone)]
pub struct WalkForwardConfig {
    pub training_period: Duration,
    pub testing_period: Duration,
    /// Anchored mode expands the training window from the start; rolling
    /// mode slides both windows by the testing period.
    pub anchored: bool,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            training_period: Duration::days(180),
            testing_period: Duration::days(30),
            anchored: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    train_start: DateTime<Utc>,
    train_end: DateTime<Utc>,
    test_start: DateTime<Utc>,
    test_end: DateTime<Utc>,
}

pub struct WindowResult {
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
    pub test_metrics: Metrics,
}

pub struct WalkForwardResult {
    pub windows: Vec<WindowResult>,
    /// Combined out-of-sample metrics over every window.
    pub combined: Metrics,
    /// Consistency score in [0, 1].
    pub stability: f64,
    pub summary: String,
}

/// Builds a fresh engine configured for one test range.
pub type EngineFactory = Box<dyn Fn(DateTime<Utc>, DateTime<Utc>) -> Engine>;

pub struct WalkForwardAnalyzer {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    initial_capital: f64,
    wf_config: WalkForwardConfig,
    engine_factory: EngineFactory,
}

impl WalkForwardAnalyzer {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        initial_capital: f64,
        wf_config: WalkForwardConfig,
        engine_factory: EngineFactory,
    ) -> Self {
        Self {
            start,
            end,
            initial_capital,
            wf_config,
            engine_factory,
        }
    }

    pub fn run(&self) -> Result<WalkForwardResult> {
        info!(
            "=== Walk-forward: training {}d, testing {}d, {} ===",
            self.wf_config.training_period.num_days(),
            self.wf_config.testing_period.num_days(),
            if self.wf_config.anchored {
                "anchored (expanding window)"
            } else {
                "rolling (sliding window)"
            }
        );

        let windows = self.generate_windows();
        if windows.is_empty() {
            return Err(anyhow!("insufficient data for walk-forward analysis"));
        }
        info!("Generated {} windows", windows.len());

        let mut results = Vec::with_capacity(windows.len());
        let mut all_trades: Vec<Trade> = Vec::new();
        let mut all_equity: Vec<EquityPoint> = Vec::new();

        for (i, window) in windows.iter().enumerate() {
            info!(
                "Window {}/{}: test {} to {}",
                i + 1,
                windows.len(),
                window.test_start.format("%Y-%m-%d"),
                window.test_end.format("%Y-%m-%d")
            );

            let mut engine = (self.engine_factory)(window.test_start, window.test_end);
            let res = match engine.run() {
                Ok(res) => res,
                Err(err) => {
                    warn!("window {} failed: {err}", i + 1);
                    continue;
                }
            };

            all_trades.extend(res.trades.clone());
            all_equity.extend(res.metrics.equity_curve.clone());

            info!(
                "  return {:+.2}% | sharpe {:.2} | maxDD {:.2}%",
                res.metrics.total_return * 100.0,
                res.metrics.sharpe_ratio,
                res.metrics.max_drawdown * 100.0
            );

            results.push(WindowResult {
                train_start: window.train_start,
                train_end: window.train_end,
                test_start: window.test_start,
                test_end: window.test_end,
                test_metrics: res.metrics,
            });
        }

        let combined = MetricsCalculator::new(self.initial_capital).calculate(&all_trades, &all_equity);
        let stability = calculate_stability(&results);
        let summary = summarize(&results, &combined, stability);

        Ok(WalkForwardResult {
            windows: results,
            combined,
            stability,
            summary,
        })
    }

    fn generate_windows(&self) -> Vec<Window> {
        let mut windows = Vec::new();
        let min_span = self.wf_config.training_period + self.wf_config.testing_period;
        if self.end - self.start < min_span {
            return windows;
        }

        if self.wf_config.anchored {
            let train_start = self.start;
            let mut test_start = self.start + self.wf_config.training_period;

            while test_start < self.end {
                let test_end = (test_start + self.wf_config.testing_period).min(self.end);
                windows.push(Window {
                    train_start,
                    train_end: test_start,
                    test_start,
                    test_end,
                });
                test_start = test_end;
            }
        } else {
            let mut train_start = self.start;
            loop {
                let train_end = train_start + self.wf_config.training_period;
                let test_start = train_end;
                let test_end = test_start + self.wf_config.testing_period;
                if test_end > self.end {
                    break;
                }
                windows.push(Window {
                    train_start,
                    train_end,
                    test_start,
                    test_end,
                });
                train_start = train_start + self.wf_config.testing_period;
            }
        }

        windows
    }
}

/// Average of the profitable-window fraction and 1/(1 + CV(Sharpe)).
fn calculate_stability(windows: &[WindowResult]) -> f64 {
    if windows.len() < 2 {
        return 0.0;
    }

    let profitable = windows
        .iter()
        .filter(|w| w.test_metrics.total_return > 0.0)
        .count();
    let profitability = profitable as f64 / windows.len() as f64;

    let sharpes: Vec<f64> = windows.iter().map(|w| w.test_metrics.sharpe_ratio).collect();
    let mean = sharpes.iter().sum::<f64>() / sharpes.len() as f64;
    let variance =
        sharpes.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / sharpes.len() as f64;
    let std_dev = variance.sqrt();

    let cv = if mean != 0.0 { std_dev / mean.abs() } else { 0.0 };
    let consistency = 1.0 / (1.0 + cv);

    (profitability + consistency) / 2.0
}

fn summarize(windows: &[WindowResult], combined: &Metrics, stability: f64) -> String {
    let profitable = windows
        .iter()
        .filter(|w| w.test_metrics.total_return > 0.0)
        .count();
    let pct = if windows.is_empty() {
        0.0
    } else {
        profitable as f64 / windows.len() as f64 * 100.0
    };

    format!(
        "=== Walk-Forward Summary ===\n\
         Windows: {} total, {profitable} profitable ({pct:.0}%)\n\
         Combined OOS Return: {:+.2}%\n\
         Combined Sharpe: {:.2}\n\
         Max Drawdown: {:.2}%\n\
         Stability Score: {stability:.2}\n",
        windows.len(),
        combined.total_return * 100.0,
        combined.sharpe_ratio,
        combined.max_drawdown * 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn analyzer(months: i64, anchored: bool) -> WalkForwardAnalyzer {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Duration::days(30 * months);
        WalkForwardAnalyzer::new(
            start,
            end,
            1000.0,
            WalkForwardConfig {
                training_period: Duration::days(180),
                testing_period: Duration::days(30),
                anchored,
            },
            Box::new(|_s, _e| Engine::new(crate::backtest::types::BacktestConfig::default())),
        )
    }

    #[test]
    fn rolling_windows_cover_the_out_of_sample_year() {
        let windows = analyzer(12, false).generate_windows();
        // 12 months with 6 months training and 1 month testing: 6 windows.
        assert!(windows.len() >= 6, "got {} windows", windows.len());
        for w in &windows {
            assert_eq!(w.train_end, w.test_start);
            assert_eq!((w.train_end - w.train_start).num_days(), 180);
            assert_eq!((w.test_end - w.test_start).num_days(), 30);
        }
        // Consecutive windows slide by the testing period.
        let step = windows[1].test_start - windows[0].test_start;
        assert_eq!(step.num_days(), 30);
    }

    #[test]
    fn anchored_windows_expand_training() {
        let windows = analyzer(12, true).generate_windows();
        assert!(windows.len() >= 6);
        let first_start = windows[0].train_start;
        for w in &windows {
            assert_eq!(w.train_start, first_start);
        }
        assert!(windows[1].train_end > windows[0].train_end);
    }

    #[test]
    fn too_short_history_has_no_windows() {
        assert!(analyzer(3, false).generate_windows().is_empty());
    }

    #[test]
    fn stability_is_bounded() {
        let mk = |ret: f64, sharpe: f64| WindowResult {
            train_start: Utc::now(),
            train_end: Utc::now(),
            test_start: Utc::now(),
            test_end: Utc::now(),
            test_metrics: Metrics {
                total_return: ret,
                sharpe_ratio: sharpe,
                ..Default::default()
            },
        };

        let windows = vec![mk(0.05, 1.0), mk(0.03, 1.1), mk(-0.01, 0.9)];
        let s = calculate_stability(&windows);
        assert!((0.0..=1.0).contains(&s), "stability {s}");

        // Perfectly consistent profitable windows score 1.0.
        let windows = vec![mk(0.05, 1.0), mk(0.05, 1.0)];
        assert!((calculate_stability(&windows) - 1.0).abs() < 1e-9);
    }
}
