// Performance metrics over trades and the equity curve. Annualization uses
// sqrt(365) throughout; crypto trades every day.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::types::{EquityPoint, Trade};

#[derive(Debug, Clone)]
pub struct Metrics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Duration,

    pub initial_capital: f64,
    pub final_equity: f64,

    pub total_return: f64,
    pub annualized_return: f64,

    pub max_drawdown: f64,
    pub max_drawdown_duration: Duration,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,

    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_holding_time: Duration,
    pub trades_per_day: f64,

    pub total_fees: f64,
    pub total_slippage: f64,
    pub total_funding: f64,
    pub total_costs: f64,
    pub cost_pct: f64,

    pub equity_curve: Vec<EquityPoint>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            duration: Duration::zero(),
            initial_capital: 0.0,
            final_equity: 0.0,
            total_return: 0.0,
            annualized_return: 0.0,
            max_drawdown: 0.0,
            max_drawdown_duration: Duration::zero(),
            volatility: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            calmar_ratio: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            profit_factor: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            avg_holding_time: Duration::zero(),
            trades_per_day: 0.0,
            total_fees: 0.0,
            total_slippage: 0.0,
            total_funding: 0.0,
            total_costs: 0.0,
            cost_pct: 0.0,
            equity_curve: Vec::new(),
        }
    }
}

pub struct MetricsCalculator {
    initial_capital: f64,
}

impl MetricsCalculator {
    pub fn new(initial_capital: f64) -> Self {
        Self { initial_capital }
    }

    pub fn calculate(&self, trades: &[Trade], equity_curve: &[EquityPoint]) -> Metrics {
        let daily_returns = daily_returns(equity_curve);

        let mut m = Metrics {
            initial_capital: self.initial_capital,
            equity_curve: equity_curve.to_vec(),
            duration: Duration::zero(),
            max_drawdown_duration: Duration::zero(),
            avg_holding_time: Duration::zero(),
            ..Default::default()
        };

        if let (Some(first), Some(last)) = (equity_curve.first(), equity_curve.last()) {
            m.start_time = Some(first.timestamp);
            m.end_time = Some(last.timestamp);
            m.duration = last.timestamp - first.timestamp;
            m.final_equity = last.equity;

            if first.equity > 0.0 {
                m.total_return = (last.equity - first.equity) / first.equity;
            }
        }

        m.annualized_return = annualized_return(m.total_return, m.duration);
        let (max_dd, max_dd_dur) = max_drawdown(equity_curve);
        m.max_drawdown = max_dd;
        m.max_drawdown_duration = max_dd_dur;
        m.volatility = annualized_volatility(&daily_returns);
        m.sharpe_ratio = sharpe(&daily_returns);
        m.sortino_ratio = sortino(&daily_returns);
        m.calmar_ratio = if m.max_drawdown > 0.0 {
            m.annualized_return / m.max_drawdown
        } else {
            0.0
        };

        self.trading_stats(trades, &mut m);
        self.costs(trades, &mut m);

        m
    }

    fn trading_stats(&self, trades: &[Trade], m: &mut Metrics) {
        if trades.is_empty() {
            return;
        }

        m.total_trades = trades.len();

        let mut gross_profit = 0.0;
        let mut gross_loss = 0.0;
        let mut holding_sum = Duration::zero();

        for t in trades {
            holding_sum = holding_sum + (t.exit_time - t.entry_time);

            if t.net_pnl > 0.0 {
                m.winning_trades += 1;
                gross_profit += t.net_pnl;
                if t.net_pnl > m.largest_win {
                    m.largest_win = t.net_pnl;
                }
            } else {
                m.losing_trades += 1;
                gross_loss += t.net_pnl.abs();
                if t.net_pnl < m.largest_loss {
                    m.largest_loss = t.net_pnl;
                }
            }
        }

        m.win_rate = m.winning_trades as f64 / m.total_trades as f64;
        m.avg_holding_time = holding_sum / m.total_trades as i32;

        if m.winning_trades > 0 {
            m.avg_win = gross_profit / m.winning_trades as f64;
        }
        if m.losing_trades > 0 {
            m.avg_loss = gross_loss / m.losing_trades as f64;
        }
        if gross_loss > 0.0 {
            m.profit_factor = gross_profit / gross_loss;
        }

        let hours = m.duration.num_seconds() as f64 / 3600.0;
        if hours > 24.0 {
            m.trades_per_day = m.total_trades as f64 / (hours / 24.0);
        }
    }

    fn costs(&self, trades: &[Trade], m: &mut Metrics) {
        for t in trades {
            m.total_fees += t.entry_fee + t.exit_fee;
            // Dollar slippage costs, not price deltas.
            m.total_slippage += t.entry_slip_cost + t.exit_slip_cost;
            m.total_funding += t.funding_paid;
        }
        m.total_costs = m.total_fees + m.total_slippage + m.total_funding;

        let gross_profit: f64 = trades.iter().filter(|t| t.gross_pnl > 0.0).map(|t| t.gross_pnl).sum();
        if gross_profit > 0.0 {
            m.cost_pct = m.total_costs / gross_profit;
        }
    }
}

fn annualized_return(total_return: f64, duration: Duration) -> f64 {
    let years = duration.num_seconds() as f64 / (365.0 * 24.0 * 3600.0);
    if years <= 0.0 {
        return 0.0;
    }
    (1.0 + total_return).powf(1.0 / years) - 1.0
}

fn max_drawdown(equity_curve: &[EquityPoint]) -> (f64, Duration) {
    let Some(first) = equity_curve.first() else {
        return (0.0, Duration::zero());
    };

    let mut max_dd = 0.0;
    let mut max_dd_dur = Duration::zero();
    let mut peak = first.equity;
    let mut peak_time = first.timestamp;

    for point in equity_curve {
        if point.equity > peak {
            peak = point.equity;
            peak_time = point.timestamp;
        }
        if peak > 0.0 {
            let dd = (peak - point.equity) / peak;
            if dd > max_dd {
                max_dd = dd;
                max_dd_dur = point.timestamp - peak_time;
            }
        }
    }

    (max_dd, max_dd_dur)
}

/// End-of-day equity per UTC day, then day-over-day returns.
fn daily_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
    if equity_curve.len() < 2 {
        return Vec::new();
    }

    let mut by_day: BTreeMap<String, f64> = BTreeMap::new();
    for point in equity_curve {
        by_day.insert(point.timestamp.format("%Y-%m-%d").to_string(), point.equity);
    }

    let values: Vec<f64> = by_day.into_values().collect();
    values
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn annualized_volatility(daily: &[f64]) -> f64 {
    if daily.len() < 2 {
        return 0.0;
    }
    let mu = mean(daily);
    let variance = daily.iter().map(|r| (r - mu) * (r - mu)).sum::<f64>() / daily.len() as f64;
    variance.sqrt() * 365f64.sqrt()
}

fn sharpe(daily: &[f64]) -> f64 {
    if daily.len() < 2 {
        return 0.0;
    }
    let mu = mean(daily);
    let variance = daily.iter().map(|r| (r - mu) * (r - mu)).sum::<f64>() / daily.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    // Risk-free rate is zero for crypto.
    (mu / std_dev) * 365f64.sqrt()
}

fn sortino(daily: &[f64]) -> f64 {
    if daily.len() < 2 {
        return 0.0;
    }
    let mu = mean(daily);

    let downside: Vec<f64> = daily.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return 0.0;
    }
    let downside_dev =
        (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt();
    if downside_dev == 0.0 {
        return 0.0;
    }
    (mu / downside_dev) * 365f64.sqrt()
}

impl Metrics {
    /// Human-readable summary.
    pub fn format_report(&self) -> String {
        let range = match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => format!("{} to {}", s.format("%Y-%m-%d"), e.format("%Y-%m-%d")),
            _ => "n/a".to_string(),
        };

        format!(
            "===== BACKTEST RESULTS =====\n\
             Period: {range}\n\
             Initial Capital: ${:.2}\n\
             Final Equity: ${:.2}\n\
             \n\
             PERFORMANCE\n\
             \x20 Total Return: {:+.2}%\n\
             \x20 Annualized Return: {:+.2}%\n\
             \x20 Max Drawdown: {:.2}%\n\
             \x20 Sharpe Ratio: {:.2}\n\
             \x20 Sortino Ratio: {:.2}\n\
             \x20 Calmar Ratio: {:.2}\n\
             \n\
             TRADING STATS\n\
             \x20 Total Trades: {}\n\
             \x20 Win Rate: {:.2}%\n\
             \x20 Profit Factor: {:.2}\n\
             \x20 Avg Win: ${:.2}\n\
             \x20 Avg Loss: ${:.2}\n\
             \x20 Trades/Day: {:.2}\n\
             \n\
             COSTS BREAKDOWN\n\
             \x20 Total Fees: ${:.2}\n\
             \x20 Total Slippage: ${:.2}\n\
             \x20 Total Funding: ${:.2}\n\
             \x20 Total Costs: ${:.2}\n",
            self.initial_capital,
            self.final_equity,
            self.total_return * 100.0,
            self.annualized_return * 100.0,
            self.max_drawdown * 100.0,
            self.sharpe_ratio,
            self.sortino_ratio,
            self.calmar_ratio,
            self.total_trades,
            self.win_rate * 100.0,
            self.profit_factor,
            self.avg_win,
            self.avg_loss,
            self.trades_per_day,
            self.total_fees,
            self.total_slippage,
            self.total_funding,
            self.total_costs,
        )
    }
}
