// Risk management: balance tracking, daily-loss and drawdown circuit
// breakers, regime-aware position sizing, and stop/take-profit derivation.
//
// The latch-and-clock pairs mutate under one lock; `can_trade` clears
// expired latches itself so callers see a consistent answer. All clocked
// entry points have `_at` variants taking an explicit `now`.

use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use log::info;
use serde_json::{json, Value};

use crate::config::Config;
use crate::venue::conversions::parse_contract_value;
use crate::venue::types::{Product, Regime};

#[derive(Debug, Default)]
struct RiskState {
    peak_balance: f64,
    current_balance: f64,
    current_drawdown: f64,
    last_trade_time: Option<DateTime<Utc>>,

    daily_start_balance: f64,
    daily_pnl: f64,
    current_day: Option<DateTime<Utc>>,

    is_circuit_broken: bool,
    circuit_broken_at: Option<DateTime<Utc>>,
    is_daily_limit_hit: bool,
    daily_limit_reset_time: Option<DateTime<Utc>>,
}

pub struct RiskManager {
    max_drawdown_pct: f64,
    stop_loss_pct: f64,
    risk_per_trade_pct: f64,
    daily_loss_limit_pct: f64,
    leverage: u32,
    max_position_pct: f64,
    state: Mutex<RiskState>,
}

impl RiskManager {
    pub fn new(cfg: &Config) -> Self {
        Self {
            max_drawdown_pct: cfg.max_drawdown_pct,
            stop_loss_pct: cfg.stop_loss_pct,
            risk_per_trade_pct: cfg.risk_per_trade_pct,
            daily_loss_limit_pct: cfg.daily_loss_limit_pct,
            leverage: cfg.leverage,
            max_position_pct: cfg.max_position_pct,
            state: Mutex::new(RiskState::default()),
        }
    }

    pub fn update_balance(&self, balance: f64) {
        self.update_balance_at(balance, Utc::now());
    }

    pub fn update_balance_at(&self, balance: f64, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("risk state poisoned");
        let today = start_of_day(now);

        match state.current_day {
            Some(day) if today > day => {
                state.current_day = Some(today);
                state.daily_start_balance = balance;
                state.daily_pnl = 0.0;
                state.is_daily_limit_hit = false;
                info!("New trading day started. Daily balance reset to {balance:.2}");
            }
            None => {
                state.current_day = Some(today);
            }
            _ => {}
        }

        if state.daily_start_balance == 0.0 {
            state.daily_start_balance = balance;
        }

        state.current_balance = balance;

        if state.daily_start_balance > 0.0 {
            state.daily_pnl =
                (balance - state.daily_start_balance) / state.daily_start_balance * 100.0;
        }

        if state.daily_pnl <= self.daily_loss_limit_pct && !state.is_daily_limit_hit {
            state.is_daily_limit_hit = true;
            state.daily_limit_reset_time = Some(today + Duration::hours(24));
            info!(
                "DAILY LOSS LIMIT HIT: daily P&L {:.2}% exceeds limit {:.2}%, trading paused until next UTC midnight",
                state.daily_pnl, self.daily_loss_limit_pct
            );
        }

        if balance > state.peak_balance {
            state.peak_balance = balance;
        }
        if state.peak_balance > 0.0 {
            state.current_drawdown =
                (state.peak_balance - balance) / state.peak_balance * 100.0;
        }

        if state.current_drawdown >= self.max_drawdown_pct && !state.is_circuit_broken {
            state.is_circuit_broken = true;
            state.circuit_broken_at = Some(now);
            info!(
                "CIRCUIT BREAKER TRIGGERED: drawdown {:.2}% exceeds max {:.2}%",
                state.current_drawdown, self.max_drawdown_pct
            );
        }
    }

    pub fn can_trade(&self) -> (bool, String) {
        self.can_trade_at(Utc::now())
    }

    /// Clears expired latches and reports whether trading is allowed.
    pub fn can_trade_at(&self, now: DateTime<Utc>) -> (bool, String) {
        let mut state = self.state.lock().expect("risk state poisoned");

        if state.is_daily_limit_hit {
            match state.daily_limit_reset_time {
                Some(reset) if now >= reset => {
                    state.is_daily_limit_hit = false;
                    state.daily_limit_reset_time = None;
                }
                Some(reset) => {
                    let hours = (reset - now).num_seconds() as f64 / 3600.0;
                    return (
                        false,
                        format!(
                            "daily loss limit hit ({:.2}%), resets in {hours:.1} hours",
                            state.daily_pnl
                        ),
                    );
                }
                None => {
                    state.is_daily_limit_hit = false;
                }
            }
        }

        if state.is_circuit_broken {
            let expired = state
                .circuit_broken_at
                .map(|at| now - at > Duration::hours(24))
                .unwrap_or(true);
            if expired {
                // Auto-reset: the peak restarts from the surviving balance.
                state.is_circuit_broken = false;
                state.circuit_broken_at = None;
                state.peak_balance = state.current_balance;
                state.current_drawdown = 0.0;
            } else {
                let at = state.circuit_broken_at.unwrap_or(now);
                let remaining = 24.0 - (now - at).num_seconds() as f64 / 3600.0;
                return (
                    false,
                    format!("circuit breaker active ({remaining:.1} hours remaining)"),
                );
            }
        }

        (true, String::new())
    }

    /// Converts a risk budget into an integer contract count.
    ///
    /// contracts = floor(risk * leverage / max(|entry - stop|, entry * base_stop)),
    /// risk scaled by the regime multiplier and capped by the max position
    /// value. A zero result means abstain; a capped result still trades at
    /// least one contract.
    pub fn calculate_position_size(
        &self,
        balance: f64,
        entry_price: f64,
        stop_loss_price: f64,
        regime: Regime,
        product: &Product,
    ) -> i64 {
        if balance <= 0.0 || entry_price <= 0.0 {
            return 0;
        }

        let risk_amount =
            balance * (self.risk_per_trade_pct / 100.0) * regime_size_multiplier(regime);

        let stop_distance = (entry_price - stop_loss_price).abs();
        let floor_distance = entry_price * (self.stop_loss_pct / 100.0);
        let risk_per_contract = stop_distance.max(floor_distance);
        if risk_per_contract <= 0.0 {
            return 0;
        }

        let contracts = (risk_amount * self.leverage as f64 / risk_per_contract).floor() as i64;
        if contracts <= 0 {
            return 0;
        }

        let contract_value = parse_contract_value(product).unwrap_or(1.0);
        let max_value = balance * (self.max_position_pct / 100.0) * self.leverage as f64;
        let max_size = (max_value / (entry_price * contract_value)).floor() as i64;

        contracts.min(max_size).max(1)
    }

    /// Stop price from the regime-scaled base percentage, widened by ATR
    /// when one is supplied (2x ATR floor).
    pub fn calculate_stop_loss(
        &self,
        entry_price: f64,
        side: &str,
        atr: f64,
        regime: Regime,
    ) -> f64 {
        let mut stop_pct = self.stop_loss_pct / 100.0;
        match regime {
            Regime::HighVol => stop_pct *= 1.5,
            Regime::LowVol => stop_pct *= 0.8,
            _ => {}
        }

        if atr > 0.0 {
            let atr_stop = (2.0 * atr) / entry_price;
            if atr_stop > stop_pct {
                stop_pct = atr_stop;
            }
        }

        if side == "buy" {
            entry_price * (1.0 - stop_pct)
        } else {
            entry_price * (1.0 + stop_pct)
        }
    }

    /// Take-profit from the regime-specific reward:risk ratio.
    pub fn calculate_take_profit(
        &self,
        entry_price: f64,
        stop_loss_price: f64,
        side: &str,
        regime: Regime,
    ) -> f64 {
        let reward_ratio = match regime {
            Regime::Bull => {
                if side == "buy" {
                    3.0
                } else {
                    1.5
                }
            }
            Regime::Bear => {
                if side == "sell" {
                    3.0
                } else {
                    1.5
                }
            }
            Regime::Ranging => 1.5,
            Regime::HighVol => 1.0,
            _ => 2.0,
        };

        let reward_distance = (entry_price - stop_loss_price).abs() * reward_ratio;
        if side == "buy" {
            entry_price + reward_distance
        } else {
            entry_price - reward_distance
        }
    }

    pub fn record_trade(&self) {
        let mut state = self.state.lock().expect("risk state poisoned");
        state.last_trade_time = Some(Utc::now());
    }

    /// Manual breaker reset; the peak restarts from the current balance.
    pub fn reset_circuit_breaker(&self) {
        let mut state = self.state.lock().expect("risk state poisoned");
        state.is_circuit_broken = false;
        state.circuit_broken_at = None;
        state.peak_balance = state.current_balance;
        info!("Circuit breaker manually reset");
    }

    pub fn risk_metrics(&self) -> Value {
        let state = self.state.lock().expect("risk state poisoned");
        json!({
            "current_balance": state.current_balance,
            "peak_balance": state.peak_balance,
            "current_drawdown": state.current_drawdown,
            "max_drawdown": self.max_drawdown_pct,
            "daily_pnl": state.daily_pnl,
            "circuit_broken": state.is_circuit_broken,
            "daily_limit_hit": state.is_daily_limit_hit,
            "last_trade_time": state.last_trade_time.map(|t| t.to_rfc3339()),
        })
    }

    #[cfg(test)]
    fn peak_balance(&self) -> f64 {
        self.state.lock().unwrap().peak_balance
    }
}

/// Position-size multiplier per regime.
pub fn regime_size_multiplier(regime: Regime) -> f64 {
    match regime {
        Regime::Bull => 1.2,
        Regime::Bear => 0.8,
        Regime::Ranging => 1.0,
        Regime::HighVol => 0.5,
        Regime::LowVol => 1.0,
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}
