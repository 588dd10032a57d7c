// Configuration loading from environment variables.
// Every knob has a default; only API credentials are mandatory for live trading.

use anyhow::{anyhow, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Venue API
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub ws_url: String,
    pub is_testnet: bool,
    pub rate_limit_rps: u32,

    // Trading
    pub symbol: String,
    pub symbols: Vec<String>,
    pub leverage: u32,
    pub max_position_pct: f64,
    pub multi_asset_mode: bool,

    // Strategy selection
    pub scalper_enabled: bool,
    pub basis_trade_enabled: bool,

    // Scalper knobs
    pub scalp_imbalance_threshold: f64,
    pub scalp_persistence_count: usize,
    pub scalp_target_bps: f64,
    pub scalp_max_loss_bps: f64,

    // Basis / funding-carry knobs
    pub basis_entry_threshold: f64,
    pub basis_exit_threshold: f64,
    pub basis_max_leverage: u32,

    // Risk knobs
    pub max_drawdown_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub risk_per_trade_pct: f64,
    pub daily_loss_limit_pct: f64,

    // Intervals
    pub candle_interval: String,
    pub regime_check_period: Duration,

    // Regime oracle
    pub oracle_endpoint: String,
}

impl Config {
    /// Builds the configuration from environment variables, falling back to
    /// defaults for everything except credentials (validated separately).
    pub fn from_env() -> Self {
        let is_testnet = env_bool("VENUE_TESTNET", true);
        let (base_url, ws_url) = if is_testnet {
            (
                "https://cdn-ind.testnet.deltaex.org/v2".to_string(),
                "wss://socket-ind.testnet.deltaex.org".to_string(),
            )
        } else {
            (
                "https://api.india.delta.exchange/v2".to_string(),
                "wss://socket.india.delta.exchange".to_string(),
            )
        };

        Self {
            api_key: env_str("VENUE_API_KEY", ""),
            api_secret: env_str("VENUE_API_SECRET", ""),
            base_url: env_str("VENUE_BASE_URL", &base_url),
            ws_url: env_str("VENUE_WS_URL", &ws_url),
            is_testnet,
            rate_limit_rps: env_u32("VENUE_RATE_LIMIT_RPS", 8),

            symbol: env_str("VENUE_SYMBOL", "BTCUSD"),
            symbols: parse_symbols(&env_str("VENUE_SYMBOLS", "BTCUSD,ETHUSD,SOLUSD")),
            leverage: env_u32("VENUE_LEVERAGE", 10),
            max_position_pct: env_f64("VENUE_MAX_POSITION_PCT", 10.0),
            multi_asset_mode: env_bool("MULTI_ASSET_MODE", true),

            scalper_enabled: env_bool("SCALPER_ENABLED", true),
            // Requires a spot hedge to be profitable, so off by default.
            basis_trade_enabled: env_bool("BASIS_TRADE_ENABLED", false),

            scalp_imbalance_threshold: env_f64("SCALP_IMBALANCE_THRESHOLD", 0.5),
            scalp_persistence_count: env_u32("SCALP_PERSISTENCE_COUNT", 5) as usize,
            scalp_target_bps: env_f64("SCALP_TARGET_BPS", 20.0),
            scalp_max_loss_bps: env_f64("SCALP_MAX_LOSS_BPS", 15.0),

            basis_entry_threshold: env_f64("BASIS_ENTRY_THRESHOLD", 0.15),
            basis_exit_threshold: env_f64("BASIS_EXIT_THRESHOLD", 0.05),
            basis_max_leverage: env_u32("BASIS_MAX_LEVERAGE", 3),

            max_drawdown_pct: env_f64("MAX_DRAWDOWN_PCT", 10.0),
            stop_loss_pct: env_f64("STOP_LOSS_PCT", 2.0),
            take_profit_pct: env_f64("TAKE_PROFIT_PCT", 4.0),
            risk_per_trade_pct: env_f64("RISK_PER_TRADE_PCT", 1.0),
            daily_loss_limit_pct: env_f64("DAILY_LOSS_LIMIT_PCT", -5.0),

            candle_interval: env_str("CANDLE_INTERVAL", "5m"),
            regime_check_period: Duration::from_secs(env_u32("REGIME_CHECK_SECONDS", 300) as u64),

            oracle_endpoint: env_str("REGIME_ORACLE_URL", ""),
        }
    }

    /// Validates settings that would make live trading impossible or unsafe.
    /// Fatal at startup only; the backtest binary does not call this.
    pub fn validate_live(&self) -> Result<()> {
        if self.api_key.trim().is_empty() || self.api_secret.trim().is_empty() {
            return Err(anyhow!(
                "VENUE_API_KEY and VENUE_API_SECRET environment variables are required"
            ));
        }
        if self.leverage == 0 {
            return Err(anyhow!("VENUE_LEVERAGE must be greater than 0"));
        }
        if self.symbols.is_empty() {
            return Err(anyhow!("VENUE_SYMBOLS must name at least one symbol"));
        }
        if self.rate_limit_rps == 0 {
            return Err(anyhow!("VENUE_RATE_LIMIT_RPS must be greater than 0"));
        }
        if self.stop_loss_pct <= 0.0 {
            return Err(anyhow!("STOP_LOSS_PCT must be positive"));
        }
        if self.max_position_pct <= 0.0 || self.max_position_pct > 100.0 {
            return Err(anyhow!("VENUE_MAX_POSITION_PCT must be in (0, 100]"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults only; does not read the environment.
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: "https://cdn-ind.testnet.deltaex.org/v2".to_string(),
            ws_url: "wss://socket-ind.testnet.deltaex.org".to_string(),
            is_testnet: true,
            rate_limit_rps: 8,
            symbol: "BTCUSD".to_string(),
            symbols: vec!["BTCUSD".into(), "ETHUSD".into(), "SOLUSD".into()],
            leverage: 10,
            max_position_pct: 10.0,
            multi_asset_mode: true,
            scalper_enabled: true,
            basis_trade_enabled: false,
            scalp_imbalance_threshold: 0.5,
            scalp_persistence_count: 5,
            scalp_target_bps: 20.0,
            scalp_max_loss_bps: 15.0,
            basis_entry_threshold: 0.15,
            basis_exit_threshold: 0.05,
            basis_max_leverage: 3,
            max_drawdown_pct: 10.0,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
            risk_per_trade_pct: 1.0,
            daily_loss_limit_pct: -5.0,
            candle_interval: "5m".to_string(),
            regime_check_period: Duration::from_secs(300),
            oracle_endpoint: String::new(),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_symbols(s: &str) -> Vec<String> {
    s.split(',')
        .map(|sym| sym.trim().to_string())
        .filter(|sym| !sym.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_symbols_trims_and_drops_empties() {
        let symbols = parse_symbols(" BTCUSD, ETHUSD ,,SOLUSD ");
        assert_eq!(symbols, vec!["BTCUSD", "ETHUSD", "SOLUSD"]);
    }

    #[test]
    fn validate_live_requires_credentials() {
        let cfg = Config::default();
        assert!(cfg.validate_live().is_err());

        let mut cfg = Config::default();
        cfg.api_key = "k".into();
        cfg.api_secret = "s".into();
        assert!(cfg.validate_live().is_ok());
    }
}
