// Backtest runner: replays cached (or freshly fetched) candles through the
// strategy family, optionally as a walk-forward analysis, and dumps the
// trade log as JSON.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use log::info;

use perpbot::backtest::data::DataLoader;
use perpbot::backtest::funding::FundingFetcher;
use perpbot::backtest::types::BacktestConfig;
use perpbot::backtest::walkforward::{WalkForwardAnalyzer, WalkForwardConfig};
use perpbot::backtest::Engine;
use perpbot::config::Config;
use perpbot::strategy::funding_arbitrage::{FundingArbitrageConfig, FundingArbitrageStrategy};
use perpbot::strategy::grid::{GridConfig, GridTradingStrategy};
use perpbot::strategy::scalper::{FeeAwareScalper, ScalperConfig};
use perpbot::strategy::Manager;
use perpbot::venue::client::Client;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let walk_forward = args.iter().any(|a| a == "--walk-forward");
    let days: i64 = args
        .iter()
        .position(|a| a == "--days")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(90);

    let app_cfg = Config::from_env();
    let mut bt_cfg = BacktestConfig::default();
    bt_cfg.symbols = app_cfg.symbols.clone();
    bt_cfg.resolution = app_cfg.candle_interval.clone();
    bt_cfg.leverage = app_cfg.leverage;
    bt_cfg.end_time = Utc::now();
    bt_cfg.start_time = bt_cfg.end_time - Duration::days(days);

    // Credentials are optional for public candle endpoints; the loader
    // prefers its cache either way.
    let client = Arc::new(Client::new(&app_cfg));
    let loader = DataLoader::new(Some(client), &bt_cfg.data_cache_dir);
    let funding = FundingFetcher::new(&bt_cfg.data_cache_dir);

    let mut candle_data = Vec::new();
    for symbol in &bt_cfg.symbols {
        let candles = loader
            .load_candles(symbol, &bt_cfg.resolution, bt_cfg.start_time, bt_cfg.end_time)
            .await?;
        info!("{symbol}: {} candles", candles.len());
        let rates = funding.fetch_funding_rates(symbol, bt_cfg.start_time, bt_cfg.end_time);
        candle_data.push((symbol.clone(), candles, rates));
    }

    if walk_forward {
        run_walk_forward(&app_cfg, bt_cfg, candle_data)?;
        return Ok(());
    }

    let mut engine = Engine::new(bt_cfg);
    install_strategies(&mut engine, &app_cfg);
    for (symbol, candles, rates) in candle_data {
        engine.set_candles(&symbol, candles);
        engine.set_funding_rates(&symbol, rates);
    }

    let result = engine.run()?;
    println!("{}", result.metrics.format_report());

    let trade_log = serde_json::to_string_pretty(&result.trades)?;
    std::fs::write("backtest_trades.json", trade_log)?;
    info!("trade log written to backtest_trades.json");

    Ok(())
}

fn install_strategies(engine: &mut Engine, cfg: &Config) {
    // Regime strategies run through the manager; structural strategies are
    // evaluated first, in the live selector's priority order.
    engine.set_manager(Arc::new(Manager::with_default_strategies()));

    if cfg.basis_trade_enabled {
        engine.register_strategy(Box::new(FundingArbitrageStrategy::new(
            FundingArbitrageConfig {
                entry_threshold_annualized: cfg.basis_entry_threshold,
                exit_threshold_annualized: cfg.basis_exit_threshold,
                ..Default::default()
            },
        )));
    }
    engine.register_strategy(Box::new(GridTradingStrategy::new(
        GridConfig::default(),
        &cfg.symbol,
    )));
    if cfg.scalper_enabled {
        let features = Arc::new(perpbot::features::Engine::new());
        engine.register_strategy(Box::new(FeeAwareScalper::new(
            ScalperConfig::default(),
            features,
        )));
    }
}

type SymbolData = Vec<(String, Vec<perpbot::venue::types::Candle>, Vec<perpbot::backtest::types::FundingRate>)>;

fn run_walk_forward(app_cfg: &Config, bt_cfg: BacktestConfig, data: SymbolData) -> Result<()> {
    let initial = bt_cfg.initial_capital;
    let start = bt_cfg.start_time;
    let end = bt_cfg.end_time;
    let app_cfg = app_cfg.clone();

    let analyzer = WalkForwardAnalyzer::new(
        start,
        end,
        initial,
        WalkForwardConfig::default(),
        Box::new(move |test_start, test_end| {
            let mut cfg = BacktestConfig::default();
            cfg.symbols = data.iter().map(|(s, _, _)| s.clone()).collect();
            cfg.start_time = test_start;
            cfg.end_time = test_end;
            cfg.initial_capital = initial;

            let mut engine = Engine::new(cfg);
            install_strategies(&mut engine, &app_cfg);
            for (symbol, candles, rates) in &data {
                let window: Vec<_> = candles
                    .iter()
                    .copied()
                    .filter(|c| {
                        c.time >= test_start.timestamp() && c.time < test_end.timestamp()
                    })
                    .collect();
                engine.set_candles(symbol, window);
                engine.set_funding_rates(symbol, rates.clone());
            }
            engine
        }),
    );

    let result = analyzer.run()?;
    println!("{}", result.summary);
    Ok(())
}
