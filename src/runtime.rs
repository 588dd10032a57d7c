// Live runtime: owns the venue and stream clients, the strategy family and
// the risk manager; runs the periodic loops (trading cycle, feature update,
// scalp-exit monitor, grid-fill monitor, regime refresh, performance
// snapshots) inside tokio tasks that all select on one stop channel.
//
// Market-data callbacks only update caches; no strategy logic runs inside
// them. Within one trading cycle, evaluation, filtering, sizing and order
// submission are sequential for a given symbol.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;

use crate::config::Config;
use crate::execution::ExecutionEngine;
use crate::features::{Engine as FeatureEngine, MarketFeatures};
use crate::oracle::OracleClient;
use crate::risk::RiskManager;
use crate::strategy::aggregator::{AssetData, SignalAggregator};
use crate::strategy::filter::SignalFilter;
use crate::strategy::funding_arbitrage::FundingArbitrageConfig;
use crate::strategy::grid::GridConfig;
use crate::strategy::scalper::ScalperConfig;
use crate::strategy::selector::{DriverSelector, DriverSelectorConfig};
use crate::strategy::{Manager, Signal, SignalAction, StructuralStrategy};
use crate::venue::client::Client;
use crate::venue::conversions::{notional_to_contracts, round_to_tick_nearest};
use crate::venue::market::resolution_duration;
use crate::venue::types::{Candle, Orderbook, Product, Regime, Ticker};
use crate::stream::StreamClient;

const CANDLE_RETENTION: usize = 500;
const HISTORY_CANDLES: usize = 200;
const MIN_SIGNAL_CANDLES: usize = 50;
const PERF_SNAPSHOT_SECS: i64 = 60;
const PERF_RING_CAP: usize = 500;
const FEE_WINDOW_WARNING_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct ScalpPosition {
    pub symbol: String,
    pub side: String,
    pub size: i64,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub order_id: i64,
}

#[derive(Debug, Clone)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub positions: usize,
}

#[derive(Default)]
struct PerfState {
    start_equity: f64,
    last_equity: f64,
    snapshots: VecDeque<PerformanceSnapshot>,
}

/// Ring of periodic performance snapshots, capped at 500 samples.
pub struct PerformanceTracker {
    state: StdMutex<PerfState>,
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(PerfState::default()),
        }
    }

    pub fn record(&self, snapshot: PerformanceSnapshot) {
        let mut state = self.state.lock().expect("perf state poisoned");
        if state.start_equity == 0.0 {
            state.start_equity = snapshot.equity;
        }
        state.last_equity = snapshot.equity;
        state.snapshots.push_back(snapshot);
        while state.snapshots.len() > PERF_RING_CAP {
            state.snapshots.pop_front();
        }
    }

    pub fn report(&self) -> Value {
        let state = self.state.lock().expect("perf state poisoned");
        let pnl_abs = state.last_equity - state.start_equity;
        let pnl_pct = if state.start_equity != 0.0 {
            pnl_abs / state.start_equity * 100.0
        } else {
            0.0
        };
        let last = state.snapshots.back();
        json!({
            "start_equity": state.start_equity,
            "last_equity": state.last_equity,
            "pnl_abs": pnl_abs,
            "pnl_pct": pnl_pct,
            "last_timestamp": last.map(|s| s.timestamp.to_rfc3339()),
            "realized_pnl": last.map(|s| s.realized_pnl).unwrap_or(0.0),
            "unrealized_pnl": last.map(|s| s.unrealized_pnl).unwrap_or(0.0),
            "open_positions": last.map(|s| s.positions).unwrap_or(0),
            "snapshots_stored": state.snapshots.len(),
        })
    }
}

/// Per-symbol caches behind one guarded map structure. Writers release
/// promptly; readers clone what they need.
#[derive(Default)]
struct RuntimeState {
    products: HashMap<String, Product>,
    candles: HashMap<String, Vec<Candle>>,
    tickers: HashMap<String, Ticker>,
    orderbooks: HashMap<String, Orderbook>,
    features: HashMap<String, MarketFeatures>,
    regimes: HashMap<String, (Regime, f64)>,
    scalp_positions: HashMap<String, ScalpPosition>,
    grid_orders: HashMap<i64, String>,
    basis_positions: HashMap<String, bool>,
    last_perf_update: Option<DateTime<Utc>>,
}

pub struct LiveRuntime {
    cfg: Config,
    client: Arc<Client>,
    stream: Arc<StreamClient>,
    oracle: Option<Arc<OracleClient>>,
    risk: Arc<RiskManager>,
    manager: Arc<Manager>,
    selector: Arc<Mutex<DriverSelector>>,
    feature_engine: Arc<FeatureEngine>,
    execution: Arc<ExecutionEngine>,
    signal_filter: SignalFilter,
    perf: Arc<PerformanceTracker>,
    state: Arc<StdRwLock<RuntimeState>>,
    stop: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl LiveRuntime {
    pub fn new(cfg: Config) -> Self {
        let client = Arc::new(Client::new(&cfg));
        let stream = Arc::new(StreamClient::new(&cfg.ws_url));
        let oracle = if cfg.oracle_endpoint.is_empty() {
            None
        } else {
            Some(Arc::new(OracleClient::new(&cfg.oracle_endpoint)))
        };

        let selector_cfg = DriverSelectorConfig {
            scalper: ScalperConfig {
                imbalance_threshold: cfg.scalp_imbalance_threshold,
                persistence_snapshots: cfg.scalp_persistence_count,
                target_profit_bps: cfg.scalp_target_bps,
                max_loss_bps: cfg.scalp_max_loss_bps,
                enabled: cfg.scalper_enabled,
                ..Default::default()
            },
            funding: FundingArbitrageConfig {
                entry_threshold_annualized: cfg.basis_entry_threshold,
                exit_threshold_annualized: cfg.basis_exit_threshold,
                enabled: cfg.basis_trade_enabled,
                ..Default::default()
            },
            grid: GridConfig::default(),
        };
        let selector = DriverSelector::new(selector_cfg);
        let feature_engine = selector.feature_engine();

        let (stop, _) = broadcast::channel(1);

        Self {
            risk: Arc::new(RiskManager::new(&cfg)),
            manager: Arc::new(Manager::with_default_strategies()),
            selector: Arc::new(Mutex::new(selector)),
            feature_engine,
            execution: Arc::new(ExecutionEngine::new(client.clone())),
            signal_filter: SignalFilter::new(),
            perf: Arc::new(PerformanceTracker::new()),
            state: Arc::new(StdRwLock::new(RuntimeState::default())),
            stop,
            stopped: AtomicBool::new(false),
            client,
            stream,
            oracle,
            cfg,
        }
    }

    pub fn performance(&self) -> Arc<PerformanceTracker> {
        self.perf.clone()
    }

    /// Resolves product metadata, sets leverage, and loads seed history for
    /// every configured symbol.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing trading runtime...");

        for symbol in &self.cfg.symbols {
            let product = match self.client.get_product(symbol).await {
                Ok(product) => product,
                Err(err) => {
                    warn!("failed to get product for {symbol}: {err}");
                    continue;
                }
            };
            info!("Loaded product: {symbol} (id {})", product.id);

            if let Err(err) = self.client.set_leverage(product.id, self.cfg.leverage).await {
                warn!("failed to set leverage for {symbol}: {err}");
            }

            let candles = match self
                .client
                .get_recent_candles(symbol, &self.cfg.candle_interval, HISTORY_CANDLES)
                .await
            {
                Ok(candles) => candles,
                Err(err) => {
                    warn!("failed to get initial candles for {symbol}: {err}");
                    Vec::new()
                }
            };

            let orderbook = self.client.get_orderbook(symbol).await.ok();
            let ticker = self.client.get_ticker(symbol).await.ok();

            let mut state = self.state.write().expect("runtime state poisoned");
            state.products.insert(symbol.clone(), product);
            state.candles.insert(symbol.clone(), candles);
            if let Some(ob) = orderbook {
                state.orderbooks.insert(symbol.clone(), ob);
            }
            if let Some(t) = ticker {
                state.tickers.insert(symbol.clone(), t);
            }
        }

        let product_count = self.state.read().expect("runtime state poisoned").products.len();
        if product_count == 0 {
            return Err(anyhow!("failed to initialize any products"));
        }

        // Seed the risk manager with the current balance.
        if let Ok(balance) = self.client.get_available_balance(&self.settling_asset()).await {
            self.risk.update_balance(balance);
            info!("Available balance: {balance:.2}");
        }

        Ok(())
    }

    /// Wires stream callbacks, subscribes, and spawns every loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.install_stream_callbacks();
        self.stream.start();

        for symbol in &self.cfg.symbols {
            self.stream.subscribe_ticker(symbol).await;
            self.stream
                .subscribe_candles(symbol, &self.cfg.candle_interval)
                .await;
            self.stream.subscribe_orderbook(symbol).await;
            self.stream.subscribe_funding_rate(&[symbol]).await;
        }

        self.spawn_trading_loop();
        self.spawn_feature_loop();
        self.spawn_scalp_exit_monitor();
        self.spawn_grid_fill_monitor();
        self.spawn_regime_loop();

        info!("Runtime started - symbols: {:?}", self.cfg.symbols);
        Ok(())
    }

    /// Cancels all loops, closes the stream and the venue client. Safe to
    /// call repeatedly.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping runtime...");
        let _ = self.stop.send(());
        self.stream.close();
        self.client.close();
        info!("Runtime stopped");
    }

    pub fn status(&self) -> Value {
        let state = self.state.read().expect("runtime state poisoned");
        json!({
            "symbols": self.cfg.symbols,
            "ws_connected": self.stream.is_connected(),
            "products_cached": state.products.len(),
            "scalp_positions": state.scalp_positions.len(),
            "grid_orders": state.grid_orders.len(),
            "risk_metrics": self.risk.risk_metrics(),
            "performance": self.perf.report(),
        })
    }

    fn settling_asset(&self) -> String {
        let state = self.state.read().expect("runtime state poisoned");
        state
            .products
            .values()
            .next()
            .map(|p| p.settling_asset.symbol.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "USDT".to_string())
    }

    fn install_stream_callbacks(&self) {
        {
            let state = self.state.clone();
            self.stream.on_ticker(move |ticker| {
                let mut state = state.write().expect("runtime state poisoned");
                state.tickers.insert(ticker.symbol.clone(), ticker);
            });
        }
        {
            let state = self.state.clone();
            self.stream.on_candle_with_symbol(move |symbol, candle| {
                let mut state = state.write().expect("runtime state poisoned");
                let candles = state.candles.entry(symbol.to_string()).or_default();
                apply_candle_update(candles, candle);
            });
        }
        {
            let state = self.state.clone();
            self.stream.on_orderbook(move |data| {
                if let Ok(ob) = serde_json::from_value::<Orderbook>(data) {
                    if !ob.symbol.is_empty() {
                        let mut state = state.write().expect("runtime state poisoned");
                        state.orderbooks.insert(ob.symbol.clone(), ob);
                    }
                }
            });
        }
        {
            let state = self.state.clone();
            self.stream.on_funding_rate(move |update| {
                let mut state = state.write().expect("runtime state poisoned");
                if let Some(ticker) = state.tickers.get_mut(&update.symbol) {
                    ticker.funding_rate = update.funding_rate;
                }
            });
        }
        self.stream.on_error(|err| {
            warn!("stream error: {err}");
        });
    }

    /// Trading loop cadence: a third of the candle interval, clamped to
    /// [10s, 60s].
    fn trading_loop_period(&self) -> Duration {
        let base = resolution_duration(&self.cfg.candle_interval)
            .map(|d| d / 3)
            .unwrap_or(Duration::from_secs(10));
        base.clamp(Duration::from_secs(10), Duration::from_secs(60))
    }

    fn spawn_trading_loop(self: &Arc<Self>) {
        let runtime = self.clone();
        let mut stop_rx = self.stop.subscribe();
        let period = self.trading_loop_period();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => return,
                    _ = ticker.tick() => runtime.trading_cycle().await,
                }
            }
        });
    }

    fn spawn_feature_loop(self: &Arc<Self>) {
        let runtime = self.clone();
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => return,
                    _ = ticker.tick() => runtime.update_features(),
                }
            }
        });
    }

    fn spawn_scalp_exit_monitor(self: &Arc<Self>) {
        let runtime = self.clone();
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => return,
                    _ = ticker.tick() => runtime.check_scalp_exits().await,
                }
            }
        });
    }

    fn spawn_grid_fill_monitor(self: &Arc<Self>) {
        let runtime = self.clone();
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(2));
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => return,
                    _ = ticker.tick() => runtime.check_grid_fills().await,
                }
            }
        });
    }

    fn spawn_regime_loop(self: &Arc<Self>) {
        let Some(oracle) = self.oracle.clone() else {
            return;
        };
        let runtime = self.clone();
        let mut stop_rx = self.stop.subscribe();
        let period = self.cfg.regime_check_period;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => return,
                    _ = ticker.tick() => runtime.update_regimes(&oracle).await,
                }
            }
        });
    }

    async fn update_regimes(&self, oracle: &OracleClient) {
        for symbol in &self.cfg.symbols {
            let candles = {
                let state = self.state.read().expect("runtime state poisoned");
                state.candles.get(symbol).cloned().unwrap_or_default()
            };
            if candles.len() < MIN_SIGNAL_CANDLES {
                continue;
            }

            match oracle.detect_regime_with_retry(&candles, symbol, 3).await {
                Ok(resp) => {
                    info!(
                        "[{symbol}] regime updated: {} (confidence {:.2}, volatility {:.4}, trend {:.4})",
                        resp.regime, resp.confidence, resp.features.volatility, resp.features.trend
                    );
                    let mut state = self.state.write().expect("runtime state poisoned");
                    state
                        .regimes
                        .insert(symbol.clone(), (resp.regime, resp.confidence));
                }
                Err(err) => warn!("[{symbol}] regime detection failed: {err}"),
            }
        }
    }

    /// Recomputes the per-symbol feature view from the caches.
    fn update_features(&self) {
        let (tickers, orderbooks, candles) = {
            let state = self.state.read().expect("runtime state poisoned");
            (
                state.tickers.clone(),
                state.orderbooks.clone(),
                state.candles.clone(),
            )
        };

        for symbol in &self.cfg.symbols {
            let Some(ticker) = tickers.get(symbol) else {
                continue;
            };
            let history = candles.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
            if history.len() < 20 {
                continue;
            }

            let mut features = self.feature_engine.compute_features_with_funding(
                orderbooks.get(symbol),
                Some(ticker),
                history,
            );

            {
                let state = self.state.read().expect("runtime state poisoned");
                if let Some((regime, confidence)) = state.regimes.get(symbol) {
                    features.regime = *regime;
                    features.regime_confidence = *confidence;
                }
            }

            let mut state = self.state.write().expect("runtime state poisoned");
            state.features.insert(symbol.clone(), features);
        }
    }

    async fn trading_cycle(&self) {
        self.update_performance_if_due(false).await;

        let (can_trade, reason) = self.risk.can_trade();
        if !can_trade {
            info!("Trading blocked: {reason}");
            return;
        }

        if self.cfg.multi_asset_mode && self.oracle.is_some() {
            self.multi_asset_cycle().await;
        } else {
            self.structural_cycle().await;
        }
    }

    /// Structural path: the selector picks one strategy per symbol; the
    /// first actionable signal is executed and the cycle ends.
    async fn structural_cycle(&self) {
        let (features_map, candles_map, products, has_scalp, has_basis) = {
            let state = self.state.read().expect("runtime state poisoned");
            (
                state.features.clone(),
                state.candles.clone(),
                state.products.clone(),
                !state.scalp_positions.is_empty(),
                !state.basis_positions.is_empty(),
            )
        };

        if has_scalp || has_basis {
            return;
        }

        for symbol in &self.cfg.symbols {
            let Some(features) = features_map.get(symbol) else {
                continue;
            };
            let Some(candles) = candles_map.get(symbol) else {
                continue;
            };
            if candles.len() < MIN_SIGNAL_CANDLES {
                continue;
            }
            let Some(product) = products.get(symbol) else {
                continue;
            };

            let (selected, signal) = {
                let mut selector = self.selector.lock().await;
                selector.select_strategy(features, candles)
            };

            if signal.is_none() {
                continue;
            }

            info!(
                "[{symbol}] signal: {} {} (strategy={}, driver={}, confidence={:.2})",
                signal.action, signal.side, selected.name, selected.driver, signal.confidence
            );

            match selected.name {
                "fee_aware_scalper" => self.execute_scalp_entry(&signal, product, symbol).await,
                "funding_arbitrage" => self.execute_funding_entry(&signal, product, symbol).await,
                "grid_trading" => self.execute_grid_entry(product, symbol).await,
                _ => {}
            }
            return;
        }
    }

    async fn execute_scalp_entry(&self, signal: &Signal, product: &Product, symbol: &str) {
        let balance = match self.client.get_available_balance(&self.settling_asset()).await {
            Ok(balance) => balance,
            Err(err) => {
                warn!("failed to get balance: {err}");
                return;
            }
        };

        let position_value =
            balance * (self.cfg.max_position_pct / 100.0) * self.cfg.leverage as f64;
        let size = match notional_to_contracts(position_value, signal.price, product) {
            Ok(size) => size.max(1),
            Err(err) => {
                warn!("failed to calculate scalp size: {err}");
                return;
            }
        };

        let sl = round_to_tick_nearest(signal.stop_loss, &product.tick_size);
        let tp = round_to_tick_nearest(signal.take_profit, &product.tick_size);

        let req = crate::venue::types::OrderRequest {
            product_id: Some(product.id),
            size,
            side: signal.side.clone(),
            order_type: "limit_order".to_string(),
            limit_price: format!("{:.2}", signal.price),
            time_in_force: "gtc".to_string(),
            bracket_stop_loss_price: sl.clone(),
            bracket_take_profit_price: tp.clone(),
            ..Default::default()
        };

        let order = match self.client.place_order(&req).await {
            Ok(order) => order,
            Err(err) => {
                warn!("failed to place scalp order: {err}");
                return;
            }
        };

        {
            let mut state = self.state.write().expect("runtime state poisoned");
            state.scalp_positions.insert(
                symbol.to_string(),
                ScalpPosition {
                    symbol: symbol.to_string(),
                    side: signal.side.clone(),
                    size,
                    entry_time: Utc::now(),
                    entry_price: signal.price,
                    order_id: order.id,
                },
            );
        }
        self.selector
            .lock()
            .await
            .scalper_mut()
            .on_position_opened(symbol, &signal.side, Utc::now());

        info!(
            "[{symbol}] scalp entry: {} {size} contracts @ {:.2} (SL {sl}, TP {tp})",
            signal.side, signal.price
        );
    }

    /// Hedged funding-carry entry: the futures leg goes first and a failed
    /// hedge aborts the perpetual leg.
    async fn execute_funding_entry(&self, signal: &Signal, product: &Product, symbol: &str) {
        let balance = match self.client.get_available_balance(&self.settling_asset()).await {
            Ok(balance) => balance,
            Err(err) => {
                warn!("failed to get balance: {err}");
                return;
            }
        };

        let target_notional = balance * (self.cfg.max_position_pct / 100.0) * 5.0;
        let perp_size = match notional_to_contracts(target_notional, signal.price, product) {
            Ok(size) => size.max(1),
            Err(err) => {
                warn!("failed to calculate funding arb size: {err}");
                return;
            }
        };

        if signal.is_hedged {
            let future_product = match self.client.get_futures_product_for_perp(symbol).await {
                Ok(p) => p,
                Err(err) => {
                    warn!("arbitrage blocked: no futures product for {symbol}: {err}");
                    return;
                }
            };
            let future_size = match notional_to_contracts(target_notional, signal.price, &future_product)
            {
                Ok(size) => size.max(1),
                Err(err) => {
                    warn!("arbitrage blocked: failed to size the hedge leg: {err}");
                    return;
                }
            };

            let future_price =
                round_to_tick_nearest(signal.price * 1.01, &future_product.tick_size);
            let future_req = crate::venue::types::OrderRequest {
                product_id: Some(future_product.id),
                size: future_size,
                side: "buy".to_string(),
                order_type: "limit_order".to_string(),
                limit_price: future_price,
                time_in_force: "ioc".to_string(),
                ..Default::default()
            };

            match self.client.place_order(&future_req).await {
                Ok(order) => info!(
                    "[{}] hedge leg placed: buy {future_size} contracts (order {})",
                    future_product.symbol, order.id
                ),
                Err(err) => {
                    warn!("arbitrage blocked: hedge leg failed: {err}");
                    return;
                }
            }
        }

        let req = crate::venue::types::OrderRequest {
            product_id: Some(product.id),
            size: perp_size,
            side: signal.side.clone(),
            order_type: "limit_order".to_string(),
            limit_price: format!("{:.2}", signal.price),
            time_in_force: "gtc".to_string(),
            ..Default::default()
        };

        let order = match self.client.place_order(&req).await {
            Ok(order) => order,
            Err(err) => {
                warn!("failed to place funding arb order: {err}");
                return;
            }
        };

        {
            let mut state = self.state.write().expect("runtime state poisoned");
            state.basis_positions.insert(symbol.to_string(), true);
        }
        self.selector
            .lock()
            .await
            .funding_arb_mut()
            .on_position_opened(symbol, &signal.side, Utc::now());

        info!(
            "[{symbol}] funding arb entry: {} {perp_size} contracts @ {:.2} (order {})",
            signal.side, signal.price, order.id
        );
    }

    /// Places the grid ladder: one resting limit order per active level.
    async fn execute_grid_entry(&self, product: &Product, symbol: &str) {
        let levels = {
            let selector = self.selector.lock().await;
            selector.grid_trader().levels().to_vec()
        };
        if levels.is_empty() {
            info!("[{symbol}] grid active but no levels calculated");
            return;
        }

        let balance = match self.client.get_available_balance(&self.settling_asset()).await {
            Ok(balance) => balance,
            Err(err) => {
                warn!("failed to get balance for grid: {err}");
                return;
            }
        };

        let grid_notional = balance * 0.05 * self.cfg.leverage as f64;
        let size_per_level = match notional_to_contracts(grid_notional, levels[0].price, product) {
            Ok(size) => size.max(1),
            Err(err) => {
                warn!("failed to calculate grid size: {err}");
                return;
            }
        };

        let mut placed = 0usize;
        for (index, level) in levels.iter().enumerate() {
            if !level.is_active {
                continue;
            }
            let price = round_to_tick_nearest(level.price, &product.tick_size);
            let req = crate::venue::types::OrderRequest {
                product_id: Some(product.id),
                size: size_per_level,
                side: level.side.clone(),
                order_type: "limit_order".to_string(),
                limit_price: price.clone(),
                time_in_force: "gtc".to_string(),
                ..Default::default()
            };

            match self.client.place_order(&req).await {
                Ok(order) => {
                    {
                        let mut state = self.state.write().expect("runtime state poisoned");
                        state.grid_orders.insert(order.id, symbol.to_string());
                    }
                    self.selector.lock().await.grid_trader_mut().bind_order(index, order.id);
                    placed += 1;
                }
                Err(err) => warn!("[{symbol}] failed to place grid order at {price}: {err}"),
            }
        }

        info!(
            "[{symbol}] grid activated: placed {placed}/{} orders ({size_per_level} contracts each)",
            levels.len()
        );
    }

    /// Walks open scalp positions and warns when the fee-free window is
    /// about to expire.
    async fn check_scalp_exits(&self) {
        let positions: Vec<ScalpPosition> = {
            let state = self.state.read().expect("runtime state poisoned");
            state.scalp_positions.values().cloned().collect()
        };
        if positions.is_empty() {
            return;
        }

        let selector = self.selector.lock().await;
        let scalper = selector.scalper();
        let now = Utc::now();

        for pos in positions {
            let window = chrono::Duration::from_std(scalper.fee_window(&pos.symbol))
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
            let remaining = window - (now - pos.entry_time);
            let in_window = scalper.should_close_for_fees_at(&pos.symbol, now);

            if remaining > chrono::Duration::zero()
                && remaining.num_seconds() < FEE_WINDOW_WARNING_SECS
                && in_window
            {
                warn!(
                    "fee window expiring in {}s for {} - consider closing",
                    remaining.num_seconds(),
                    pos.symbol
                );
            }
        }
    }

    /// Polls registered grid orders; fills mark their level inactive.
    async fn check_grid_fills(&self) {
        let order_ids: Vec<i64> = {
            let state = self.state.read().expect("runtime state poisoned");
            state.grid_orders.keys().copied().collect()
        };

        for order_id in order_ids {
            let order = match self.client.get_order(order_id).await {
                Ok(order) => order,
                Err(err) => {
                    warn!("failed to get grid order {order_id}: {err}");
                    continue;
                }
            };

            if order.state == "filled" || order.state == "closed" {
                let signal = self.selector.lock().await.grid_trader_mut().on_fill(order_id);
                {
                    let mut state = self.state.write().expect("runtime state poisoned");
                    state.grid_orders.remove(&order_id);
                }
                if !signal.reason.is_empty() {
                    info!("[GRID] order {order_id} filled: {}", signal.reason);
                }
            }
        }
    }

    /// Multi-asset path: evaluate every symbol against its oracle regime,
    /// aggregate, filter, and execute the single best signal.
    async fn multi_asset_cycle(&self) {
        let (candles_map, regimes, products) = {
            let state = self.state.read().expect("runtime state poisoned");
            (
                state.candles.clone(),
                state.regimes.clone(),
                state.products.clone(),
            )
        };

        let mut assets = Vec::new();
        for symbol in &self.cfg.symbols {
            let Some(candles) = candles_map.get(symbol) else {
                continue;
            };
            if candles.len() < MIN_SIGNAL_CANDLES {
                info!("  {symbol}: insufficient candles ({})", candles.len());
                continue;
            }
            let Some((regime, confidence)) = regimes.get(symbol) else {
                info!("  {symbol}: no regime yet");
                continue;
            };

            assets.push(AssetData {
                symbol: symbol.clone(),
                candles: candles.clone(),
                regime: *regime,
                hmm_confidence: *confidence,
            });
        }

        if assets.is_empty() {
            return;
        }

        let asset_candles: HashMap<String, Vec<Candle>> = assets
            .iter()
            .map(|a| (a.symbol.clone(), a.candles.clone()))
            .collect();

        let aggregator = SignalAggregator::new(self.manager.clone());
        let Some(best) = aggregator.select_best_signal(assets).await else {
            return;
        };

        let candles = asset_candles.get(&best.symbol).cloned().unwrap_or_default();
        let (should_trade, filter_reason) =
            self.signal_filter
                .should_trade(&best.signal, &candles, best.regime);
        if !should_trade {
            info!("signal filtered for {}: {filter_reason}", best.symbol);
            return;
        }

        let Some(product) = products.get(&best.symbol) else {
            warn!("product not found for {}", best.symbol);
            return;
        };

        info!(
            "EXECUTING: {} {} (score {:.3}, regime {})",
            best.symbol, best.signal.side, best.total_score, best.regime
        );
        self.execute_signal_for_symbol(&best.signal, best.regime, &best.symbol, product)
            .await;
    }

    async fn execute_signal_for_symbol(
        &self,
        signal: &Signal,
        regime: Regime,
        symbol: &str,
        product: &Product,
    ) {
        let settling = if product.settling_asset.symbol.is_empty() {
            "USDT".to_string()
        } else {
            product.settling_asset.symbol.clone()
        };
        let balance = match self.client.get_available_balance(&settling).await {
            Ok(balance) => balance,
            Err(err) => {
                warn!("failed to get balance: {err}");
                return;
            }
        };
        self.risk.update_balance(balance);

        // Volatile markets demand a higher bar.
        let min_confidence = if regime == Regime::HighVol { 0.6 } else { 0.5 };
        if signal.confidence < min_confidence {
            info!(
                "signal confidence {:.2} below threshold {min_confidence:.2}, skipping",
                signal.confidence
            );
            return;
        }

        match signal.action {
            SignalAction::Buy | SignalAction::Sell => {
                self.execute_trade(signal, regime, balance, symbol, product).await;
            }
            SignalAction::Close => self.close_positions(&signal.side).await,
            SignalAction::Reduce => {
                info!("capital preservation mode - reducing exposure");
            }
            SignalAction::None => {}
        }
    }

    async fn execute_trade(
        &self,
        signal: &Signal,
        regime: Regime,
        balance: f64,
        symbol: &str,
        product: &Product,
    ) {
        let stop_loss = if signal.stop_loss > 0.0 {
            signal.stop_loss
        } else {
            self.risk
                .calculate_stop_loss(signal.price, &signal.side, 0.0, regime)
        };
        let take_profit = if signal.take_profit > 0.0 {
            signal.take_profit
        } else {
            self.risk
                .calculate_take_profit(signal.price, stop_loss, &signal.side, regime)
        };

        let size = self
            .risk
            .calculate_position_size(balance, signal.price, stop_loss, regime, product);
        if size <= 0 {
            info!("calculated position size is 0, skipping trade");
            return;
        }

        if let Err(err) = self.client.set_leverage(product.id, self.cfg.leverage).await {
            warn!("failed to set leverage for {symbol}: {err}");
        }

        let sl = round_to_tick_nearest(stop_loss, &product.tick_size);
        let tp = round_to_tick_nearest(take_profit, &product.tick_size);

        let req = crate::venue::types::OrderRequest {
            product_id: Some(product.id),
            size,
            side: signal.side.clone(),
            bracket_stop_loss_price: sl,
            bracket_take_profit_price: tp,
            ..Default::default()
        };

        info!(
            "placing limit order: {symbol} {} size={size} SL={stop_loss:.2} TP={take_profit:.2}",
            signal.side
        );

        match self.execution.place_limit_with_fallback(&req, symbol, 5).await {
            Ok(order) => {
                let order_type = if order.order_type == "market_order" {
                    "market (fallback)"
                } else {
                    "limit"
                };
                info!(
                    "order placed: id={} type={order_type} state={}",
                    order.id, order.state
                );
                self.risk.record_trade();
            }
            Err(err) if err.is_rejection() => {
                // Rejection kills this order, not the trading loop.
                warn!("order rejected by venue: {err}");
            }
            Err(err) => warn!("failed to place order: {err}"),
        }
    }

    /// Closes every open position on the given side via reduce-only orders.
    async fn close_positions(&self, side: &str) {
        let positions = match self.client.get_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                warn!("failed to get positions: {err}");
                return;
            }
        };

        for pos in positions {
            if pos.size == 0 {
                continue;
            }
            // A close signal on "buy" targets shorts; on "sell", longs.
            let position_side = if pos.size > 0 { "buy" } else { "sell" };
            if side == "buy" && pos.size > 0 {
                continue;
            }
            if side == "sell" && pos.size < 0 {
                continue;
            }

            info!("closing position: {} size={}", pos.product_symbol, pos.size);
            if let Err(err) = self
                .execution
                .close_position(
                    &pos.product_symbol,
                    pos.product_id,
                    pos.size.abs(),
                    position_side,
                )
                .await
            {
                warn!("failed to close position: {err}");
            }
        }
    }

    /// Snapshots equity, realized/unrealized P&L, and open position count.
    async fn update_performance_if_due(&self, force: bool) {
        let due = {
            let state = self.state.read().expect("runtime state poisoned");
            force
                || state
                    .last_perf_update
                    .map(|t| (Utc::now() - t).num_seconds() >= PERF_SNAPSHOT_SECS)
                    .unwrap_or(true)
        };
        if !due {
            return;
        }

        let equity = match self.client.get_net_equity().await {
            Ok(equity) => equity,
            Err(_) => match self
                .client
                .get_available_balance(&self.settling_asset())
                .await
            {
                Ok(balance) => balance,
                Err(_) => return,
            },
        };

        let positions = match self.client.get_positions().await {
            Ok(positions) => positions,
            Err(_) => return,
        };

        let mut realized = 0.0;
        let mut unrealized = 0.0;
        let mut open = 0usize;
        for p in &positions {
            if p.size != 0 {
                open += 1;
            }
            realized += p.realized_pnl.parse::<f64>().unwrap_or(0.0);
            unrealized += p.unrealized_pnl.parse::<f64>().unwrap_or(0.0);
        }

        self.perf.record(PerformanceSnapshot {
            timestamp: Utc::now(),
            equity,
            realized_pnl: realized,
            unrealized_pnl: unrealized,
            positions: open,
        });

        {
            let mut state = self.state.write().expect("runtime state poisoned");
            state.last_perf_update = Some(Utc::now());
        }

        let report = self.perf.report();
        info!(
            "performance: equity={:.2} pnl={:.2} ({:.2}%) positions={open}",
            report["last_equity"].as_f64().unwrap_or(0.0),
            report["pnl_abs"].as_f64().unwrap_or(0.0),
            report["pnl_pct"].as_f64().unwrap_or(0.0),
        );
    }
}

/// Candle cache update rule: equal timestamp replaces the last bar in
/// place, a strictly greater one appends, older ones drop. Retention is
/// capped at the most recent 500 bars.
fn apply_candle_update(candles: &mut Vec<Candle>, candle: Candle) {
    match candles.last() {
        Some(last) if candle.time == last.time => {
            let idx = candles.len() - 1;
            candles[idx] = candle;
        }
        Some(last) if candle.time > last.time => {
            candles.push(candle);
            if candles.len() > CANDLE_RETENTION {
                let excess = candles.len() - CANDLE_RETENTION;
                candles.drain(..excess);
            }
        }
        Some(_) => {}
        None => candles.push(candle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn candle_updates_follow_the_append_rule() {
        let mut candles = vec![candle(100, 1.0)];

        // Same timestamp updates in place.
        apply_candle_update(&mut candles, candle(100, 2.0));
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 2.0);

        // Greater timestamp opens a new bar.
        apply_candle_update(&mut candles, candle(200, 3.0));
        assert_eq!(candles.len(), 2);

        // Older timestamps are dropped.
        apply_candle_update(&mut candles, candle(50, 9.0));
        assert_eq!(candles.len(), 2);
        assert!(candles.iter().all(|c| c.close != 9.0));
    }

    #[test]
    fn candle_retention_is_capped() {
        let mut candles = Vec::new();
        for i in 0..600 {
            apply_candle_update(&mut candles, candle(i, 1.0));
        }
        assert_eq!(candles.len(), CANDLE_RETENTION);
        assert_eq!(candles[0].time, 100);
    }

    #[test]
    fn performance_ring_caps_at_500() {
        let tracker = PerformanceTracker::new();
        for i in 0..600 {
            tracker.record(PerformanceSnapshot {
                timestamp: Utc::now(),
                equity: 100.0 + i as f64,
                realized_pnl: 0.0,
                unrealized_pnl: 0.0,
                positions: 0,
            });
        }
        let report = tracker.report();
        assert_eq!(report["snapshots_stored"], 500);
        assert_eq!(report["start_equity"], 100.0);
        assert_eq!(report["last_equity"], 699.0);
    }

    #[tokio::test]
    async fn trading_loop_period_clamps() {
        let mut cfg = Config::default();
        cfg.candle_interval = "1m".to_string();
        let rt = LiveRuntime::new(cfg);
        // 60s / 3 = 20s, inside the clamp.
        assert_eq!(rt.trading_loop_period(), Duration::from_secs(20));

        let mut cfg = Config::default();
        cfg.candle_interval = "1d".to_string();
        let rt = LiveRuntime::new(cfg);
        assert_eq!(rt.trading_loop_period(), Duration::from_secs(60));

        let mut cfg = Config::default();
        cfg.candle_interval = "5m".to_string();
        let rt = LiveRuntime::new(cfg);
        // 300s / 3 = 100s clamps to 60s.
        assert_eq!(rt.trading_loop_period(), Duration::from_secs(60));
    }
}
