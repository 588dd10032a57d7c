// Stream client: a single persistent push connection with a deduplicated
// subscription list. Subscriptions made before connect are queued and
// replayed after (re)connect; reconnects are single-flight with exponential
// backoff; a heartbeat pings every 30 seconds. Close is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::venue::types::{Candle, FundingRateUpdate, Ticker};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub name: String,
    pub symbols: Vec<String>,
}

/// Wire envelope for push messages.
#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(rename = "type", default)]
    msg_type: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    data: Value,
}

type TickerCallback = Box<dyn Fn(Ticker) + Send + Sync>;
type CandleCallback = Box<dyn Fn(Candle) + Send + Sync>;
type CandleSymbolCallback = Box<dyn Fn(&str, Candle) + Send + Sync>;
type OrderbookCallback = Box<dyn Fn(Value) + Send + Sync>;
type FundingCallback = Box<dyn Fn(FundingRateUpdate) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_ticker: Option<TickerCallback>,
    on_candle: Option<CandleCallback>,
    on_candle_with_symbol: Option<CandleSymbolCallback>,
    on_orderbook: Option<OrderbookCallback>,
    on_funding_rate: Option<FundingCallback>,
    on_error: Option<ErrorCallback>,
}

struct Inner {
    url: String,
    subscriptions: StdMutex<Vec<Subscription>>,
    callbacks: StdMutex<Callbacks>,
    writer: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    closed: AtomicBool,
    stop: broadcast::Sender<()>,
}

pub struct StreamClient {
    inner: Arc<Inner>,
}

impl StreamClient {
    pub fn new(url: &str) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                url: url.to_string(),
                subscriptions: StdMutex::new(Vec::new()),
                callbacks: StdMutex::new(Callbacks::default()),
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                stop,
            }),
        }
    }

    pub fn on_ticker(&self, callback: impl Fn(Ticker) + Send + Sync + 'static) {
        self.inner.callbacks.lock().expect("callbacks poisoned").on_ticker = Some(Box::new(callback));
    }

    pub fn on_candle(&self, callback: impl Fn(Candle) + Send + Sync + 'static) {
        self.inner.callbacks.lock().expect("callbacks poisoned").on_candle = Some(Box::new(callback));
    }

    pub fn on_candle_with_symbol(&self, callback: impl Fn(&str, Candle) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .lock()
            .expect("callbacks poisoned")
            .on_candle_with_symbol = Some(Box::new(callback));
    }

    pub fn on_orderbook(&self, callback: impl Fn(Value) + Send + Sync + 'static) {
        self.inner.callbacks.lock().expect("callbacks poisoned").on_orderbook =
            Some(Box::new(callback));
    }

    pub fn on_funding_rate(&self, callback: impl Fn(FundingRateUpdate) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .lock()
            .expect("callbacks poisoned")
            .on_funding_rate = Some(Box::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.inner.callbacks.lock().expect("callbacks poisoned").on_error = Some(Box::new(callback));
    }

    /// Records the subscription (deduplicated) and sends the frame when
    /// already connected; otherwise it is replayed after connect.
    pub async fn subscribe(&self, channel: &str, symbols: &[&str]) {
        let sub = Subscription {
            name: channel.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        };

        {
            let mut subs = self.inner.subscriptions.lock().expect("subscriptions poisoned");
            if subs.contains(&sub) {
                return;
            }
            subs.push(sub.clone());
        }

        if self.inner.connected.load(Ordering::SeqCst) {
            self.inner.send_subscribe(&sub).await;
        }
    }

    pub async fn subscribe_ticker(&self, symbol: &str) {
        self.subscribe("v2/ticker", &[symbol]).await;
    }

    pub async fn subscribe_candles(&self, symbol: &str, resolution: &str) {
        self.subscribe(&format!("candlestick_{resolution}"), &[symbol]).await;
    }

    pub async fn subscribe_orderbook(&self, symbol: &str) {
        self.subscribe("l2_orderbook", &[symbol]).await;
    }

    pub async fn subscribe_funding_rate(&self, symbols: &[&str]) {
        self.subscribe("funding_rate", symbols).await;
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.lock().expect("subscriptions poisoned").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Starts the connection, read, and heartbeat tasks.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Inner::run(inner).await;
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            Inner::heartbeat(inner).await;
        });
    }

    /// Stops every task and drops the connection. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.stop.send(());
            self.inner.connected.store(false, Ordering::SeqCst);
            info!("STREAM: closed");
        }
    }
}

impl Inner {
    /// Single-flight connect/read/reconnect loop.
    async fn run(inner: Arc<Inner>) {
        let mut stop_rx = inner.stop.subscribe();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }

            match connect_async(inner.url.as_str()).await {
                Ok((ws, _)) => {
                    info!("STREAM: connected to {}", inner.url);
                    backoff = INITIAL_BACKOFF;

                    let (sink, mut read) = ws.split();
                    *inner.writer.lock().await = Some(sink);
                    inner.connected.store(true, Ordering::SeqCst);
                    inner.resubscribe_all().await;

                    loop {
                        tokio::select! {
                            _ = stop_rx.recv() => {
                                inner.drop_writer().await;
                                return;
                            }
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => inner.dispatch(&text),
                                Some(Ok(Message::Ping(payload))) => {
                                    let mut writer = inner.writer.lock().await;
                                    if let Some(sink) = writer.as_mut() {
                                        let _ = sink.send(Message::Pong(payload)).await;
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!("STREAM: read error: {err}");
                                    inner.emit_error(format!("read error: {err}"));
                                    break;
                                }
                                None => {
                                    warn!("STREAM: connection closed by peer");
                                    break;
                                }
                            }
                        }
                    }

                    inner.connected.store(false, Ordering::SeqCst);
                    inner.drop_writer().await;
                }
                Err(err) => {
                    warn!("STREAM: connect error: {err}");
                    inner.emit_error(format!("connect error: {err}"));
                }
            }

            info!("STREAM: reconnecting in {}s", backoff.as_secs());
            tokio::select! {
                _ = stop_rx.recv() => return,
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn heartbeat(inner: Arc<Inner>) {
        let mut stop_rx = inner.stop.subscribe();
        loop {
            tokio::select! {
                _ = stop_rx.recv() => return,
                _ = sleep(HEARTBEAT_INTERVAL) => {}
            }
            if !inner.connected.load(Ordering::SeqCst) {
                continue;
            }
            let mut writer = inner.writer.lock().await;
            if let Some(sink) = writer.as_mut() {
                if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                    warn!("STREAM: heartbeat ping failed: {err}");
                }
            }
        }
    }

    async fn drop_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            let _ = sink.close().await;
        }
        *writer = None;
    }

    /// Replays every stored subscription, each exactly once.
    async fn resubscribe_all(&self) {
        let subs = self.subscriptions.lock().expect("subscriptions poisoned").clone();
        for sub in &subs {
            self.send_subscribe(sub).await;
        }
    }

    async fn send_subscribe(&self, sub: &Subscription) {
        let payload = subscribe_payload(sub);
        let mut writer = self.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            if let Err(err) = sink.send(Message::Text(payload.to_string())).await {
                warn!("STREAM: subscribe send failed for {}: {err}", sub.name);
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let msg: StreamMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("STREAM: failed to parse message: {err}");
                return;
            }
        };

        let callbacks = self.callbacks.lock().expect("callbacks poisoned");
        let kind = if msg.msg_type.is_empty() { &msg.channel } else { &msg.msg_type };

        if kind.contains("ticker") || msg.channel.contains("ticker") {
            if let Some(cb) = &callbacks.on_ticker {
                if let Ok(ticker) = serde_json::from_value::<Ticker>(msg.data.clone()) {
                    cb(ticker);
                }
            }
        } else if kind.contains("candlestick") || msg.channel.contains("candlestick") {
            if let Ok(candle) = serde_json::from_value::<Candle>(msg.data.clone()) {
                if let Some(cb) = &callbacks.on_candle {
                    cb(candle);
                }
                if let Some(cb) = &callbacks.on_candle_with_symbol {
                    cb(&msg.symbol, candle);
                }
            }
        } else if kind.contains("l2_orderbook") || msg.channel.contains("l2_orderbook") {
            if let Some(cb) = &callbacks.on_orderbook {
                cb(msg.data);
            }
        } else if kind.contains("funding_rate") || msg.channel.contains("funding_rate") {
            if let Some(cb) = &callbacks.on_funding_rate {
                if let Ok(update) = serde_json::from_value::<FundingRateUpdate>(msg.data) {
                    cb(update);
                }
            }
        } else if msg.msg_type == "subscribed" {
            info!("STREAM: subscribed to {}", msg.channel);
        } else if msg.msg_type == "error" {
            warn!("STREAM: server error: {text}");
            if let Some(cb) = &callbacks.on_error {
                cb(text.to_string());
            }
        }
    }

    fn emit_error(&self, message: String) {
        let callbacks = self.callbacks.lock().expect("callbacks poisoned");
        if let Some(cb) = &callbacks.on_error {
            cb(message);
        }
    }
}

/// Subscription frame: symbols may be a list or the literal "all".
fn subscribe_payload(sub: &Subscription) -> Value {
    let symbols: Value = if sub.symbols.is_empty() {
        Value::String("all".to_string())
    } else {
        json!(sub.symbols)
    };

    json!({
        "type": "subscribe",
        "payload": {
            "channels": [
                { "name": sub.name, "symbols": symbols }
            ]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn subscriptions_deduplicate() {
        let client = StreamClient::new("wss://example.invalid");
        client.subscribe("v2/ticker", &["BTCUSD"]).await;
        client.subscribe("v2/ticker", &["BTCUSD"]).await;
        client.subscribe("v2/ticker", &["ETHUSD"]).await;
        client.subscribe("l2_orderbook", &["BTCUSD"]).await;

        let subs = client.subscriptions();
        assert_eq!(subs.len(), 3);
    }

    #[tokio::test]
    async fn queued_subscriptions_survive_until_connect() {
        let client = StreamClient::new("wss://example.invalid");
        client.subscribe_candles("BTCUSD", "5m").await;
        let subs = client.subscriptions();
        assert_eq!(subs[0].name, "candlestick_5m");
        assert_eq!(subs[0].symbols, vec!["BTCUSD"]);
        assert!(!client.is_connected());
    }

    #[test]
    fn subscribe_payload_shape() {
        let sub = Subscription {
            name: "v2/ticker".into(),
            symbols: vec!["BTCUSD".into()],
        };
        let payload = subscribe_payload(&sub);
        assert_eq!(payload["type"], "subscribe");
        assert_eq!(payload["payload"]["channels"][0]["name"], "v2/ticker");
        assert_eq!(payload["payload"]["channels"][0]["symbols"][0], "BTCUSD");

        let all = Subscription {
            name: "funding_rate".into(),
            symbols: Vec::new(),
        };
        assert_eq!(subscribe_payload(&all)["payload"]["channels"][0]["symbols"], "all");
    }

    #[tokio::test]
    async fn dispatch_routes_by_channel_class() {
        let client = StreamClient::new("wss://example.invalid");
        let ticks = Arc::new(AtomicUsize::new(0));
        let candles = Arc::new(AtomicUsize::new(0));
        let books = Arc::new(AtomicUsize::new(0));

        {
            let ticks = ticks.clone();
            client.on_ticker(move |_| {
                ticks.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let candles = candles.clone();
            client.on_candle_with_symbol(move |symbol, _| {
                assert_eq!(symbol, "BTCUSD");
                candles.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let books = books.clone();
            client.on_orderbook(move |_| {
                books.fetch_add(1, Ordering::SeqCst);
            });
        }

        client.inner.dispatch(
            r#"{"type":"v2/ticker","symbol":"BTCUSD","data":{"symbol":"BTCUSD","close":"50000"}}"#,
        );
        client.inner.dispatch(
            r#"{"type":"candlestick_5m","symbol":"BTCUSD","data":{"time":1,"open":1.0,"high":1.0,"low":1.0,"close":1.0,"volume":0.0}}"#,
        );
        client
            .inner
            .dispatch(r#"{"type":"l2_orderbook","symbol":"BTCUSD","data":{"buy":[],"sell":[]}}"#);

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert_eq!(candles.load(Ordering::SeqCst), 1);
        assert_eq!(books.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let client = StreamClient::new("wss://example.invalid");
        client.close();
        client.close();
        assert!(!client.is_connected());
    }
}
