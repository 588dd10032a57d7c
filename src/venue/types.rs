// Wire types for the venue REST and stream surfaces.
// Numeric fields the venue encodes as strings stay strings at the edge;
// flexible deserializers cover the endpoints that send either form.

use serde::{Deserialize, Deserializer, Serialize};

/// Categorical market state used for strategy selection and risk scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    #[serde(rename = "bull")]
    Bull,
    #[serde(rename = "bear")]
    Bear,
    #[serde(rename = "ranging")]
    Ranging,
    #[serde(rename = "high_volatility", alias = "high_vol")]
    HighVol,
    #[serde(rename = "low_volatility", alias = "low_vol")]
    LowVol,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Bull => "bull",
            Regime::Bear => "bear",
            Regime::Ranging => "ranging",
            Regime::HighVol => "high_volatility",
            Regime::LowVol => "low_volatility",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Asset {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub precision: i32,
}

/// A tradable instrument (perpetual or dated future).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub symbol: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub tick_size: String,
    #[serde(default)]
    pub contract_value: String,
    #[serde(default)]
    pub initial_margin: String,
    #[serde(default)]
    pub maintenance_margin: String,
    #[serde(default)]
    pub settling_asset: Asset,
    #[serde(default)]
    pub quoting_asset: Asset,
    #[serde(default, rename = "maker_commission_rate")]
    pub maker_commission: String,
    #[serde(default, rename = "taker_commission_rate")]
    pub taker_commission: String,
    #[serde(default)]
    pub is_active: bool,
}

/// Fixture product used by the backtest and unit tests when live metadata is
/// unavailable. Contract values match the venue's listed perps.
pub fn mock_product(symbol: &str) -> Product {
    let (contract_value, tick_size) = match symbol {
        "BTCUSD" | "BTCINR" => ("0.001", "0.5"),
        "ETHUSD" | "ETHINR" => ("0.01", "0.05"),
        "SOLUSD" | "SOLINR" => ("1", "0.01"),
        _ => ("1", "0.01"),
    };
    Product {
        id: 1,
        symbol: symbol.to_string(),
        product_type: "perpetual_futures".to_string(),
        tick_size: tick_size.to_string(),
        contract_value: contract_value.to_string(),
        initial_margin: "1".to_string(),
        maintenance_margin: "0.5".to_string(),
        maker_commission: "0.0002".to_string(),
        taker_commission: "0.0005".to_string(),
        is_active: true,
        ..Default::default()
    }
}

/// Real-time ticker snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    #[serde(default)]
    pub product_id: i64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub close: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub high: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub low: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub open: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub mark_price: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub timestamp: i64,
    /// 8-hour funding rate for perpetuals; annualized as rate * 3 * 365.
    #[serde(default, deserialize_with = "flexible_f64")]
    pub funding_rate: f64,
}

/// OHLCV bar; timestamp is venue epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderbookLevel {
    #[serde(default)]
    pub depth: String,
    pub price: String,
    pub size: i64,
}

impl OrderbookLevel {
    pub fn price_f64(&self) -> f64 {
        self.price.parse().unwrap_or(0.0)
    }
}

/// L2 orderbook snapshot; `buy` is best-first descending, `sell` ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Orderbook {
    #[serde(default)]
    pub buy: Vec<OrderbookLevel>,
    #[serde(default)]
    pub sell: Vec<OrderbookLevel>,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub last_updated_at: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BestBidAsk {
    pub best_bid: f64,
    pub best_ask: f64,
    pub best_bid_size: i64,
    pub best_ask_size: i64,
    pub spread: f64,
    pub spread_pct: f64,
}

/// An order as reported by the venue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub unfilled_size: i64,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub limit_price: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub product_id: i64,
    #[serde(default)]
    pub product_symbol: String,
}

impl Order {
    pub fn filled_size(&self) -> i64 {
        self.size - self.unfilled_size
    }
}

/// Order intent sent to the venue. Bracket prices attach protective SL/TP
/// legs covering the resulting position.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_symbol: Option<String>,
    pub size: i64,
    pub side: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub order_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub limit_price: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub time_in_force: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub post_only: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reduce_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bracket_stop_loss_price: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bracket_stop_loss_limit_price: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bracket_take_profit_price: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bracket_take_profit_limit_price: String,
}

impl OrderRequest {
    pub fn has_bracket(&self) -> bool {
        !self.bracket_stop_loss_price.is_empty() || !self.bracket_take_profit_price.is_empty()
    }
}

/// A margined position as reported by the venue. Positive size is long.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub entry_price: String,
    #[serde(default)]
    pub margin: String,
    #[serde(default)]
    pub liquidation_price: String,
    #[serde(default)]
    pub realized_pnl: String,
    #[serde(default)]
    pub unrealized_pnl: String,
    #[serde(default)]
    pub realized_funding: String,
    #[serde(default)]
    pub product_id: i64,
    #[serde(default)]
    pub product_symbol: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Wallet {
    #[serde(default)]
    pub asset_id: i64,
    #[serde(default)]
    pub asset_symbol: String,
    #[serde(default)]
    pub available_balance: String,
    #[serde(default)]
    pub balance: String,
    #[serde(default)]
    pub blocked_margin: String,
    #[serde(default)]
    pub position_margin: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletMeta {
    #[serde(default)]
    pub net_equity: String,
}

/// Funding rate push message from the stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingRateUpdate {
    #[serde(default)]
    pub symbol: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub funding_rate: f64,
    #[serde(default)]
    pub timestamp: i64,
}

/// Accepts a JSON number, a numeric string, or null.
pub fn flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(f64),
        Str(String),
        Null,
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => Ok(s.parse().unwrap_or(0.0)),
        NumOrString::Null => Ok(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_parses_string_and_numeric_fields() {
        let json = r#"{"symbol":"BTCUSD","close":"50000.5","mark_price":50001.0,"funding_rate":"0.0001","volume":12.5}"#;
        let t: Ticker = serde_json::from_str(json).unwrap();
        assert_eq!(t.close, 50000.5);
        assert_eq!(t.mark_price, 50001.0);
        assert_eq!(t.funding_rate, 0.0001);
    }

    #[test]
    fn order_filled_size_is_size_minus_unfilled() {
        let order = Order {
            size: 10,
            unfilled_size: 4,
            ..Default::default()
        };
        assert_eq!(order.filled_size(), 6);
    }

    #[test]
    fn order_request_omits_empty_fields() {
        let req = OrderRequest {
            product_id: Some(1),
            size: 5,
            side: "buy".into(),
            order_type: "market_order".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("limit_price"));
        assert!(!json.contains("bracket_stop_loss_price"));
        assert!(!json.contains("reduce_only"));
    }

    #[test]
    fn regime_serde_round_trip() {
        let r: Regime = serde_json::from_str("\"high_volatility\"").unwrap();
        assert_eq!(r, Regime::HighVol);
        let r: Regime = serde_json::from_str("\"high_vol\"").unwrap();
        assert_eq!(r, Regime::HighVol);
    }
}
