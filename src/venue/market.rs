// Market-data endpoints: products, tickers, candles, orderbook.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::client::Client;
use super::error::VenueError;
use super::types::{BestBidAsk, Candle, Orderbook, Product, Ticker};

/// Maps a candle resolution token to its duration.
pub fn resolution_duration(resolution: &str) -> Option<Duration> {
    let secs = match resolution {
        "1m" => 60,
        "5m" => 5 * 60,
        "15m" => 15 * 60,
        "30m" => 30 * 60,
        "1h" => 3600,
        "2h" => 2 * 3600,
        "4h" => 4 * 3600,
        "6h" => 6 * 3600,
        "1d" => 86_400,
        "7d" => 7 * 86_400,
        "30d" => 30 * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

impl Client {
    pub async fn get_products(&self) -> Result<Vec<Product>, VenueError> {
        let resp = self.get("/products", &[]).await?;
        resp.parse_result()
    }

    pub async fn get_product(&self, symbol: &str) -> Result<Product, VenueError> {
        let resp = self.get(&format!("/products/{symbol}"), &[]).await?;
        resp.parse_result()
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, VenueError> {
        let resp = self.get(&format!("/tickers/{symbol}"), &[]).await?;
        resp.parse_result()
    }

    pub async fn get_candles(
        &self,
        symbol: &str,
        resolution: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, VenueError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("resolution", resolution.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
        ];
        let resp = self.get("/history/candles", &query).await?;
        resp.parse_result()
    }

    /// Fetches the last `count` candles by converting the count into a time
    /// range via the resolution duration.
    pub async fn get_recent_candles(
        &self,
        symbol: &str,
        resolution: &str,
        count: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let step = resolution_duration(resolution).unwrap_or(Duration::from_secs(60));
        let end = Utc::now();
        let span = chrono::Duration::from_std(step * count as u32)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let start = end - span;
        self.get_candles(symbol, resolution, start, end).await
    }

    /// Finds a dated-futures product on the same underlying as a perpetual
    /// symbol; used as the hedge leg for funding carry.
    pub async fn get_futures_product_for_perp(
        &self,
        perp_symbol: &str,
    ) -> Result<Product, VenueError> {
        let products = self.get_products().await?;
        products
            .into_iter()
            .find(|p| {
                p.is_active
                    && p.product_type.contains("futures")
                    && !p.product_type.contains("perpetual")
                    && p.symbol.starts_with(perp_symbol)
            })
            .ok_or_else(|| VenueError::Parse {
                reason: format!("no dated futures product found for {perp_symbol}"),
                body: String::new(),
            })
    }

    pub async fn get_orderbook(&self, symbol: &str) -> Result<Orderbook, VenueError> {
        let resp = self.get(&format!("/l2orderbook/{symbol}"), &[]).await?;
        resp.parse_result()
    }

    pub async fn get_best_bid_ask(&self, symbol: &str) -> Result<BestBidAsk, VenueError> {
        let orderbook = self.get_orderbook(symbol).await?;
        best_bid_ask(&orderbook).ok_or_else(|| VenueError::Parse {
            reason: format!("orderbook is empty for {symbol}"),
            body: String::new(),
        })
    }
}

/// Top-of-book view over an orderbook snapshot.
pub fn best_bid_ask(orderbook: &Orderbook) -> Option<BestBidAsk> {
    let bid = orderbook.buy.first()?;
    let ask = orderbook.sell.first()?;
    let best_bid = bid.price_f64();
    let best_ask = ask.price_f64();
    if best_bid <= 0.0 || best_ask <= 0.0 {
        return None;
    }
    let spread = best_ask - best_bid;
    Some(BestBidAsk {
        best_bid,
        best_ask,
        best_bid_size: bid.size,
        best_ask_size: ask.size,
        spread,
        spread_pct: (spread / best_bid) * 100.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::types::OrderbookLevel;

    #[test]
    fn resolution_durations_cover_all_tokens() {
        assert_eq!(resolution_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(resolution_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(resolution_duration("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(resolution_duration("9x"), None);
    }

    #[test]
    fn best_bid_ask_from_snapshot() {
        let ob = Orderbook {
            buy: vec![OrderbookLevel {
                price: "50000".into(),
                size: 3,
                ..Default::default()
            }],
            sell: vec![OrderbookLevel {
                price: "50010".into(),
                size: 2,
                ..Default::default()
            }],
            ..Default::default()
        };
        let bba = best_bid_ask(&ob).unwrap();
        assert_eq!(bba.best_bid, 50_000.0);
        assert_eq!(bba.best_ask, 50_010.0);
        assert_eq!(bba.spread, 10.0);
    }

    #[test]
    fn empty_book_yields_none() {
        assert!(best_bid_ask(&Orderbook::default()).is_none());
    }
}
