// Order execution: aggressive limit with market fallback.
//
// The state machine distinguishes venue rejection (typed, never falls back)
// from timeout (cancel-confirm, then market for the unfilled remainder).
// When any contracts filled on the limit leg, the market remainder carries
// no bracket prices; the original bracket already covers the filled part.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::time::{sleep, Instant};

use crate::strategy::opposite_side;
use crate::venue::client::Client;
use crate::venue::conversions::{round_to_tick, RoundDirection};
use crate::venue::error::VenueError;
use crate::venue::types::{BestBidAsk, Order, OrderRequest, Product};

const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);
const CANCEL_CONFIRM_WINDOW: Duration = Duration::from_secs(2);
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 3;
const AGGRESSIVE_OFFSET_PCT: f64 = 0.01;

/// The slice of the venue surface the execution engine drives. The live
/// client implements it; tests script it.
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<Order, VenueError>;
    async fn cancel_order(&self, order_id: i64, product_id: i64) -> Result<(), VenueError>;
    async fn get_order(&self, order_id: i64) -> Result<Order, VenueError>;
    async fn best_bid_ask(&self, symbol: &str) -> Result<BestBidAsk, VenueError>;
    async fn get_product(&self, symbol: &str) -> Result<Product, VenueError>;
}

#[async_trait]
impl OrderApi for Client {
    async fn place_order(&self, req: &OrderRequest) -> Result<Order, VenueError> {
        Client::place_order(self, req).await
    }

    async fn cancel_order(&self, order_id: i64, product_id: i64) -> Result<(), VenueError> {
        Client::cancel_order(self, order_id, product_id).await
    }

    async fn get_order(&self, order_id: i64) -> Result<Order, VenueError> {
        Client::get_order(self, order_id).await
    }

    async fn best_bid_ask(&self, symbol: &str) -> Result<BestBidAsk, VenueError> {
        Client::get_best_bid_ask(self, symbol).await
    }

    async fn get_product(&self, symbol: &str) -> Result<Product, VenueError> {
        Client::get_product(self, symbol).await
    }
}

pub struct ExecutionEngine {
    api: Arc<dyn OrderApi>,
}

impl ExecutionEngine {
    pub fn new(api: Arc<dyn OrderApi>) -> Self {
        Self { api }
    }

    /// Places a limit order priced to nearly cross the spread: buys at
    /// best ask less a small offset (floored at best bid), sells mirrored.
    /// Rounding never crosses the intended price.
    pub async fn place_aggressive_limit(
        &self,
        req: &OrderRequest,
        symbol: &str,
        offset_pct: f64,
    ) -> Result<Order, VenueError> {
        let bba = self.api.best_bid_ask(symbol).await?;
        let product = self.api.get_product(symbol).await?;

        let (limit_price, direction) = if req.side == "buy" {
            let mut price = bba.best_ask * (1.0 - offset_pct / 100.0);
            if price < bba.best_bid {
                price = bba.best_bid;
            }
            (price, RoundDirection::Down)
        } else {
            let mut price = bba.best_bid * (1.0 + offset_pct / 100.0);
            if price > bba.best_ask {
                price = bba.best_ask;
            }
            (price, RoundDirection::Up)
        };

        let mut aggressive = req.clone();
        aggressive.limit_price = round_to_tick(limit_price, &product.tick_size, direction);
        aggressive.order_type = "limit_order".to_string();
        aggressive.time_in_force = "gtc".to_string();

        self.api.place_order(&aggressive).await
    }

    /// Polls the order until `filled` or the timeout elapses.
    ///
    /// Returns `Ok(None)` on timeout. Rejection and cancellation surface as
    /// typed errors; states outside the known set are unexpected-state
    /// errors. Up to three consecutive transient poll errors are tolerated.
    pub async fn wait_for_fill(
        &self,
        order_id: i64,
        timeout_secs: u64,
    ) -> Result<Option<Order>, VenueError> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let mut consecutive_errors = 0u32;
        let mut last_order: Option<Order> = None;

        while Instant::now() < deadline {
            let order = match self.api.get_order(order_id).await {
                Ok(order) => order,
                Err(err) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                        return Err(err);
                    }
                    sleep(FILL_POLL_INTERVAL).await;
                    continue;
                }
            };
            consecutive_errors = 0;

            match order.state.as_str() {
                "filled" => return Ok(Some(order)),
                "cancelled" => return Err(VenueError::OrderCancelled { order_id }),
                "rejected" => {
                    return Err(VenueError::OrderRejected {
                        order_id,
                        reason: "order rejected by exchange".to_string(),
                    })
                }
                "open" | "pending" | "partially_filled" => {}
                state => {
                    return Err(VenueError::UnexpectedOrderState {
                        order_id,
                        state: state.to_string(),
                    })
                }
            }

            last_order = Some(order);
            sleep(FILL_POLL_INTERVAL).await;
        }

        // Final check to catch a fill at the last moment.
        if let Ok(order) = self.api.get_order(order_id).await {
            if order.state == "filled" {
                return Ok(Some(order));
            }
            last_order = Some(order);
        }

        if let Some(order) = last_order {
            if order.state == "filled" {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    /// Requests cancel, then polls until a terminal state appears or the 2 s
    /// window closes. Returns the final order view and whether a replacement
    /// order is safe to place.
    pub async fn wait_for_cancel_confirmation(
        &self,
        order_id: i64,
        product_id: i64,
    ) -> (Option<Order>, bool) {
        let _ = self.api.cancel_order(order_id, product_id).await;

        let deadline = Instant::now() + CANCEL_CONFIRM_WINDOW;
        while Instant::now() < deadline {
            match self.api.get_order(order_id).await {
                Ok(order) if order.state == "filled" => return (Some(order), false),
                Ok(order) if order.state == "cancelled" => return (Some(order), true),
                _ => {}
            }
            sleep(CANCEL_POLL_INTERVAL).await;
        }

        match self.api.get_order(order_id).await {
            Ok(order) if order.state == "filled" => (Some(order), false),
            Ok(order) if order.state == "cancelled" => (Some(order), true),
            // Still active after a cancel attempt: indeterminate, refuse to
            // replace.
            Ok(order) => (Some(order), false),
            Err(_) => (None, false),
        }
    }

    /// Aggressive limit with market fallback.
    pub async fn place_limit_with_fallback(
        &self,
        req: &OrderRequest,
        symbol: &str,
        timeout_secs: u64,
    ) -> Result<Order, VenueError> {
        let has_bracket = req.has_bracket();
        let original = req.clone();

        let limit_order = match self
            .place_aggressive_limit(req, symbol, AGGRESSIVE_OFFSET_PCT)
            .await
        {
            Ok(order) => order,
            Err(err) => {
                // The limit leg never reached the book; go straight to
                // market with the original bracket intact.
                warn!("EXEC: limit placement failed ({err}), sending market order");
                return self.api.place_order(&market_request(&original, original.size, true)).await;
            }
        };

        match self.wait_for_fill(limit_order.id, timeout_secs).await {
            Ok(Some(filled)) => Ok(filled),
            Err(err) if err.is_rejection() => {
                // Exchange said no. Never replace a rejection with a market
                // order.
                Err(err)
            }
            Err(err) => {
                warn!("EXEC: fill wait failed ({err}), cancelling order {}", limit_order.id);
                let (final_order, safe) = self
                    .wait_for_cancel_confirmation(limit_order.id, order_product_id(&original))
                    .await;
                if let Some(order) = &final_order {
                    if order.state == "filled" {
                        return Ok(order.clone());
                    }
                }
                if !safe {
                    return Err(VenueError::UnsafeReplace {
                        order_id: limit_order.id,
                        reason: err.to_string(),
                    });
                }
                // Nothing filled; market order for the full size with
                // brackets reattached.
                self.api.place_order(&market_request(&original, original.size, true)).await
            }
            Ok(None) => {
                let (final_order, safe) = self
                    .wait_for_cancel_confirmation(limit_order.id, order_product_id(&original))
                    .await;
                if let Some(order) = &final_order {
                    if order.state == "filled" {
                        return Ok(order.clone());
                    }
                }
                if !safe {
                    return Err(VenueError::UnsafeReplace {
                        order_id: limit_order.id,
                        reason: "order still active after cancel timeout".to_string(),
                    });
                }

                let (filled_qty, remaining) = match &final_order {
                    Some(order) => (order.filled_size(), order.unfilled_size),
                    None => (0, original.size),
                };

                if remaining <= 0 {
                    // Everything filled during the cancel race.
                    return final_order.ok_or(VenueError::Transport(
                        "order vanished during cancel confirmation".to_string(),
                    ));
                }

                // Reattach the bracket only when nothing filled; a partial
                // fill already carries protection from the original order.
                let with_bracket = filled_qty == 0 && has_bracket;
                info!(
                    "EXEC: market fallback for {remaining} contracts (filled {filled_qty}, bracket: {with_bracket})"
                );
                self.api
                    .place_order(&market_request(&original, remaining, with_bracket))
                    .await
            }
        }
    }

    /// Closes a position with a reduce-only order on the opposite side,
    /// driven through the same fill-or-fallback machine.
    pub async fn close_position(
        &self,
        symbol: &str,
        product_id: i64,
        size: i64,
        position_side: &str,
    ) -> Result<Order, VenueError> {
        let req = OrderRequest {
            product_id: Some(product_id),
            size,
            side: opposite_side(position_side).to_string(),
            reduce_only: true,
            ..Default::default()
        };
        self.place_limit_with_fallback(&req, symbol, 3).await
    }
}

fn order_product_id(req: &OrderRequest) -> i64 {
    req.product_id.unwrap_or(0)
}

/// The market-order version of a request, optionally carrying the original
/// bracket prices.
fn market_request(original: &OrderRequest, size: i64, with_bracket: bool) -> OrderRequest {
    let mut req = OrderRequest {
        product_id: original.product_id,
        product_symbol: original.product_symbol.clone(),
        size,
        side: original.side.clone(),
        order_type: "market_order".to_string(),
        reduce_only: original.reduce_only,
        ..Default::default()
    };
    if with_bracket {
        req.bracket_stop_loss_price = original.bracket_stop_loss_price.clone();
        req.bracket_stop_loss_limit_price = original.bracket_stop_loss_limit_price.clone();
        req.bracket_take_profit_price = original.bracket_take_profit_price.clone();
        req.bracket_take_profit_limit_price = original.bracket_take_profit_limit_price.clone();
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_request_strips_bracket_when_asked() {
        let original = OrderRequest {
            product_id: Some(7),
            size: 10,
            side: "buy".to_string(),
            bracket_stop_loss_price: "49000".to_string(),
            bracket_take_profit_price: "52000".to_string(),
            ..Default::default()
        };

        let stripped = market_request(&original, 4, false);
        assert_eq!(stripped.size, 4);
        assert_eq!(stripped.order_type, "market_order");
        assert!(stripped.bracket_stop_loss_price.is_empty());
        assert!(stripped.bracket_take_profit_price.is_empty());

        let kept = market_request(&original, 10, true);
        assert_eq!(kept.bracket_stop_loss_price, "49000");
        assert_eq!(kept.bracket_take_profit_price, "52000");
    }
}
