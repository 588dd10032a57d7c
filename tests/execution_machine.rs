// Execution state-machine tests against a scripted venue: rejection never
// falls back to market, partial fills drop the bracket from the market
// remainder, and a fill discovered during cancel confirmation wins.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use perpbot::execution::{ExecutionEngine, OrderApi};
use perpbot::venue::error::VenueError;
use perpbot::venue::types::{mock_product, BestBidAsk, Order, OrderRequest, Product};

/// A venue whose order lifecycle is scripted per test: one state before the
/// cancel request arrives and one after.
struct ScriptedVenue {
    placed: Mutex<Vec<OrderRequest>>,
    cancels: AtomicUsize,
    next_id: AtomicI64,
    limit_size: i64,
    pre_cancel_state: String,
    post_cancel_state: String,
    post_cancel_unfilled: i64,
}

impl ScriptedVenue {
    fn new(pre: &str, post: &str, post_unfilled: i64) -> Arc<Self> {
        Arc::new(Self {
            placed: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            next_id: AtomicI64::new(1),
            limit_size: 10,
            pre_cancel_state: pre.to_string(),
            post_cancel_state: post.to_string(),
            post_cancel_unfilled: post_unfilled,
        })
    }

    fn placed_orders(&self) -> Vec<OrderRequest> {
        self.placed.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderApi for ScriptedVenue {
    async fn place_order(&self, req: &OrderRequest) -> Result<Order, VenueError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.placed.lock().unwrap().push(req.clone());
        Ok(Order {
            id,
            size: req.size,
            unfilled_size: req.size,
            side: req.side.clone(),
            order_type: req.order_type.clone(),
            state: "open".to_string(),
            ..Default::default()
        })
    }

    async fn cancel_order(&self, _order_id: i64, _product_id: i64) -> Result<(), VenueError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_order(&self, order_id: i64) -> Result<Order, VenueError> {
        let cancelled = self.cancels.load(Ordering::SeqCst) > 0;
        let (state, unfilled) = if cancelled {
            (self.post_cancel_state.clone(), self.post_cancel_unfilled)
        } else {
            (self.pre_cancel_state.clone(), self.limit_size)
        };
        Ok(Order {
            id: order_id,
            size: self.limit_size,
            unfilled_size: unfilled,
            state,
            ..Default::default()
        })
    }

    async fn best_bid_ask(&self, _symbol: &str) -> Result<BestBidAsk, VenueError> {
        Ok(BestBidAsk {
            best_bid: 49_999.5,
            best_ask: 50_000.5,
            best_bid_size: 5,
            best_ask_size: 5,
            spread: 1.0,
            spread_pct: 0.002,
        })
    }

    async fn get_product(&self, symbol: &str) -> Result<Product, VenueError> {
        Ok(mock_product(symbol))
    }
}

fn bracketed_request() -> OrderRequest {
    OrderRequest {
        product_id: Some(1),
        size: 10,
        side: "buy".to_string(),
        bracket_stop_loss_price: "49000.0".to_string(),
        bracket_take_profit_price: "52000.0".to_string(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn rejection_returns_typed_error_without_market_fallback() {
    let venue = ScriptedVenue::new("rejected", "rejected", 10);
    let engine = ExecutionEngine::new(venue.clone());

    let err = engine
        .place_limit_with_fallback(&bracketed_request(), "BTCUSD", 1)
        .await
        .unwrap_err();

    assert!(
        matches!(err, VenueError::OrderRejected { .. }),
        "got {err:?}"
    );
    // Only the limit leg ever reached the venue.
    assert_eq!(venue.placed_orders().len(), 1);
    assert_eq!(venue.cancels.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn partial_fill_market_remainder_carries_no_bracket() {
    // Limit sits open until the timeout; the cancel confirms with 6 of 10
    // contracts filled.
    let venue = ScriptedVenue::new("open", "cancelled", 4);
    let engine = ExecutionEngine::new(venue.clone());

    let order = engine
        .place_limit_with_fallback(&bracketed_request(), "BTCUSD", 1)
        .await
        .unwrap();

    let placed = venue.placed_orders();
    assert_eq!(placed.len(), 2, "limit then market");

    let market = &placed[1];
    assert_eq!(market.order_type, "market_order");
    assert_eq!(market.size, 4, "market order covers only the remainder");
    assert!(market.bracket_stop_loss_price.is_empty());
    assert!(market.bracket_take_profit_price.is_empty());
    assert_eq!(order.size, 4);
}

#[tokio::test(start_paused = true)]
async fn zero_fill_market_fallback_keeps_the_bracket() {
    let venue = ScriptedVenue::new("open", "cancelled", 10);
    let engine = ExecutionEngine::new(venue.clone());

    engine
        .place_limit_with_fallback(&bracketed_request(), "BTCUSD", 1)
        .await
        .unwrap();

    let placed = venue.placed_orders();
    assert_eq!(placed.len(), 2);

    let market = &placed[1];
    assert_eq!(market.size, 10);
    assert_eq!(market.bracket_stop_loss_price, "49000.0");
    assert_eq!(market.bracket_take_profit_price, "52000.0");
}

#[tokio::test(start_paused = true)]
async fn fill_during_cancel_confirmation_wins() {
    // The order fills in the race between timeout and cancel.
    let venue = ScriptedVenue::new("open", "filled", 0);
    let engine = ExecutionEngine::new(venue.clone());

    let order = engine
        .place_limit_with_fallback(&bracketed_request(), "BTCUSD", 1)
        .await
        .unwrap();

    assert_eq!(order.state, "filled");
    // No replacement was placed.
    assert_eq!(venue.placed_orders().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn indeterminate_cancel_refuses_replacement() {
    // Still open after the cancel window: replacement is unsafe.
    let venue = ScriptedVenue::new("open", "open", 10);
    let engine = ExecutionEngine::new(venue.clone());

    let err = engine
        .place_limit_with_fallback(&bracketed_request(), "BTCUSD", 1)
        .await
        .unwrap_err();

    assert!(matches!(err, VenueError::UnsafeReplace { .. }), "got {err:?}");
    assert_eq!(venue.placed_orders().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn aggressive_buy_prices_at_top_of_book() {
    let venue = ScriptedVenue::new("filled", "filled", 0);
    let engine = ExecutionEngine::new(venue.clone());

    engine
        .place_limit_with_fallback(&bracketed_request(), "BTCUSD", 1)
        .await
        .unwrap();

    let placed = venue.placed_orders();
    let limit = &placed[0];
    assert_eq!(limit.order_type, "limit_order");
    assert_eq!(limit.time_in_force, "gtc");
    // ask * (1 - 0.01%) dips below the bid, so the price floors at the best
    // bid and rounds down onto the 0.5 tick grid.
    assert_eq!(limit.limit_price, "49999.5");
}

#[tokio::test(start_paused = true)]
async fn close_position_is_reduce_only_opposite_side() {
    let venue = ScriptedVenue::new("filled", "filled", 0);
    let engine = ExecutionEngine::new(venue.clone());

    engine
        .close_position("BTCUSD", 1, 5, "buy")
        .await
        .unwrap();

    let placed = venue.placed_orders();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].side, "sell");
    assert!(placed[0].reduce_only);
    assert_eq!(placed[0].size, 5);
}
