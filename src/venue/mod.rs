// Venue REST client: signing, rate limiting, retry, and the typed API surface.

pub mod account;
pub mod auth;
pub mod client;
pub mod conversions;
pub mod error;
pub mod market;
pub mod orders;
pub mod types;

pub use client::{ApiResponse, Client};
pub use conversions::{
    contracts_to_notional, notional_to_contracts, parse_contract_value, round_to_tick,
    RoundDirection,
};
pub use error::VenueError;
pub use types::{
    BestBidAsk, Candle, Order, OrderRequest, Orderbook, OrderbookLevel, Position, Product, Regime,
    Ticker, Wallet, WalletMeta,
};
