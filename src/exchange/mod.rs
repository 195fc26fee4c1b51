//! Exchange capability: venue-agnostic trait, wire types, and adapters.

mod binance;
mod mock;
mod rate_limit;
mod traits;
mod types;
mod websocket;

pub use binance::BinanceFuturesClient;
pub use mock::PaperExchange;
pub use rate_limit::RateLimiter;
pub use traits::Exchange;
#[cfg(test)]
pub use traits::MockExchange;
pub use types::{
    AccountBalance, CancelOrder, MarginInfo, MarginType, NewOrder, OrderResponse, OrderSide,
    OrderStatus, OrderType, Position, PositionSide, SymbolRiskLimit, Ticker, TimeInForce,
};
pub use websocket::TickerStream;
