//! The exchange capability required by the risk core.
//!
//! Implementations own retries, rate limiting and bounded timeouts; the core
//! never retries on top. Cancellation is structural: callers drop the future
//! when the root shutdown fires.

use async_trait::async_trait;

use super::types::{
    AccountBalance, CancelOrder, MarginInfo, MarginType, NewOrder, OrderResponse, Position,
    SymbolRiskLimit,
};
use rust_decimal::Decimal;

/// Abstract interface to a perpetual futures venue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// All per-asset account balances.
    async fn get_account_balances(&self) -> anyhow::Result<Vec<AccountBalance>>;

    /// The position for a symbol, `None` when flat and unknown to the venue.
    async fn get_position(&self, symbol: &str) -> anyhow::Result<Option<Position>>;

    /// All open positions.
    async fn get_positions(&self) -> anyhow::Result<Vec<Position>>;

    /// Current mark price for a symbol.
    async fn get_symbol_price(&self, symbol: &str) -> anyhow::Result<Decimal>;

    /// Place an order.
    async fn place_order(&self, order: NewOrder) -> anyhow::Result<OrderResponse>;

    /// Cancel a single order.
    async fn cancel_order(&self, cancel: CancelOrder) -> anyhow::Result<()>;

    /// Cancel every open order on a symbol.
    async fn cancel_all_orders(&self, symbol: &str) -> anyhow::Result<()>;

    /// Open orders for a symbol.
    async fn get_open_orders(&self, symbol: &str) -> anyhow::Result<Vec<OrderResponse>>;

    /// Change leverage for a symbol.
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> anyhow::Result<()>;

    /// Change margin type for a symbol.
    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> anyhow::Result<()>;

    /// Account-wide margin overview.
    async fn get_margin_info(&self) -> anyhow::Result<MarginInfo>;

    /// Venue risk limits for a symbol.
    async fn get_risk_limits(&self, symbol: &str) -> anyhow::Result<SymbolRiskLimit>;
}
