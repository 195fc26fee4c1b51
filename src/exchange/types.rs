//! Domain types shared across the risk engine and venue adapters.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side implied by a signed quantity. Zero defaults to long.
    pub fn from_size(size: Decimal) -> Self {
        if size < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Long
        }
    }

    /// Order side that shrinks a position on this side.
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

/// Margin type for positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Cross,
    Isolated,
}

/// A leveraged perpetual position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Signed quantity; negative means short
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub leverage: u8,
    pub margin_type: MarginType,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.size != Decimal::ZERO
    }

    /// Current exposure valued at mark.
    pub fn notional(&self) -> Decimal {
        self.size.abs() * self.mark_price
    }

    /// Margin posted at entry: |size| * entry / leverage.
    pub fn initial_margin(&self) -> Decimal {
        if self.leverage == 0 {
            return Decimal::ZERO;
        }
        self.size.abs() * self.entry_price / Decimal::from(self.leverage)
    }

    /// Margin consumed at the current mark: |size| * mark / leverage.
    pub fn margin_used(&self) -> Decimal {
        if self.leverage == 0 {
            return Decimal::ZERO;
        }
        self.notional() / Decimal::from(self.leverage)
    }

    /// Unrealized PnL at the given mark price. Zero-size positions carry none.
    pub fn unrealized_at(&self, mark: Decimal) -> Decimal {
        if self.size == Decimal::ZERO {
            return Decimal::ZERO;
        }
        match self.side {
            PositionSide::Long => (mark - self.entry_price) * self.size.abs(),
            PositionSide::Short => (self.entry_price - mark) * self.size.abs(),
        }
    }
}

/// Account balance for a single asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

/// A mark-price observation from the venue stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub symbol: String,
    pub mark_price: Decimal,
    pub at: DateTime<Utc>,
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtx,
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// New order request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub new_client_order_id: Option<String>,
}

impl NewOrder {
    /// Reduce-only market order, the only shape defensive actions emit.
    pub fn reduce_only_market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            reduce_only: true,
            new_client_order_id: None,
        }
    }
}

/// Order cancellation request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrder {
    pub symbol: String,
    pub order_id: Option<i64>,
    pub orig_client_order_id: Option<String>,
}

/// Order response from the exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    pub client_order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub reduce_only: bool,
    pub update_time: i64,
}

/// Account-wide margin overview.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginInfo {
    #[serde(with = "rust_decimal::serde::str")]
    pub total_wallet_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_unrealized_profit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_margin_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_maint_margin: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
}

/// Venue risk limits for a symbol.
#[derive(Debug, Clone)]
pub struct SymbolRiskLimit {
    pub symbol: String,
    pub max_leverage: u8,
    pub max_notional: Decimal,
    pub maint_margin_rate: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_btc() -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            size: dec!(1),
            entry_price: dec!(20000),
            mark_price: dec!(19500),
            unrealized_pnl: dec!(-500),
            realized_pnl: Decimal::ZERO,
            leverage: 10,
            margin_type: MarginType::Cross,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_unrealized_long() {
        let pos = long_btc();
        assert_eq!(pos.unrealized_at(dec!(19500)), dec!(-500));
        assert_eq!(pos.unrealized_at(dec!(21000)), dec!(1000));
    }

    #[test]
    fn test_unrealized_short_inverts() {
        let mut pos = long_btc();
        pos.side = PositionSide::Short;
        pos.size = dec!(-1);
        assert_eq!(pos.unrealized_at(dec!(19500)), dec!(500));
        assert_eq!(pos.unrealized_at(dec!(21000)), dec!(-1000));
    }

    #[test]
    fn test_zero_size_has_no_pnl() {
        let mut pos = long_btc();
        pos.size = Decimal::ZERO;
        assert_eq!(pos.unrealized_at(dec!(25000)), Decimal::ZERO);
    }

    #[test]
    fn test_margin_accessors() {
        let pos = long_btc();
        assert_eq!(pos.initial_margin(), dec!(2000));
        assert_eq!(pos.margin_used(), dec!(1950));
        assert_eq!(pos.notional(), dec!(19500));
    }

    #[test]
    fn test_closing_order_side() {
        assert_eq!(PositionSide::Long.closing_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_order_side(), OrderSide::Buy);
    }

    #[test]
    fn test_side_from_size() {
        assert_eq!(PositionSide::from_size(dec!(-2)), PositionSide::Short);
        assert_eq!(PositionSide::from_size(dec!(2)), PositionSide::Long);
    }
}
