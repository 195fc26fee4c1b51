//! In-memory venue for paper trading and tests.
//!
//! Market orders fill instantly at the current mark price; limit orders rest
//! until cancelled. Reduce-only semantics are enforced the way the live venue
//! does: such orders can only shrink an existing position.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::traits::Exchange;
use super::types::{
    AccountBalance, CancelOrder, MarginInfo, MarginType, NewOrder, OrderResponse, OrderSide,
    OrderStatus, OrderType, Position, PositionSide, SymbolRiskLimit,
};

const QUOTE_ASSET: &str = "USDT";

#[derive(Debug, Default)]
struct PaperState {
    balance: Decimal,
    realized_pnl: Decimal,
    positions: HashMap<String, Position>,
    prices: HashMap<String, Decimal>,
    open_orders: HashMap<i64, OrderResponse>,
}

/// Simulated exchange backed by in-memory state.
pub struct PaperExchange {
    state: RwLock<PaperState>,
    order_id_counter: AtomicI64,
    /// Every order that reached the venue, for test assertions
    placed_orders: RwLock<Vec<NewOrder>>,
    /// Symbols that received a cancel-all, for test assertions
    cancel_all_log: RwLock<Vec<String>>,
}

impl PaperExchange {
    /// Create a paper venue with an initial quote balance.
    pub fn new(initial_balance: Decimal) -> Self {
        let state = PaperState {
            balance: initial_balance,
            ..Default::default()
        };
        Self {
            state: RwLock::new(state),
            order_id_counter: AtomicI64::new(1),
            placed_orders: RwLock::new(Vec::new()),
            cancel_all_log: RwLock::new(Vec::new()),
        }
    }

    /// Set the mark price for a symbol, repricing any open position.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.write().await;
        state.prices.insert(symbol.to_string(), price);
        if let Some(pos) = state.positions.get_mut(symbol) {
            pos.mark_price = price;
            pos.unrealized_pnl = pos.unrealized_at(price);
            pos.updated_at = Utc::now();
        }
    }

    /// Seed an open position directly (test setup / scenario replay).
    pub async fn seed_position(&self, position: Position) {
        let mut state = self.state.write().await;
        state
            .prices
            .insert(position.symbol.clone(), position.mark_price);
        state.positions.insert(position.symbol.clone(), position);
    }

    /// Orders placed so far.
    pub async fn placed_orders(&self) -> Vec<NewOrder> {
        self.placed_orders.read().await.clone()
    }

    /// Symbols that received a cancel-all call.
    pub async fn cancel_all_calls(&self) -> Vec<String> {
        self.cancel_all_log.read().await.clone()
    }

    fn next_order_id(&self) -> i64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn fill_response(order: &NewOrder, order_id: i64, qty: Decimal, price: Decimal) -> OrderResponse {
        OrderResponse {
            order_id,
            symbol: order.symbol.clone(),
            status: OrderStatus::Filled,
            client_order_id: order
                .new_client_order_id
                .clone()
                .unwrap_or_else(|| format!("paper-{}", order_id)),
            price,
            avg_price: price,
            orig_qty: order.quantity,
            executed_qty: qty,
            side: order.side,
            order_type: order.order_type,
            reduce_only: order.reduce_only,
            update_time: Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_account_balances(&self) -> Result<Vec<AccountBalance>> {
        let state = self.state.read().await;
        let unrealized: Decimal = state.positions.values().map(|p| p.unrealized_pnl).sum();
        Ok(vec![AccountBalance {
            asset: QUOTE_ASSET.to_string(),
            total: state.balance,
            available: state.balance,
            locked: Decimal::ZERO,
            unrealized_pnl: unrealized,
            realized_pnl: state.realized_pnl,
        }])
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        Ok(self.state.read().await.positions.get(symbol).cloned())
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect())
    }

    async fn get_symbol_price(&self, symbol: &str) -> Result<Decimal> {
        self.state
            .read()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no price for {}", symbol))
    }

    async fn place_order(&self, order: NewOrder) -> Result<OrderResponse> {
        self.placed_orders.write().await.push(order.clone());

        let order_id = self.next_order_id();
        let mut state = self.state.write().await;
        let mark = state
            .prices
            .get(&order.symbol)
            .copied()
            .ok_or_else(|| anyhow!("no price for {}", order.symbol))?;

        if order.order_type == OrderType::Limit {
            let response = OrderResponse {
                status: OrderStatus::New,
                executed_qty: Decimal::ZERO,
                ..Self::fill_response(&order, order_id, Decimal::ZERO, order.price.unwrap_or(mark))
            };
            state.open_orders.insert(order_id, response.clone());
            return Ok(response);
        }

        if order.reduce_only {
            let pos = state
                .positions
                .get_mut(&order.symbol)
                .filter(|p| p.is_open())
                .ok_or_else(|| anyhow!("reduce-only order with no open position"))?;

            if order.side != pos.side.closing_order_side() {
                return Err(anyhow!("reduce-only order on the wrong side"));
            }

            let open_qty = pos.size.abs();
            let fill_qty = order.quantity.min(open_qty);
            let realized = pos.unrealized_at(mark) * fill_qty / open_qty;

            pos.size = if pos.size > Decimal::ZERO {
                pos.size - fill_qty
            } else {
                pos.size + fill_qty
            };
            pos.unrealized_pnl = pos.unrealized_at(mark);
            pos.updated_at = Utc::now();

            let symbol = order.symbol.clone();
            if !state.positions.get(&symbol).map(Position::is_open).unwrap_or(false) {
                state.positions.remove(&symbol);
            }
            state.balance += realized;
            state.realized_pnl += realized;

            info!(
                symbol = %order.symbol,
                qty = %fill_qty,
                realized = %realized,
                "Paper fill (reduce-only)"
            );
            return Ok(Self::fill_response(&order, order_id, fill_qty, mark));
        }

        // Opening market order: create or extend
        let signed_qty = match order.side {
            OrderSide::Buy => order.quantity,
            OrderSide::Sell => -order.quantity,
        };
        let position = state
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position {
                symbol: order.symbol.clone(),
                side: PositionSide::from_size(signed_qty),
                size: Decimal::ZERO,
                entry_price: mark,
                mark_price: mark,
                unrealized_pnl: Decimal::ZERO,
                realized_pnl: Decimal::ZERO,
                leverage: 10,
                margin_type: MarginType::Cross,
                updated_at: Utc::now(),
            });
        position.size += signed_qty;
        position.side = PositionSide::from_size(position.size);
        position.entry_price = mark;
        position.unrealized_pnl = position.unrealized_at(mark);
        position.updated_at = Utc::now();

        debug!(symbol = %order.symbol, qty = %order.quantity, "Paper fill (open)");
        Ok(Self::fill_response(&order, order_id, order.quantity, mark))
    }

    async fn cancel_order(&self, cancel: CancelOrder) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(id) = cancel.order_id {
            state
                .open_orders
                .remove(&id)
                .ok_or_else(|| anyhow!("unknown order {}", id))?;
        }
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.cancel_all_log.write().await.push(symbol.to_string());
        let mut state = self.state.write().await;
        state.open_orders.retain(|_, o| o.symbol != symbol);
        Ok(())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderResponse>> {
        Ok(self
            .state
            .read()
            .await
            .open_orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<()> {
        if leverage == 0 {
            return Err(anyhow!("leverage must be >= 1"));
        }
        let mut state = self.state.write().await;
        if let Some(pos) = state.positions.get_mut(symbol) {
            pos.leverage = leverage;
            pos.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(pos) = state.positions.get_mut(symbol) {
            pos.margin_type = margin_type;
        }
        Ok(())
    }

    async fn get_margin_info(&self) -> Result<MarginInfo> {
        let state = self.state.read().await;
        let unrealized: Decimal = state.positions.values().map(|p| p.unrealized_pnl).sum();
        let maint: Decimal = state
            .positions
            .values()
            .map(|p| p.notional() * dec!(0.004))
            .sum();
        Ok(MarginInfo {
            total_wallet_balance: state.balance,
            total_unrealized_profit: unrealized,
            total_margin_balance: state.balance + unrealized,
            total_maint_margin: maint,
            available_balance: state.balance,
        })
    }

    async fn get_risk_limits(&self, symbol: &str) -> Result<SymbolRiskLimit> {
        Ok(SymbolRiskLimit {
            symbol: symbol.to_string(),
            max_leverage: 125,
            max_notional: dec!(50_000_000),
            maint_margin_rate: dec!(0.004),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position(symbol: &str, size: Decimal, entry: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::from_size(size),
            size,
            entry_price: entry,
            mark_price: entry,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            leverage: 10,
            margin_type: MarginType::Cross,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reduce_only_shrinks_position() {
        let venue = PaperExchange::new(dec!(10000));
        venue
            .seed_position(long_position("BTCUSDT", dec!(1), dec!(20000)))
            .await;
        venue.set_price("BTCUSDT", dec!(21000)).await;

        let order = NewOrder::reduce_only_market("BTCUSDT", OrderSide::Sell, dec!(0.5));
        let response = venue.place_order(order).await.unwrap();
        assert_eq!(response.executed_qty, dec!(0.5));

        let pos = venue.get_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(pos.size, dec!(0.5));
        // Half of the 1000 gain realized
        let balances = venue.get_account_balances().await.unwrap();
        assert_eq!(balances[0].total, dec!(10500));
    }

    #[tokio::test]
    async fn test_reduce_only_never_flips() {
        let venue = PaperExchange::new(dec!(10000));
        venue
            .seed_position(long_position("BTCUSDT", dec!(1), dec!(20000)))
            .await;

        // Ask for more than the open size; fill clamps at 1.0
        let order = NewOrder::reduce_only_market("BTCUSDT", OrderSide::Sell, dec!(5));
        let response = venue.place_order(order).await.unwrap();
        assert_eq!(response.executed_qty, dec!(1));
        assert!(venue.get_position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reduce_only_wrong_side_rejected() {
        let venue = PaperExchange::new(dec!(10000));
        venue
            .seed_position(long_position("BTCUSDT", dec!(1), dec!(20000)))
            .await;

        let order = NewOrder::reduce_only_market("BTCUSDT", OrderSide::Buy, dec!(0.5));
        assert!(venue.place_order(order).await.is_err());
    }

    #[tokio::test]
    async fn test_reduce_only_without_position_rejected() {
        let venue = PaperExchange::new(dec!(10000));
        venue.set_price("BTCUSDT", dec!(20000)).await;

        let order = NewOrder::reduce_only_market("BTCUSDT", OrderSide::Sell, dec!(1));
        assert!(venue.place_order(order).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_all_clears_symbol_orders() {
        let venue = PaperExchange::new(dec!(10000));
        venue.set_price("BTCUSDT", dec!(20000)).await;

        let mut order = NewOrder::reduce_only_market("BTCUSDT", OrderSide::Sell, dec!(1));
        order.reduce_only = false;
        order.order_type = OrderType::Limit;
        order.price = Some(dec!(25000));
        venue.place_order(order).await.unwrap();

        assert_eq!(venue.get_open_orders("BTCUSDT").await.unwrap().len(), 1);
        venue.cancel_all_orders("BTCUSDT").await.unwrap();
        assert!(venue.get_open_orders("BTCUSDT").await.unwrap().is_empty());
        assert_eq!(venue.cancel_all_calls().await, vec!["BTCUSDT".to_string()]);
    }
}
