//! Defensive action dispatcher.
//!
//! Consumes `TriggerEvent`s and turns them into exchange calls. Every order
//! is reduce-only on the side opposite the position, so a defensive action
//! can never open or flip exposure. In dry-run mode actions are logged and
//! no exchange call is made.

use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::ValidationError;
use crate::exchange::{Exchange, NewOrder, Position};
use crate::managers::OrderManager;
use crate::monitor::{Severity, TriggerAction, TriggerEvent, TriggerSink};
use crate::pnl::PnlCalculator;

/// The risk executor.
pub struct RiskExecutor {
    exchange: Arc<dyn Exchange>,
    orders: Arc<OrderManager>,
    calculator: Arc<PnlCalculator>,
    symbols: Vec<String>,
    max_reduction_fraction: Decimal,
    dry_run: bool,
    enabled: AtomicBool,
}

impl RiskExecutor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        orders: Arc<OrderManager>,
        calculator: Arc<PnlCalculator>,
        symbols: Vec<String>,
        max_reduction_fraction: Decimal,
        dry_run: bool,
    ) -> Self {
        Self {
            exchange,
            orders,
            calculator,
            symbols,
            max_reduction_fraction,
            dry_run,
            enabled: AtomicBool::new(true),
        }
    }

    /// Whether defensive actions are currently executed.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Re-enable after a stop-trading latch. Operator action only.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        info!("Risk executor re-enabled");
    }

    /// Dispatch one trigger event.
    pub async fn execute(&self, event: &TriggerEvent) -> Result<()> {
        if !self.is_enabled() && event.action != TriggerAction::Alert {
            warn!(event = %event.id, action = event.action.as_str(), "Executor disabled, skipping action");
            return Ok(());
        }

        match event.action {
            TriggerAction::ReducePosition => {
                self.reduce_positions(event.symbol.as_deref(), self.max_reduction_fraction)
                    .await
            }
            TriggerAction::ClosePosition => {
                let symbol = event
                    .symbol
                    .as_deref()
                    .ok_or(ValidationError::SymbolRequired("close_position"))?;
                self.close_position(symbol).await
            }
            TriggerAction::ReduceLeverage => {
                let symbol = event
                    .symbol
                    .as_deref()
                    .ok_or(ValidationError::SymbolRequired("reduce_leverage"))?;
                self.reduce_leverage(symbol).await
            }
            TriggerAction::StopTrading => self.stop_trading(event).await,
            TriggerAction::Alert => {
                info!(
                    event = %event.id,
                    trigger = event.trigger.as_str(),
                    severity = event.severity.as_str(),
                    message = %event.message,
                    "Risk alert"
                );
                Ok(())
            }
        }
    }

    /// Shrink one position, or every open position when no symbol is given.
    /// Per-position failures are logged and the batch continues.
    pub async fn reduce_positions(&self, symbol: Option<&str>, fraction: Decimal) -> Result<()> {
        let positions: Vec<Position> = match symbol {
            Some(sym) => self
                .calculator
                .positions()
                .await
                .into_iter()
                .filter(|p| p.symbol == sym)
                .collect(),
            None => self.calculator.positions().await,
        };

        if positions.is_empty() {
            warn!(symbol = symbol.unwrap_or("*"), "No open positions to reduce");
            return Ok(());
        }

        for position in positions {
            let quantity = position.size.abs() * fraction;
            if let Err(e) = self.place_reduce_only(&position, quantity).await {
                error!(symbol = %position.symbol, error = %e, "Reduce failed, continuing batch");
            }
        }
        Ok(())
    }

    /// Fully close one position with a reduce-only market order.
    pub async fn close_position(&self, symbol: &str) -> Result<()> {
        let position = match self
            .calculator
            .positions()
            .await
            .into_iter()
            .find(|p| p.symbol == symbol)
        {
            Some(p) => p,
            None => {
                warn!(%symbol, "Close requested for a flat symbol");
                return Ok(());
            }
        };
        self.place_reduce_only(&position, position.size.abs()).await
    }

    /// Halve leverage, floored at 1x.
    pub async fn reduce_leverage(&self, symbol: &str) -> Result<()> {
        let current = self
            .calculator
            .positions()
            .await
            .into_iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.leverage)
            .unwrap_or(1);
        let target = (current / 2).max(1);

        if self.dry_run {
            info!(%symbol, current, target, "DRY RUN: reduce leverage");
            return Ok(());
        }

        self.exchange.set_leverage(symbol, target).await?;
        info!(%symbol, current, target, "Leverage reduced");
        Ok(())
    }

    /// Cancel all open orders, close everything on critical severity, then
    /// latch the executor off. Re-enabling requires operator input.
    async fn stop_trading(&self, event: &TriggerEvent) -> Result<()> {
        warn!(
            event = %event.id,
            severity = event.severity.as_str(),
            "STOP TRADING: {}",
            event.message
        );

        for symbol in &self.symbols {
            if self.dry_run {
                info!(%symbol, "DRY RUN: cancel all orders");
                continue;
            }
            if let Err(e) = self.orders.cancel_all(symbol).await {
                error!(%symbol, error = %e, "Cancel-all failed, continuing");
            }
        }

        if event.severity >= Severity::Critical {
            for position in self.calculator.positions().await {
                if let Err(e) = self
                    .place_reduce_only(&position, position.size.abs())
                    .await
                {
                    error!(symbol = %position.symbol, error = %e, "Close-all leg failed, continuing");
                }
            }
        }

        self.enabled.store(false, Ordering::SeqCst);
        warn!("Risk executor latched off");
        Ok(())
    }

    async fn place_reduce_only(&self, position: &Position, quantity: Decimal) -> Result<()> {
        if quantity <= Decimal::ZERO {
            return Ok(());
        }
        let side = position.side.closing_order_side();

        if self.dry_run {
            info!(
                symbol = %position.symbol,
                ?side,
                %quantity,
                "DRY RUN: reduce-only market order"
            );
            return Ok(());
        }

        let order = NewOrder::reduce_only_market(&position.symbol, side, quantity);
        let response = self.orders.place_order(order).await?;
        info!(
            symbol = %position.symbol,
            order_id = response.order_id,
            executed = %response.executed_qty,
            "Defensive order placed"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl TriggerSink for RiskExecutor {
    async fn handle(&self, event: TriggerEvent) -> Result<()> {
        self.execute(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        MarginType, MockExchange, OrderResponse, OrderSide, OrderStatus, OrderType, PaperExchange,
        PositionSide,
    };
    use crate::monitor::TriggerType;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, size: Decimal, entry: Decimal, leverage: u8) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::from_size(size),
            size,
            entry_price: entry,
            mark_price: entry,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            leverage,
            margin_type: MarginType::Cross,
            updated_at: Utc::now(),
        }
    }

    fn event(action: TriggerAction, symbol: Option<&str>, severity: Severity) -> TriggerEvent {
        TriggerEvent::new(
            TriggerType::PositionLoss,
            action,
            symbol.map(String::from),
            dec!(-1200),
            dec!(1000),
            severity,
            "test".to_string(),
            Utc::now(),
        )
    }

    async fn executor_with_paper(
        positions: Vec<Position>,
        dry_run: bool,
    ) -> (Arc<PaperExchange>, Arc<PnlCalculator>, RiskExecutor) {
        let venue = Arc::new(PaperExchange::new(dec!(100000)));
        let calc = Arc::new(PnlCalculator::new());
        let now = Utc::now();
        let mut symbols = Vec::new();
        for pos in positions {
            symbols.push(pos.symbol.clone());
            venue.seed_position(pos.clone()).await;
            calc.update_position(pos, now).await;
        }
        let orders = Arc::new(OrderManager::new(venue.clone()));
        let executor = RiskExecutor::new(
            venue.clone(),
            orders,
            calc.clone(),
            symbols,
            dec!(0.5),
            dry_run,
        );
        (venue, calc, executor)
    }

    #[tokio::test]
    async fn test_reduce_emits_opposite_side_reduce_only() {
        let (venue, _calc, executor) =
            executor_with_paper(vec![position("BTCUSDT", dec!(2), dec!(20000), 10)], false).await;

        executor
            .execute(&event(TriggerAction::ReducePosition, Some("BTCUSDT"), Severity::High))
            .await
            .unwrap();

        let placed = venue.placed_orders().await;
        assert_eq!(placed.len(), 1);
        assert!(placed[0].reduce_only);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(placed[0].quantity, dec!(1)); // 2 * 0.5
    }

    #[tokio::test]
    async fn test_reduce_all_when_symbol_absent() {
        let (venue, _calc, executor) = executor_with_paper(
            vec![
                position("BTCUSDT", dec!(2), dec!(20000), 10),
                position("ETHUSDT", dec!(-10), dec!(3000), 10),
            ],
            false,
        )
        .await;

        executor
            .execute(&event(TriggerAction::ReducePosition, None, Severity::High))
            .await
            .unwrap();

        let placed = venue.placed_orders().await;
        assert_eq!(placed.len(), 2);
        assert!(placed.iter().all(|o| o.reduce_only));
        // Short position reduces with a buy
        let eth = placed.iter().find(|o| o.symbol == "ETHUSDT").unwrap();
        assert_eq!(eth.side, OrderSide::Buy);
        assert_eq!(eth.quantity, dec!(5));
    }

    #[tokio::test]
    async fn test_close_uses_full_size() {
        let (venue, _calc, executor) =
            executor_with_paper(vec![position("BTCUSDT", dec!(2), dec!(20000), 10)], false).await;

        executor
            .execute(&event(TriggerAction::ClosePosition, Some("BTCUSDT"), Severity::High))
            .await
            .unwrap();

        let placed = venue.placed_orders().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].quantity, dec!(2));
        assert!(placed[0].reduce_only);
    }

    #[tokio::test]
    async fn test_close_requires_symbol() {
        let (_venue, _calc, executor) =
            executor_with_paper(vec![position("BTCUSDT", dec!(2), dec!(20000), 10)], false).await;

        let result = executor
            .execute(&event(TriggerAction::ClosePosition, None, Severity::High))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stop_trading_critical_closes_and_latches() {
        let (venue, _calc, executor) = executor_with_paper(
            vec![
                position("BTCUSDT", dec!(1), dec!(20000), 10),
                position("ETHUSDT", dec!(-5), dec!(3000), 10),
            ],
            false,
        )
        .await;

        executor
            .execute(&event(TriggerAction::StopTrading, None, Severity::Critical))
            .await
            .unwrap();

        // Orders cancelled on every symbol, all positions closed, latch set
        assert_eq!(venue.cancel_all_calls().await.len(), 2);
        assert_eq!(venue.placed_orders().await.len(), 2);
        assert!(!executor.is_enabled());

        // Latched: further defensive actions are skipped
        executor
            .execute(&event(TriggerAction::ReducePosition, Some("BTCUSDT"), Severity::High))
            .await
            .unwrap();
        assert_eq!(venue.placed_orders().await.len(), 2);

        executor.enable();
        assert!(executor.is_enabled());
    }

    #[tokio::test]
    async fn test_stop_trading_warning_keeps_positions() {
        let (venue, _calc, executor) =
            executor_with_paper(vec![position("BTCUSDT", dec!(1), dec!(20000), 10)], false).await;

        executor
            .execute(&event(TriggerAction::StopTrading, None, Severity::Warning))
            .await
            .unwrap();

        assert_eq!(venue.cancel_all_calls().await.len(), 1);
        assert!(venue.placed_orders().await.is_empty());
        assert!(!executor.is_enabled());
    }

    #[tokio::test]
    async fn test_dry_run_places_nothing() {
        let (venue, _calc, executor) =
            executor_with_paper(vec![position("BTCUSDT", dec!(2), dec!(20000), 10)], true).await;

        executor
            .execute(&event(TriggerAction::ReducePosition, Some("BTCUSDT"), Severity::High))
            .await
            .unwrap();
        executor
            .execute(&event(TriggerAction::StopTrading, None, Severity::Critical))
            .await
            .unwrap();

        assert!(venue.placed_orders().await.is_empty());
        assert!(venue.cancel_all_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_reduce_leverage_halves_and_floors() {
        let venue = Arc::new(PaperExchange::new(dec!(100000)));
        let calc = Arc::new(PnlCalculator::new());
        let now = Utc::now();
        let pos = position("BTCUSDT", dec!(1), dec!(20000), 10);
        venue.seed_position(pos.clone()).await;
        calc.update_position(pos, now).await;

        let orders = Arc::new(OrderManager::new(venue.clone()));
        let executor = RiskExecutor::new(
            venue.clone(),
            orders,
            calc.clone(),
            vec!["BTCUSDT".to_string()],
            dec!(0.5),
            false,
        );

        executor.reduce_leverage("BTCUSDT").await.unwrap();
        let pos = venue.get_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(pos.leverage, 5);

        // Flat symbol: target floors at 1
        executor.reduce_leverage("XRPUSDT").await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures() {
        let mut exchange = MockExchange::new();
        exchange.expect_place_order().times(2).returning(|order| {
            if order.symbol == "BTCUSDT" {
                anyhow::bail!("venue rejected")
            }
            Ok(OrderResponse {
                order_id: 1,
                symbol: order.symbol.clone(),
                status: OrderStatus::Filled,
                client_order_id: "x".to_string(),
                price: dec!(0),
                avg_price: dec!(3000),
                orig_qty: order.quantity,
                executed_qty: order.quantity,
                side: order.side,
                order_type: OrderType::Market,
                reduce_only: true,
                update_time: 0,
            })
        });
        let exchange = Arc::new(exchange);

        let calc = Arc::new(PnlCalculator::new());
        let now = Utc::now();
        calc.update_position(position("BTCUSDT", dec!(1), dec!(20000), 10), now)
            .await;
        calc.update_position(position("ETHUSDT", dec!(5), dec!(3000), 10), now)
            .await;

        let orders = Arc::new(OrderManager::new(exchange.clone()));
        let executor = RiskExecutor::new(
            exchange,
            orders,
            calc,
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            dec!(0.5),
            false,
        );

        // Both positions attempted despite the first failing
        executor.reduce_positions(None, dec!(0.5)).await.unwrap();
    }
}
