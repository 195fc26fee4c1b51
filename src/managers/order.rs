//! Open-order cache mirroring exchange state.
//!
//! Order placement flows through here so the cache sees its own writes
//! before the next reconcile pass confirms them.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::exchange::{Exchange, NewOrder, OrderResponse, OrderStatus};

/// Mirrors venue open orders and fronts order placement.
pub struct OrderManager {
    exchange: Arc<dyn Exchange>,
    open_orders: RwLock<HashMap<String, Vec<OrderResponse>>>,
}

impl OrderManager {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange,
            open_orders: RwLock::new(HashMap::new()),
        }
    }

    /// Place an order on the venue, caching it while it rests.
    pub async fn place_order(&self, order: NewOrder) -> Result<OrderResponse> {
        let response = self
            .exchange
            .place_order(order)
            .await
            .context("Order placement failed")?;

        if response.status == OrderStatus::New
            || response.status == OrderStatus::PartiallyFilled
        {
            self.open_orders
                .write()
                .await
                .entry(response.symbol.clone())
                .or_default()
                .push(response.clone());
        }
        Ok(response)
    }

    /// Cancel all open orders on a symbol, clearing the local cache.
    pub async fn cancel_all(&self, symbol: &str) -> Result<()> {
        self.exchange
            .cancel_all_orders(symbol)
            .await
            .context("Cancel-all failed")?;
        self.open_orders.write().await.remove(symbol);
        Ok(())
    }

    /// Cached open orders for a symbol.
    pub async fn open_orders(&self, symbol: &str) -> Vec<OrderResponse> {
        self.open_orders
            .read()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Pull venue open orders for each symbol. Per-symbol failures are
    /// logged and the remaining symbols still refresh.
    pub async fn reconcile(&self, symbols: &[String]) -> Result<()> {
        for symbol in symbols {
            match self.exchange.get_open_orders(symbol).await {
                Ok(orders) => {
                    self.open_orders
                        .write()
                        .await
                        .insert(symbol.clone(), orders);
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "Open-order reconcile failed for symbol");
                }
            }
        }
        Ok(())
    }

    /// Reconciler loop.
    pub async fn run(
        self: Arc<Self>,
        symbols: Vec<String>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        info!(interval_secs, "Order reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile(&symbols).await {
                        warn!(error = %e, "Order reconcile iteration skipped");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Order reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderSide, PaperExchange};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_limit_order_cached_until_cancel() {
        let venue = Arc::new(PaperExchange::new(dec!(10000)));
        venue.set_price("BTCUSDT", dec!(20000)).await;
        let mgr = OrderManager::new(venue);

        let mut order = NewOrder::reduce_only_market("BTCUSDT", OrderSide::Sell, dec!(1));
        order.reduce_only = false;
        order.order_type = crate::exchange::OrderType::Limit;
        order.price = Some(dec!(25000));
        mgr.place_order(order).await.unwrap();

        assert_eq!(mgr.open_orders("BTCUSDT").await.len(), 1);
        mgr.cancel_all("BTCUSDT").await.unwrap();
        assert!(mgr.open_orders("BTCUSDT").await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_refreshes_cache() {
        let venue = Arc::new(PaperExchange::new(dec!(10000)));
        venue.set_price("BTCUSDT", dec!(20000)).await;
        let mgr = OrderManager::new(venue.clone());

        let mut order = NewOrder::reduce_only_market("BTCUSDT", OrderSide::Sell, dec!(1));
        order.reduce_only = false;
        order.order_type = crate::exchange::OrderType::Limit;
        order.price = Some(dec!(25000));
        venue.place_order(order).await.unwrap();

        assert!(mgr.open_orders("BTCUSDT").await.is_empty());
        mgr.reconcile(&["BTCUSDT".to_string()]).await.unwrap();
        assert_eq!(mgr.open_orders("BTCUSDT").await.len(), 1);
    }
}
