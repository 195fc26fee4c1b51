//! In-memory position cache mirroring exchange state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::exchange::{Exchange, Position};

const CHANNEL_CAPACITY: usize = 100;

/// Mirrors venue positions and publishes changes to subscribers.
pub struct PositionManager {
    exchange: Arc<dyn Exchange>,
    cache: RwLock<HashMap<String, Position>>,
    subs: RwLock<HashMap<String, mpsc::Sender<Position>>>,
}

impl PositionManager {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange,
            cache: RwLock::new(HashMap::new()),
            subs: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to position changes. Re-registering the same id replaces the
    /// previous subscription.
    pub async fn subscribe(&self, id: &str) -> mpsc::Receiver<Position> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if self.subs.write().await.insert(id.to_string(), tx).is_some() {
            debug!(subscriber = %id, "Replaced existing position subscription");
        }
        rx
    }

    /// Cached position for a symbol.
    pub async fn get(&self, symbol: &str) -> Option<Position> {
        self.cache.read().await.get(symbol).cloned()
    }

    /// All cached open positions.
    pub async fn all(&self) -> Vec<Position> {
        self.cache.read().await.values().cloned().collect()
    }

    /// Pull venue state and publish every change. A closed position is
    /// published once as a zero-size update so consumers can drop it.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<()> {
        let fresh = self
            .exchange
            .get_positions()
            .await
            .context("Position reconcile failed")?;

        let mut changed = Vec::new();
        {
            let mut cache = self.cache.write().await;
            let mut seen: HashMap<String, Position> = HashMap::with_capacity(fresh.len());

            for pos in fresh {
                let dirty = cache
                    .get(&pos.symbol)
                    .map(|old| {
                        old.size != pos.size
                            || old.entry_price != pos.entry_price
                            || old.mark_price != pos.mark_price
                            || old.leverage != pos.leverage
                    })
                    .unwrap_or(true);
                if dirty {
                    changed.push(pos.clone());
                }
                seen.insert(pos.symbol.clone(), pos);
            }

            // Positions gone from the venue are flat now
            for (symbol, old) in cache.iter() {
                if !seen.contains_key(symbol) {
                    let mut closed = old.clone();
                    closed.size = rust_decimal::Decimal::ZERO;
                    closed.unrealized_pnl = rust_decimal::Decimal::ZERO;
                    closed.updated_at = now;
                    changed.push(closed);
                }
            }

            *cache = seen;
        }

        if !changed.is_empty() {
            debug!(count = changed.len(), "Position cache updated");
            let subs = self.subs.read().await;
            for pos in &changed {
                for (id, tx) in subs.iter() {
                    if tx.try_send(pos.clone()).is_err() {
                        debug!(subscriber = %id, "Position channel full, dropping update");
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconciler loop; errors are logged and the next tick re-reads.
    pub async fn run(
        self: Arc<Self>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        info!(interval_secs, "Position reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile(Utc::now()).await {
                        warn!(error = %e, "Position reconcile iteration skipped");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Position reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MarginType, MockExchange, PositionSide};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, size: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::from_size(size),
            size,
            entry_price: dec!(100),
            mark_price: dec!(100),
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            leverage: 10,
            margin_type: MarginType::Cross,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_publishes_new_positions() {
        let mut exchange = MockExchange::new();
        exchange
            .expect_get_positions()
            .returning(|| Ok(vec![position("BTCUSDT", dec!(1))]));

        let mgr = PositionManager::new(Arc::new(exchange));
        let mut rx = mgr.subscribe("test").await;

        mgr.reconcile(Utc::now()).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().symbol, "BTCUSDT");
        assert!(mgr.get("BTCUSDT").await.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_skips_unchanged() {
        let mut exchange = MockExchange::new();
        exchange
            .expect_get_positions()
            .returning(|| Ok(vec![position("BTCUSDT", dec!(1))]));

        let mgr = PositionManager::new(Arc::new(exchange));
        let mut rx = mgr.subscribe("test").await;

        mgr.reconcile(Utc::now()).await.unwrap();
        assert!(rx.try_recv().is_ok());

        mgr.reconcile(Utc::now()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconcile_flags_closed_positions() {
        let mut exchange = MockExchange::new();
        let mut first = true;
        exchange.expect_get_positions().returning(move || {
            if first {
                first = false;
                Ok(vec![position("BTCUSDT", dec!(1))])
            } else {
                Ok(vec![])
            }
        });

        let mgr = PositionManager::new(Arc::new(exchange));
        let mut rx = mgr.subscribe("test").await;

        mgr.reconcile(Utc::now()).await.unwrap();
        rx.try_recv().unwrap();

        mgr.reconcile(Utc::now()).await.unwrap();
        let closed = rx.try_recv().unwrap();
        assert_eq!(closed.size, Decimal::ZERO);
        assert!(mgr.get("BTCUSDT").await.is_none());
    }
}
