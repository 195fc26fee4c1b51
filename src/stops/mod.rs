//! Per-symbol protective stop orders.
//!
//! At most one stop is active per `(symbol, kind)` pair. `check` runs on
//! every mark-price update; a triggered stop fires a reduce-only market
//! order through the order manager and is removed only after the order is
//! accepted, so a venue failure retries on the next tick.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ValidationError;
use crate::exchange::{NewOrder, OrderSide};
use crate::managers::OrderManager;

/// Chandelier stops hang three ATRs off the extreme.
const CHANDELIER_ATR_MULTIPLIER: Decimal = dec!(3);
/// Parabolic acceleration factor per tick.
pub const PARABOLIC_ACCELERATION: Decimal = dec!(0.02);

/// Which protective slot a stop occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopKind {
    StopLoss,
    TakeProfit,
}

impl StopKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopKind::StopLoss => "stop_loss",
            StopKind::TakeProfit => "take_profit",
        }
    }
}

/// Trigger style of a stop order.
#[derive(Debug, Clone, PartialEq)]
pub enum StopTrigger {
    /// Static trigger price
    Fixed,
    /// Ratchets with the favorable extreme, trailing by `delta`
    Trailing { delta: Decimal },
    /// Priced off ATR at creation; static afterwards
    Atr { atr: Decimal, multiplier: Decimal },
    /// Fires at the deadline regardless of price
    Time { deadline: DateTime<Utc> },
    /// Hangs `3 * atr` off the favorable extreme
    Chandelier { atr: Decimal },
    /// Accelerates toward the favorable extreme each tick
    Parabolic { acceleration: Decimal },
}

/// A protective stop for one symbol.
#[derive(Debug, Clone)]
pub struct StopOrder {
    pub symbol: String,
    /// Order side fired on trigger: sell protects longs, buy protects shorts
    pub side: OrderSide,
    pub kind: StopKind,
    pub trigger: StopTrigger,
    pub stop_price: Decimal,
    pub quantity: Decimal,
    pub high_watermark: Decimal,
    pub low_watermark: Decimal,
    pub created_at: DateTime<Utc>,
}

impl StopOrder {
    /// Fixed stop at an explicit price.
    pub fn fixed(
        symbol: &str,
        side: OrderSide,
        kind: StopKind,
        stop_price: Decimal,
        quantity: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind,
            trigger: StopTrigger::Fixed,
            stop_price,
            quantity,
            high_watermark: Decimal::ZERO,
            low_watermark: Decimal::ZERO,
            created_at: now,
        }
    }

    /// Trailing stop seeded from the current price.
    pub fn trailing(
        symbol: &str,
        side: OrderSide,
        delta: Decimal,
        quantity: Decimal,
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let stop_price = match side {
            OrderSide::Sell => current_price * (Decimal::ONE - delta),
            OrderSide::Buy => current_price * (Decimal::ONE + delta),
        };
        Self {
            symbol: symbol.to_string(),
            side,
            kind: StopKind::StopLoss,
            trigger: StopTrigger::Trailing { delta },
            stop_price,
            quantity,
            high_watermark: current_price,
            low_watermark: current_price,
            created_at: now,
        }
    }

    /// ATR stop priced `multiplier * atr` off the entry, by side.
    pub fn atr(
        symbol: &str,
        side: OrderSide,
        entry_price: Decimal,
        atr: Decimal,
        multiplier: Decimal,
        quantity: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let stop_price = match side {
            OrderSide::Sell => entry_price - multiplier * atr,
            OrderSide::Buy => entry_price + multiplier * atr,
        };
        Self {
            symbol: symbol.to_string(),
            side,
            kind: StopKind::StopLoss,
            trigger: StopTrigger::Atr { atr, multiplier },
            stop_price,
            quantity,
            high_watermark: Decimal::ZERO,
            low_watermark: Decimal::ZERO,
            created_at: now,
        }
    }

    /// Time stop that exits at the deadline.
    pub fn time(
        symbol: &str,
        side: OrderSide,
        deadline: DateTime<Utc>,
        quantity: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: StopKind::StopLoss,
            trigger: StopTrigger::Time { deadline },
            stop_price: Decimal::ZERO,
            quantity,
            high_watermark: Decimal::ZERO,
            low_watermark: Decimal::ZERO,
            created_at: now,
        }
    }

    /// Chandelier stop hanging off the favorable extreme.
    pub fn chandelier(
        symbol: &str,
        side: OrderSide,
        atr: Decimal,
        quantity: Decimal,
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let stop_price = match side {
            OrderSide::Sell => current_price - CHANDELIER_ATR_MULTIPLIER * atr,
            OrderSide::Buy => current_price + CHANDELIER_ATR_MULTIPLIER * atr,
        };
        Self {
            symbol: symbol.to_string(),
            side,
            kind: StopKind::StopLoss,
            trigger: StopTrigger::Chandelier { atr },
            stop_price,
            quantity,
            high_watermark: current_price,
            low_watermark: current_price,
            created_at: now,
        }
    }

    /// Parabolic stop accelerating from an initial stop price.
    pub fn parabolic(
        symbol: &str,
        side: OrderSide,
        initial_stop: Decimal,
        quantity: Decimal,
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: StopKind::StopLoss,
            trigger: StopTrigger::Parabolic {
                acceleration: PARABOLIC_ACCELERATION,
            },
            stop_price: initial_stop,
            quantity,
            high_watermark: current_price,
            low_watermark: current_price,
            created_at: now,
        }
    }

    fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.quantity <= Decimal::ZERO {
            return Err(ValidationError::InvalidQuantity(self.quantity));
        }
        match &self.trigger {
            StopTrigger::Time { deadline } => {
                if *deadline <= now {
                    return Err(ValidationError::InvalidDuration);
                }
            }
            StopTrigger::Trailing { delta } => {
                if *delta <= Decimal::ZERO || *delta >= Decimal::ONE {
                    return Err(ValidationError::InvalidTrailingDelta(*delta));
                }
            }
            _ => {
                if self.stop_price <= Decimal::ZERO {
                    return Err(ValidationError::InvalidStopPrice(self.stop_price));
                }
            }
        }
        Ok(())
    }

    /// Ratchet watermarks and recompute the trigger price. Trailing-style
    /// stops only ever move favorably.
    fn advance(&mut self, px: Decimal) {
        match self.side {
            OrderSide::Sell => self.high_watermark = self.high_watermark.max(px),
            OrderSide::Buy => {
                self.low_watermark = if self.low_watermark == Decimal::ZERO {
                    px
                } else {
                    self.low_watermark.min(px)
                }
            }
        }

        match &self.trigger {
            StopTrigger::Trailing { delta } => {
                self.stop_price = match self.side {
                    OrderSide::Sell => self.high_watermark * (Decimal::ONE - *delta),
                    OrderSide::Buy => self.low_watermark * (Decimal::ONE + *delta),
                };
            }
            StopTrigger::Chandelier { atr } => {
                self.stop_price = match self.side {
                    OrderSide::Sell => self.high_watermark - CHANDELIER_ATR_MULTIPLIER * *atr,
                    OrderSide::Buy => self.low_watermark + CHANDELIER_ATR_MULTIPLIER * *atr,
                };
            }
            StopTrigger::Parabolic { acceleration } => {
                self.stop_price = match self.side {
                    OrderSide::Sell => {
                        self.stop_price + *acceleration * (self.high_watermark - self.stop_price)
                    }
                    OrderSide::Buy => {
                        self.stop_price - *acceleration * (self.stop_price - self.low_watermark)
                    }
                };
            }
            StopTrigger::Fixed | StopTrigger::Atr { .. } | StopTrigger::Time { .. } => {}
        }
    }

    fn is_triggered(&self, px: Decimal, now: DateTime<Utc>) -> bool {
        match &self.trigger {
            StopTrigger::Time { deadline } => now >= *deadline,
            _ => match self.side {
                OrderSide::Sell => px <= self.stop_price,
                OrderSide::Buy => px >= self.stop_price,
            },
        }
    }
}

/// The stop engine.
pub struct StopEngine {
    stops: RwLock<HashMap<(String, StopKind), StopOrder>>,
    orders: Arc<OrderManager>,
}

impl StopEngine {
    pub fn new(orders: Arc<OrderManager>) -> Self {
        Self {
            stops: RwLock::new(HashMap::new()),
            orders,
        }
    }

    /// Register a stop, replacing any active stop in the same slot.
    pub async fn place(&self, stop: StopOrder, now: DateTime<Utc>) -> Result<(), ValidationError> {
        stop.validate(now)?;
        let key = (stop.symbol.clone(), stop.kind);
        info!(
            symbol = %stop.symbol,
            kind = stop.kind.as_str(),
            stop_price = %stop.stop_price,
            quantity = %stop.quantity,
            "Stop placed"
        );
        self.stops.write().await.insert(key, stop);
        Ok(())
    }

    /// Remove a stop, returning it if present.
    pub async fn cancel(&self, symbol: &str, kind: StopKind) -> Option<StopOrder> {
        self.stops
            .write()
            .await
            .remove(&(symbol.to_string(), kind))
    }

    pub async fn get(&self, symbol: &str, kind: StopKind) -> Option<StopOrder> {
        self.stops
            .read()
            .await
            .get(&(symbol.to_string(), kind))
            .cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.stops.read().await.len()
    }

    /// Pull watermark-based stops closer by `factor` (e.g. 0.8 shrinks the
    /// distance to the extreme by 20%). Fixed, ATR and time stops keep their
    /// levels.
    pub async fn tighten(&self, factor: Decimal) {
        let mut stops = self.stops.write().await;
        for stop in stops.values_mut() {
            match &stop.trigger {
                StopTrigger::Trailing { .. }
                | StopTrigger::Chandelier { .. }
                | StopTrigger::Parabolic { .. } => {
                    stop.stop_price = match stop.side {
                        OrderSide::Sell => {
                            stop.high_watermark
                                - (stop.high_watermark - stop.stop_price) * factor
                        }
                        OrderSide::Buy => {
                            stop.low_watermark
                                + (stop.stop_price - stop.low_watermark) * factor
                        }
                    };
                }
                _ => {}
            }
        }
        if !stops.is_empty() {
            info!(%factor, count = stops.len(), "Stops tightened");
        }
    }

    /// Evaluate the symbol's stops against a fresh mark price. Returns the
    /// kinds that triggered and filled.
    pub async fn check(
        &self,
        symbol: &str,
        px: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<StopKind> {
        let mut fired = Vec::new();

        for kind in [StopKind::StopLoss, StopKind::TakeProfit] {
            let key = (symbol.to_string(), kind);
            let triggered = {
                let mut stops = self.stops.write().await;
                match stops.get_mut(&key) {
                    Some(stop) => {
                        stop.advance(px);
                        stop.is_triggered(px, now).then(|| stop.clone())
                    }
                    None => None,
                }
            };

            let Some(stop) = triggered else { continue };

            info!(
                %symbol,
                kind = kind.as_str(),
                stop_price = %stop.stop_price,
                px = %px,
                "Stop triggered"
            );

            let order = NewOrder::reduce_only_market(symbol, stop.side, stop.quantity);
            match self.orders.place_order(order).await {
                Ok(response) => {
                    debug!(%symbol, order_id = response.order_id, "Stop order filled");
                    self.stops.write().await.remove(&key);
                    fired.push(kind);
                }
                Err(e) => {
                    // Stop stays registered; the next tick retries
                    warn!(%symbol, kind = kind.as_str(), error = %e, "Stop order failed");
                }
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MarginType, PaperExchange, Position, PositionSide};
    use chrono::Duration;

    async fn engine_with_long(size: Decimal, entry: Decimal) -> (Arc<PaperExchange>, StopEngine) {
        let venue = Arc::new(PaperExchange::new(dec!(100000)));
        venue
            .seed_position(Position {
                symbol: "BTCUSDT".to_string(),
                side: PositionSide::from_size(size),
                size,
                entry_price: entry,
                mark_price: entry,
                unrealized_pnl: Decimal::ZERO,
                realized_pnl: Decimal::ZERO,
                leverage: 10,
                margin_type: MarginType::Cross,
                updated_at: Utc::now(),
            })
            .await;
        let orders = Arc::new(OrderManager::new(venue.clone()));
        (venue, StopEngine::new(orders))
    }

    #[tokio::test]
    async fn test_fixed_stop_triggers_and_removes() {
        let (venue, engine) = engine_with_long(dec!(1), dec!(100)).await;
        let now = Utc::now();

        engine
            .place(
                StopOrder::fixed("BTCUSDT", OrderSide::Sell, StopKind::StopLoss, dec!(95), dec!(1), now),
                now,
            )
            .await
            .unwrap();

        assert!(engine.check("BTCUSDT", dec!(96), now).await.is_empty());

        venue.set_price("BTCUSDT", dec!(94)).await;
        let fired = engine.check("BTCUSDT", dec!(94), now).await;
        assert_eq!(fired, vec![StopKind::StopLoss]);
        assert!(engine.get("BTCUSDT", StopKind::StopLoss).await.is_none());

        // Re-checking after removal is a no-op at any price
        assert!(engine.check("BTCUSDT", dec!(1), now).await.is_empty());
    }

    #[tokio::test]
    async fn test_trailing_stop_scenario() {
        // delta 0.05, prices 100 -> 120 -> 110
        let (venue, engine) = engine_with_long(dec!(1), dec!(100)).await;
        let now = Utc::now();

        engine
            .place(
                StopOrder::trailing("BTCUSDT", OrderSide::Sell, dec!(0.05), dec!(1), dec!(100), now),
                now,
            )
            .await
            .unwrap();

        assert!(engine.check("BTCUSDT", dec!(120), now).await.is_empty());
        let stop = engine.get("BTCUSDT", StopKind::StopLoss).await.unwrap();
        assert_eq!(stop.high_watermark, dec!(120));
        assert_eq!(stop.stop_price, dec!(114.00));

        venue.set_price("BTCUSDT", dec!(110)).await;
        let fired = engine.check("BTCUSDT", dec!(110), now).await;
        assert_eq!(fired, vec![StopKind::StopLoss]);
    }

    #[tokio::test]
    async fn test_trailing_stop_never_moves_adversely() {
        let (_venue, engine) = engine_with_long(dec!(1), dec!(100)).await;
        let now = Utc::now();

        engine
            .place(
                StopOrder::trailing("BTCUSDT", OrderSide::Sell, dec!(0.05), dec!(1), dec!(100), now),
                now,
            )
            .await
            .unwrap();

        let mut last_stop = Decimal::ZERO;
        for px in [dec!(101), dec!(105), dec!(103), dec!(110), dec!(108)] {
            engine.check("BTCUSDT", px, now).await;
            let stop = engine.get("BTCUSDT", StopKind::StopLoss).await.unwrap();
            assert!(stop.stop_price >= last_stop);
            last_stop = stop.stop_price;
        }
    }

    #[tokio::test]
    async fn test_atr_stop_priced_at_creation() {
        let now = Utc::now();
        let stop = StopOrder::atr("BTCUSDT", OrderSide::Sell, dec!(100), dec!(2), dec!(2), dec!(1), now);
        assert_eq!(stop.stop_price, dec!(96));

        let stop = StopOrder::atr("BTCUSDT", OrderSide::Buy, dec!(100), dec!(2), dec!(2), dec!(1), now);
        assert_eq!(stop.stop_price, dec!(104));
    }

    #[tokio::test]
    async fn test_time_stop_fires_on_deadline() {
        let (venue, engine) = engine_with_long(dec!(1), dec!(100)).await;
        let now = Utc::now();
        let deadline = now + Duration::seconds(60);

        engine
            .place(
                StopOrder::time("BTCUSDT", OrderSide::Sell, deadline, dec!(1), now),
                now,
            )
            .await
            .unwrap();

        // Price is irrelevant before the deadline
        venue.set_price("BTCUSDT", dec!(500)).await;
        assert!(engine.check("BTCUSDT", dec!(500), now).await.is_empty());

        let fired = engine.check("BTCUSDT", dec!(500), deadline).await;
        assert_eq!(fired, vec![StopKind::StopLoss]);
    }

    #[tokio::test]
    async fn test_chandelier_hangs_off_watermark() {
        let (_venue, engine) = engine_with_long(dec!(1), dec!(100)).await;
        let now = Utc::now();

        engine
            .place(
                StopOrder::chandelier("BTCUSDT", OrderSide::Sell, dec!(2), dec!(1), dec!(100), now),
                now,
            )
            .await
            .unwrap();

        engine.check("BTCUSDT", dec!(110), now).await;
        let stop = engine.get("BTCUSDT", StopKind::StopLoss).await.unwrap();
        assert_eq!(stop.stop_price, dec!(104)); // 110 - 3*2
    }

    #[tokio::test]
    async fn test_parabolic_accelerates() {
        let (_venue, engine) = engine_with_long(dec!(1), dec!(100)).await;
        let now = Utc::now();

        engine
            .place(
                StopOrder::parabolic("BTCUSDT", OrderSide::Sell, dec!(90), dec!(1), dec!(100), now),
                now,
            )
            .await
            .unwrap();

        engine.check("BTCUSDT", dec!(100), now).await;
        let s1 = engine.get("BTCUSDT", StopKind::StopLoss).await.unwrap().stop_price;
        // 90 + 0.02 * (100 - 90)
        assert_eq!(s1, dec!(90.2));

        engine.check("BTCUSDT", dec!(100), now).await;
        let s2 = engine.get("BTCUSDT", StopKind::StopLoss).await.unwrap().stop_price;
        assert!(s2 > s1);
    }

    #[tokio::test]
    async fn test_failed_order_keeps_stop() {
        // No position seeded, so the reduce-only order is rejected
        let venue = Arc::new(PaperExchange::new(dec!(100000)));
        venue.set_price("BTCUSDT", dec!(94)).await;
        let engine = StopEngine::new(Arc::new(OrderManager::new(venue)));
        let now = Utc::now();

        engine
            .place(
                StopOrder::fixed("BTCUSDT", OrderSide::Sell, StopKind::StopLoss, dec!(95), dec!(1), now),
                now,
            )
            .await
            .unwrap();

        let fired = engine.check("BTCUSDT", dec!(94), now).await;
        assert!(fired.is_empty());
        assert!(engine.get("BTCUSDT", StopKind::StopLoss).await.is_some());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_inputs() {
        let venue = Arc::new(PaperExchange::new(dec!(100000)));
        let engine = StopEngine::new(Arc::new(OrderManager::new(venue)));
        let now = Utc::now();

        let bad_price = StopOrder::fixed("BTCUSDT", OrderSide::Sell, StopKind::StopLoss, dec!(0), dec!(1), now);
        assert_eq!(
            engine.place(bad_price, now).await,
            Err(ValidationError::InvalidStopPrice(Decimal::ZERO))
        );

        let bad_qty = StopOrder::fixed("BTCUSDT", OrderSide::Sell, StopKind::StopLoss, dec!(95), dec!(0), now);
        assert!(matches!(
            engine.place(bad_qty, now).await,
            Err(ValidationError::InvalidQuantity(_))
        ));

        let bad_delta =
            StopOrder::trailing("BTCUSDT", OrderSide::Sell, dec!(1.5), dec!(1), dec!(100), now);
        assert!(matches!(
            engine.place(bad_delta, now).await,
            Err(ValidationError::InvalidTrailingDelta(_))
        ));

        let past_deadline =
            StopOrder::time("BTCUSDT", OrderSide::Sell, now - Duration::seconds(1), dec!(1), now);
        assert_eq!(
            engine.place(past_deadline, now).await,
            Err(ValidationError::InvalidDuration)
        );
    }

    #[tokio::test]
    async fn test_one_stop_per_slot() {
        let venue = Arc::new(PaperExchange::new(dec!(100000)));
        let engine = StopEngine::new(Arc::new(OrderManager::new(venue)));
        let now = Utc::now();

        for px in [dec!(95), dec!(90)] {
            engine
                .place(
                    StopOrder::fixed("BTCUSDT", OrderSide::Sell, StopKind::StopLoss, px, dec!(1), now),
                    now,
                )
                .await
                .unwrap();
        }
        assert_eq!(engine.active_count().await, 1);
        let stop = engine.get("BTCUSDT", StopKind::StopLoss).await.unwrap();
        assert_eq!(stop.stop_price, dec!(90));
    }
}
