//! Per-symbol price-move circuit breaker.
//!
//! A breaker is `armed` until the price moves more than the configured
//! fraction away from its base price inside the measurement window, then
//! `triggered` for the cooldown. Re-arming resets the base price to the
//! price seen at resume time.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::managers::OrderManager;
use crate::utils::decimal::pct_change;

/// Per-symbol breaker state.
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub symbol: String,
    pub base_price: Decimal,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    /// When the base price was last (re)set
    pub updated_at: DateTime<Utc>,
}

/// Breaker transitions worth telling the rest of the system about.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    Triggered {
        symbol: String,
        change: Decimal,
        at: DateTime<Utc>,
    },
    Resumed {
        symbol: String,
        base_price: Decimal,
        at: DateTime<Utc>,
    },
}

/// The circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: RwLock<HashMap<String, CircuitState>>,
    orders: Arc<OrderManager>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, orders: Arc<OrderManager>) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
            orders,
        }
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.time_window_secs as i64)
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.config.cooldown_secs as i64)
    }

    /// Whether the symbol is currently halted.
    pub async fn is_triggered(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.states
            .read()
            .await
            .get(symbol)
            .map(|s| s.triggered && s.resume_at.map(|r| now < r).unwrap_or(false))
            .unwrap_or(false)
    }

    pub async fn state(&self, symbol: &str) -> Option<CircuitState> {
        self.states.read().await.get(symbol).cloned()
    }

    /// Feed one price observation through the state machine.
    pub async fn observe(
        &self,
        symbol: &str,
        px: Decimal,
        now: DateTime<Utc>,
    ) -> Option<BreakerEvent> {
        let mut states = self.states.write().await;
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| CircuitState {
                symbol: symbol.to_string(),
                base_price: Decimal::ZERO,
                triggered: false,
                triggered_at: None,
                resume_at: None,
                updated_at: now,
            });

        if state.triggered {
            match state.resume_at {
                Some(resume_at) if now >= resume_at => {
                    state.triggered = false;
                    state.triggered_at = None;
                    state.resume_at = None;
                    state.base_price = px;
                    state.updated_at = now;
                    info!(%symbol, base_price = %px, "Circuit breaker re-armed");
                    return Some(BreakerEvent::Resumed {
                        symbol: symbol.to_string(),
                        base_price: px,
                        at: now,
                    });
                }
                _ => return None, // still cooling down
            }
        }

        if state.base_price == Decimal::ZERO {
            state.base_price = px;
            state.updated_at = now;
            return None;
        }

        if now - state.updated_at > self.window() {
            state.base_price = px;
            state.updated_at = now;
            return None;
        }

        let change = pct_change(state.base_price, px);
        if change.abs() >= self.config.price_change {
            state.triggered = true;
            state.triggered_at = Some(now);
            state.resume_at = Some(now + self.cooldown());
            state.updated_at = now;

            warn!(
                %symbol,
                change = %change,
                base_price = %state.base_price,
                px = %px,
                "Circuit breaker TRIGGERED"
            );

            // Fire-and-forget: a cancel failure must not hold the transition
            let orders = self.orders.clone();
            let sym = symbol.to_string();
            tokio::spawn(async move {
                if let Err(e) = orders.cancel_all(&sym).await {
                    warn!(symbol = %sym, error = %e, "Breaker cancel-all failed");
                }
            });

            return Some(BreakerEvent::Triggered {
                symbol: symbol.to_string(),
                change,
                at: now,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use rust_decimal_macros::dec;

    fn config() -> BreakerConfig {
        BreakerConfig {
            price_change: dec!(0.05),
            time_window_secs: 60,
            cooldown_secs: 300,
        }
    }

    fn breaker() -> (Arc<PaperExchange>, CircuitBreaker) {
        let venue = Arc::new(PaperExchange::new(dec!(100000)));
        let orders = Arc::new(OrderManager::new(venue.clone()));
        (venue, CircuitBreaker::new(config(), orders))
    }

    #[tokio::test]
    async fn test_breaker_scenario() {
        // priceChange=0.05, window=60s, cooldown=300s
        let (venue, breaker) = breaker();
        let t0 = Utc::now();

        // First observation seeds the base price
        assert!(breaker.observe("BTCUSDT", dec!(100), t0).await.is_none());

        // +5.1% at t=10s trips it
        let event = breaker
            .observe("BTCUSDT", dec!(105.1), t0 + Duration::seconds(10))
            .await;
        assert!(matches!(event, Some(BreakerEvent::Triggered { .. })));
        assert!(
            breaker
                .is_triggered("BTCUSDT", t0 + Duration::seconds(11))
                .await
        );

        // Cancel-all was dispatched
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(venue.cancel_all_calls().await, vec!["BTCUSDT".to_string()]);

        // Inside the cooldown, observations are ignored
        let event = breaker
            .observe("BTCUSDT", dec!(104), t0 + Duration::seconds(100))
            .await;
        assert!(event.is_none());

        // After the cooldown, the breaker re-arms at the seen price
        let event = breaker
            .observe("BTCUSDT", dec!(104), t0 + Duration::seconds(311))
            .await;
        match event {
            Some(BreakerEvent::Resumed { base_price, .. }) => {
                assert_eq!(base_price, dec!(104));
            }
            other => panic!("expected Resumed, got {:?}", other),
        }
        assert!(
            !breaker
                .is_triggered("BTCUSDT", t0 + Duration::seconds(312))
                .await
        );
    }

    #[tokio::test]
    async fn test_no_retrigger_before_cooldown() {
        let (_venue, breaker) = breaker();
        let t0 = Utc::now();

        breaker.observe("BTCUSDT", dec!(100), t0).await;
        breaker
            .observe("BTCUSDT", dec!(106), t0 + Duration::seconds(1))
            .await;

        // Even a violent move cannot re-trigger during the cooldown
        for secs in [10, 60, 299] {
            let event = breaker
                .observe("BTCUSDT", dec!(50), t0 + Duration::seconds(secs))
                .await;
            assert!(event.is_none());
        }
    }

    #[tokio::test]
    async fn test_stale_window_refreshes_base() {
        let (_venue, breaker) = breaker();
        let t0 = Utc::now();

        breaker.observe("BTCUSDT", dec!(100), t0).await;

        // 2 minutes of silence: the old base is stale, 10% jump is absorbed
        let event = breaker
            .observe("BTCUSDT", dec!(110), t0 + Duration::seconds(120))
            .await;
        assert!(event.is_none());

        let state = breaker.state("BTCUSDT").await.unwrap();
        assert_eq!(state.base_price, dec!(110));
        assert!(!state.triggered);
    }

    #[tokio::test]
    async fn test_downside_move_triggers_too() {
        let (_venue, breaker) = breaker();
        let t0 = Utc::now();

        breaker.observe("BTCUSDT", dec!(100), t0).await;
        let event = breaker
            .observe("BTCUSDT", dec!(94.9), t0 + Duration::seconds(5))
            .await;
        match event {
            Some(BreakerEvent::Triggered { change, .. }) => {
                assert!(change < Decimal::ZERO);
            }
            other => panic!("expected Triggered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_symbols_are_independent() {
        let (_venue, breaker) = breaker();
        let t0 = Utc::now();

        breaker.observe("BTCUSDT", dec!(100), t0).await;
        breaker.observe("ETHUSDT", dec!(2000), t0).await;
        breaker
            .observe("BTCUSDT", dec!(110), t0 + Duration::seconds(1))
            .await;

        assert!(breaker.is_triggered("BTCUSDT", t0 + Duration::seconds(2)).await);
        assert!(!breaker.is_triggered("ETHUSDT", t0 + Duration::seconds(2)).await);
    }
}
