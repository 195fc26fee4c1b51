//! Threshold monitor.
//!
//! Scans the portfolio on a periodic cadence and emits `TriggerEvent`s to
//! registered sinks. A cooldown keyed by `(type, action, symbol)` keeps a
//! persistent breach from producing an action storm; the next tick re-emits
//! once the window has passed.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::RiskThresholds;
use crate::persistence::SqliteStore;
use crate::pnl::PnlCalculator;

/// Ordered alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
    Emergency,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Emergency => "emergency",
        }
    }
}

/// What breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    MarginRatio,
    DailyLoss,
    PositionLoss,
    PositionLossPercent,
    AccountBalance,
    Drawdown,
    StressTest,
    RiskScore,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::MarginRatio => "margin_ratio",
            TriggerType::DailyLoss => "daily_loss",
            TriggerType::PositionLoss => "position_loss",
            TriggerType::PositionLossPercent => "position_loss_percent",
            TriggerType::AccountBalance => "account_balance",
            TriggerType::Drawdown => "drawdown",
            TriggerType::StressTest => "stress_test",
            TriggerType::RiskScore => "risk_score",
        }
    }
}

/// What to do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    ReducePosition,
    ClosePosition,
    ReduceLeverage,
    StopTrading,
    Alert,
}

impl TriggerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerAction::ReducePosition => "reduce_position",
            TriggerAction::ClosePosition => "close_position",
            TriggerAction::ReduceLeverage => "reduce_leverage",
            TriggerAction::StopTrading => "stop_trading",
            TriggerAction::Alert => "alert",
        }
    }
}

/// A threshold breach handed to the executor and other sinks.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerEvent {
    pub id: String,
    pub trigger: TriggerType,
    pub action: TriggerAction,
    pub symbol: Option<String>,
    pub current_value: Decimal,
    pub threshold: Decimal,
    pub severity: Severity,
    pub message: String,
    pub metadata: HashMap<String, Decimal>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TriggerEvent {
    pub fn new(
        trigger: TriggerType,
        action: TriggerAction,
        symbol: Option<String>,
        current_value: Decimal,
        threshold: Decimal,
        severity: Severity,
        message: String,
        now: DateTime<Utc>,
    ) -> Self {
        let id = format!(
            "evt-{}-{}",
            now.timestamp(),
            now.timestamp_subsec_nanos()
        );
        Self {
            id,
            trigger,
            action,
            symbol,
            current_value,
            threshold,
            severity,
            message,
            metadata: HashMap::new(),
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Decimal) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Cooldown/lifecycle key.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.trigger.as_str(),
            self.action.as_str(),
            self.symbol.as_deref().unwrap_or("-")
        )
    }

    /// Structured log line for workflow parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        match self.severity {
            Severity::Info => info!(target: "risk_event", "RISK_EVENT: {}", json),
            Severity::Warning => warn!(target: "risk_event", "RISK_EVENT: {}", json),
            _ => error!(target: "risk_event", "RISK_EVENT: {}", json),
        }
    }
}

/// Receives trigger events. Sink errors are logged and never stop the
/// remaining sinks.
#[async_trait::async_trait]
pub trait TriggerSink: Send + Sync {
    async fn handle(&self, event: TriggerEvent) -> anyhow::Result<()>;
}

/// The risk monitor.
pub struct RiskMonitor {
    thresholds: RwLock<RiskThresholds>,
    calculator: Arc<PnlCalculator>,
    cooldowns: RwLock<HashMap<String, DateTime<Utc>>>,
    active: RwLock<HashMap<String, TriggerEvent>>,
    sinks: RwLock<Vec<(String, Arc<dyn TriggerSink>)>>,
    store: Option<Arc<SqliteStore>>,
    cooldown_secs: u64,
    base_interval_secs: u64,
    interval_secs: AtomicU64,
}

impl RiskMonitor {
    pub fn new(
        thresholds: RiskThresholds,
        calculator: Arc<PnlCalculator>,
        interval_secs: u64,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            calculator,
            cooldowns: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            sinks: RwLock::new(Vec::new()),
            store: None,
            cooldown_secs,
            base_interval_secs: interval_secs,
            interval_secs: AtomicU64::new(interval_secs),
        }
    }

    /// Attach the alert store; emitted and resolved triggers are persisted.
    pub fn with_store(mut self, store: Arc<SqliteStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a sink. Registration is idempotent by id.
    pub async fn register(&self, id: &str, sink: Arc<dyn TriggerSink>) {
        let mut sinks = self.sinks.write().await;
        if sinks.iter().any(|(existing, _)| existing == id) {
            debug!(sink = id, "Sink already registered");
            return;
        }
        sinks.push((id.to_string(), sink));
    }

    /// Swap in new thresholds; the next tick picks them up.
    pub async fn update_thresholds(&self, thresholds: RiskThresholds) {
        *self.thresholds.write().await = thresholds;
    }

    /// Current scan interval.
    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.load(Ordering::Relaxed)
    }

    /// Scan cadence as configured at startup.
    pub fn base_interval_secs(&self) -> u64 {
        self.base_interval_secs
    }

    /// Adjust the scan cadence (the controller doubles it under stress).
    pub fn set_interval_secs(&self, secs: u64) {
        self.interval_secs.store(secs.max(1), Ordering::Relaxed);
    }

    /// Currently active (unresolved) breaches.
    pub async fn active_alerts(&self) -> Vec<TriggerEvent> {
        self.active.read().await.values().cloned().collect()
    }

    /// Evaluate all thresholds once. Returns the events that were emitted
    /// (post-cooldown).
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TriggerEvent> {
        let thresholds = self.thresholds.read().await.clone();
        let mut breaches = Vec::new();

        // 1. Margin utilization
        let utilization = self.calculator.margin_utilization().await;
        if utilization >= thresholds.max_margin_ratio {
            breaches.push(
                TriggerEvent::new(
                    TriggerType::MarginRatio,
                    TriggerAction::ReducePosition,
                    None,
                    utilization,
                    thresholds.max_margin_ratio,
                    Severity::Critical,
                    format!(
                        "Margin utilization {:.4} at or above limit {}",
                        utilization, thresholds.max_margin_ratio
                    ),
                    now,
                )
                .with_metadata("margin_ratio", self.calculator.margin_ratio().await),
            );
        } else if utilization >= thresholds.warning_margin_ratio {
            breaches.push(TriggerEvent::new(
                TriggerType::MarginRatio,
                TriggerAction::Alert,
                None,
                utilization,
                thresholds.warning_margin_ratio,
                Severity::Warning,
                format!(
                    "Margin utilization {:.4} above warning level {}",
                    utilization, thresholds.warning_margin_ratio
                ),
                now,
            ));
        }

        // 2. Aggregate daily loss
        let daily = self.calculator.daily_pnl(now).await;
        if daily <= -thresholds.max_daily_loss {
            breaches.push(TriggerEvent::new(
                TriggerType::DailyLoss,
                TriggerAction::StopTrading,
                None,
                daily,
                thresholds.max_daily_loss,
                Severity::Critical,
                format!(
                    "Daily PnL {} beyond loss limit {}",
                    daily, thresholds.max_daily_loss
                ),
                now,
            ));
        }

        // 3. Per-position loss, absolute then percentage
        for snap in self.calculator.snapshots(now).await {
            if snap.unrealized_pnl <= -thresholds.max_position_loss {
                breaches.push(
                    TriggerEvent::new(
                        TriggerType::PositionLoss,
                        TriggerAction::ClosePosition,
                        Some(snap.symbol.clone()),
                        snap.unrealized_pnl,
                        thresholds.max_position_loss,
                        Severity::High,
                        format!(
                            "{} unrealized loss {} beyond {}",
                            snap.symbol, snap.unrealized_pnl, thresholds.max_position_loss
                        ),
                        now,
                    )
                    .with_metadata("mark_price", snap.mark_price)
                    .with_metadata("size", snap.size),
                );
                continue;
            }

            // Loss as a fraction of the margin posted at entry
            let loss_fraction = Decimal::ONE - snap.margin_ratio;
            if loss_fraction >= thresholds.max_position_loss_percent {
                breaches.push(
                    TriggerEvent::new(
                        TriggerType::PositionLossPercent,
                        TriggerAction::ReducePosition,
                        Some(snap.symbol.clone()),
                        loss_fraction,
                        thresholds.max_position_loss_percent,
                        Severity::High,
                        format!(
                            "{} lost {:.2}% of position margin",
                            snap.symbol,
                            loss_fraction * Decimal::new(100, 0)
                        ),
                        now,
                    )
                    .with_metadata("unrealized_pnl", snap.unrealized_pnl),
                );
            }
        }

        // 4. Account balance floor
        let equity = self.calculator.equity().await;
        if equity < thresholds.min_account_balance {
            breaches.push(TriggerEvent::new(
                TriggerType::AccountBalance,
                TriggerAction::StopTrading,
                None,
                equity,
                thresholds.min_account_balance,
                Severity::Critical,
                format!(
                    "Equity {} below account floor {}",
                    equity, thresholds.min_account_balance
                ),
                now,
            ));
        }

        // 5. Drawdown
        let drawdown = self.calculator.drawdown().await;
        if drawdown >= thresholds.max_drawdown_percent {
            breaches.push(TriggerEvent::new(
                TriggerType::Drawdown,
                TriggerAction::ReducePosition,
                None,
                drawdown,
                thresholds.max_drawdown_percent,
                Severity::High,
                format!(
                    "Drawdown {:.2}% beyond limit {:.2}%",
                    drawdown * Decimal::new(100, 0),
                    thresholds.max_drawdown_percent * Decimal::new(100, 0)
                ),
                now,
            ));
        }

        self.resolve_cleared(&breaches, now).await;

        let mut emitted = Vec::new();
        for event in breaches {
            if self.cooldown_allows(&event, now).await {
                self.dispatch(event.clone()).await;
                self.active
                    .write()
                    .await
                    .insert(event.key(), event.clone());
                emitted.push(event);
            }
        }
        emitted
    }

    /// Emit a controller-originated event through the same cooldown and
    /// dispatch path as monitor breaches.
    pub async fn trigger_event(&self, event: TriggerEvent, now: DateTime<Utc>) -> bool {
        if !self.cooldown_allows(&event, now).await {
            return false;
        }
        self.active
            .write()
            .await
            .insert(event.key(), event.clone());
        self.dispatch(event).await;
        true
    }

    async fn cooldown_allows(&self, event: &TriggerEvent, now: DateTime<Utc>) -> bool {
        let key = event.key();
        let mut cooldowns = self.cooldowns.write().await;
        if let Some(last) = cooldowns.get(&key) {
            if now - *last < Duration::seconds(self.cooldown_secs as i64) {
                debug!(%key, "Trigger suppressed by cooldown");
                return false;
            }
        }
        cooldowns.insert(key, now);
        true
    }

    /// Mark active alerts whose condition cleared and whose cooldown elapsed
    /// as resolved.
    async fn resolve_cleared(&self, breaches: &[TriggerEvent], now: DateTime<Utc>) {
        let breached: Vec<String> = breaches.iter().map(TriggerEvent::key).collect();
        let mut active = self.active.write().await;
        let cooldown = Duration::seconds(self.cooldown_secs as i64);

        let store = self.store.clone();
        active.retain(|key, event| {
            if breached.contains(key) {
                return true;
            }
            if now - event.created_at >= cooldown {
                let mut resolved = event.clone();
                resolved.resolved_at = Some(now);
                info!(key = %key, "Risk trigger resolved");
                resolved.emit();
                if let Some(store) = &store {
                    if let Err(e) = store.mark_alert_resolved(&event.id, now) {
                        warn!(error = %e, "Failed to persist alert resolution");
                    }
                }
                false
            } else {
                true
            }
        });
    }

    /// Deliver to every sink in registration order.
    async fn dispatch(&self, event: TriggerEvent) {
        event.emit();
        if let Some(store) = &self.store {
            if let Err(e) = store.insert_trigger_event(&event) {
                warn!(error = %e, "Failed to persist trigger event");
            }
        }
        let sinks = self.sinks.read().await.clone();
        for (id, sink) in sinks {
            if let Err(e) = sink.handle(event.clone()).await {
                error!(sink = %id, event = %event.id, error = %e, "Trigger sink failed");
            }
        }
    }

    /// Monitor loop. The interval is re-read each pass so the controller can
    /// retune the cadence at runtime.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval_secs(), "Risk monitor started");
        loop {
            let interval = std::time::Duration::from_secs(self.interval_secs());
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Risk monitor stopped");
    }
}
