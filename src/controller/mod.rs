//! Intelligent risk controller.
//!
//! A super-monitor layered on top of the threshold monitor. Four background
//! loops: assessment (composite score and level actions), dynamic limit
//! adjustment, stress testing, and reporting.

mod limits;
mod score;
mod stress;
mod volatility;

pub use limits::{composite_factor, level_factor, LimitBook, RiskLimits};
pub use score::{composite_score, RealtimeMetrics, RiskLevel};
pub use stress::{builtin_scenarios, run_scenario, StressResult, StressScenario};
pub use volatility::EwmaVolatility;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::executor::RiskExecutor;
use crate::monitor::{RiskMonitor, Severity, TriggerAction, TriggerEvent, TriggerType};
use crate::pnl::PnlCalculator;
use crate::stops::StopEngine;
use crate::utils::decimal::{quadrature_sum, safe_div};

/// One-sided 95% z-score for the parametric VaR approximation.
const VAR_Z_95: Decimal = dec!(1.645);

/// Serialized risk state, produced by the reporting loop.
#[derive(Debug, Clone, Serialize)]
pub struct RiskReport {
    pub level: RiskLevel,
    pub score: Decimal,
    pub metrics: RealtimeMetrics,
    pub limit_factor: Decimal,
    pub limits: Vec<RiskLimits>,
    pub suspended: bool,
    pub generated_at: DateTime<Utc>,
}

/// The controller.
pub struct IntelligentController {
    config: ControllerConfig,
    calculator: Arc<PnlCalculator>,
    executor: Arc<RiskExecutor>,
    monitor: Arc<RiskMonitor>,
    stops: Arc<StopEngine>,
    vol: RwLock<EwmaVolatility>,
    limits: RwLock<LimitBook>,
    level: RwLock<RiskLevel>,
    last_score: RwLock<Decimal>,
    suspended: AtomicBool,
}

impl IntelligentController {
    pub fn new(
        config: ControllerConfig,
        symbols: &[String],
        calculator: Arc<PnlCalculator>,
        executor: Arc<RiskExecutor>,
        monitor: Arc<RiskMonitor>,
        stops: Arc<StopEngine>,
    ) -> Self {
        let vol = EwmaVolatility::new(config.ewma_lambda, config.assessment_interval_secs);
        Self {
            config,
            calculator,
            executor,
            monitor,
            stops,
            vol: RwLock::new(vol),
            limits: RwLock::new(LimitBook::new(symbols)),
            level: RwLock::new(RiskLevel::Low),
            last_score: RwLock::new(Decimal::ZERO),
            suspended: AtomicBool::new(false),
        }
    }

    /// Current risk grade.
    pub async fn current_level(&self) -> RiskLevel {
        *self.level.read().await
    }

    /// Whether opening new positions is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Adjusted limits for a symbol.
    pub async fn adjusted_limits(&self, symbol: &str) -> Option<RiskLimits> {
        self.limits.read().await.adjusted(symbol).cloned()
    }

    /// Replace the base limits for a symbol.
    pub async fn set_base_limits(&self, limits: RiskLimits) {
        self.limits.write().await.set_base(limits);
    }

    /// Refresh realtime metrics from the live portfolio.
    pub async fn compute_metrics(&self, now: DateTime<Utc>) -> RealtimeMetrics {
        let positions = self.calculator.positions().await;
        let equity = self.calculator.equity().await;
        if positions.is_empty() {
            let mut metrics = RealtimeMetrics::flat(equity, &self.config, now);
            metrics.drawdown = self.calculator.drawdown().await;
            return metrics;
        }

        let vol = self.vol.read().await;
        let notionals: Vec<Decimal> = positions.iter().map(|p| p.notional()).collect();
        let total_notional: Decimal = notionals.iter().copied().sum();

        // Parametric per-position VaR, aggregated in quadrature under the
        // independence assumption
        let per_position_var: Vec<Decimal> = positions
            .iter()
            .map(|p| {
                let sigma = vol
                    .vol(&p.symbol)
                    .unwrap_or(self.config.default_volatility);
                p.notional() * sigma * VAR_Z_95
            })
            .collect();
        let portfolio_var = quadrature_sum(&per_position_var);
        let var_ratio = safe_div(portfolio_var, total_notional);

        let concentration = notionals
            .iter()
            .copied()
            .max()
            .map(|largest| safe_div(largest, total_notional))
            .unwrap_or(Decimal::ZERO);

        RealtimeMetrics {
            var_ratio,
            cvar_ratio: var_ratio * self.config.cvar_multiplier,
            drawdown: self.calculator.drawdown().await,
            concentration,
            avg_correlation: self.config.avg_correlation,
            liquidity_score: self.config.default_liquidity_score,
            total_notional,
            equity,
            at: now,
        }
    }

    /// One assessment pass: sample volatility, score the portfolio, and run
    /// the level action set when the grade changes.
    pub async fn assess(&self, now: DateTime<Utc>) -> (Decimal, RiskLevel) {
        {
            let positions = self.calculator.positions().await;
            let mut vol = self.vol.write().await;
            for pos in &positions {
                vol.observe(&pos.symbol, pos.mark_price);
            }
        }

        let metrics = self.compute_metrics(now).await;
        let score = composite_score(&metrics, &self.config);
        let level = RiskLevel::from_score(score);
        *self.last_score.write().await = score;

        let previous = {
            let mut current = self.level.write().await;
            let previous = *current;
            *current = level;
            previous
        };

        if level != previous {
            info!(
                score = %score,
                from = previous.as_str(),
                to = level.as_str(),
                "Risk level changed"
            );
            self.apply_level_actions(level, score, &metrics, now).await;
        }

        (score, level)
    }

    /// Level-specific action set, dispatched on grade transitions.
    async fn apply_level_actions(
        &self,
        level: RiskLevel,
        score: Decimal,
        metrics: &RealtimeMetrics,
        now: DateTime<Utc>,
    ) {
        let base_interval = self.monitor.base_interval_secs();

        match level {
            RiskLevel::Emergency => {
                let event = TriggerEvent::new(
                    TriggerType::RiskScore,
                    TriggerAction::StopTrading,
                    None,
                    score,
                    dec!(100),
                    Severity::Emergency,
                    format!("Composite risk score {} in emergency band", score),
                    now,
                );
                // Emergency severity closes everything and latches the executor
                self.monitor.trigger_event(event, now).await;
            }
            RiskLevel::Critical => {
                self.suspended.store(true, Ordering::SeqCst);
                for symbol in self.high_risk_symbols(metrics).await {
                    if let Err(e) = self
                        .executor
                        .reduce_positions(Some(&symbol), dec!(0.5))
                        .await
                    {
                        warn!(%symbol, error = %e, "Critical-level reduction failed");
                    }
                }
                let event = TriggerEvent::new(
                    TriggerType::RiskScore,
                    TriggerAction::Alert,
                    None,
                    score,
                    dec!(80),
                    Severity::Critical,
                    "High-risk positions reduced 50%, new positions suspended".to_string(),
                    now,
                );
                self.monitor.trigger_event(event, now).await;
            }
            RiskLevel::High => {
                // Scale every position to 80% and pull stops in by the same factor
                if let Err(e) = self.executor.reduce_positions(None, dec!(0.2)).await {
                    warn!(error = %e, "High-level scale-down failed");
                }
                self.stops.tighten(dec!(0.8)).await;
            }
            RiskLevel::Medium => {
                self.monitor.set_interval_secs((base_interval / 2).max(1));
                self.limits.write().await.adjust_all(dec!(0.9));
            }
            RiskLevel::Low => {
                self.monitor.set_interval_secs(base_interval);
                self.limits.write().await.adjust_all(Decimal::ONE);
                self.suspended.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Positions whose notional share marks them as concentration risk; the
    /// largest position when none crosses the threshold.
    async fn high_risk_symbols(&self, metrics: &RealtimeMetrics) -> Vec<String> {
        let positions = self.calculator.positions().await;
        if positions.is_empty() || metrics.total_notional == Decimal::ZERO {
            return Vec::new();
        }

        let concentrated: Vec<String> = positions
            .iter()
            .filter(|p| {
                safe_div(p.notional(), metrics.total_notional)
                    >= self.config.concentration_threshold
            })
            .map(|p| p.symbol.clone())
            .collect();

        if !concentrated.is_empty() {
            return concentrated;
        }

        positions
            .iter()
            .max_by_key(|p| p.notional())
            .map(|p| vec![p.symbol.clone()])
            .unwrap_or_default()
    }

    /// Dynamic limit pass: scale base limits by the composite factor.
    pub async fn adjust_limits(&self, _now: DateTime<Utc>) -> Decimal {
        let level = self.current_level().await;
        let symbols: Vec<String> = self
            .calculator
            .positions()
            .await
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        let avg_vol = self
            .vol
            .read()
            .await
            .average_vol(&symbols, self.config.default_volatility);

        let factor = composite_factor(level, avg_vol, self.config.target_volatility);
        self.limits.write().await.adjust_all(factor);
        info!(
            level = level.as_str(),
            %avg_vol,
            %factor,
            "Dynamic limits adjusted"
        );
        factor
    }

    /// Stress pass: run every scenario, alert on breaches.
    pub async fn run_stress_tests(&self, now: DateTime<Utc>) -> Vec<StressResult> {
        let positions = self.calculator.positions().await;
        let equity = self.calculator.equity().await;

        let results: Vec<StressResult> = builtin_scenarios()
            .iter()
            .map(|scenario| {
                run_scenario(&positions, equity, scenario, self.config.stress_loss_alert)
            })
            .collect();

        for result in &results {
            if result.breached {
                warn!(
                    scenario = result.scenario,
                    loss = %result.loss_fraction,
                    "Stress scenario breach"
                );
                let event = TriggerEvent::new(
                    TriggerType::StressTest,
                    TriggerAction::Alert,
                    None,
                    result.loss_fraction,
                    self.config.stress_loss_alert,
                    Severity::High,
                    format!(
                        "Scenario '{}' loses {:.2}% of equity",
                        result.scenario,
                        result.loss_fraction * dec!(100)
                    ),
                    now,
                )
                .with_metadata("price_shock", result.price_shock)
                .with_metadata("vol_multiplier", result.vol_multiplier);
                self.monitor.trigger_event(event, now).await;
            }
        }
        results
    }

    /// Reporting pass: serialize current risk state into the log stream.
    pub async fn report(&self, now: DateTime<Utc>) -> RiskReport {
        let metrics = self.compute_metrics(now).await;
        let limits = self.limits.read().await;
        let report = RiskReport {
            level: self.current_level().await,
            score: *self.last_score.read().await,
            metrics,
            limit_factor: limits.factor(),
            limits: limits.all_adjusted(),
            suspended: self.is_suspended(),
            generated_at: now,
        };
        let json = serde_json::to_string(&report).unwrap_or_default();
        info!(target: "risk_report", "RISK_REPORT: {}", json);
        report
    }

    /// Assessment loop (10s cadence class).
    pub async fn run_assessment(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.assessment_interval_secs,
        ));
        info!("Risk assessment loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.assess(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
        info!("Risk assessment loop stopped");
    }

    /// Dynamic-limit loop (minutes cadence class).
    pub async fn run_limits(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.limits_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.adjust_limits(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
    }

    /// Stress-test loop (hourly cadence class).
    pub async fn run_stress(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.stress_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_stress_tests(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
    }

    /// Reporting loop (6h cadence class).
    pub async fn run_reporting(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.report_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskThresholds;
    use crate::exchange::{AccountBalance, MarginType, PaperExchange, Position, PositionSide};
    use crate::managers::OrderManager;

    fn position(symbol: &str, size: Decimal, mark: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::from_size(size),
            size,
            entry_price: mark,
            mark_price: mark,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            leverage: 10,
            margin_type: MarginType::Cross,
            updated_at: Utc::now(),
        }
    }

    fn usdt(total: Decimal) -> AccountBalance {
        AccountBalance {
            asset: "USDT".to_string(),
            total,
            available: total,
            locked: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }

    struct Harness {
        venue: Arc<PaperExchange>,
        calc: Arc<PnlCalculator>,
        executor: Arc<RiskExecutor>,
        controller: Arc<IntelligentController>,
    }

    async fn harness(positions: Vec<Position>, equity: Decimal) -> Harness {
        let venue = Arc::new(PaperExchange::new(equity));
        let calc = Arc::new(PnlCalculator::new());
        let now = Utc::now();
        calc.update_balance(usdt(equity), now).await;

        let mut symbols = Vec::new();
        for pos in positions {
            symbols.push(pos.symbol.clone());
            venue.seed_position(pos.clone()).await;
            calc.update_position(pos, now).await;
        }

        let orders = Arc::new(OrderManager::new(venue.clone()));
        let executor = Arc::new(RiskExecutor::new(
            venue.clone(),
            orders.clone(),
            calc.clone(),
            symbols.clone(),
            dec!(0.5),
            false,
        ));
        let monitor = Arc::new(RiskMonitor::new(
            RiskThresholds::default(),
            calc.clone(),
            5,
            300,
        ));
        monitor.register("executor", executor.clone()).await;
        let stops = Arc::new(StopEngine::new(orders));

        let controller = Arc::new(IntelligentController::new(
            ControllerConfig::default(),
            &symbols,
            calc.clone(),
            executor.clone(),
            monitor,
            stops,
        ));
        Harness {
            venue,
            calc,
            executor,
            controller,
        }
    }

    #[tokio::test]
    async fn test_flat_portfolio_assesses_low() {
        let h = harness(vec![], dec!(100000)).await;
        let (score, level) = h.controller.assess(Utc::now()).await;
        assert!(score < dec!(30));
        assert_eq!(level, RiskLevel::Low);
        assert!(!h.controller.is_suspended());
    }

    #[tokio::test]
    async fn test_concentration_and_drawdown_escalate() {
        // Single concentrated position plus a deep drawdown pushes the score
        // into the critical band
        let h = harness(vec![position("BTCUSDT", dec!(5), dec!(20000))], dec!(100000)).await;
        let now = Utc::now();
        h.calc.update_balance(usdt(dec!(80000)), now).await; // 20% drawdown

        let (score, level) = h.controller.assess(now).await;
        assert!(score >= dec!(80), "score was {}", score);
        assert!(level >= RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_critical_reduces_high_risk_and_suspends() {
        let h = harness(vec![position("BTCUSDT", dec!(5), dec!(20000))], dec!(100000)).await;
        let now = Utc::now();
        h.calc.update_balance(usdt(dec!(80000)), now).await;

        let (_, level) = h.controller.assess(now).await;
        if level == RiskLevel::Critical {
            assert!(h.controller.is_suspended());
            let placed = h.venue.placed_orders().await;
            assert_eq!(placed.len(), 1);
            assert!(placed[0].reduce_only);
            assert_eq!(placed[0].quantity, dec!(2.5)); // 50% of 5
        } else {
            // Emergency path goes through the stop-trading latch instead
            assert_eq!(level, RiskLevel::Emergency);
            assert!(!h.executor.is_enabled());
        }
    }

    #[tokio::test]
    async fn test_recovery_to_low_restores_state() {
        let h = harness(vec![position("BTCUSDT", dec!(5), dec!(20000))], dec!(100000)).await;
        let now = Utc::now();
        h.calc.update_balance(usdt(dec!(80000)), now).await;
        h.controller.assess(now).await;

        // Close the book and recover equity
        h.calc
            .update_position(position("BTCUSDT", Decimal::ZERO, dec!(20000)), now)
            .await;
        h.calc.update_balance(usdt(dec!(101000)), now).await;

        let (_, level) = h.controller.assess(now).await;
        assert_eq!(level, RiskLevel::Low);
        assert!(!h.controller.is_suspended());
    }

    #[tokio::test]
    async fn test_medium_level_scales_limits() {
        let h = harness(vec![position("BTCUSDT", dec!(1), dec!(20000))], dec!(100000)).await;
        let now = Utc::now();

        // Metrics with enough weight for the medium band
        let mut metrics = RealtimeMetrics::flat(dec!(100000), &ControllerConfig::default(), now);
        metrics.concentration = dec!(0.4);
        metrics.drawdown = dec!(0.08);
        h.controller
            .apply_level_actions(RiskLevel::Medium, dec!(45), &metrics, now)
            .await;

        let limits = h.controller.adjusted_limits("BTCUSDT").await.unwrap();
        let base = RiskLimits::default_for("BTCUSDT");
        assert_eq!(limits.max_position_value, base.max_position_value * dec!(0.9));
    }

    #[tokio::test]
    async fn test_stress_breach_emits_alert() {
        // 80% long book breaches the crash scenario
        let h = harness(vec![position("BTCUSDT", dec!(4), dec!(20000))], dec!(100000)).await;
        let results = h.controller.run_stress_tests(Utc::now()).await;

        let crash = results.iter().find(|r| r.scenario == "Market Crash").unwrap();
        assert!(crash.breached);
        assert_eq!(crash.loss_fraction, dec!(0.16));

        let others_breached = results
            .iter()
            .filter(|r| r.scenario != "Market Crash")
            .any(|r| r.breached);
        assert!(!others_breached);
    }

    #[tokio::test]
    async fn test_limit_factor_tracks_level() {
        let h = harness(vec![position("BTCUSDT", dec!(1), dec!(20000))], dec!(100000)).await;
        let factor = h.controller.adjust_limits(Utc::now()).await;
        // Low level at default volatility: level factor 1.0, vol at target
        assert_eq!(factor, dec!(1.0));
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let h = harness(vec![position("BTCUSDT", dec!(1), dec!(20000))], dec!(100000)).await;
        let report = h.controller.report(Utc::now()).await;
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"level\""));
        assert!(json.contains("\"limit_factor\""));
    }
}
