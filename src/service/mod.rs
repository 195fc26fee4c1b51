//! Service wiring: builds the component graph, spawns every loop, and owns
//! shutdown.
//!
//! Teardown broadcasts a watch signal and drains all tasks inside the
//! configured grace budget; anything still running after that is abandoned
//! to process exit.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::controller::{IntelligentController, RiskLimits};
use crate::exchange::{Exchange, Ticker, TickerStream};
use crate::executor::RiskExecutor;
use crate::managers::{OrderManager, PositionManager};
use crate::monitor::RiskMonitor;
use crate::persistence::SqliteStore;
use crate::pnl::PnlCalculator;
use crate::stops::StopEngine;

const TICKER_CHANNEL_CAPACITY: usize = 100;
const PAPER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The assembled risk service.
pub struct RiskService {
    config: Config,
    exchange: Arc<dyn Exchange>,
    store: Arc<SqliteStore>,
    calculator: Arc<PnlCalculator>,
    positions: Arc<PositionManager>,
    orders: Arc<OrderManager>,
    stops: Arc<StopEngine>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<RiskMonitor>,
    executor: Arc<RiskExecutor>,
    controller: Arc<IntelligentController>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RiskService {
    /// Build the component graph. Fails fast on invalid configuration; the
    /// service refuses to run rather than start partially wired.
    pub fn new(config: Config, exchange: Arc<dyn Exchange>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let store = Arc::new(
            SqliteStore::new(&config.persistence.db_path).context("Failed to open risk store")?,
        );
        let calculator = Arc::new(PnlCalculator::new());
        let positions = Arc::new(PositionManager::new(exchange.clone()));
        let orders = Arc::new(OrderManager::new(exchange.clone()));
        let stops = Arc::new(StopEngine::new(orders.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), orders.clone()));

        let executor = Arc::new(RiskExecutor::new(
            exchange.clone(),
            orders.clone(),
            calculator.clone(),
            config.service.symbols.clone(),
            config.executor.max_reduction_fraction,
            config.service.dry_run,
        ));

        let monitor = Arc::new(
            RiskMonitor::new(
                config.thresholds.clone(),
                calculator.clone(),
                config.service.monitor_interval_secs,
                config.service.cooldown_secs,
            )
            .with_store(store.clone()),
        );

        let controller = Arc::new(IntelligentController::new(
            config.controller.clone(),
            &config.service.symbols,
            calculator.clone(),
            executor.clone(),
            monitor.clone(),
            stops.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            exchange,
            store,
            calculator,
            positions,
            orders,
            stops,
            breaker,
            monitor,
            executor,
            controller,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn calculator(&self) -> Arc<PnlCalculator> {
        self.calculator.clone()
    }

    pub fn executor(&self) -> Arc<RiskExecutor> {
        self.executor.clone()
    }

    pub fn controller(&self) -> Arc<IntelligentController> {
        self.controller.clone()
    }

    pub fn stops(&self) -> Arc<StopEngine> {
        self.stops.clone()
    }

    /// Spawn every background loop.
    pub async fn start(&self) -> Result<()> {
        let symbols = self.config.service.symbols.clone();
        info!(symbols = ?symbols, dry_run = self.config.service.dry_run, "Risk service starting");

        self.monitor.register("risk-executor", self.executor.clone()).await;

        // Seed base limits from the venue's own risk brackets; on failure the
        // conservative defaults stand and a restart retries.
        for symbol in &symbols {
            match self.exchange.get_risk_limits(symbol).await {
                Ok(limit) => {
                    let mut base = RiskLimits::default_for(symbol);
                    base.max_leverage = base.max_leverage.min(limit.max_leverage);
                    base.max_position_value = base.max_position_value.min(limit.max_notional);
                    self.controller.set_base_limits(base).await;
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "Venue risk limits unavailable, using defaults")
                }
            }
        }
        match self.exchange.get_margin_info().await {
            Ok(info) => info!(
                margin_balance = %info.total_margin_balance,
                available = %info.available_balance,
                maint_margin = %info.total_maint_margin,
                "Account margin overview"
            ),
            Err(e) => warn!(error = %e, "Margin overview unavailable"),
        }

        let mut tasks = self.tasks.lock().await;

        // Mark-price pipeline
        let ticker_rx = self.ticker_source(&symbols);
        tasks.push(self.spawn_ticker_pipeline(ticker_rx));

        // Monitor + controller loops
        tasks.push(tokio::spawn(
            self.monitor.clone().run(self.shutdown_rx()),
        ));
        tasks.push(tokio::spawn(
            self.controller.clone().run_assessment(self.shutdown_rx()),
        ));
        tasks.push(tokio::spawn(
            self.controller.clone().run_limits(self.shutdown_rx()),
        ));
        tasks.push(tokio::spawn(
            self.controller.clone().run_stress(self.shutdown_rx()),
        ));
        tasks.push(tokio::spawn(
            self.controller.clone().run_reporting(self.shutdown_rx()),
        ));

        // Reconcilers
        tasks.push(tokio::spawn(self.positions.clone().run(
            self.config.service.reconcile_interval_secs,
            self.shutdown_rx(),
        )));
        tasks.push(tokio::spawn(self.orders.clone().run(
            symbols.clone(),
            self.config.service.reconcile_interval_secs,
            self.shutdown_rx(),
        )));
        tasks.push(self.spawn_position_forwarder().await);
        tasks.push(self.spawn_balance_sync());

        // Persistence
        tasks.push(self.spawn_margin_alert_writer().await);
        tasks.push(self.spawn_snapshot_loop());
        tasks.push(self.spawn_cleanup_loop());

        info!(tasks = tasks.len(), "Risk service started");
        Ok(())
    }

    /// Broadcast shutdown and drain tasks within the grace budget.
    pub async fn shutdown(&self) {
        info!("Risk service shutting down");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let grace = Duration::from_secs(self.config.service.shutdown_grace_secs);
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            warn!("Shutdown grace expired, abandoning remaining tasks");
        }
        info!("Risk service stopped");
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Live connections stream mark prices over WebSocket; the paper venue
    /// is polled instead.
    fn ticker_source(&self, symbols: &[String]) -> mpsc::Receiver<Ticker> {
        if self.config.exchange.paper {
            let (tx, rx) = mpsc::channel(TICKER_CHANNEL_CAPACITY);
            let exchange = self.exchange.clone();
            let symbols = symbols.to_vec();
            let mut shutdown = self.shutdown_rx();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PAPER_POLL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for symbol in &symbols {
                                match exchange.get_symbol_price(symbol).await {
                                    Ok(price) => {
                                        let _ = tx.try_send(Ticker {
                                            symbol: symbol.clone(),
                                            mark_price: price,
                                            at: Utc::now(),
                                        });
                                    }
                                    Err(e) => debug!(%symbol, error = %e, "No paper price yet"),
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() { break; }
                        }
                    }
                }
            });
            rx
        } else {
            TickerStream::new(self.config.exchange.testnet)
                .subscribe(symbols, self.shutdown_rx())
        }
    }

    /// Per-symbol mark-price handling, in order: reprice the calculator,
    /// feed the breaker, then run stop checks unless the breaker is holding
    /// the symbol.
    fn spawn_ticker_pipeline(&self, mut rx: mpsc::Receiver<Ticker>) -> JoinHandle<()> {
        let calculator = self.calculator.clone();
        let breaker = self.breaker.clone();
        let stops = self.stops.clone();
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ticker = rx.recv() => {
                        let Some(ticker) = ticker else { break };
                        let now = Utc::now();
                        calculator
                            .update_mark_price(&ticker.symbol, ticker.mark_price, now)
                            .await;
                        breaker.observe(&ticker.symbol, ticker.mark_price, now).await;
                        if !breaker.is_triggered(&ticker.symbol, now).await {
                            stops.check(&ticker.symbol, ticker.mark_price, now).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
            debug!("Ticker pipeline stopped");
        })
    }

    /// Push reconciled position updates into the calculator and the
    /// position snapshot table.
    async fn spawn_position_forwarder(&self) -> JoinHandle<()> {
        let mut rx = self.positions.subscribe("pnl-forwarder").await;
        let calculator = self.calculator.clone();
        let store = self.store.clone();
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    position = rx.recv() => {
                        let Some(position) = position else { break };
                        let now = Utc::now();
                        if position.is_open() {
                            if let Err(e) = store.upsert_position(&position) {
                                warn!(symbol = %position.symbol, error = %e, "Position upsert failed");
                            }
                        } else if let Err(e) = store.delete_position(&position.symbol) {
                            warn!(symbol = %position.symbol, error = %e, "Position delete failed");
                        }
                        calculator.update_position(position, now).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        })
    }

    /// Refresh account balances on the reconcile cadence.
    fn spawn_balance_sync(&self) -> JoinHandle<()> {
        let exchange = self.exchange.clone();
        let calculator = self.calculator.clone();
        let interval_secs = self.config.service.reconcile_interval_secs;
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match exchange.get_account_balances().await {
                            Ok(balances) => {
                                let now = Utc::now();
                                for balance in balances {
                                    calculator.update_balance(balance, now).await;
                                }
                            }
                            Err(e) => warn!(error = %e, "Balance sync skipped"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        })
    }

    /// Persist protective margin alerts as they fan out.
    async fn spawn_margin_alert_writer(&self) -> JoinHandle<()> {
        let mut rx = self.calculator.subscribe_margin_alerts("margin-writer").await;
        let store = self.store.clone();
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    alert = rx.recv() => {
                        let Some(alert) = alert else { break };
                        if let Err(e) = store.insert_margin_alert(&alert) {
                            warn!(symbol = %alert.symbol, error = %e, "Margin alert insert failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        })
    }

    /// Periodic PnL snapshots, equity history and the daily rollup.
    fn spawn_snapshot_loop(&self) -> JoinHandle<()> {
        let calculator = self.calculator.clone();
        let store = self.store.clone();
        let interval_secs = self.config.service.snapshot_interval_secs;
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        for snapshot in calculator.snapshots(now).await {
                            if let Err(e) = store.insert_pnl_snapshot(&snapshot) {
                                warn!(error = %e, "PnL snapshot insert failed");
                            }
                        }
                        if let Err(e) = store.insert_equity_snapshot(&calculator.equity_snapshot(now).await) {
                            warn!(error = %e, "Equity snapshot insert failed");
                        }
                        let summary = calculator.daily_summary(now).await;
                        if let Err(e) = store.upsert_daily_summary(&summary, now) {
                            warn!(error = %e, "Daily summary upsert failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        })
    }

    /// Hourly history retention pass.
    fn spawn_cleanup_loop(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval_secs = self.config.persistence.cleanup_interval_secs;
        let retention_days = self.config.persistence.retention_days;
        let mut shutdown = self.shutdown_rx();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
                        match store.cleanup(cutoff) {
                            Ok(removed) if removed > 0 => {
                                info!(removed, "History retention pass complete");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "History cleanup failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        })
    }
}
