//! Configuration management for the risk engine.
//!
//! Loads settings from environment variables and config files. Components
//! re-read their section at loop head, so updates swapped in atomically
//! take effect on the next tick.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Venue API credentials and mode
    pub exchange: ExchangeConfig,
    /// Service wiring: symbols, cadences, shutdown
    pub service: ServiceConfig,
    /// Monitor trigger thresholds
    pub thresholds: RiskThresholds,
    /// Executor behavior
    pub executor: ExecutorConfig,
    /// Per-symbol circuit breaker
    pub breaker: BreakerConfig,
    /// Intelligent controller parameters
    pub controller: ControllerConfig,
    /// SQLite persistence
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// Use the in-memory paper venue instead of a live connection
    #[serde(default)]
    pub paper: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Symbols to monitor (uppercase, venue-native form)
    pub symbols: Vec<String>,
    /// Monitor evaluation cadence in seconds
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// PnL snapshot cadence in seconds
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Trigger cooldown window in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Position/order reconciler cadence in seconds
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Graceful drain budget on shutdown in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Log defensive actions without touching the exchange
    #[serde(default)]
    pub dry_run: bool,
}

/// Trigger thresholds evaluated by the risk monitor.
///
/// Margin thresholds are on the utilization scale (margin used / equity),
/// where higher means riskier.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskThresholds {
    /// Margin utilization that forces a position reduction
    #[serde(default = "default_max_margin_ratio")]
    pub max_margin_ratio: Decimal,
    /// Margin utilization that raises an alert only
    #[serde(default = "default_warning_margin_ratio")]
    pub warning_margin_ratio: Decimal,
    /// Aggregate daily loss in quote currency that halts trading
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Absolute per-position loss in quote currency that closes the position
    #[serde(default = "default_max_position_loss")]
    pub max_position_loss: Decimal,
    /// Per-position loss as a fraction of position margin that reduces it
    #[serde(default = "default_max_position_loss_percent")]
    pub max_position_loss_percent: Decimal,
    /// Account equity floor in quote currency that halts trading
    #[serde(default = "default_min_account_balance")]
    pub min_account_balance: Decimal,
    /// Drawdown from peak equity that forces a reduction
    #[serde(default = "default_max_drawdown_percent")]
    pub max_drawdown_percent: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Fraction of |size| removed by a reduce action (0.0-1.0)
    #[serde(default = "default_max_reduction_fraction")]
    pub max_reduction_fraction: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Absolute price change fraction that trips the breaker
    #[serde(default = "default_breaker_price_change")]
    pub price_change: Decimal,
    /// Window after which the base price is considered stale, in seconds
    #[serde(default = "default_breaker_window_secs")]
    pub time_window_secs: u64,
    /// Halt duration after a trip, in seconds
    #[serde(default = "default_breaker_cooldown_secs")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Risk assessment cadence in seconds
    #[serde(default = "default_assessment_interval_secs")]
    pub assessment_interval_secs: u64,
    /// Dynamic limit adjustment cadence in seconds
    #[serde(default = "default_limits_interval_secs")]
    pub limits_interval_secs: u64,
    /// Stress test cadence in seconds
    #[serde(default = "default_stress_interval_secs")]
    pub stress_interval_secs: u64,
    /// Risk report cadence in seconds
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,

    /// Normalized VaR considered fully risk-contributing
    #[serde(default = "default_var_threshold")]
    pub var_threshold: Decimal,
    /// Drawdown considered fully risk-contributing
    #[serde(default = "default_drawdown_threshold")]
    pub drawdown_threshold: Decimal,
    /// Largest-position share considered fully risk-contributing
    #[serde(default = "default_concentration_threshold")]
    pub concentration_threshold: Decimal,
    /// Average pairwise correlation considered fully risk-contributing
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: Decimal,
    /// Liquidity score below which liquidity contributes risk
    #[serde(default = "default_liquidity_floor")]
    pub liquidity_floor: Decimal,

    /// Assumed average pairwise correlation of the portfolio
    #[serde(default = "default_avg_correlation")]
    pub avg_correlation: Decimal,
    /// Reference starting balance for reporting
    #[serde(default = "default_starting_balance")]
    pub starting_balance: Decimal,
    /// Conditional VaR as a multiple of VaR
    #[serde(default = "default_cvar_multiplier")]
    pub cvar_multiplier: Decimal,
    /// Liquidity score assumed for symbols without depth data
    #[serde(default = "default_liquidity_score")]
    pub default_liquidity_score: Decimal,
    /// Annualized volatility assumed for symbols without samples
    #[serde(default = "default_volatility")]
    pub default_volatility: Decimal,
    /// Annualized volatility the dynamic-limit factor targets
    #[serde(default = "default_target_volatility")]
    pub target_volatility: Decimal,
    /// EWMA decay for the realized volatility model
    #[serde(default = "default_ewma_lambda")]
    pub ewma_lambda: Decimal,
    /// Stress-scenario portfolio loss fraction that raises an alert
    #[serde(default = "default_stress_loss_alert")]
    pub stress_loss_alert: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Days of history kept by the hourly cleanup
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Cleanup cadence in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

// Default value functions

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_snapshot_interval_secs() -> u64 {
    1
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_reconcile_interval_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_max_margin_ratio() -> Decimal {
    Decimal::new(8, 1) // 0.8
}

fn default_warning_margin_ratio() -> Decimal {
    Decimal::new(7, 1) // 0.7
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(5000, 0) // 5000 USDT
}

fn default_max_position_loss() -> Decimal {
    Decimal::new(1000, 0) // 1000 USDT
}

fn default_max_position_loss_percent() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_min_account_balance() -> Decimal {
    Decimal::new(1000, 0) // 1000 USDT
}

fn default_max_drawdown_percent() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_max_reduction_fraction() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_breaker_price_change() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_breaker_window_secs() -> u64 {
    60
}

fn default_breaker_cooldown_secs() -> u64 {
    300
}

fn default_assessment_interval_secs() -> u64 {
    10
}

fn default_limits_interval_secs() -> u64 {
    300
}

fn default_stress_interval_secs() -> u64 {
    3600
}

fn default_report_interval_secs() -> u64 {
    21600
}

fn default_var_threshold() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_drawdown_threshold() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_concentration_threshold() -> Decimal {
    Decimal::new(40, 2) // 0.40
}

fn default_correlation_threshold() -> Decimal {
    Decimal::new(60, 2) // 0.60
}

fn default_liquidity_floor() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_avg_correlation() -> Decimal {
    Decimal::new(30, 2) // 0.30
}

fn default_starting_balance() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_cvar_multiplier() -> Decimal {
    Decimal::new(13, 1) // 1.3
}

fn default_liquidity_score() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_volatility() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_target_volatility() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_ewma_lambda() -> Decimal {
    Decimal::new(94, 2) // 0.94
}

fn default_stress_loss_alert() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_db_path() -> String {
    "data/sentinel.db".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("PS"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.service.symbols.is_empty(),
            "at least one symbol must be configured"
        );

        anyhow::ensure!(
            self.service
                .symbols
                .iter()
                .all(|s| !s.is_empty() && *s == s.to_uppercase()),
            "symbols must be non-empty and uppercase"
        );

        anyhow::ensure!(
            self.thresholds.warning_margin_ratio < self.thresholds.max_margin_ratio,
            "warning_margin_ratio must be below max_margin_ratio"
        );

        anyhow::ensure!(
            self.thresholds.max_daily_loss > Decimal::ZERO
                && self.thresholds.max_position_loss > Decimal::ZERO,
            "loss limits must be positive"
        );

        anyhow::ensure!(
            self.executor.max_reduction_fraction > Decimal::ZERO
                && self.executor.max_reduction_fraction <= Decimal::ONE,
            "max_reduction_fraction must be in (0, 1]"
        );

        anyhow::ensure!(
            self.breaker.price_change > Decimal::ZERO && self.breaker.price_change < Decimal::ONE,
            "breaker price_change must be in (0, 1)"
        );

        anyhow::ensure!(
            self.controller.ewma_lambda > Decimal::ZERO
                && self.controller.ewma_lambda < Decimal::ONE,
            "ewma_lambda must be in (0, 1)"
        );

        anyhow::ensure!(
            !self.exchange.paper || (self.exchange.api_key.is_empty() || self.exchange.testnet),
            "paper mode does not use production credentials"
        );

        if !self.exchange.paper {
            anyhow::ensure!(
                !self.exchange.api_key.is_empty() && !self.exchange.secret_key.is_empty(),
                "live mode requires api_key and secret_key"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig {
                api_key: String::new(),
                secret_key: String::new(),
                testnet: true,
                paper: true,
            },
            service: ServiceConfig {
                symbols: vec!["BTCUSDT".to_string()],
                monitor_interval_secs: default_monitor_interval_secs(),
                snapshot_interval_secs: default_snapshot_interval_secs(),
                cooldown_secs: default_cooldown_secs(),
                reconcile_interval_secs: default_reconcile_interval_secs(),
                shutdown_grace_secs: default_shutdown_grace_secs(),
                dry_run: false,
            },
            thresholds: RiskThresholds::default(),
            executor: ExecutorConfig {
                max_reduction_fraction: default_max_reduction_fraction(),
            },
            breaker: BreakerConfig {
                price_change: default_breaker_price_change(),
                time_window_secs: default_breaker_window_secs(),
                cooldown_secs: default_breaker_cooldown_secs(),
            },
            controller: ControllerConfig::default(),
            persistence: PersistenceConfig {
                db_path: default_db_path(),
                retention_days: default_retention_days(),
                cleanup_interval_secs: default_cleanup_interval_secs(),
            },
        }
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            max_margin_ratio: default_max_margin_ratio(),
            warning_margin_ratio: default_warning_margin_ratio(),
            max_daily_loss: default_max_daily_loss(),
            max_position_loss: default_max_position_loss(),
            max_position_loss_percent: default_max_position_loss_percent(),
            min_account_balance: default_min_account_balance(),
            max_drawdown_percent: default_max_drawdown_percent(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            assessment_interval_secs: default_assessment_interval_secs(),
            limits_interval_secs: default_limits_interval_secs(),
            stress_interval_secs: default_stress_interval_secs(),
            report_interval_secs: default_report_interval_secs(),
            var_threshold: default_var_threshold(),
            drawdown_threshold: default_drawdown_threshold(),
            concentration_threshold: default_concentration_threshold(),
            correlation_threshold: default_correlation_threshold(),
            liquidity_floor: default_liquidity_floor(),
            avg_correlation: default_avg_correlation(),
            starting_balance: default_starting_balance(),
            cvar_multiplier: default_cvar_multiplier(),
            default_liquidity_score: default_liquidity_score(),
            default_volatility: default_volatility(),
            target_volatility: default_target_volatility(),
            ewma_lambda: default_ewma_lambda(),
            stress_loss_alert: default_stress_loss_alert(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            price_change: default_breaker_price_change(),
            time_window_secs: default_breaker_window_secs(),
            cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}
