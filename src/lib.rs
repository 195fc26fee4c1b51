//! # Perp Sentinel
//!
//! Real-time risk and position-control engine for leveraged perpetual
//! futures. Watches a live portfolio, computes PnL and margin state from the
//! mark-price stream, and executes defensive actions (reduce, close, cancel,
//! de-leverage, halt) when configurable thresholds are breached.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue capability trait, Binance adapter, paper venue
//! - `pnl`: Live PnL, margin and equity accounting
//! - `stops`: Per-symbol protective stops (fixed, trailing, ATR, time,
//!   Chandelier, Parabolic)
//! - `breaker`: Per-symbol price-move circuit breaker
//! - `monitor`: Threshold scanning, cooldown and trigger events
//! - `executor`: Trigger-event to exchange-action dispatch
//! - `controller`: Composite risk scoring, dynamic limits, stress tests
//! - `managers`: Position/order caches mirroring exchange state
//! - `persistence`: SQLite history and alert store
//! - `service`: Wiring, background loops and shutdown
//! - `utils`: Shared decimal arithmetic helpers

pub mod breaker;
pub mod config;
pub mod controller;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod managers;
pub mod monitor;
pub mod persistence;
pub mod pnl;
pub mod service;
pub mod stops;
pub mod utils;

pub use config::Config;
pub use service::RiskService;
