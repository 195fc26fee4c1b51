//! Typed errors for fail-fast input validation.
//!
//! Transient exchange failures travel as `anyhow::Error` with context; these
//! variants are returned before any state mutation happens.

use rust_decimal::Decimal;
use thiserror::Error;

/// Validation failures for operator- and strategy-supplied inputs.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("stop price must be positive, got {0}")]
    InvalidStopPrice(Decimal),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("trailing delta must be in (0, 1), got {0}")]
    InvalidTrailingDelta(Decimal),

    #[error("duration must be positive")]
    InvalidDuration,

    #[error("symbol is required for action {0}")]
    SymbolRequired(&'static str),

    #[error("threshold {name} out of range: {value}")]
    InvalidThreshold { name: &'static str, value: Decimal },
}
