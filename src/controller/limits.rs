//! Per-symbol risk limits, base and dynamically adjusted copies.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;

use crate::utils::decimal::{clamp, safe_div};

use super::score::RiskLevel;

/// Hard bounds on the dynamic-limit factor.
pub const FACTOR_FLOOR: Decimal = dec!(0.1);
pub const FACTOR_CEIL: Decimal = dec!(1.2);

/// Trading limits for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct RiskLimits {
    pub symbol: String,
    pub max_position_value: Decimal,
    pub max_leverage: u8,
    pub max_drawdown: Decimal,
    pub circuit_breaker_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub trailing_stop_pct: Decimal,
}

impl RiskLimits {
    /// Conservative defaults for a newly tracked symbol.
    pub fn default_for(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            max_position_value: dec!(100_000),
            max_leverage: 20,
            max_drawdown: dec!(0.15),
            circuit_breaker_pct: dec!(0.05),
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.05),
            trailing_stop_pct: dec!(0.03),
        }
    }

    /// Component-wise scale. Leverage floors at 1x.
    pub fn scaled(&self, factor: Decimal) -> Self {
        let leverage = (Decimal::from(self.max_leverage) * factor)
            .floor()
            .to_u8()
            .unwrap_or(1)
            .max(1);
        Self {
            symbol: self.symbol.clone(),
            max_position_value: self.max_position_value * factor,
            max_leverage: leverage,
            max_drawdown: self.max_drawdown * factor,
            circuit_breaker_pct: self.circuit_breaker_pct * factor,
            stop_loss_pct: self.stop_loss_pct * factor,
            take_profit_pct: self.take_profit_pct * factor,
            trailing_stop_pct: self.trailing_stop_pct * factor,
        }
    }
}

/// Risk-level component of the dynamic-limit factor.
pub fn level_factor(level: RiskLevel) -> Decimal {
    match level {
        RiskLevel::Low => dec!(1.0),
        RiskLevel::Medium => dec!(0.9),
        RiskLevel::High => dec!(0.8),
        RiskLevel::Critical => dec!(0.5),
        RiskLevel::Emergency => dec!(0.1),
    }
}

/// Composite factor from risk level and average realized volatility,
/// clamped to `[0.1, 1.2]`. Calm markets (below target vol) relax limits,
/// turbulent markets shrink them.
pub fn composite_factor(level: RiskLevel, avg_vol: Decimal, target_vol: Decimal) -> Decimal {
    let vol_factor = if avg_vol <= Decimal::ZERO {
        Decimal::ONE
    } else {
        clamp(safe_div(target_vol, avg_vol), dec!(0.5), dec!(1.5))
    };
    clamp(level_factor(level) * vol_factor, FACTOR_FLOOR, FACTOR_CEIL)
}

/// Base and adjusted limits for every tracked symbol.
pub struct LimitBook {
    base: HashMap<String, RiskLimits>,
    adjusted: HashMap<String, RiskLimits>,
    factor: Decimal,
}

impl LimitBook {
    pub fn new(symbols: &[String]) -> Self {
        let base: HashMap<String, RiskLimits> = symbols
            .iter()
            .map(|s| (s.clone(), RiskLimits::default_for(s)))
            .collect();
        let adjusted = base.clone();
        Self {
            base,
            adjusted,
            factor: Decimal::ONE,
        }
    }

    /// Replace the base limits for a symbol; the adjustment re-applies.
    pub fn set_base(&mut self, limits: RiskLimits) {
        let symbol = limits.symbol.clone();
        self.adjusted.insert(symbol.clone(), limits.scaled(self.factor));
        self.base.insert(symbol, limits);
    }

    /// Re-derive every adjusted limit from its base.
    pub fn adjust_all(&mut self, factor: Decimal) {
        let factor = clamp(factor, FACTOR_FLOOR, FACTOR_CEIL);
        self.factor = factor;
        self.adjusted = self
            .base
            .iter()
            .map(|(s, l)| (s.clone(), l.scaled(factor)))
            .collect();
    }

    pub fn factor(&self) -> Decimal {
        self.factor
    }

    pub fn base(&self, symbol: &str) -> Option<&RiskLimits> {
        self.base.get(symbol)
    }

    pub fn adjusted(&self, symbol: &str) -> Option<&RiskLimits> {
        self.adjusted.get(symbol)
    }

    pub fn all_adjusted(&self) -> Vec<RiskLimits> {
        self.adjusted.values().cloned().collect()
    }
}
