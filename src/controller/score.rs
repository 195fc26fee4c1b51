//! Composite risk score and level banding.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::config::ControllerConfig;
use crate::utils::decimal::{clamp, safe_div};

/// Each contribution is the dimension weight scaled by the exceedance ratio
/// against its threshold, capped here.
const EXCEEDANCE_CAP: Decimal = dec!(1.2);

const WEIGHT_VAR: Decimal = dec!(30);
const WEIGHT_DRAWDOWN: Decimal = dec!(25);
const WEIGHT_CONCENTRATION: Decimal = dec!(20);
const WEIGHT_CORRELATION: Decimal = dec!(15);
const WEIGHT_LIQUIDITY: Decimal = dec!(10);

/// Ordered portfolio risk grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
            RiskLevel::Emergency => "emergency",
        }
    }

    /// Band edges: >=100 Emergency, >=80 Critical, >=60 High, >=30 Medium.
    pub fn from_score(score: Decimal) -> Self {
        if score >= dec!(100) {
            RiskLevel::Emergency
        } else if score >= dec!(80) {
            RiskLevel::Critical
        } else if score >= dec!(60) {
            RiskLevel::High
        } else if score >= dec!(30) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Metric snapshot feeding the composite score.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMetrics {
    /// Portfolio VaR as a fraction of total notional
    pub var_ratio: Decimal,
    /// Conditional VaR as a fraction of total notional
    pub cvar_ratio: Decimal,
    /// Drawdown from peak equity
    pub drawdown: Decimal,
    /// Largest single-position share of total notional
    pub concentration: Decimal,
    /// Assumed average pairwise correlation
    pub avg_correlation: Decimal,
    /// Aggregate liquidity score, 1 = perfectly liquid
    pub liquidity_score: Decimal,
    pub total_notional: Decimal,
    pub equity: Decimal,
    pub at: DateTime<Utc>,
}

impl RealtimeMetrics {
    pub fn flat(equity: Decimal, config: &ControllerConfig, at: DateTime<Utc>) -> Self {
        Self {
            var_ratio: Decimal::ZERO,
            cvar_ratio: Decimal::ZERO,
            drawdown: Decimal::ZERO,
            concentration: Decimal::ZERO,
            avg_correlation: config.avg_correlation,
            liquidity_score: config.default_liquidity_score,
            total_notional: Decimal::ZERO,
            equity,
            at,
        }
    }
}

fn contribution(value: Decimal, threshold: Decimal, weight: Decimal) -> Decimal {
    weight * clamp(safe_div(value, threshold), Decimal::ZERO, EXCEEDANCE_CAP)
}

/// Weighted composite risk score. With every dimension at its cap the score
/// is 120; the Emergency band starts at 100.
pub fn composite_score(metrics: &RealtimeMetrics, config: &ControllerConfig) -> Decimal {
    let liquidity_risk = Decimal::ONE - metrics.liquidity_score;
    let liquidity_threshold = Decimal::ONE - config.liquidity_floor;

    contribution(metrics.var_ratio, config.var_threshold, WEIGHT_VAR)
        + contribution(metrics.drawdown, config.drawdown_threshold, WEIGHT_DRAWDOWN)
        + contribution(
            metrics.concentration,
            config.concentration_threshold,
            WEIGHT_CONCENTRATION,
        )
        + contribution(
            metrics.avg_correlation,
            config.correlation_threshold,
            WEIGHT_CORRELATION,
        )
        + contribution(liquidity_risk, liquidity_threshold, WEIGHT_LIQUIDITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banding_is_total_and_exact_at_edges() {
        assert_eq!(RiskLevel::from_score(dec!(-5)), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(dec!(0)), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(dec!(29.999)), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(dec!(30)), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(dec!(59.999)), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(dec!(60)), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(dec!(79.999)), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(dec!(80)), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(dec!(99.999)), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(dec!(100)), RiskLevel::Emergency);
        assert_eq!(RiskLevel::from_score(dec!(500)), RiskLevel::Emergency);
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert!(RiskLevel::Critical < RiskLevel::Emergency);
    }

    #[test]
    fn test_flat_portfolio_scores_low_dimensions() {
        let config = ControllerConfig::default();
        let metrics = RealtimeMetrics::flat(dec!(100000), &config, Utc::now());
        let score = composite_score(&metrics, &config);

        // Only the assumed correlation (0.3/0.6) and residual liquidity risk
        // ((1-0.8)/(1-0.5)) contribute: 15*0.5 + 10*0.4 = 11.5
        assert_eq!(score, dec!(11.5));
        assert_eq!(RiskLevel::from_score(score), RiskLevel::Low);
    }

    #[test]
    fn test_contributions_cap_at_exceedance() {
        let config = ControllerConfig::default();
        let mut metrics = RealtimeMetrics::flat(dec!(100000), &config, Utc::now());
        metrics.var_ratio = dec!(100); // absurd exceedance still caps at 1.2
        metrics.drawdown = dec!(1);
        metrics.concentration = dec!(1);
        metrics.avg_correlation = dec!(1);
        metrics.liquidity_score = Decimal::ZERO;

        let score = composite_score(&metrics, &config);
        assert_eq!(score, dec!(120));
        assert_eq!(RiskLevel::from_score(score), RiskLevel::Emergency);
    }

    #[test]
    fn test_score_monotone_in_var() {
        let config = ControllerConfig::default();
        let mut low = RealtimeMetrics::flat(dec!(100000), &config, Utc::now());
        low.var_ratio = dec!(0.02);
        let mut high = low.clone();
        high.var_ratio = dec!(0.08);

        assert!(composite_score(&high, &config) > composite_score(&low, &config));
    }
}
