//! Canned stress scenarios applied to the live portfolio.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::exchange::{Position, PositionSide};
use crate::utils::decimal::safe_div;

/// A hypothetical market move.
#[derive(Debug, Clone, Serialize)]
pub struct StressScenario {
    pub name: &'static str,
    /// Uniform price shock applied to every symbol
    pub price_shock: Decimal,
    /// Volatility multiplier (reported, not applied to prices)
    pub vol_multiplier: Decimal,
}

/// The four standing scenarios.
pub fn builtin_scenarios() -> Vec<StressScenario> {
    vec![
        StressScenario {
            name: "Market Crash",
            price_shock: dec!(-0.20),
            vol_multiplier: dec!(2.0),
        },
        StressScenario {
            name: "Flash Crash",
            price_shock: dec!(-0.10),
            vol_multiplier: dec!(3.0),
        },
        StressScenario {
            name: "High Volatility",
            price_shock: Decimal::ZERO,
            vol_multiplier: dec!(2.5),
        },
        StressScenario {
            name: "Liquidity Crisis",
            price_shock: dec!(-0.05),
            vol_multiplier: dec!(1.5),
        },
    ]
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct StressResult {
    pub scenario: &'static str,
    pub price_shock: Decimal,
    pub vol_multiplier: Decimal,
    /// Portfolio loss as a fraction of equity; positive means losing
    pub loss_fraction: Decimal,
    pub breached: bool,
}

/// Apply the shock to every position and express the loss relative to
/// account equity. Longs lose on a downward shock, shorts gain.
pub fn run_scenario(
    positions: &[Position],
    equity: Decimal,
    scenario: &StressScenario,
    alert_threshold: Decimal,
) -> StressResult {
    let pnl: Decimal = positions
        .iter()
        .filter(|p| p.is_open())
        .map(|p| {
            let shocked = p.notional() * scenario.price_shock;
            match p.side {
                PositionSide::Long => shocked,
                PositionSide::Short => -shocked,
            }
        })
        .sum();

    let loss_fraction = safe_div(-pnl, equity);
    StressResult {
        scenario: scenario.name,
        price_shock: scenario.price_shock,
        vol_multiplier: scenario.vol_multiplier,
        loss_fraction,
        breached: loss_fraction > alert_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MarginType;
    use chrono::Utc;

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

    fn crash() -> StressScenario {
        builtin_scenarios()
            .into_iter()
            .find(|s| s.name == "Market Crash")
            .unwrap()
    }

    #[test]
    fn test_crash_on_70pct_long_book_stays_under_alert() {
        // 70k long BTC notional against 100k equity: loss = 0.7 * 0.2 = 0.14
        let positions = vec![position("BTCUSDT", dec!(3.5), dec!(20000))];
        let result = run_scenario(&positions, dec!(100_000), &crash(), dec!(0.15));

        assert_eq!(result.loss_fraction, dec!(0.14));
        assert!(!result.breached);
    }

    #[test]
    fn test_crash_on_80pct_long_book_breaches() {
        // 80k long notional: loss = 0.16 > 0.15
        let positions = vec![position("BTCUSDT", dec!(4), dec!(20000))];
        let result = run_scenario(&positions, dec!(100_000), &crash(), dec!(0.15));

        assert_eq!(result.loss_fraction, dec!(0.16));
        assert!(result.breached);
    }

    #[test]
    fn test_shorts_hedge_the_shock() {
        let positions = vec![
            position("BTCUSDT", dec!(4), dec!(20000)),   // 80k long
            position("ETHUSDT", dec!(-20), dec!(3000)),  // 60k short
        ];
        let result = run_scenario(&positions, dec!(100_000), &crash(), dec!(0.15));

        // 0.2 * (80k - 60k) / 100k
        assert_eq!(result.loss_fraction, dec!(0.04));
        assert!(!result.breached);
    }

    #[test]
    fn test_zero_shock_scenario_never_breaches_on_price() {
        let positions = vec![position("BTCUSDT", dec!(10), dec!(20000))];
        let high_vol = builtin_scenarios()
            .into_iter()
            .find(|s| s.name == "High Volatility")
            .unwrap();
        let result = run_scenario(&positions, dec!(100_000), &high_vol, dec!(0.15));
        assert_eq!(result.loss_fraction, Decimal::ZERO);
        assert!(!result.breached);
    }

    #[test]
    fn test_all_builtin_scenarios_present() {
        let names: Vec<&str> = builtin_scenarios().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["Market Crash", "Flash Crash", "High Volatility", "Liquidity Crisis"]
        );
    }
}
