//! Decimal arithmetic utilities for risk calculations.

use rust_decimal::{Decimal, MathematicalOps};

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Clamp a value to the inclusive range `[min, max]`.
pub fn clamp(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    value.max(min).min(max)
}

/// Relative change from `from` to `to`, zero when `from` is zero.
pub fn pct_change(from: Decimal, to: Decimal) -> Decimal {
    safe_div(to - from, from)
}

/// Euclidean norm of the inputs, used for independence-assumption VaR
/// aggregation.
pub fn quadrature_sum(values: &[Decimal]) -> Decimal {
    let sum_sq: Decimal = values.iter().map(|v| v * v).sum();
    sum_sq.sqrt().unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(dec!(1.5), dec!(0.1), dec!(1.2)), dec!(1.2));
        assert_eq!(clamp(dec!(0.05), dec!(0.1), dec!(1.2)), dec!(0.1));
        assert_eq!(clamp(dec!(0.9), dec!(0.1), dec!(1.2)), dec!(0.9));
    }

    #[test]
    fn test_pct_change() {
        assert_eq!(pct_change(dec!(100), dec!(105)), dec!(0.05));
        assert_eq!(pct_change(dec!(100), dec!(95)), dec!(-0.05));
        assert_eq!(pct_change(Decimal::ZERO, dec!(95)), Decimal::ZERO);
    }

    #[test]
    fn test_quadrature_sum() {
        // 3-4-5 triangle
        assert_eq!(quadrature_sum(&[dec!(3), dec!(4)]), dec!(5));
        assert_eq!(quadrature_sum(&[]), Decimal::ZERO);
    }
}
