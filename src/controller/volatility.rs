//! Per-symbol realized volatility, EWMA over sampled returns.

use rust_decimal::{Decimal, MathematicalOps};
use std::collections::HashMap;

const SECONDS_PER_YEAR: u64 = 31_536_000;

#[derive(Debug, Clone)]
struct VolState {
    last_price: Decimal,
    variance: Decimal,
    samples: u64,
}

/// EWMA realized volatility model.
///
/// `observe` is fed one price sample per assessment tick; `vol` reports the
/// annualized standard deviation of returns.
pub struct EwmaVolatility {
    lambda: Decimal,
    annualization: Decimal,
    state: HashMap<String, VolState>,
}

impl EwmaVolatility {
    pub fn new(lambda: Decimal, sample_interval_secs: u64) -> Self {
        let samples_per_year =
            Decimal::from(SECONDS_PER_YEAR) / Decimal::from(sample_interval_secs.max(1));
        Self {
            lambda,
            annualization: samples_per_year.sqrt().unwrap_or(Decimal::ONE),
            state: HashMap::new(),
        }
    }

    /// Fold one price sample into the model.
    pub fn observe(&mut self, symbol: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        match self.state.get_mut(symbol) {
            None => {
                self.state.insert(
                    symbol.to_string(),
                    VolState {
                        last_price: price,
                        variance: Decimal::ZERO,
                        samples: 1,
                    },
                );
            }
            Some(state) => {
                let ret = (price - state.last_price) / state.last_price;
                state.variance =
                    self.lambda * state.variance + (Decimal::ONE - self.lambda) * ret * ret;
                state.last_price = price;
                state.samples += 1;
            }
        }
    }

    /// Annualized volatility, `None` until the symbol has enough samples.
    pub fn vol(&self, symbol: &str) -> Option<Decimal> {
        let state = self.state.get(symbol)?;
        if state.samples < 2 {
            return None;
        }
        state.variance.sqrt().map(|sd| sd * self.annualization)
    }

    /// Mean annualized volatility across the given symbols, falling back to
    /// `default_vol` per symbol without samples.
    pub fn average_vol(&self, symbols: &[String], default_vol: Decimal) -> Decimal {
        if symbols.is_empty() {
            return default_vol;
        }
        let sum: Decimal = symbols
            .iter()
            .map(|s| self.vol(s).unwrap_or(default_vol))
            .sum();
        sum / Decimal::from(symbols.len())
    }
}
