// genopt_core/src/instruments_info.rs

use crate::data_handler;

/// Number of trailing closes inspected when deriving the pip size.
pub const PIP_SAMPLE_SIZE: usize = 20;
/// Most decimal places a pip size can resolve to.
pub const MAX_PIP_DIGITS: usize = 8;

/// Instrument metadata a transport reports for its ticker.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct Instrument {
    pub ticker: String,
    /// Units per lot.
    pub lot: f64,
    /// Minimum meaningful price increment.
    pub pip_size: f64,
}

impl Instrument {
    pub fn new(ticker: &str, lot: f64, pip_size: f64) -> Self {
        Self {
            ticker: ticker.to_string(),
            lot,
            pip_size,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lot <= 0.0 {
            anyhow::bail!(
                "Validation error for instrument '{}': 'lot' must be positive, got {}",
                self.ticker,
                self.lot,
            );
        }

        if self.pip_size <= 0.0 {
            anyhow::bail!(
                "Validation error for instrument '{}': 'pip_size' must be positive, got {}",
                self.ticker,
                self.pip_size,
            );
        }

        anyhow::Ok(())
    }

}

/// Derives the pip size from the decimal places used by the last closes.
/// A series quoted with at most 4 decimals yields 0.0001; integer prices yield 1.
pub fn pip_size_from_closes(candles: &[data_handler::Candle]) -> f64 {
    let start = candles.len().saturating_sub(PIP_SAMPLE_SIZE);
    let digits = candles[start..]
        .iter()
        .map(|candle| decimal_places(candle.close))
        .max()
        .unwrap_or(0);

    10f64.powi(-(digits as i32))
}

/// Decimal places of the shortest representation of `value`, capped at
/// `MAX_PIP_DIGITS` so float noise cannot shrink the pip size.
fn decimal_places(value: f64) -> usize {
    if !value.is_finite() {
        return 0;
    }

    let repr = format!("{}", value);
    match repr.split_once('.') {
        Some((_, fraction)) => fraction.trim_end_matches('0').len().min(MAX_PIP_DIGITS),
        None => 0,
    }
}
