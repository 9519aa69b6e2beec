// genopt_core/src/indicators.rs

//! Technical indicators over candle closes.
//!
//! All functions are pure and return `None` when there is not enough data for
//! the requested lookback window.

use crate::data_handler;

/// Direction of a fast/slow line crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cross {
    /// Fast line moved above the slow one.
    Up,
    /// Fast line moved below the slow one.
    Down,
}

/// Computes the **Simple Moving Average (SMA)** of the last `n` values.
///
/// # Arguments
/// * `values` - Data points, oldest first.
/// * `n` - Lookback period. Must be at least 1.
///
/// # Returns
/// * `Some(f64)` - The average of the last `n` values.
/// * `None` - If `n == 0` or fewer than `n` values are available.
pub fn sma(values: &[f64], n: usize) -> Option<f64> {
    if n == 0 || values.len() < n {
        return None;
    }

    let sum: f64 = values[values.len() - n..].iter().sum();
    Some(sum / n as f64)
}

/// SMA of the last `n` closes, shifted back by `shift` candles.
pub fn sma_of_closes(candles: &[data_handler::Candle], n: usize, shift: usize) -> Option<f64> {
    let end = candles.len().checked_sub(shift)?;
    let closes: Vec<f64> = candles[..end].iter().map(|c| c.close).collect();
    sma(&closes, n)
}

/// Detects whether `fast` crossed `slow` between the previous and the current bar.
pub fn cross(previous: (f64, f64), current: (f64, f64)) -> Option<Cross> {
    let (prev_fast, prev_slow) = previous;
    let (fast, slow) = current;

    if prev_fast <= prev_slow && fast > slow {
        Some(Cross::Up)
    } else if prev_fast >= prev_slow && fast < slow {
        Some(Cross::Down)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_needs_enough_data() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0, 2.0], 3), None);
        assert_eq!(sma(&[1.0], 0), None);
    }

    #[test]
    fn shifted_sma_over_closes() {
        let ts = chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap();
        let candles: Vec<data_handler::Candle> = [1.0, 2.0, 3.0, 6.0]
            .iter()
            .map(|&c| data_handler::Candle::new(ts, c, c, c, c, 0.0))
            .collect();

        assert_eq!(sma_of_closes(&candles, 2, 0), Some(4.5));
        assert_eq!(sma_of_closes(&candles, 2, 1), Some(2.5));
        assert_eq!(sma_of_closes(&candles, 4, 1), None);
        assert_eq!(sma_of_closes(&candles, 1, 5), None);
    }

    #[test]
    fn detects_crossings() {
        assert_eq!(cross((1.0, 2.0), (3.0, 2.0)), Some(Cross::Up));
        assert_eq!(cross((3.0, 2.0), (1.0, 2.0)), Some(Cross::Down));
        assert_eq!(cross((3.0, 2.0), (4.0, 2.0)), None);
    }
}
