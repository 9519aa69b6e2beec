// genopt_core/src/walk_forward.rs

//! Walk-forward segmentation of a candle history.
//!
//! With `L` candles and `S` segments the forward slice length is
//! `f = L / (S + 2)` and the backtest slice length is `2f`, so the last
//! segment's forward slice ends at or before the tail of the history.

use crate::settings;

/// A backtest slice followed by its held-out forward slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub backtest: std::ops::Range<usize>,
    pub forward: std::ops::Range<usize>,
}

impl Segment {
    pub fn backtest_slice<'a, T>(&self, history: &'a [T]) -> &'a [T] {
        &history[self.backtest.clone()]
    }

    pub fn forward_slice<'a, T>(&self, history: &'a [T]) -> &'a [T] {
        &history[self.forward.clone()]
    }

}

/// Splits `len` candles into `count` segments.
pub fn segment(len: usize, count: usize, mode: settings::WalkForwardMode) -> anyhow::Result<Vec<Segment>> {
    if count == 0 {
        anyhow::bail!("Walk-forward needs at least one segment");
    }

    let forward = len / (count + 2);
    if forward == 0 {
        anyhow::bail!(
            "History of {} candles is too short for {} walk-forward segments",
            len,
            count
        );
    }
    let backtest = forward * 2;

    let segments = (0..count)
        .map(|i| {
            let (start, split) = match mode {
                settings::WalkForwardMode::Rolling => (i * forward, i * forward + backtest),
                settings::WalkForwardMode::Anchored => (0, backtest + i * forward),
            };
            let split = split.min(len);
            let end = (split + forward).min(len);

            Segment {
                index: i,
                backtest: start..split,
                forward: split..end,
            }
        })
        .collect();

    anyhow::Ok(segments)
}
