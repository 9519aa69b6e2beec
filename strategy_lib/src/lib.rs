// strategy_lib/src/lib.rs

//! Moving-average crossover strategy written as a pair of plugins:
//! `sma_cross` produces the signals and `risk` can veto openings.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use genopt_core::event;
use genopt_core::schema;
use genopt_core::worker;
use genopt_core::indicators;
use genopt_core::plugins::{Hook, HookEvent, HookFlow, Plugin, PluginContext};

pub const SMA_CROSS_PLUGIN: &str = "sma_cross";
pub const RISK_PLUGIN: &str = "risk";

/// A simple moving average crossover strategy.
/// Goes long when the fast SMA crosses above the slow one and short on the
/// opposite cross; `reverse` swaps the two sides.
pub struct SmaCrossover {
    /// The window size for the short-term Simple Moving Average (SMA).
    fast: usize,
    /// The window size for the long-term Simple Moving Average (SMA).
    slow: usize,
    reverse: bool,
    closes: std::sync::Mutex<std::collections::VecDeque<f64>>,
    previous: std::sync::Mutex<Option<(f64, f64)>>,
}

impl SmaCrossover {
    /// Reads `fast`, `slow` and the optional `reverse` flag from the config.
    pub fn from_config(config: &schema::StrategyConfig) -> anyhow::Result<Self> {
        let fast = get_param_as_usize(config, "fast")?;
        let slow = get_param_as_usize(config, "slow")?;

        // Validate that the fast window is less than the slow window.
        if fast == 0 || fast >= slow {
            anyhow::bail!("'fast' ({}) must be positive and less than 'slow' ({}).", fast, slow);
        }

        let reverse = config.get_bool("reverse").unwrap_or(false);

        anyhow::Ok(Self {
            fast,
            slow,
            reverse,
            closes: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(slow)),
            previous: std::sync::Mutex::new(None),
        })
    }

    fn entry_side(&self, cross: indicators::Cross) -> event::Side {
        let side = match cross {
            indicators::Cross::Up => event::Side::Buy,
            indicators::Cross::Down => event::Side::Sell,
        };
        if self.reverse { side.inverse() } else { side }
    }

    /// Feeds a close and returns the crossing it produced, if any.
    fn update(&self, close: f64) -> Option<indicators::Cross> {
        let current = {
            let mut closes = self.closes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if closes.len() == self.slow {
                closes.pop_front();
            }
            closes.push_back(close);

            let closes: &[f64] = closes.make_contiguous();
            match (indicators::sma(closes, self.fast), indicators::sma(closes, self.slow)) {
                (Some(fast), Some(slow)) => (fast, slow),
                _ => return None,
            }
        };

        let mut previous = self.previous.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cross = previous.and_then(|previous| indicators::cross(previous, current));
        *previous = Some(current);
        cross
    }

    // --- Getters ---
    pub fn get_windows(&self) -> (usize, usize) {
        (self.fast, self.slow)
    }

    pub fn is_reversed(&self) -> bool {
        self.reverse
    }

}

#[async_trait::async_trait]
impl Plugin for SmaCrossover {
    fn name(&self) -> &str {
        SMA_CROSS_PLUGIN
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::Candle]
    }

    async fn on_event(&self, ctx: &PluginContext<'_>, event: &HookEvent<'_>) -> anyhow::Result<HookFlow> {
        let HookEvent::Candle(candle) = event else {
            return anyhow::Ok(HookFlow::Continue);
        };
        let Some(cross) = self.update(candle.close) else {
            return anyhow::Ok(HookFlow::Continue);
        };

        let strategy = ctx.strategy();
        let side = self.entry_side(cross);

        // exit positions opened on the other side
        for order in strategy.get_orders() {
            if order.side != side {
                strategy.close_order(&order).await?;
            }
        }

        if let Some(risk) = ctx.plugin_as::<RiskGuard>(RISK_PLUGIN) {
            if risk.is_cooling_down() {
                tracing::debug!(ts = %candle.timestamp, "entry skipped during cooldown");
                return anyhow::Ok(HookFlow::Continue);
            }
        }

        if strategy.get_orders().is_empty() {
            tracing::trace!(ts = %candle.timestamp, side = ?side, close = candle.close, "entry signal");
            strategy.create_order(side).await?;
        }

        anyhow::Ok(HookFlow::Continue)
    }

}

/// Vetoes openings beyond `max_open` concurrent orders and for `cooldown`
/// candles after a losing close.
pub struct RiskGuard {
    max_open: usize,
    cooldown: usize,
    remaining: AtomicUsize,
    vetoes: AtomicUsize,
}

impl RiskGuard {
    pub fn new(max_open: usize, cooldown: usize) -> Self {
        Self {
            max_open: max_open.max(1),
            cooldown,
            remaining: AtomicUsize::new(0),
            vetoes: AtomicUsize::new(0),
        }
    }

    /// Reads the optional `max_open` (default 1) and `cooldown` (default 0) parameters.
    pub fn from_config(config: &schema::StrategyConfig) -> anyhow::Result<Self> {
        let max_open = match config.get("max_open") {
            Some(_) => get_param_as_usize(config, "max_open")?,
            None => 1,
        };
        let cooldown = match config.get("cooldown") {
            Some(_) => get_param_as_usize(config, "cooldown")?,
            None => 0,
        };

        anyhow::Ok(Self::new(max_open, cooldown))
    }

    pub fn is_cooling_down(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) > 0
    }

    pub fn get_vetoes(&self) -> usize {
        self.vetoes.load(Ordering::SeqCst)
    }

}

#[async_trait::async_trait]
impl Plugin for RiskGuard {
    fn name(&self) -> &str {
        RISK_PLUGIN
    }

    fn hooks(&self) -> &[Hook] {
        &[Hook::BeforeOpen, Hook::Close, Hook::AfterCandle]
    }

    async fn on_event(&self, ctx: &PluginContext<'_>, event: &HookEvent<'_>) -> anyhow::Result<HookFlow> {
        match event {
            HookEvent::BeforeOpen(order) => {
                let open = ctx.strategy().get_orders().len();
                if self.is_cooling_down() || open >= self.max_open {
                    self.vetoes.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(order = order.id, open, "opening vetoed");
                    return anyhow::Ok(HookFlow::Skip);
                }
            }
            HookEvent::Close(close) => {
                let Some(opened_id) = close.closes else {
                    return anyhow::Ok(HookFlow::Continue);
                };
                let history = ctx.strategy().get_history();
                let opened = history.iter().find(|o| o.id == opened_id);

                if let (Some(opened), Some(exit), Some(entry)) =
                    (opened, close.get_fill_price(), opened.and_then(|o| o.get_fill_price()))
                {
                    let pnl = (exit - entry) * opened.side.sign();
                    if pnl < 0.0 && self.cooldown > 0 {
                        self.remaining.store(self.cooldown, Ordering::SeqCst);
                    }
                }
            }
            HookEvent::AfterCandle(_) => {
                let _ = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1));
            }
            _ => {}
        }

        anyhow::Ok(HookFlow::Continue)
    }

}

/// Builds `sma_cross` + `risk` for every evaluated configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmaCrossoverFactory;

impl worker::StrategyFactory for SmaCrossoverFactory {
    fn build(&self, config: &schema::StrategyConfig) -> anyhow::Result<Vec<Arc<dyn Plugin>>> {
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(SmaCrossover::from_config(config)?),
            Arc::new(RiskGuard::from_config(config)?),
        ];
        anyhow::Ok(plugins)
    }
}

/// Rejects configs the crossover cannot run with.
pub fn validate(config: &schema::StrategyConfig) -> bool {
    match (config.get_i64("fast"), config.get_i64("slow")) {
        (Ok(fast), Ok(slow)) => fast > 0 && fast < slow,
        _ => false,
    }
}

fn get_param_as_usize(config: &schema::StrategyConfig, name: &str) -> anyhow::Result<usize> {
    let value = config.get_i64(name)?;
    if value < 0 {
        anyhow::bail!("Parameter '{}' must not be negative, got: {}", name, value);
    }
    anyhow::Ok(value as usize)
}
