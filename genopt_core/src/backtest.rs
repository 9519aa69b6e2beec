// genopt_core/src/backtest.rs

//! Deterministic backtest simulator.
//!
//! Replays an ordered candle sequence as ticks to every subscribed handler,
//! awaiting each handler before moving on, and fills orders synthetically at
//! their requested price. With identical candles and deterministic strategies
//! two runs produce identical order sequences.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event;
use crate::execution;
use crate::data_handler;
use crate::instruments_info;

type HandlerList = std::sync::Mutex<Vec<(u64, Arc<dyn execution::TickHandler>)>>;

/// Simulator parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatorSettings {
    /// Fee as a fraction of traded notional.
    #[serde(default)]
    pub fee_rate: f64,
    /// Expand each candle into four intrabar ticks.
    #[serde(default)]
    pub sub_ticks: bool,
    /// Units per lot of the simulated instrument.
    #[serde(default = "default_lot")]
    pub lot: f64,
}

fn default_lot() -> f64 {
    1.0
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            fee_rate: 0.0,
            sub_ticks: false,
            lot: default_lot(),
        }
    }
}

pub struct BacktestSimulator {
    settings: SimulatorSettings,
    ticker: String,
    candles: std::sync::Mutex<Arc<Vec<data_handler::Candle>>>,
    handlers: Arc<HandlerList>,
    next_handler_id: AtomicU64,
}

impl BacktestSimulator {
    pub fn new(settings: SimulatorSettings) -> Self {
        Self {
            settings,
            ticker: "SIM".to_string(),
            candles: std::sync::Mutex::new(Arc::new(Vec::new())),
            handlers: Arc::new(std::sync::Mutex::new(Vec::new())),
            next_handler_id: AtomicU64::new(1),
        }
    }

    pub fn with_ticker(mut self, ticker: &str) -> Self {
        self.ticker = ticker.to_string();
        self
    }

    /// Replaces the replayed candle sequence.
    pub fn set_candles(&self, candles: Vec<data_handler::Candle>) {
        *self.candles.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(candles);
    }

    pub fn get_candles(&self) -> Arc<Vec<data_handler::Candle>> {
        self.candles.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn get_settings(&self) -> &SimulatorSettings {
        &self.settings
    }

    pub fn handler_count(&self) -> usize {
        self.lock_handlers().len()
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Arc<dyn execution::TickHandler>)>> {
        self.handlers.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drops every handler subscription.
    pub fn reset(&self) {
        self.lock_handlers().clear();
    }

    /// Ticks a candle is replayed as.
    pub fn expand(&self, candle: &data_handler::Candle) -> Vec<data_handler::Candle> {
        if !self.settings.sub_ticks {
            return vec![candle.clone()];
        }

        let path = if candle.is_bullish() {
            [candle.open, candle.low, candle.high, candle.close]
        } else {
            [candle.open, candle.high, candle.low, candle.close]
        };

        let mut high = f64::NEG_INFINITY;
        let mut low = f64::INFINITY;
        let last = path.len() - 1;

        path.iter()
            .enumerate()
            .map(|(i, &price)| {
                high = high.max(price);
                low = low.min(price);
                data_handler::Candle {
                    timestamp: candle.timestamp,
                    open: candle.open,
                    high,
                    low,
                    close: price,
                    volume: if i == last { candle.volume } else { 0.0 },
                }
            })
            .collect()
    }

    /// Replays every tick, awaiting each handler in subscription order.
    /// Returns the number of ticks delivered.
    pub async fn run(&self) -> anyhow::Result<usize> {
        let candles = self.get_candles();
        let mut delivered = 0;

        for candle in candles.iter() {
            for tick in self.expand(candle) {
                let handlers: Vec<Arc<dyn execution::TickHandler>> = self
                    .lock_handlers()
                    .iter()
                    .map(|(_, handler)| handler.clone())
                    .collect();

                for handler in handlers {
                    handler.on_tick(&tick).await?;
                }
                delivered += 1;
            }
        }

        anyhow::Ok(delivered)
    }

    /// Synthetic fill at the requested price.
    pub fn fill(&self, order: event::Order) -> event::Order {
        let fill_price = order.price;
        let executed_lots = order.lots;
        let fee = (fill_price * executed_lots * self.settings.lot * self.settings.fee_rate).abs();
        order.executed(fill_price, executed_lots, fee)
    }

}

#[async_trait::async_trait]
impl execution::Transport for BacktestSimulator {
    async fn get_instrument(&self) -> anyhow::Result<instruments_info::Instrument> {
        let candles = self.get_candles();
        let instrument = instruments_info::Instrument::new(
            &self.ticker,
            self.settings.lot,
            instruments_info::pip_size_from_closes(&candles),
        );
        instrument.validate()?;
        anyhow::Ok(instrument)
    }

    async fn subscribe_to_tick(
        &self,
        handler: Arc<dyn execution::TickHandler>,
    ) -> anyhow::Result<execution::Subscription> {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.lock_handlers().push((id, handler));

        let handlers = Arc::downgrade(&self.handlers);
        anyhow::Ok(execution::Subscription::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                handlers
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .retain(|(handler_id, _)| *handler_id != id);
            }
        }))
    }

    async fn place_order(&self, order: event::Order) -> anyhow::Result<event::Order> {
        anyhow::Ok(self.fill(order))
    }

    fn prepare_lots(&self, raw_lots: f64) -> f64 {
        raw_lots
    }

}
