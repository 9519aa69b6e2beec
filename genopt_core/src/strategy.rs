// genopt_core/src/strategy.rs

//! Strategy core: turns a tick stream into candle closes, order open/close
//! sequences and plugin hook invocations.
//! The same core runs against a live transport or the backtest simulator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::event;
use crate::schema;
use crate::plugins;
use crate::execution;
use crate::data_handler;
use crate::instruments_info;

/// Closed candles kept by default.
pub const CANDLE_HISTORY_DEPTH: usize = 10;

struct CoreState {
    current: Option<data_handler::Candle>,
    candles: std::collections::VecDeque<data_handler::Candle>,
    orders: Vec<event::Order>,
    history: Vec<event::Order>,
    instrument: Option<instruments_info::Instrument>,
    next_order_id: event::OrderId,
    closed_candles: usize,
}

impl CoreState {
    fn new(depth: usize) -> Self {
        Self {
            current: None,
            candles: std::collections::VecDeque::with_capacity(depth),
            orders: Vec::new(),
            history: Vec::new(),
            instrument: None,
            next_order_id: 1,
            closed_candles: 0,
        }
    }

    fn push_candle(&mut self, candle: data_handler::Candle, depth: usize) {
        if self.candles.len() == depth {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
        self.closed_candles += 1;
    }

    /// The in-progress candle, or the last closed one between a close and the next open.
    fn pricing_candle(&self) -> Option<&data_handler::Candle> {
        self.current.as_ref().or(self.candles.back())
    }

    fn next_id(&mut self) -> event::OrderId {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

}

/// What `score` and `stats` functions see once a strategy finished its run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Evaluation {
    pub config: schema::StrategyConfig,
    pub instrument: Option<instruments_info::Instrument>,
    /// Executed orders, opens and closes, in execution order.
    pub orders: Vec<event::Order>,
    /// Orders still tracked as open.
    pub open_orders: Vec<event::Order>,
    pub closed_candles: usize,
}

impl Evaluation {
    /// Sum of cash flows of executed non-learning orders, fees included.
    pub fn realized_pnl(&self) -> f64 {
        let lot = self.instrument.as_ref().map(|i| i.lot).unwrap_or(1.0);
        self.orders
            .iter()
            .filter(|o| !o.learning)
            .map(|o| o.cash_flow(lot))
            .sum()
    }

    /// Number of executed close orders outside learning.
    pub fn deals_count(&self) -> usize {
        self.orders
            .iter()
            .filter(|o| !o.learning && o.is_close())
            .count()
    }

    pub fn total_fees(&self) -> f64 {
        self.orders.iter().filter(|o| !o.learning).map(|o| o.get_fee()).sum()
    }

}

pub struct StrategyCoreBuilder {
    config: schema::StrategyConfig,
    transport: Arc<dyn execution::Transport>,
    history: Option<Arc<dyn data_handler::HistoryProvider>>,
    plugins: Vec<Arc<dyn plugins::Plugin>>,
    depth: usize,
}

impl StrategyCoreBuilder {
    pub fn with_history(mut self, history: Arc<dyn data_handler::HistoryProvider>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_plugins(mut self, plugins: Vec<Arc<dyn plugins::Plugin>>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    /// Number of closed candles to keep.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth.max(1);
        self
    }

    /// Registers the plugins and fires their init hook once.
    pub fn build(self) -> Arc<StrategyCore> {
        let mut pipeline = plugins::PluginPipeline::new();
        pipeline.register(self.plugins);

        let core = Arc::new(StrategyCore {
            config: self.config,
            transport: self.transport,
            history: self.history,
            pipeline,
            depth: self.depth,
            state: std::sync::Mutex::new(CoreState::new(self.depth)),
            learning: AtomicBool::new(false),
        });

        core.pipeline.dispatch_sync(&plugins::PluginContext::new(&core));
        core
    }

}

pub struct StrategyCore {
    config: schema::StrategyConfig,
    transport: Arc<dyn execution::Transport>,
    history: Option<Arc<dyn data_handler::HistoryProvider>>,
    pipeline: plugins::PluginPipeline,
    depth: usize,
    state: std::sync::Mutex<CoreState>,
    learning: AtomicBool,
}

impl StrategyCore {
    pub fn builder(
        config: schema::StrategyConfig,
        transport: Arc<dyn execution::Transport>,
    ) -> StrategyCoreBuilder {
        StrategyCoreBuilder {
            config,
            transport,
            history: None,
            plugins: Vec::new(),
            depth: CANDLE_HISTORY_DEPTH,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn ensure_instrument(&self) -> anyhow::Result<instruments_info::Instrument> {
        if let Some(instrument) = self.lock_state().instrument.clone() {
            return anyhow::Ok(instrument);
        }

        let instrument = self.transport.get_instrument().await?;
        self.lock_state().instrument = Some(instrument.clone());
        anyhow::Ok(instrument)
    }

    /// Subscribes to ticks and fires the start hook. The returned handle
    /// closes open orders, unsubscribes and fires the dispose hook.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<Dispose> {
        self.ensure_instrument().await?;

        let forwarder: Arc<dyn execution::TickHandler> = Arc::new(TickForwarder {
            core: Arc::downgrade(self),
        });
        let subscription = self.transport.subscribe_to_tick(forwarder).await?;

        self.pipeline
            .dispatch_async(&plugins::PluginContext::new(self), &plugins::HookEvent::Start)
            .await?;

        tracing::debug!(ticker = %self.config.ticker, "strategy started");

        anyhow::Ok(Dispose {
            core: self.clone(),
            subscription: std::sync::Mutex::new(subscription),
            disposed: AtomicBool::new(false),
        })
    }

    /// Tick path: tick hook (may veto), then either merge into the
    /// in-progress candle or close it and open a new one.
    pub async fn handle_tick(&self, tick: &data_handler::Candle) -> anyhow::Result<()> {
        let ctx = plugins::PluginContext::new(self);
        if self.pipeline.dispatch_skippable(&ctx, &plugins::HookEvent::Tick(tick)).await? {
            return anyhow::Ok(());
        }

        let closed = {
            let mut state = self.lock_state();
            match state.current.take() {
                Some(mut current) if current.timestamp == tick.timestamp => {
                    current.merge(tick);
                    state.current = Some(current);
                    None
                }
                Some(previous) => {
                    state.push_candle(previous.clone(), self.depth);
                    Some(previous)
                }
                None => {
                    state.current = Some(tick.clone());
                    None
                }
            }
        };

        if let Some(closed) = closed {
            self.pipeline.dispatch_async(&ctx, &plugins::HookEvent::Candle(&closed)).await?;
            self.pipeline.dispatch_async(&ctx, &plugins::HookEvent::AfterCandle(&closed)).await?;
            self.lock_state().current = Some(tick.clone());
        }

        anyhow::Ok(())
    }

    /// Opens a position at the current candle's close.
    /// Returns `None` when vetoed or when the transport rejected the order.
    pub async fn create_order(&self, side: event::Side) -> anyhow::Result<Option<event::Order>> {
        let instrument = self.ensure_instrument().await?;

        let (id, timestamp, price) = {
            let mut state = self.lock_state();
            let Some(candle) = state.pricing_candle() else {
                anyhow::bail!("Cannot price an order for '{}' before the first tick", self.config.ticker);
            };
            let (timestamp, price) = (candle.timestamp, candle.close);
            (state.next_id(), timestamp, price)
        };

        if price <= 0.0 {
            anyhow::bail!("Cannot size an order for '{}' at non-positive price {}", self.config.ticker, price);
        }

        let raw_lots = self.config.amount / (price * instrument.lot);
        let lots = self.transport.prepare_lots(raw_lots);
        let pending = event::Order::pending(id, timestamp, side, price, lots)
            .with_learning(self.is_learning());

        let ctx = plugins::PluginContext::new(self);
        if self.pipeline.dispatch_skippable(&ctx, &plugins::HookEvent::BeforeOpen(&pending)).await? {
            return anyhow::Ok(None);
        }

        self.lock_state().orders.push(pending.clone());

        match self.transport.place_order(pending).await {
            Ok(executed) => {
                {
                    let mut state = self.lock_state();
                    if let Some(slot) = state.orders.iter_mut().find(|o| o.id == id) {
                        *slot = executed.clone();
                    }
                    state.history.push(executed.clone());
                }

                self.pipeline.dispatch_async(&ctx, &plugins::HookEvent::Open(&executed)).await?;
                anyhow::Ok(Some(executed))
            }
            Err(e) => {
                self.lock_state().orders.retain(|o| o.id != id);
                tracing::warn!(ticker = %self.config.ticker, order = id, "failed to open order: {:#}", e);
                anyhow::Ok(None)
            }
        }
    }

    /// Closes a tracked open order with an order of the inverse side.
    /// No-op when the order is untracked, not executed or already closing.
    pub async fn close_order(&self, order: &event::Order) -> anyhow::Result<Option<event::Order>> {
        let (original, position, close) = {
            let mut state = self.lock_state();
            let Some(position) = state.orders.iter().position(|o| o.id == order.id) else {
                return anyhow::Ok(None);
            };

            let tracked = &state.orders[position];
            if tracked.processing || !tracked.is_executed() {
                return anyhow::Ok(None);
            }

            let fallback = tracked.get_fill_price().unwrap_or(tracked.price);
            let (timestamp, price) = state
                .pricing_candle()
                .map(|c| (c.timestamp, c.close))
                .unwrap_or((tracked.timestamp, fallback));

            state.orders[position].processing = true;
            let original = state.orders[position].clone();
            let lots = original.get_executed_lots().unwrap_or(original.lots);
            let id = state.next_id();
            let close = event::Order::pending(id, timestamp, original.side.inverse(), price, lots)
                .with_closes(original.id)
                .with_learning(self.is_learning());

            (original, position, close)
        };

        let ctx = plugins::PluginContext::new(self);
        let vetoed = match self.pipeline.dispatch_skippable(&ctx, &plugins::HookEvent::BeforeClose(&close)).await {
            Ok(vetoed) => vetoed,
            Err(e) => {
                self.clear_processing(original.id);
                return Err(e);
            }
        };

        if vetoed {
            self.clear_processing(original.id);
            return anyhow::Ok(None);
        }

        self.lock_state().orders.retain(|o| o.id != original.id);

        match self.transport.place_order(close).await {
            Ok(executed) => {
                self.lock_state().history.push(executed.clone());
                self.pipeline.dispatch_async(&ctx, &plugins::HookEvent::Close(&executed)).await?;
                anyhow::Ok(Some(executed))
            }
            Err(e) => {
                tracing::warn!(ticker = %self.config.ticker, order = original.id, "failed to close order: {:#}", e);
                let mut restored = original;
                restored.processing = false;
                let mut state = self.lock_state();
                let position = position.min(state.orders.len());
                state.orders.insert(position, restored);
                anyhow::Ok(None)
            }
        }
    }

    fn clear_processing(&self, id: event::OrderId) {
        if let Some(order) = self.lock_state().orders.iter_mut().find(|o| o.id == id) {
            order.processing = false;
        }
    }

    /// Closes a snapshot of the tracked orders one by one. Returns how many closed.
    pub async fn close_all(&self) -> anyhow::Result<usize> {
        let snapshot = self.lock_state().orders.clone();
        let mut closed = 0;

        for order in &snapshot {
            if self.close_order(order).await?.is_some() {
                closed += 1;
            }
        }

        anyhow::Ok(closed)
    }

    /// Feeds `days` of history through the tick path without subscribing,
    /// flagging resulting orders as learning. Returns the number of candles fed.
    pub async fn learn(&self, days: u32) -> anyhow::Result<usize> {
        let Some(history) = &self.history else {
            anyhow::bail!("No history provider bound to strategy '{}'", self.config.ticker);
        };

        let request = data_handler::HistoryRequest {
            broker: self.config.broker.clone(),
            ticker: self.config.ticker.clone(),
            interval: self.config.interval,
            days,
            gap_days: 0,
        };
        let candles = history.get_history(&request).await?;

        self.learning.store(true, Ordering::SeqCst);
        let mut result = anyhow::Ok(());
        for candle in &candles {
            if let Err(e) = self.handle_tick(candle).await {
                result = Err(e);
                break;
            }
        }
        self.learning.store(false, Ordering::SeqCst);

        tracing::debug!(ticker = %self.config.ticker, candles = candles.len(), "learning finished");
        result.map(|_| candles.len())
    }

    pub fn evaluation(&self) -> Evaluation {
        let state = self.lock_state();
        Evaluation {
            config: self.config.clone(),
            instrument: state.instrument.clone(),
            orders: state.history.clone(),
            open_orders: state.orders.clone(),
            closed_candles: state.closed_candles,
        }
    }

    // --- Getters ---
    pub fn get_config(&self) -> &schema::StrategyConfig {
        &self.config
    }

    pub fn get_pipeline(&self) -> &plugins::PluginPipeline {
        &self.pipeline
    }

    pub fn get_instrument(&self) -> Option<instruments_info::Instrument> {
        self.lock_state().instrument.clone()
    }

    /// Closed candles, oldest first.
    pub fn get_candles(&self) -> Vec<data_handler::Candle> {
        self.lock_state().candles.iter().cloned().collect()
    }

    pub fn get_current_candle(&self) -> Option<data_handler::Candle> {
        self.lock_state().current.clone()
    }

    /// Tracked (open or opening) orders.
    pub fn get_orders(&self) -> Vec<event::Order> {
        self.lock_state().orders.clone()
    }

    /// Executed orders in execution order.
    pub fn get_history(&self) -> Vec<event::Order> {
        self.lock_state().history.clone()
    }

    pub fn is_learning(&self) -> bool {
        self.learning.load(Ordering::SeqCst)
    }

}

/// Forwards transport ticks to a strategy without keeping it alive.
struct TickForwarder {
    core: std::sync::Weak<StrategyCore>,
}

#[async_trait::async_trait]
impl execution::TickHandler for TickForwarder {
    async fn on_tick(&self, tick: &data_handler::Candle) -> anyhow::Result<()> {
        match self.core.upgrade() {
            Some(core) => core.handle_tick(tick).await,
            None => anyhow::Ok(()),
        }
    }
}

/// Returned by `StrategyCore::start`. Disposing twice is a no-op.
pub struct Dispose {
    core: Arc<StrategyCore>,
    subscription: std::sync::Mutex<execution::Subscription>,
    disposed: AtomicBool,
}

impl Dispose {
    pub async fn dispose(&self) -> anyhow::Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return anyhow::Ok(());
        }

        // Teardown runs to the end even when closing fails; the first error wins.
        let closed = self.core.close_all().await;
        self.subscription
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unsubscribe();
        let hooked = self
            .core
            .pipeline
            .dispatch_async(&plugins::PluginContext::new(&self.core), &plugins::HookEvent::Dispose)
            .await;

        if let Err(e) = closed {
            tracing::warn!(ticker = %self.core.config.ticker, "closing orders on dispose failed: {:#}", e);
            return Err(e);
        }
        hooked
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn get_core(&self) -> &Arc<StrategyCore> {
        &self.core
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest;
    use crate::execution::Transport;
    use crate::plugins::{Hook, HookEvent, HookFlow, Plugin, PluginContext};

    fn ts(minute: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::<chrono::Utc>::from_timestamp(minute * 60, 0).unwrap()
    }

    fn tick(minute: i64, price: f64) -> data_handler::Candle {
        data_handler::Candle::new(ts(minute), price, price, price, price, 1.0)
    }

    fn simulator() -> Arc<backtest::BacktestSimulator> {
        Arc::new(backtest::BacktestSimulator::new(backtest::SimulatorSettings::default()))
    }

    fn config() -> schema::StrategyConfig {
        schema::StrategyConfig::default()
    }

    /// Records every hook it sees and vetoes the configured ones.
    struct Log {
        hooks: Vec<Hook>,
        veto: Vec<Hook>,
        seen: std::sync::Mutex<Vec<Hook>>,
    }

    impl Log {
        fn new(veto: &[Hook]) -> Arc<Self> {
            Arc::new(Self {
                hooks: Hook::ALL.to_vec(),
                veto: veto.to_vec(),
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn count(&self, hook: Hook) -> usize {
            self.seen.lock().unwrap().iter().filter(|h| **h == hook).count()
        }
    }

    #[async_trait::async_trait]
    impl Plugin for Log {
        fn name(&self) -> &str {
            "log"
        }

        fn hooks(&self) -> &[Hook] {
            &self.hooks
        }

        fn on_init(&self, _ctx: &PluginContext<'_>) {
            self.seen.lock().unwrap().push(Hook::Init);
        }

        async fn on_event(&self, _ctx: &PluginContext<'_>, event: &HookEvent<'_>) -> anyhow::Result<HookFlow> {
            self.seen.lock().unwrap().push(event.hook());
            if self.veto.contains(&event.hook()) {
                return Ok(HookFlow::Skip);
            }
            Ok(HookFlow::Continue)
        }
    }

    /// Opens on a closed candle when flat, closes everything otherwise.
    struct Flipper;

    #[async_trait::async_trait]
    impl Plugin for Flipper {
        fn name(&self) -> &str {
            "flipper"
        }

        fn hooks(&self) -> &[Hook] {
            &[Hook::Candle]
        }

        async fn on_event(&self, ctx: &PluginContext<'_>, _event: &HookEvent<'_>) -> anyhow::Result<HookFlow> {
            let strategy = ctx.strategy();
            if strategy.get_orders().is_empty() {
                strategy.create_order(event::Side::Buy).await?;
            } else {
                strategy.close_all().await?;
            }
            Ok(HookFlow::Continue)
        }
    }

    /// Closes the newest tracked order from inside the first close hook.
    struct Cascade {
        fired: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Plugin for Cascade {
        fn name(&self) -> &str {
            "cascade"
        }

        fn hooks(&self) -> &[Hook] {
            &[Hook::Close]
        }

        async fn on_event(&self, ctx: &PluginContext<'_>, _event: &HookEvent<'_>) -> anyhow::Result<HookFlow> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                if let Some(last) = ctx.strategy().get_orders().last().cloned() {
                    ctx.strategy().close_order(&last).await?;
                }
            }
            Ok(HookFlow::Continue)
        }
    }

    /// Simulator whose order placement can be switched off.
    struct Flaky {
        inner: backtest::BacktestSimulator,
        reject: AtomicBool,
    }

    #[async_trait::async_trait]
    impl execution::Transport for Flaky {
        async fn get_instrument(&self) -> anyhow::Result<instruments_info::Instrument> {
            self.inner.get_instrument().await
        }

        async fn subscribe_to_tick(
            &self,
            handler: Arc<dyn execution::TickHandler>,
        ) -> anyhow::Result<execution::Subscription> {
            self.inner.subscribe_to_tick(handler).await
        }

        async fn place_order(&self, order: event::Order) -> anyhow::Result<event::Order> {
            if self.reject.load(Ordering::SeqCst) {
                anyhow::bail!("rejected");
            }
            self.inner.place_order(order).await
        }

        fn prepare_lots(&self, raw_lots: f64) -> f64 {
            self.inner.prepare_lots(raw_lots)
        }
    }

    #[tokio::test]
    async fn ticks_merge_until_timestamp_changes() {
        let log = Log::new(&[]);
        let core = StrategyCore::builder(config(), simulator())
            .with_plugins(vec![log.clone()])
            .build();

        core.handle_tick(&tick(0, 10.0)).await.unwrap();
        core.handle_tick(&tick(0, 12.0)).await.unwrap();
        core.handle_tick(&tick(0, 9.0)).await.unwrap();
        assert!(core.get_candles().is_empty());

        core.handle_tick(&tick(1, 11.0)).await.unwrap();

        let closed = core.get_candles();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].open, 10.0);
        assert_eq!(closed[0].high, 12.0);
        assert_eq!(closed[0].low, 9.0);
        assert_eq!(closed[0].close, 9.0);
        assert_eq!(core.get_current_candle().unwrap().timestamp, ts(1));

        assert_eq!(log.count(Hook::Init), 1);
        assert_eq!(log.count(Hook::Tick), 4);
        assert_eq!(log.count(Hook::Candle), 1);
        assert_eq!(log.count(Hook::AfterCandle), 1);
    }

    #[tokio::test]
    async fn vetoed_tick_is_ignored() {
        let log = Log::new(&[Hook::Tick]);
        let core = StrategyCore::builder(config(), simulator())
            .with_plugins(vec![log.clone()])
            .build();

        core.handle_tick(&tick(0, 10.0)).await.unwrap();
        assert!(core.get_current_candle().is_none());
    }

    #[tokio::test]
    async fn candle_ring_drops_oldest() {
        let core = StrategyCore::builder(config(), simulator()).with_depth(3).build();
        for minute in 0..6 {
            core.handle_tick(&tick(minute, minute as f64 + 1.0)).await.unwrap();
        }

        let closes: Vec<f64> = core.get_candles().iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![3.0, 4.0, 5.0]);
        assert_eq!(core.evaluation().closed_candles, 5);
    }

    #[tokio::test]
    async fn orders_are_sized_from_amount() {
        let cfg = schema::StrategyConfig { amount: 1000.0, ..config() };
        let core = StrategyCore::builder(cfg, simulator()).build();

        assert!(core.create_order(event::Side::Buy).await.is_err());

        core.handle_tick(&tick(0, 50.0)).await.unwrap();
        let order = core.create_order(event::Side::Buy).await.unwrap().unwrap();
        assert!(order.is_executed());
        assert_eq!(order.get_executed_lots(), Some(20.0));
        assert_eq!(core.get_orders().len(), 1);
        assert_eq!(core.get_history().len(), 1);
    }

    #[tokio::test]
    async fn vetoes_leave_state_untouched() {
        let log = Log::new(&[Hook::BeforeOpen]);
        let core = StrategyCore::builder(config(), simulator())
            .with_plugins(vec![log.clone()])
            .build();
        core.handle_tick(&tick(0, 5.0)).await.unwrap();

        assert!(core.create_order(event::Side::Sell).await.unwrap().is_none());
        assert!(core.get_orders().is_empty());
        assert_eq!(log.count(Hook::Open), 0);

        let log = Log::new(&[Hook::BeforeClose]);
        let core = StrategyCore::builder(config(), simulator())
            .with_plugins(vec![log.clone()])
            .build();
        core.handle_tick(&tick(0, 5.0)).await.unwrap();

        let order = core.create_order(event::Side::Sell).await.unwrap().unwrap();
        assert!(core.close_order(&order).await.unwrap().is_none());

        let tracked = core.get_orders();
        assert_eq!(tracked.len(), 1);
        assert!(!tracked[0].processing);
        assert_eq!(log.count(Hook::Close), 0);
    }

    #[tokio::test]
    async fn placement_failures_are_recovered() {
        let transport = Arc::new(Flaky {
            inner: backtest::BacktestSimulator::new(backtest::SimulatorSettings::default()),
            reject: AtomicBool::new(true),
        });
        let core = StrategyCore::builder(config(), transport.clone()).build();
        core.handle_tick(&tick(0, 5.0)).await.unwrap();

        assert!(core.create_order(event::Side::Buy).await.unwrap().is_none());
        assert!(core.get_orders().is_empty());

        transport.reject.store(false, Ordering::SeqCst);
        let opened = core.create_order(event::Side::Buy).await.unwrap().unwrap();
        core.create_order(event::Side::Buy).await.unwrap().unwrap();

        transport.reject.store(true, Ordering::SeqCst);
        assert!(core.close_order(&opened).await.unwrap().is_none());

        let tracked = core.get_orders();
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[0].id, opened.id);
        assert!(!tracked[0].processing);
    }

    #[tokio::test]
    async fn close_all_attempts_every_order_despite_reentrant_closes() {
        let log = Log::new(&[]);
        let cascade = Arc::new(Cascade { fired: AtomicBool::new(false) });
        let core = StrategyCore::builder(config(), simulator())
            .with_plugins(vec![log.clone(), cascade])
            .build();
        core.handle_tick(&tick(0, 5.0)).await.unwrap();

        for _ in 0..3 {
            core.create_order(event::Side::Buy).await.unwrap().unwrap();
        }

        core.close_all().await.unwrap();

        assert_eq!(log.count(Hook::BeforeClose), 3);
        assert!(core.get_orders().is_empty());
        let closes = core.get_history().iter().filter(|o| o.is_close()).count();
        assert_eq!(closes, 3);
    }

    #[tokio::test]
    async fn learning_marks_orders_and_needs_history() {
        let core = StrategyCore::builder(config(), simulator()).build();
        assert!(core.learn(5).await.is_err());

        let candles: Vec<data_handler::Candle> = (0..5).map(|m| tick(m, 10.0 + m as f64)).collect();
        let history = Arc::new(data_handler::InMemoryHistory::new(candles));
        let core = StrategyCore::builder(config(), simulator())
            .with_history(history)
            .with_plugins(vec![Arc::new(Flipper)])
            .build();

        assert_eq!(core.learn(30).await.unwrap(), 5);
        assert!(!core.is_learning());

        let history = core.get_history();
        assert!(!history.is_empty());
        assert!(history.iter().all(|o| o.learning));
        assert_eq!(core.evaluation().realized_pnl(), 0.0);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let sim = simulator();
        let log = Log::new(&[]);
        let core = StrategyCore::builder(config(), sim.clone())
            .with_plugins(vec![log.clone()])
            .build();

        let dispose = core.start().await.unwrap();
        assert_eq!(sim.handler_count(), 1);
        assert_eq!(log.count(Hook::Start), 1);

        core.handle_tick(&tick(0, 5.0)).await.unwrap();
        core.create_order(event::Side::Buy).await.unwrap();

        dispose.dispose().await.unwrap();
        dispose.dispose().await.unwrap();

        assert!(dispose.is_disposed());
        assert_eq!(sim.handler_count(), 0);
        assert!(core.get_orders().is_empty());
        assert_eq!(log.count(Hook::Dispose), 1);
        assert_eq!(log.count(Hook::Close), 1);
    }

    /// Fails every close hook.
    struct BrokenClose;

    #[async_trait::async_trait]
    impl Plugin for BrokenClose {
        fn name(&self) -> &str {
            "broken_close"
        }

        fn hooks(&self) -> &[Hook] {
            &[Hook::Close]
        }

        async fn on_event(&self, _ctx: &PluginContext<'_>, _event: &HookEvent<'_>) -> anyhow::Result<HookFlow> {
            anyhow::bail!("close hook failed")
        }
    }

    #[tokio::test]
    async fn failed_close_still_detaches_and_fires_dispose() {
        let sim = simulator();
        let log = Log::new(&[]);
        let core = StrategyCore::builder(config(), sim.clone())
            .with_plugins(vec![log.clone(), Arc::new(BrokenClose)])
            .build();

        let dispose = core.start().await.unwrap();
        core.handle_tick(&tick(0, 5.0)).await.unwrap();
        core.create_order(event::Side::Buy).await.unwrap();

        assert!(dispose.dispose().await.is_err());
        assert!(dispose.is_disposed());
        assert_eq!(sim.handler_count(), 0);
        assert_eq!(log.count(Hook::Dispose), 1);

        dispose.dispose().await.unwrap();
        assert_eq!(log.count(Hook::Dispose), 1);
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let candles: Vec<data_handler::Candle> = (0..40)
            .map(|m| {
                let price = 100.0 + ((m * 7) % 11) as f64;
                data_handler::Candle::new(ts(m), price, price + 1.0, price - 1.0, price + 0.5, 3.0)
            })
            .collect();

        let mut runs = Vec::new();
        for _ in 0..2 {
            let sim = Arc::new(backtest::BacktestSimulator::new(backtest::SimulatorSettings {
                fee_rate: 0.001,
                sub_ticks: true,
                ..Default::default()
            }));
            sim.set_candles(candles.clone());

            let core = StrategyCore::builder(config(), sim.clone())
                .with_plugins(vec![Arc::new(Flipper)])
                .build();
            let dispose = core.start().await.unwrap();
            sim.run().await.unwrap();
            dispose.dispose().await.unwrap();

            let evaluation = core.evaluation();
            runs.push((evaluation.orders.clone(), evaluation.realized_pnl()));
        }

        assert!(!runs[0].0.is_empty());
        assert_eq!(runs[0].0, runs[1].0);
        assert_eq!(runs[0].1.to_bits(), runs[1].1.to_bits());
    }
}
