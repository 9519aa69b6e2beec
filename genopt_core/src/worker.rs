// genopt_core/src/worker.rs

//! Evaluation workers and the pool the engine dispatches to.
//!
//! Each worker is a tokio task owning one `BacktestSimulator` and the
//! strategies resident on it. Workers share nothing with the engine: they
//! receive `WorkerMessage`s through a bounded mailbox and report
//! `WorkerEvent`s through one shared event channel.
//!
//! Per generation the engine sends `SetTicks` to every worker, then one
//! `AddTask` per distinct task id in round-robin order. When the number of
//! submitted requests reaches the generation size the pool broadcasts
//! `Estimate`; each worker replays its simulator, reports one result per
//! resident strategy and resets.

use std::sync::Arc;

use crate::schema;
use crate::plugins;
use crate::backtest;
use crate::settings;
use crate::strategy;
use crate::data_handler;

/// Messages a worker accepts.
const MAILBOX_CAPACITY: usize = 256;
/// Events buffered between workers and the engine.
const EVENT_CAPACITY: usize = 1024;

/// Builds the plugin set of one strategy instance from its configuration.
pub trait StrategyFactory: Send + Sync {
    fn build(&self, config: &schema::StrategyConfig) -> anyhow::Result<Vec<Arc<dyn plugins::Plugin>>>;
}

pub type ScoreFn = Arc<dyn Fn(&strategy::Evaluation) -> f64 + Send + Sync>;
pub type StatsFn = Arc<dyn Fn(&strategy::Evaluation) -> serde_json::Value + Send + Sync>;

/// Engine to worker messages.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerMessage {
    AddTask {
        id: schema::TaskId,
        config: schema::StrategyConfig,
    },
    SetTicks(Vec<data_handler::Candle>),
    Estimate,
}

/// Outcome of one evaluated strategy.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TaskResult {
    pub id: schema::TaskId,
    pub score: f64,
    pub stats: serde_json::Value,
}

/// Worker to engine events.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerEvent {
    Online { worker: usize },
    Results { worker: usize, result: TaskResult },
    Exited { worker: usize },
}

/// Everything a worker needs to turn a config into a scored strategy.
#[derive(Clone)]
pub struct WorkerContext {
    factory: Arc<dyn StrategyFactory>,
    score: ScoreFn,
    stats: StatsFn,
    simulator: backtest::SimulatorSettings,
    ticker: String,
}

impl WorkerContext {
    pub fn new(factory: Arc<dyn StrategyFactory>, score: ScoreFn, stats: StatsFn) -> Self {
        Self {
            factory,
            score,
            stats,
            simulator: backtest::SimulatorSettings::default(),
            ticker: "SIM".to_string(),
        }
    }

    pub fn with_simulator(mut self, simulator: backtest::SimulatorSettings) -> Self {
        self.simulator = simulator;
        self
    }

    pub fn with_ticker(mut self, ticker: &str) -> Self {
        self.ticker = ticker.to_string();
        self
    }

}

struct ResidentStrategy {
    id: schema::TaskId,
    core: Arc<strategy::StrategyCore>,
    dispose: strategy::Dispose,
}

/// Worker loop. Returns when the mailbox closes or the engine stops listening.
async fn run_worker(
    index: usize,
    mut inbox: tokio::sync::mpsc::Receiver<WorkerMessage>,
    events: tokio::sync::mpsc::Sender<WorkerEvent>,
    ctx: WorkerContext,
) -> anyhow::Result<()> {
    let simulator = Arc::new(backtest::BacktestSimulator::new(ctx.simulator.clone()).with_ticker(&ctx.ticker));
    let mut resident: Vec<ResidentStrategy> = Vec::new();

    if events.send(WorkerEvent::Online { worker: index }).await.is_err() {
        return anyhow::Ok(());
    }

    while let Some(message) = inbox.recv().await {
        match message {
            WorkerMessage::AddTask { id, config } => {
                let plugins = ctx.factory.build(&config)?;
                let core = strategy::StrategyCore::builder(config, simulator.clone())
                    .with_plugins(plugins)
                    .build();
                let dispose = core.start().await?;
                resident.push(ResidentStrategy { id, core, dispose });
            }
            WorkerMessage::SetTicks(candles) => {
                tracing::trace!(worker = index, candles = candles.len(), "ticks received");
                simulator.set_candles(candles);
            }
            WorkerMessage::Estimate => {
                let started = std::time::Instant::now();
                let ticks = simulator.run().await?;

                for strategy in resident.drain(..) {
                    strategy.dispose.dispose().await?;
                    let evaluation = strategy.core.evaluation();
                    let result = TaskResult {
                        id: strategy.id,
                        score: (ctx.score)(&evaluation),
                        stats: (ctx.stats)(&evaluation),
                    };

                    if events.send(WorkerEvent::Results { worker: index, result }).await.is_err() {
                        return anyhow::Ok(());
                    }
                }
                simulator.reset();

                tracing::debug!(
                    worker = index,
                    ticks,
                    elapsed = ?started.elapsed(),
                    "estimate finished"
                );
            }
        }
    }

    anyhow::Ok(())
}

/// Engine-side view of one worker.
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    mailbox: tokio::sync::mpsc::Sender<WorkerMessage>,
    /// Tasks dispatched and not yet answered.
    outstanding: usize,
    /// Tasks dispatched over the pool's lifetime.
    assigned: usize,
    alive: bool,
}

impl WorkerHandle {
    fn new(index: usize, mailbox: tokio::sync::mpsc::Sender<WorkerMessage>) -> Self {
        Self {
            index,
            mailbox,
            outstanding: 0,
            assigned: 0,
            alive: true,
        }
    }

    // --- Getters ---
    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn get_outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn get_assigned(&self) -> usize {
        self.assigned
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

}

#[derive(Debug, Clone)]
struct PendingTask {
    worker: usize,
    config: schema::StrategyConfig,
}

/// Fixed set of workers plus the per-generation dispatch state.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    events: tokio::sync::mpsc::Receiver<WorkerEvent>,
    policy: settings::OrphanPolicy,
    /// Next round-robin slot.
    next: usize,
    /// Requests expected before the estimate broadcast.
    expected: usize,
    /// Requests submitted this generation, merged duplicates included.
    requested: usize,
    /// Distinct tasks dispatched this generation.
    dispatched: usize,
    pending: std::collections::HashMap<schema::TaskId, PendingTask>,
    candles: Vec<data_handler::Candle>,
}

impl WorkerPool {
    /// Spawns `count` workers and waits until each one reports online.
    pub async fn spawn(count: usize, ctx: WorkerContext, policy: settings::OrphanPolicy) -> anyhow::Result<Self> {
        if count == 0 {
            anyhow::bail!("Worker pool needs at least one worker");
        }

        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(EVENT_CAPACITY);
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let (mailbox, inbox) = tokio::sync::mpsc::channel(MAILBOX_CAPACITY);
            let task = tokio::spawn(run_worker(index, inbox, event_tx.clone(), ctx.clone()));

            let monitor = event_tx.clone();
            tokio::spawn(async move {
                match task.await {
                    Ok(Ok(())) => tracing::debug!(worker = index, "worker stopped"),
                    Ok(Err(e)) => tracing::error!(worker = index, "worker failed: {:#}", e),
                    Err(e) => tracing::error!(worker = index, "worker panicked: {}", e),
                }
                let _ = monitor.send(WorkerEvent::Exited { worker: index }).await;
            });

            workers.push(WorkerHandle::new(index, mailbox));
        }
        drop(event_tx);

        let mut online = 0;
        while online < count {
            match event_rx.recv().await {
                Some(WorkerEvent::Online { .. }) => online += 1,
                Some(WorkerEvent::Exited { worker }) => {
                    anyhow::bail!("Worker {} exited before coming online", worker)
                }
                Some(WorkerEvent::Results { worker, .. }) => {
                    tracing::warn!(worker, "unexpected result before pool start");
                }
                None => anyhow::bail!("Worker event channel closed during pool start"),
            }
        }

        tracing::info!(workers = count, policy = ?policy, "worker pool online");

        anyhow::Ok(Self {
            workers,
            events: event_rx,
            policy,
            next: 0,
            expected: 0,
            requested: 0,
            dispatched: 0,
            pending: std::collections::HashMap::new(),
            candles: Vec::new(),
        })
    }

    /// Resets the per-generation counters; the barrier fires after `expected` submissions.
    pub fn begin_generation(&mut self, expected: usize) {
        self.expected = expected;
        self.requested = 0;
        self.dispatched = 0;
    }

    /// Sends the generation's candle set to every live worker.
    pub async fn set_ticks(&mut self, candles: &[data_handler::Candle]) -> anyhow::Result<()> {
        self.candles = candles.to_vec();

        for worker in self.workers.iter_mut().filter(|w| w.alive) {
            if worker.mailbox.send(WorkerMessage::SetTicks(self.candles.clone())).await.is_err() {
                tracing::debug!(worker = worker.index, "set ticks: mailbox closed");
                worker.alive = false;
            }
        }

        anyhow::Ok(())
    }

    /// Requests an evaluation. A task id already pending this generation is
    /// merged instead of dispatched again. Broadcasts the estimate command
    /// once the barrier count is reached.
    pub async fn submit(&mut self, id: schema::TaskId, config: schema::StrategyConfig) -> anyhow::Result<()> {
        if self.pending.contains_key(&id) {
            tracing::debug!(task = %id, config = %config.format_for_display(), "merged duplicate task");
        } else {
            self.dispatch(id, config).await?;
        }

        self.requested += 1;
        if self.requested == self.expected {
            self.broadcast_estimate().await;
        }

        anyhow::Ok(())
    }

    /// Sends one task to the next live worker in round-robin order.
    /// Returns the index of the worker that received it.
    pub async fn dispatch(&mut self, id: schema::TaskId, config: schema::StrategyConfig) -> anyhow::Result<usize> {
        loop {
            let Some(slot) = self.next_slot() else {
                anyhow::bail!("No live workers left to dispatch task {}", id);
            };

            let worker = &mut self.workers[slot];
            let message = WorkerMessage::AddTask { id, config: config.clone() };
            if worker.mailbox.send(message).await.is_err() {
                tracing::warn!(worker = worker.index, "mailbox closed, skipping worker");
                worker.alive = false;
                continue;
            }

            worker.outstanding += 1;
            worker.assigned += 1;
            let index = worker.index;

            self.pending.insert(id, PendingTask { worker: index, config });
            self.dispatched += 1;
            return anyhow::Ok(index);
        }
    }

    fn next_slot(&mut self) -> Option<usize> {
        let len = self.workers.len();
        for offset in 0..len {
            let slot = (self.next + offset) % len;
            if self.workers[slot].alive {
                self.next = (slot + 1) % len;
                return Some(slot);
            }
        }
        None
    }

    /// Tells every live worker to replay and report.
    pub async fn broadcast_estimate(&mut self) {
        tracing::debug!(dispatched = self.dispatched, requested = self.requested, "broadcasting estimate");

        for worker in self.workers.iter_mut().filter(|w| w.alive) {
            if worker.mailbox.send(WorkerMessage::Estimate).await.is_err() {
                tracing::debug!(worker = worker.index, "estimate: mailbox closed");
                worker.alive = false;
            }
        }
    }

    /// Waits until every pending task has a result.
    ///
    /// With `OrphanPolicy::Abandon` a task dispatched to a worker that died
    /// is never answered, so this future does not complete while any other
    /// worker is alive.
    pub async fn collect(&mut self) -> anyhow::Result<std::collections::HashMap<schema::TaskId, TaskResult>> {
        let mut results = std::collections::HashMap::with_capacity(self.pending.len());

        while !self.pending.is_empty() {
            let Some(event) = self.events.recv().await else {
                anyhow::bail!("All workers exited with {} tasks pending", self.pending.len());
            };

            match event {
                WorkerEvent::Results { worker, result } => {
                    if self.pending.remove(&result.id).is_none() {
                        tracing::debug!(worker, task = %result.id, "result for unknown task");
                        continue;
                    }
                    if let Some(handle) = self.workers.iter_mut().find(|w| w.index == worker) {
                        handle.outstanding = handle.outstanding.saturating_sub(1);
                    }
                    results.insert(result.id, result);
                }
                WorkerEvent::Exited { worker } => self.handle_exit(worker).await?,
                WorkerEvent::Online { .. } => {}
            }
        }

        anyhow::Ok(results)
    }

    async fn handle_exit(&mut self, worker: usize) -> anyhow::Result<()> {
        if let Some(position) = self.workers.iter().position(|w| w.index == worker) {
            self.workers.remove(position);
            if position < self.next {
                self.next -= 1;
            }
            if self.next >= self.workers.len() {
                self.next = 0;
            }
        }

        let mut orphans: Vec<(schema::TaskId, schema::StrategyConfig)> = self
            .pending
            .iter()
            .filter(|(_, task)| task.worker == worker)
            .map(|(id, task)| (*id, task.config.clone()))
            .collect();
        orphans.sort_by_key(|(id, _)| *id);

        tracing::warn!(
            worker,
            orphaned = orphans.len(),
            remaining = self.live_workers(),
            "worker exited"
        );

        if orphans.is_empty() {
            return anyhow::Ok(());
        }

        match self.policy {
            settings::OrphanPolicy::Abandon => {
                tracing::warn!(worker, tasks = orphans.len(), "tasks abandoned, generation cannot complete");
                anyhow::Ok(())
            }
            settings::OrphanPolicy::FailGeneration => {
                anyhow::bail!("Worker {} exited with {} tasks in flight", worker, orphans.len())
            }
            settings::OrphanPolicy::Reassign => self.reassign(orphans).await,
        }
    }

    /// Re-dispatches orphaned tasks; each receiving worker is re-fed the
    /// generation's ticks first and told to estimate afterwards.
    async fn reassign(&mut self, orphans: Vec<(schema::TaskId, schema::StrategyConfig)>) -> anyhow::Result<()> {
        let mut targets: Vec<usize> = Vec::new();

        for (id, config) in orphans {
            self.pending.remove(&id);
            self.dispatched = self.dispatched.saturating_sub(1);

            let Some(slot) = self.next_slot() else {
                anyhow::bail!("No live workers left to reassign task {}", id);
            };
            let index = self.workers[slot].index;

            if !targets.contains(&index) {
                self.send_to(slot, WorkerMessage::SetTicks(self.candles.clone())).await?;
                targets.push(index);
            }
            self.send_to(slot, WorkerMessage::AddTask { id, config: config.clone() }).await?;

            let worker = &mut self.workers[slot];
            worker.outstanding += 1;
            worker.assigned += 1;
            self.pending.insert(id, PendingTask { worker: index, config });
            self.dispatched += 1;

            tracing::info!(task = %id, worker = index, "task reassigned");
        }

        for index in targets {
            if let Some(slot) = self.workers.iter().position(|w| w.index == index) {
                self.send_to(slot, WorkerMessage::Estimate).await?;
            }
        }

        anyhow::Ok(())
    }

    async fn send_to(&mut self, slot: usize, message: WorkerMessage) -> anyhow::Result<()> {
        let worker = &mut self.workers[slot];
        if worker.mailbox.send(message).await.is_err() {
            worker.alive = false;
            anyhow::bail!("Worker {} mailbox closed during reassignment", worker.index);
        }
        anyhow::Ok(())
    }

    /// Closes every mailbox and waits for the workers to stop.
    pub async fn shutdown(mut self) {
        let count = self.workers.len();
        self.workers.clear();

        let mut exited = 0;
        while exited < count {
            match self.events.recv().await {
                Some(WorkerEvent::Exited { .. }) => exited += 1,
                Some(_) => {}
                None => break,
            }
        }
        tracing::debug!(workers = exited, "worker pool shut down");
    }

    // --- Getters ---
    pub fn get_workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    /// Tasks each live worker received over the pool's lifetime, by worker index.
    pub fn assigned_counts(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.assigned).collect()
    }

    pub fn get_dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn get_requested(&self) -> usize {
        self.requested
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

}
