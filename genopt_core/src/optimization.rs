// genopt_core/src/optimization.rs

//! Genetic search over strategy configurations.
//!
//! `Genetics` holds the population algebra: random generation, mutation,
//! crossover and breeding (elitism + binary tournament), optionally split into
//! islands that periodically merge into one continental population.
//! `OptimizationEngine` drives generations through a `WorkerPool`, with or
//! without walk-forward segmentation, and ranks the final population.

use std::sync::Arc;
use anyhow::Context;
use rand::prelude::*;
use itertools::Itertools;

use crate::worker;
use crate::schema;
use crate::backtest;
use crate::settings;
use crate::strategy;
use crate::walk_forward;
use crate::data_handler;

/// Bound on validation retries for generation, mutation and crossover.
pub const RETRY_LIMIT: usize = 100;
/// Every this many generations the islands merge.
pub const CONTINENT_PERIOD: usize = 15;
/// Generations a continental phase lasts.
pub const CONTINENT_LENGTH: usize = 5;

pub type ValidateFn = Arc<dyn Fn(&schema::StrategyConfig) -> bool + Send + Sync>;

/// Whether `generation` (counted from 0) runs on the merged population.
pub fn is_continental(generation: usize) -> bool {
    generation >= CONTINENT_PERIOD && generation % CONTINENT_PERIOD < CONTINENT_LENGTH
}

/// Splits `len` individuals into `count` contiguous near-equal islands.
pub fn island_ranges(len: usize, count: usize) -> Vec<std::ops::Range<usize>> {
    let count = count.max(1);
    let base = len / count;
    let extra = len % count;
    let mut start = 0;

    (0..count)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .filter(|range| !range.is_empty())
        .collect()
}

/// A configuration and, once evaluated, its fitness and stats.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Phenotype {
    config: schema::StrategyConfig,
    fitness: Option<f64>,
    stats: Option<serde_json::Value>,
}

impl Phenotype {
    pub fn new(config: schema::StrategyConfig) -> Self {
        Self {
            config,
            fitness: None,
            stats: None,
        }
    }

    pub fn with_result(mut self, fitness: f64, stats: serde_json::Value) -> Self {
        self.fitness = Some(fitness);
        self.stats = Some(stats);
        self
    }

    // --- Getters ---
    pub fn get_config(&self) -> &schema::StrategyConfig {
        &self.config
    }

    pub fn get_fitness(&self) -> Option<f64> {
        self.fitness
    }

    pub fn get_stats(&self) -> Option<&serde_json::Value> {
        self.stats.as_ref()
    }

    /// Fitness used for ranking; unscored phenotypes rank last.
    fn rank_fitness(&self) -> f64 {
        match self.fitness {
            Some(fitness) if !fitness.is_nan() => fitness,
            _ => f64::NEG_INFINITY,
        }
    }

}

/// One entry of the final ranking.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RankedCandidate {
    pub config: schema::StrategyConfig,
    pub fitness: f64,
    pub stats: serde_json::Value,
}

/// Top `n` phenotypes by descending fitness.
pub fn best(population: &[Phenotype], n: usize) -> Vec<RankedCandidate> {
    population
        .iter()
        .sorted_by(|a, b| b.rank_fitness().total_cmp(&a.rank_fitness()))
        .take(n)
        .map(|p| RankedCandidate {
            config: p.config.clone(),
            fitness: p.rank_fitness(),
            stats: p.stats.clone().unwrap_or(serde_json::Value::Null),
        })
        .collect()
}

/// Which slice of history a generation was scored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Window {
    Full,
    Backtest,
    Forward,
}

/// Fitness summary of one evaluated generation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GenerationStats {
    pub generation: usize,
    pub segment: Option<usize>,
    pub window: Window,
    pub continental: bool,
    pub best_fitness: f64,
    pub mean_fitness: f64,
    pub worst_fitness: f64,
    pub best_config: Option<schema::StrategyConfig>,
    pub elapsed_ms: u128,
}

impl GenerationStats {
    fn from_population(population: &[Phenotype], generation: usize, window: Window) -> Self {
        let values: Vec<f64> = population.iter().map(|p| p.rank_fitness()).collect();
        let (mean, best_fitness, worst_fitness) = calculate_stats(&values);
        let best_config = population
            .iter()
            .max_by(|a, b| a.rank_fitness().total_cmp(&b.rank_fitness()))
            .map(|p| p.config.clone());

        Self {
            generation,
            segment: None,
            window,
            continental: false,
            best_fitness,
            mean_fitness: mean,
            worst_fitness,
            best_config,
            elapsed_ms: 0,
        }
    }

    fn with_segment(mut self, segment: usize) -> Self {
        self.segment = Some(segment);
        self
    }

    fn with_continental(mut self, continental: bool) -> Self {
        self.continental = continental;
        self
    }

    fn with_elapsed(mut self, elapsed: std::time::Duration) -> Self {
        self.elapsed_ms = elapsed.as_millis();
        self
    }

}

/// Mean, max and min of the finite values.
fn calculate_stats(values: &[f64]) -> (f64, f64, f64) {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return (0.0, 0.0, 0.0);
    }

    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    (mean, max, min)
}

/// Population algebra. Pure apart from the RNG it is handed.
#[derive(Clone)]
pub struct Genetics {
    schema: schema::Schema,
    base: schema::StrategyConfig,
    validate: ValidateFn,
    p_crossover: f64,
    p_mutation: f64,
}

impl Genetics {
    pub fn new(schema: schema::Schema, base: schema::StrategyConfig, validate: ValidateFn) -> Self {
        Self {
            schema,
            base,
            validate,
            p_crossover: 0.8,
            p_mutation: 0.2,
        }
    }

    pub fn with_probabilities(mut self, p_crossover: f64, p_mutation: f64) -> Self {
        self.p_crossover = p_crossover.clamp(0.0, 1.0);
        self.p_mutation = p_mutation.clamp(0.0, 1.0);
        self
    }

    pub fn is_valid(&self, config: &schema::StrategyConfig) -> bool {
        (self.validate)(config)
    }

    /// Runs `attempt` up to `RETRY_LIMIT` times until `accept` holds.
    fn bounded<T, R, A, V>(&self, rng: &mut R, mut attempt: A, accept: V) -> schema::Attempt<T>
    where
        R: Rng,
        A: FnMut(&mut R) -> T,
        V: Fn(&T) -> bool,
    {
        let mut candidate = attempt(rng);
        for _ in 1..RETRY_LIMIT {
            if accept(&candidate) {
                return schema::Attempt::Validated(candidate);
            }
            candidate = attempt(rng);
        }

        if accept(&candidate) {
            schema::Attempt::Validated(candidate)
        } else {
            schema::Attempt::Exhausted(candidate)
        }
    }

    /// Base config with every schema key drawn at random.
    pub fn random_config<R: Rng>(&self, rng: &mut R) -> schema::Attempt<schema::StrategyConfig> {
        self.bounded(
            rng,
            |rng| {
                let mut config = self.base.clone();
                for (name, descriptor) in &self.schema {
                    config.params.insert(name.clone(), descriptor.random_value(rng));
                }
                config
            },
            |config| self.is_valid(config),
        )
    }

    /// Redraws a random non-empty subset of the schema keys.
    pub fn mutate<R: Rng>(&self, config: &schema::StrategyConfig, rng: &mut R) -> schema::Attempt<schema::StrategyConfig> {
        let keys: Vec<&String> = self.schema.keys().collect();
        if keys.is_empty() {
            return if self.is_valid(config) {
                schema::Attempt::Validated(config.clone())
            } else {
                schema::Attempt::Exhausted(config.clone())
            };
        }

        self.bounded(
            rng,
            |rng| {
                let count = rng.gen_range(1..=keys.len());
                let mut mutant = config.clone();
                for name in keys.choose_multiple(rng, count) {
                    let descriptor = &self.schema[*name];
                    mutant.params.insert((*name).clone(), descriptor.random_value(rng));
                }
                mutant
            },
            |mutant| self.is_valid(mutant),
        )
    }

    /// Two children, each inheriting every schema key from a randomly chosen parent.
    pub fn crossover<R: Rng>(
        &self,
        mother: &schema::StrategyConfig,
        father: &schema::StrategyConfig,
        rng: &mut R,
    ) -> schema::Attempt<(schema::StrategyConfig, schema::StrategyConfig)> {
        let recombine = |first: &schema::StrategyConfig, rng: &mut R| {
            let mut child = first.clone();
            for name in self.schema.keys() {
                let parent = if rng.gen_bool(0.5) { mother } else { father };
                if let Some(value) = parent.get(name) {
                    child.params.insert(name.clone(), *value);
                }
            }
            child
        };

        self.bounded(
            rng,
            |rng| {
                let son = recombine(mother, rng);
                let daughter = recombine(father, rng);
                (son, daughter)
            },
            |(son, daughter)| self.is_valid(son) && self.is_valid(daughter),
        )
    }

    /// Binary tournament.
    fn select<'a, R: Rng>(&self, group: &'a [Phenotype], rng: &mut R) -> &'a Phenotype {
        let a = &group[rng.gen_range(0..group.len())];
        let b = &group[rng.gen_range(0..group.len())];
        if a.rank_fitness() >= b.rank_fitness() { a } else { b }
    }

    /// Next `size` configs bred from `group`: the best individual survives,
    /// the rest come from tournament-selected parents.
    pub fn breed<R: Rng>(&self, group: &[Phenotype], size: usize, rng: &mut R) -> Vec<schema::StrategyConfig> {
        let mut next = Vec::with_capacity(size);
        if size == 0 {
            return next;
        }

        if group.is_empty() {
            while next.len() < size {
                next.push(self.accept(self.random_config(rng), "random generation"));
            }
            return next;
        }

        if let Some(elite) = group.iter().max_by(|a, b| a.rank_fitness().total_cmp(&b.rank_fitness())) {
            next.push(elite.config.clone());
        }

        while next.len() < size {
            let mother = &self.select(group, rng).config;
            let father = &self.select(group, rng).config;

            let (son, daughter) = if rng.gen_bool(self.p_crossover) {
                self.accept(self.crossover(mother, father, rng), "crossover")
            } else {
                (mother.clone(), father.clone())
            };

            for child in [son, daughter] {
                if next.len() == size {
                    break;
                }
                let child = if rng.gen_bool(self.p_mutation) {
                    self.accept(self.mutate(&child, rng), "mutation")
                } else {
                    child
                };
                next.push(child);
            }
        }

        next
    }

    fn accept<T>(&self, attempt: schema::Attempt<T>, operation: &str) -> T {
        if !attempt.is_validated() {
            tracing::warn!(operation, retries = RETRY_LIMIT, "retries exhausted, accepting invalid candidate");
        }
        attempt.into_inner()
    }

    /// Breeds a whole population, island by island unless `continental`.
    pub fn breed_population<R: Rng>(
        &self,
        population: &[Phenotype],
        island_count: Option<usize>,
        continental: bool,
        rng: &mut R,
    ) -> Vec<schema::StrategyConfig> {
        match island_count {
            Some(count) if !continental => island_ranges(population.len(), count)
                .into_iter()
                .flat_map(|range| {
                    let size = range.len();
                    self.breed(&population[range], size, rng)
                })
                .collect(),
            _ => self.breed(population, population.len(), rng),
        }
    }

    /// A fresh population of `size` random configs.
    pub fn seed_population<R: Rng>(&self, size: usize, rng: &mut R) -> Vec<schema::StrategyConfig> {
        (0..size)
            .map(|_| self.accept(self.random_config(rng), "random generation"))
            .collect()
    }

}

/// Output of a full optimization run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OptimizationReport {
    pub best: Vec<RankedCandidate>,
    pub generations: Vec<GenerationStats>,
}

pub struct OptimizationEngineBuilder {
    params: settings::GAParams,
    schema: schema::Schema,
    base: schema::StrategyConfig,
    walk_forward: Option<settings::WalkForwardSettings>,
    simulator: backtest::SimulatorSettings,
    request: Option<data_handler::HistoryRequest>,
    history: Option<Arc<dyn data_handler::HistoryProvider>>,
    factory: Option<Arc<dyn worker::StrategyFactory>>,
    validate: ValidateFn,
    score: Option<worker::ScoreFn>,
    stats: worker::StatsFn,
}

impl OptimizationEngineBuilder {
    pub fn new(params: settings::GAParams, schema: schema::Schema, base: schema::StrategyConfig) -> Self {
        Self {
            params,
            schema,
            base,
            walk_forward: None,
            simulator: backtest::SimulatorSettings::default(),
            request: None,
            history: None,
            factory: None,
            validate: Arc::new(|_| true),
            score: None,
            stats: Arc::new(|_| serde_json::Value::Null),
        }
    }

    /// Pre-fills everything the settings file describes.
    pub fn from_settings(settings: &settings::Settings) -> Self {
        Self::new(settings.optimizer.clone(), settings.schema.clone(), settings.strategy.clone())
            .with_walk_forward(settings.walk_forward.clone())
            .with_simulator(settings.simulator.clone())
            .with_request(settings.history_request())
    }

    pub fn with_walk_forward(mut self, walk_forward: Option<settings::WalkForwardSettings>) -> Self {
        self.walk_forward = walk_forward;
        self
    }

    pub fn with_simulator(mut self, simulator: backtest::SimulatorSettings) -> Self {
        self.simulator = simulator;
        self
    }

    pub fn with_request(mut self, request: data_handler::HistoryRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn data_handler::HistoryProvider>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn worker::StrategyFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&schema::StrategyConfig) -> bool + Send + Sync + 'static,
    {
        self.validate = Arc::new(validate);
        self
    }

    pub fn with_score<F>(mut self, score: F) -> Self
    where
        F: Fn(&strategy::Evaluation) -> f64 + Send + Sync + 'static,
    {
        self.score = Some(Arc::new(score));
        self
    }

    pub fn with_stats<F>(mut self, stats: F) -> Self
    where
        F: Fn(&strategy::Evaluation) -> serde_json::Value + Send + Sync + 'static,
    {
        self.stats = Arc::new(stats);
        self
    }

    pub fn build(self) -> anyhow::Result<OptimizationEngine> {
        let Some(history) = self.history else {
            anyhow::bail!("Optimization engine needs a history provider");
        };
        let Some(factory) = self.factory else {
            anyhow::bail!("Optimization engine needs a strategy factory");
        };
        let Some(score) = self.score else {
            anyhow::bail!("Optimization engine needs a score function");
        };
        if self.params.population_size == 0 || self.params.max_generations == 0 {
            anyhow::bail!("Population size and generation count must be positive");
        }
        for (name, p) in [("p_crossover", self.params.p_crossover), ("p_mutation", self.params.p_mutation)] {
            if !(0.0..=1.0).contains(&p) {
                anyhow::bail!("GA {} must be between 0.0 and 1.0, got {}", name, p);
            }
        }
        if self.schema.is_empty() {
            anyhow::bail!("Optimization engine needs a non-empty schema");
        }
        for (name, descriptor) in &self.schema {
            descriptor.validate(name)?;
        }

        let request = self.request.unwrap_or_else(|| data_handler::HistoryRequest {
            broker: self.base.broker.clone(),
            ticker: self.base.ticker.clone(),
            interval: self.base.interval,
            days: 365,
            gap_days: 0,
        });

        let rng = match self.params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let context = worker::WorkerContext::new(factory, score, self.stats)
            .with_simulator(self.simulator)
            .with_ticker(&self.base.ticker);

        let genetics = Genetics::new(self.schema, self.base, self.validate)
            .with_probabilities(self.params.p_crossover, self.params.p_mutation);

        anyhow::Ok(OptimizationEngine {
            params: self.params,
            walk_forward: self.walk_forward,
            genetics,
            history,
            request,
            context,
            rng,
            generation: 0,
        })
    }

}

pub struct OptimizationEngine {
    params: settings::GAParams,
    walk_forward: Option<settings::WalkForwardSettings>,
    genetics: Genetics,
    history: Arc<dyn data_handler::HistoryProvider>,
    request: data_handler::HistoryRequest,
    context: worker::WorkerContext,
    rng: StdRng,
    /// Generations evaluated so far, across walk-forward segments.
    generation: usize,
}

impl OptimizationEngine {
    pub fn builder(params: settings::GAParams, schema: schema::Schema, base: schema::StrategyConfig) -> OptimizationEngineBuilder {
        OptimizationEngineBuilder::new(params, schema, base)
    }

    /// Fetches history, spawns the worker pool and runs the search.
    pub async fn run(&mut self) -> anyhow::Result<OptimizationReport> {
        let candles = self
            .history
            .get_history(&self.request)
            .await
            .with_context(|| format!("Failed to fetch history for '{}'", self.request.ticker))?;
        if candles.is_empty() {
            anyhow::bail!("History for '{}' is empty", self.request.ticker);
        }

        let workers = self.params.worker_count();
        tracing::info!(
            ticker = %self.request.ticker,
            candles = candles.len(),
            workers,
            population = self.params.population_size,
            generations = self.params.max_generations,
            islands = self.params.islands,
            "starting optimization"
        );

        let mut pool = worker::WorkerPool::spawn(workers, self.context.clone(), self.params.orphan_policy).await?;
        let result = self.search(&mut pool, &candles).await;
        pool.shutdown().await;

        let (population, generations) = result?;
        let ranking = best(&population, self.params.best);

        if let Some(top) = ranking.first() {
            tracing::info!(fitness = top.fitness, config = %top.config.format_for_display(), "best candidate");
        }

        anyhow::Ok(OptimizationReport { best: ranking, generations })
    }

    async fn search(
        &mut self,
        pool: &mut worker::WorkerPool,
        candles: &[data_handler::Candle],
    ) -> anyhow::Result<(Vec<Phenotype>, Vec<GenerationStats>)> {
        self.generation = 0;
        let mut stats = Vec::new();
        let mut population = self.genetics.seed_population(self.params.population_size, &mut self.rng);
        let max_generations = self.params.max_generations;

        let Some(walk_forward) = self.walk_forward.clone() else {
            let mut evaluated = Vec::new();
            for g in 0..max_generations {
                let (scored, stat) = self.generation_step(pool, population, candles, Window::Full).await?;
                stats.push(stat);
                population = if g + 1 < max_generations { self.breed(&scored) } else { Vec::new() };
                evaluated = scored;
            }
            return anyhow::Ok((evaluated, stats));
        };

        let segments = walk_forward::segment(candles.len(), walk_forward.segments, walk_forward.mode)?;
        let mut evaluated = Vec::new();

        for segment in &segments {
            tracing::info!(
                segment = segment.index,
                backtest = ?segment.backtest,
                forward = ?segment.forward,
                "walk-forward segment"
            );

            let backtest = segment.backtest_slice(candles);
            for _ in 0..max_generations {
                let (scored, stat) = self.generation_step(pool, population, backtest, Window::Backtest).await?;
                stats.push(stat.with_segment(segment.index));
                population = self.breed(&scored);
            }

            let started = std::time::Instant::now();
            let forward = segment.forward_slice(candles);
            let scored = self.evaluate(pool, population, forward).await?;
            let stat = GenerationStats::from_population(&scored, self.generation, Window::Forward)
                .with_segment(segment.index)
                .with_elapsed(started.elapsed());
            tracing::info!(
                segment = segment.index,
                best = stat.best_fitness,
                mean = stat.mean_fitness,
                worst = stat.worst_fitness,
                "forward window evaluated"
            );
            stats.push(stat);

            population = if segment.index + 1 < segments.len() { self.breed(&scored) } else { Vec::new() };
            evaluated = scored;
        }

        anyhow::Ok((evaluated, stats))
    }

    /// Evaluates one generation, logs its statistics and advances the counter.
    async fn generation_step(
        &mut self,
        pool: &mut worker::WorkerPool,
        population: Vec<schema::StrategyConfig>,
        candles: &[data_handler::Candle],
        window: Window,
    ) -> anyhow::Result<(Vec<Phenotype>, GenerationStats)> {
        let started = std::time::Instant::now();
        let continental = self.params.islands && is_continental(self.generation);
        let scored = self.evaluate(pool, population, candles).await?;

        let stat = GenerationStats::from_population(&scored, self.generation, window)
            .with_continental(continental)
            .with_elapsed(started.elapsed());

        tracing::info!(
            generation = self.generation,
            best = stat.best_fitness,
            mean = stat.mean_fitness,
            worst = stat.worst_fitness,
            continental,
            elapsed_ms = stat.elapsed_ms as u64,
            "generation evaluated"
        );

        self.generation += 1;
        anyhow::Ok((scored, stat))
    }

    /// Pushes ticks, submits every config and waits for the results.
    pub async fn evaluate(
        &mut self,
        pool: &mut worker::WorkerPool,
        population: Vec<schema::StrategyConfig>,
        candles: &[data_handler::Candle],
    ) -> anyhow::Result<Vec<Phenotype>> {
        pool.begin_generation(population.len());
        pool.set_ticks(candles).await?;

        let ids: Vec<schema::TaskId> = population.iter().map(|c| c.task_id()).collect();
        for (id, config) in ids.iter().zip(&population) {
            pool.submit(*id, config.clone()).await?;
        }

        let results = pool.collect().await?;

        population
            .into_iter()
            .zip(ids)
            .map(|(config, id)| {
                let result = results
                    .get(&id)
                    .ok_or_else(|| anyhow::anyhow!("No result for task {}", id))?;
                anyhow::Ok(Phenotype::new(config).with_result(result.score, result.stats.clone()))
            })
            .collect()
    }

    /// Population of the next generation, bred as one when that generation is continental.
    fn breed(&mut self, scored: &[Phenotype]) -> Vec<schema::StrategyConfig> {
        let islands = self.params.islands.then_some(self.params.island_count);
        let continental = is_continental(self.generation);
        self.genetics.breed_population(scored, islands, continental, &mut self.rng)
    }

    // --- Getters ---
    pub fn get_genetics(&self) -> &Genetics {
        &self.genetics
    }

    pub fn get_params(&self) -> &settings::GAParams {
        &self.params
    }

    pub fn get_generation(&self) -> usize {
        self.generation
    }

}
