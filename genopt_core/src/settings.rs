// genopt_core/src/settings.rs

//! Configuration structures for an optimization run.
//! Loads settings from a JSON file and validates them.

use anyhow::Context;

use crate::schema;
use crate::backtest;
use crate::data_handler;

/// What happens to tasks dispatched to a worker that died mid-generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub enum OrphanPolicy {
    /// Leave them pending: the generation never completes.
    #[serde(rename = "abandon")]
    #[default]
    Abandon,
    /// Fail the run.
    #[serde(rename = "fail_generation")]
    FailGeneration,
    /// Re-dispatch them to the next live worker.
    #[serde(rename = "reassign")]
    Reassign,
}

/// How walk-forward windows advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub enum WalkForwardMode {
    /// Window start moves by the forward slice length every segment.
    #[serde(rename = "rolling")]
    #[default]
    Rolling,
    /// Window start stays at the first candle.
    #[serde(rename = "anchored", alias = "classic")]
    Anchored,
}

fn default_segments() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WalkForwardSettings {
    #[serde(default = "default_segments")]
    pub segments: usize,
    #[serde(default)]
    pub mode: WalkForwardMode,
}

impl Default for WalkForwardSettings {
    fn default() -> Self {
        Self {
            segments: default_segments(),
            mode: WalkForwardMode::default(),
        }
    }
}

fn default_island_count() -> usize {
    4
}

fn default_best() -> usize {
    10
}

/// Genetic algorithm parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GAParams {
    pub population_size: usize,
    pub max_generations: usize,
    pub p_crossover: f64,
    pub p_mutation: f64,
    #[serde(default)]
    pub islands: bool,
    #[serde(default = "default_island_count")]
    pub island_count: usize,
    /// Number of ranked candidates returned.
    #[serde(default = "default_best")]
    pub best: usize,
    /// Worker pool size; defaults to the CPU count and is capped by it.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Seeds the engine RNG for reproducible searches.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
}

impl Default for GAParams {
    fn default() -> Self {
        Self {
            population_size: 50,
            max_generations: 20,
            p_crossover: 0.8,
            p_mutation: 0.2,
            islands: false,
            island_count: default_island_count(),
            best: default_best(),
            workers: None,
            seed: None,
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

impl GAParams {
    /// Effective worker pool size.
    pub fn worker_count(&self) -> usize {
        let available = num_cpus::get().max(1);
        self.workers.unwrap_or(available).clamp(1, available)
    }

}

/// History window fed to the search.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistorySettings {
    pub days: u32,
    #[serde(default)]
    pub gap_days: u32,
    /// Candle file read by the CSV history provider.
    #[serde(default)]
    pub path: Option<String>,
}

/// Top-level settings structure.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Base configuration: identity fields and fixed parameters.
    pub strategy: schema::StrategyConfig,
    pub history: HistorySettings,
    pub optimizer: GAParams,
    #[serde(default)]
    pub walk_forward: Option<WalkForwardSettings>,
    #[serde(default)]
    pub simulator: backtest::SimulatorSettings,
    pub schema: schema::Schema,
}

impl Settings {
    /// Loads and validates settings from a JSON file.
    pub fn load<P: AsRef<std::path::Path>>(settings_file_path: P) -> anyhow::Result<Self> {
        let path = settings_file_path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file '{}'", path.display()))?;

        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        let mut settings: Settings = serde_json::from_str(contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse settings JSON: {}", e))?;

        check_args(&mut settings)
            .map_err(|e| anyhow::anyhow!("Settings validation failed:\n{}", e))?;

        anyhow::Ok(settings)
    }

    pub fn history_request(&self) -> data_handler::HistoryRequest {
        data_handler::HistoryRequest {
            broker: self.strategy.broker.clone(),
            ticker: self.strategy.ticker.clone(),
            interval: self.strategy.interval,
            days: self.history.days,
            gap_days: self.history.gap_days,
        }
    }

}

fn check_args(settings: &mut Settings) -> anyhow::Result<()> {
    // check workers
    {
        if let Some(workers) = settings.optimizer.workers {
            if workers == 0 {
                anyhow::bail!("Settings validation error: 'workers' cannot be zero.");
            }
            let available = num_cpus::get();
            if workers > available {
                settings.optimizer.workers = Some(available);
            }
        }
    }

    // check GA params
    {
        let ga_params = &settings.optimizer;
        if ga_params.population_size == 0 {
            anyhow::bail!("GA population_size must be greater than 0");
        }
        if ga_params.max_generations == 0 {
            anyhow::bail!("GA max_generations must be greater than 0");
        }
        if !(0.0..=1.0).contains(&ga_params.p_crossover) {
            anyhow::bail!("GA p_crossover must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&ga_params.p_mutation) {
            anyhow::bail!("GA p_mutation must be between 0.0 and 1.0");
        }
        if ga_params.best == 0 {
            anyhow::bail!("GA best must be greater than 0");
        }
        if ga_params.islands && ga_params.island_count < 2 {
            anyhow::bail!("GA island_count must be at least 2 when islands are enabled");
        }
    }

    // check strategy
    {
        if settings.strategy.amount <= 0.0 {
            anyhow::bail!("Strategy amount must be positive!");
        }
        if settings.strategy.ticker.is_empty() {
            anyhow::bail!("Provide a ticker!");
        }
    }

    // check history
    {
        if settings.history.days == 0 {
            anyhow::bail!("History days must be greater than 0");
        }
    }

    // check walk forward
    {
        if let Some(walk_forward) = &settings.walk_forward {
            if walk_forward.segments == 0 {
                anyhow::bail!("Walk-forward segments must be greater than 0");
            }
        }
    }

    // check simulator
    {
        if settings.simulator.fee_rate < 0.0 {
            anyhow::bail!("Simulator fee_rate cannot be negative!");
        }
        if settings.simulator.lot <= 0.0 {
            anyhow::bail!("Simulator lot must be positive!");
        }
    }

    // check schema
    {
        if settings.schema.is_empty() {
            anyhow::bail!("Schema cannot be empty!");
        }
        for (name, descriptor) in &settings.schema {
            descriptor.validate(name)?;
        }
    }

    anyhow::Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"{
        "strategy": {"broker": "sim", "ticker": "BTCUSDT", "amount": 1000.0, "interval": "1h"},
        "history": {"days": 90, "gap_days": 1},
        "optimizer": {"population_size": 20, "max_generations": 5, "p_crossover": 0.7, "p_mutation": 0.3},
        "walk_forward": {"segments": 6, "mode": "classic"},
        "schema": {
            "fast": {"type": "integer", "min": 2, "max": 20},
            "reverse": {"type": "boolean"}
        }
    }"#;

    #[test]
    fn loads_with_defaults() {
        let settings = Settings::from_json(SETTINGS).unwrap();

        assert_eq!(settings.strategy.interval, data_handler::Interval::OneHour);
        assert_eq!(settings.optimizer.orphan_policy, OrphanPolicy::Abandon);
        assert_eq!(settings.optimizer.island_count, 4);
        assert_eq!(settings.optimizer.best, 10);
        assert_eq!(settings.walk_forward.as_ref().unwrap().mode, WalkForwardMode::Anchored);
        assert_eq!(settings.simulator, backtest::SimulatorSettings::default());
        assert_eq!(settings.history_request().gap_days, 1);
        assert!(settings.optimizer.worker_count() >= 1);
    }

    #[test]
    fn rejects_bad_probabilities_and_schema() {
        let bad = SETTINGS.replace("\"p_mutation\": 0.3", "\"p_mutation\": 1.3");
        assert!(Settings::from_json(&bad).is_err());

        let bad = SETTINGS.replace("\"min\": 2, \"max\": 20", "\"min\": 30, \"max\": 20");
        assert!(Settings::from_json(&bad).is_err());

        let bad = SETTINGS.replace("\"amount\": 1000.0", "\"amount\": 1000.0, \"unknown\": 1");
        assert!(Settings::from_json(&bad).is_err());
    }

    #[test]
    fn caps_workers_at_cpu_count() {
        let many = SETTINGS.replace("\"p_mutation\": 0.3", "\"p_mutation\": 0.3, \"workers\": 100000");
        let settings = Settings::from_json(&many).unwrap();
        assert_eq!(settings.optimizer.workers, Some(num_cpus::get()));
    }
}
