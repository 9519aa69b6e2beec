// genopt_core/tests/common/mod.rs

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use genopt_core::{data_handler, plugins, schema, strategy, worker};

pub fn candles(count: i64) -> Vec<data_handler::Candle> {
    (0..count)
        .map(|m| {
            let ts = chrono::DateTime::<chrono::Utc>::from_timestamp(m * 60, 0).unwrap();
            let price = 100.0 + (m % 7) as f64;
            data_handler::Candle::new(ts, price, price + 1.0, price - 1.0, price, 1.0)
        })
        .collect()
}

pub fn config_with_x(x: i64) -> schema::StrategyConfig {
    schema::StrategyConfig::default().with_param("x", schema::ParamValue::Int(x))
}

pub fn score_x(evaluation: &strategy::Evaluation) -> f64 {
    evaluation.config.get_i64("x").unwrap_or(0) as f64
}

pub fn stats_x(evaluation: &strategy::Evaluation) -> serde_json::Value {
    serde_json::json!({
        "x": evaluation.config.get_i64("x").unwrap_or(0),
        "candles": evaluation.closed_candles,
    })
}

/// Builds plugin-free strategies; fails the first `failures` builds of configs carrying `boom`.
pub struct TestFactory {
    failures: AtomicUsize,
}

impl TestFactory {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self { failures: AtomicUsize::new(failures) })
    }
}

impl worker::StrategyFactory for TestFactory {
    fn build(&self, config: &schema::StrategyConfig) -> anyhow::Result<Vec<Arc<dyn plugins::Plugin>>> {
        if config.get("boom").is_some() {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("cannot build strategy");
            }
        }
        Ok(Vec::new())
    }
}

pub fn context(factory: Arc<TestFactory>) -> worker::WorkerContext {
    worker::WorkerContext::new(factory, Arc::new(score_x), Arc::new(stats_x))
}
