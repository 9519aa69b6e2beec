// genopt/src/main.rs

mod cli;
mod history;
mod scoring;

use std::sync::Arc;
use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let start_time = std::time::Instant::now();

    let args = cli::Args::parse();
    let settings = genopt_core::settings::Settings::load(&args.config)?;

    let Some(path) = settings.history.path.as_deref() else {
        anyhow::bail!("Settings 'history.path' must point to a candle CSV file");
    };
    let history = Arc::new(history::CsvHistory::new(path));

    tracing::info!(
        config = %args.config.display(),
        candles = %path,
        walk_forward = settings.walk_forward.is_some(),
        "settings loaded"
    );

    let mut engine = genopt_core::optimization::OptimizationEngineBuilder::from_settings(&settings)
        .with_history(history)
        .with_factory(Arc::new(strategy_lib::SmaCrossoverFactory))
        .with_validate(strategy_lib::validate)
        .with_score(scoring::score)
        .with_stats(scoring::stats)
        .build()?;

    let report = engine.run().await?;

    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(output) => {
            std::fs::write(output, json)
                .with_context(|| format!("Failed to write report to '{}'", output.display()))?;
            tracing::info!(path = %output.display(), "report written");
        }
        None => println!("{}", json),
    }

    tracing::info!(seconds = start_time.elapsed().as_secs_f64(), "optimization finished");
    anyhow::Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_path(file: &str) -> std::path::PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos").join(file)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn demo_settings_run_end_to_end() {
        let mut settings = genopt_core::settings::Settings::load(demo_path("settings.json")).unwrap();
        settings.optimizer.population_size = 8;
        settings.optimizer.max_generations = 2;
        settings.optimizer.workers = Some(2);

        let history = Arc::new(history::CsvHistory::new(demo_path("candles.csv")));
        let mut engine = genopt_core::optimization::OptimizationEngineBuilder::from_settings(&settings)
            .with_history(history)
            .with_factory(Arc::new(strategy_lib::SmaCrossoverFactory))
            .with_validate(strategy_lib::validate)
            .with_score(scoring::score)
            .with_stats(scoring::stats)
            .build()
            .unwrap();

        let report = engine.run().await.unwrap();

        assert_eq!(report.best.len(), 5);
        assert!(report.best.iter().all(|c| strategy_lib::validate(&c.config)));
        assert!(report.best.windows(2).all(|w| w[0].fitness >= w[1].fitness));
        assert_eq!(report.generations.len(), 4 * 3);
    }
}
