// genopt_core/tests/engine.rs

mod common;

use std::sync::Arc;

use genopt_core::{data_handler, optimization, schema, settings};

fn schema_x(min: i64, max: i64) -> schema::Schema {
    let mut schema = schema::Schema::new();
    schema.insert("x".to_string(), schema::SchemaDescriptor::Integer { min, max, odd: false });
    schema
}

fn params(population_size: usize, max_generations: usize, best: usize) -> settings::GAParams {
    settings::GAParams {
        population_size,
        max_generations,
        best,
        workers: Some(2),
        seed: Some(42),
        ..settings::GAParams::default()
    }
}

fn engine(params: settings::GAParams, schema: schema::Schema) -> optimization::OptimizationEngineBuilder {
    optimization::OptimizationEngine::builder(params, schema, schema::StrategyConfig::default())
        .with_history(Arc::new(data_handler::InMemoryHistory::new(common::candles(60))))
        .with_factory(common::TestFactory::new(0))
        .with_score(common::score_x)
        .with_stats(common::stats_x)
}

#[tokio::test]
async fn single_generation_ranks_descending() {
    let mut engine = engine(params(4, 1, 4), schema_x(1, 5)).build().unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.best.len(), 4);
    assert_eq!(report.generations.len(), 1);
    for candidate in &report.best {
        let x = candidate.config.get_i64("x").unwrap();
        assert!((1..=5).contains(&x));
        assert_eq!(candidate.fitness, x as f64);
        assert_eq!(candidate.stats["x"], x);
    }

    let top_two = &report.best[..2];
    assert!(top_two[0].fitness >= top_two[1].fitness);
    assert!(report.best.windows(2).all(|w| w[0].fitness >= w[1].fitness));
}

#[tokio::test]
async fn identical_configs_collapse_to_one_evaluation() {
    let mut engine = engine(params(4, 1, 4), schema_x(7, 7)).build().unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.best.len(), 4);
    assert!(report.best.iter().all(|c| c.fitness == 7.0));
}

#[tokio::test]
async fn search_climbs_and_is_reproducible() {
    let mut first = engine(params(8, 6, 3), schema_x(1, 50)).build().unwrap();
    let mut second = engine(params(8, 6, 3), schema_x(1, 50)).build().unwrap();

    let a = first.run().await.unwrap();
    let b = second.run().await.unwrap();

    assert_eq!(a.best, b.best);
    assert_eq!(a.generations.len(), 6);
    let first_best = a.generations[0].best_fitness;
    let last_best = a.generations[5].best_fitness;
    assert!(last_best >= first_best, "elitism keeps the best fitness");
}

#[tokio::test]
async fn islands_run_through_continental_phase() {
    let mut params = params(8, 17, 2);
    params.islands = true;
    params.island_count = 2;

    let mut engine = engine(params, schema_x(1, 30)).build().unwrap();
    let report = engine.run().await.unwrap();

    let continental: Vec<usize> = report
        .generations
        .iter()
        .filter(|g| g.continental)
        .map(|g| g.generation)
        .collect();
    assert_eq!(continental, vec![15, 16]);
    assert_eq!(report.best.len(), 2);
}

#[tokio::test]
async fn walk_forward_evaluates_every_forward_window() {
    let mut engine = engine(params(4, 2, 2), schema_x(1, 5))
        .with_walk_forward(Some(settings::WalkForwardSettings {
            segments: 3,
            mode: settings::WalkForwardMode::Rolling,
        }))
        .build()
        .unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.generations.len(), 3 * 3);
    let forward: Vec<_> = report
        .generations
        .iter()
        .filter(|g| g.window == optimization::Window::Forward)
        .collect();
    assert_eq!(forward.len(), 3);
    assert_eq!(forward.iter().map(|g| g.segment).collect::<Vec<_>>(), vec![Some(0), Some(1), Some(2)]);
    assert_eq!(engine.get_generation(), 6);

    // 60 candles in 3 segments: forward slices of 12 candles, 11 of them closed.
    assert!(report.best.iter().all(|c| c.stats["candles"] == 11));
}

#[tokio::test]
async fn history_errors_abort_the_run() {
    let mut engine = optimization::OptimizationEngine::builder(params(4, 1, 2), schema_x(1, 5), schema::StrategyConfig::default())
        .with_history(Arc::new(data_handler::InMemoryHistory::new(Vec::new())))
        .with_factory(common::TestFactory::new(0))
        .with_score(common::score_x)
        .build()
        .unwrap();

    assert!(engine.run().await.is_err());
}

#[tokio::test]
async fn fail_policy_aborts_the_run_on_worker_death() {
    let mut params = params(6, 1, 2);
    params.orphan_policy = settings::OrphanPolicy::FailGeneration;

    let mut engine = optimization::OptimizationEngine::builder(
        params,
        schema_x(1, 5),
        schema::StrategyConfig::default().with_param("boom", schema::ParamValue::Bool(true)),
    )
    .with_history(Arc::new(data_handler::InMemoryHistory::new(common::candles(20))))
    .with_factory(common::TestFactory::new(1))
    .with_score(common::score_x)
    .build()
    .unwrap();

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), engine.run())
        .await
        .expect("run should finish");
    assert!(outcome.is_err());
}

#[test]
fn builder_requires_collaborators() {
    let missing = optimization::OptimizationEngine::builder(params(4, 1, 2), schema_x(1, 5), schema::StrategyConfig::default())
        .with_score(common::score_x)
        .build();
    assert!(missing.is_err());
}

#[test]
fn builder_rejects_unusable_search_space() {
    let inverted = engine(params(4, 1, 2), schema_x(5, 1)).build();
    assert!(inverted.is_err());

    let empty = engine(params(4, 1, 2), schema::Schema::new()).build();
    assert!(empty.is_err());

    let mut bad_probability = params(4, 1, 2);
    bad_probability.p_mutation = 1.5;
    assert!(engine(bad_probability, schema_x(1, 5)).build().is_err());
}
