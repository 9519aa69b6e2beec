// genopt/src/scoring.rs

//! Fitness and stats of a finished strategy run.

/// Realized profit and loss, fees included.
pub fn score(evaluation: &genopt_core::strategy::Evaluation) -> f64 {
    evaluation.realized_pnl()
}

pub fn stats(evaluation: &genopt_core::strategy::Evaluation) -> serde_json::Value {
    serde_json::json!({
        "pnl": evaluation.realized_pnl(),
        "deals": evaluation.deals_count(),
        "fees": evaluation.total_fees(),
        "closed_candles": evaluation.closed_candles,
        "open_orders": evaluation.open_orders.len(),
    })
}
