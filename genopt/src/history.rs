// genopt/src/history.rs

//! Candle history read from a CSV file with a
//! `timestamp,open,high,low,close,volume` header.

use anyhow::Context;

#[derive(Debug, serde::Deserialize)]
struct Row {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

/// History provider backed by one CSV file per run. The file is read on every
/// request; the window selection matches `InMemoryHistory`.
#[derive(Debug, Clone)]
pub struct CsvHistory {
    path: std::path::PathBuf,
}

impl CsvHistory {
    pub fn new<P: Into<std::path::PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

}

/// Reads and sorts every candle of `path`. Malformed rows fail the load.
pub fn load_candles(path: &std::path::Path) -> anyhow::Result<Vec<genopt_core::data_handler::Candle>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open candle file '{}'", path.display()))?;

    let mut candles = Vec::new();
    for (line, record) in reader.deserialize::<Row>().enumerate() {
        let row = record.with_context(|| format!("Bad candle row {} in '{}'", line + 1, path.display()))?;
        let timestamp = genopt_core::utils::string_to_date_time(&row.timestamp)
            .with_context(|| format!("Bad timestamp on row {} in '{}'", line + 1, path.display()))?;

        candles.push(genopt_core::data_handler::Candle::new(
            timestamp, row.open, row.high, row.low, row.close, row.volume,
        ));
    }

    candles.sort_by_key(|c| c.timestamp);
    candles.dedup_by_key(|c| c.timestamp);

    anyhow::Ok(candles)
}

#[async_trait::async_trait]
impl genopt_core::data_handler::HistoryProvider for CsvHistory {
    async fn get_history(
        &self,
        request: &genopt_core::data_handler::HistoryRequest,
    ) -> anyhow::Result<Vec<genopt_core::data_handler::Candle>> {
        let path = self.path.clone();
        let candles = tokio::task::spawn_blocking(move || load_candles(&path))
            .await
            .context("Candle loader task failed")??;

        tracing::info!(
            path = %self.path.display(),
            ticker = %request.ticker,
            interval = %request.interval,
            candles = candles.len(),
            "candle file loaded"
        );

        genopt_core::data_handler::InMemoryHistory::new(candles)
            .get_history(request)
            .await
    }
}
