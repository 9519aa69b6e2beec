// genopt_core/src/data_handler.rs

//! Market data model and the history capability.
//! Candles are plain values ordered by timestamp; history retrieval and caching
//! belong to whatever implements `HistoryProvider`.

/// One OHLCV bar. A tick is delivered in the same shape: a snapshot of the
/// in-progress candle stamped with that candle's opening time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Candle {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: chrono::DateTime<chrono::Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Folds a tick belonging to the same candle into this in-progress candle.
    pub fn merge(&mut self, tick: &Candle) {
        self.high = self.high.max(tick.high);
        self.low = self.low.min(tick.low);
        self.close = tick.close;
        self.volume = tick.volume;
    }

    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

}

/// Candle interval of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Interval {
    pub fn duration(&self) -> chrono::Duration {
        match self {
            Interval::OneMinute => chrono::Duration::minutes(1),
            Interval::FiveMinutes => chrono::Duration::minutes(5),
            Interval::FifteenMinutes => chrono::Duration::minutes(15),
            Interval::ThirtyMinutes => chrono::Duration::minutes(30),
            Interval::OneHour => chrono::Duration::hours(1),
            Interval::FourHours => chrono::Duration::hours(4),
            Interval::OneDay => chrono::Duration::days(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1d",
        }
    }

}

impl std::str::FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        const VALID_INTERVALS: &[&str] = &["1m", "5m", "15m", "30m", "1h", "4h", "1d"];
        match value {
            "1m" => Ok(Interval::OneMinute),
            "5m" => Ok(Interval::FiveMinutes),
            "15m" => Ok(Interval::FifteenMinutes),
            "30m" => Ok(Interval::ThirtyMinutes),
            "1h" => Ok(Interval::OneHour),
            "4h" => Ok(Interval::FourHours),
            "1d" => Ok(Interval::OneDay),
            _ => anyhow::bail!("Wrong interval '{}'. Use one of {:?}", value, VALID_INTERVALS),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a history fetch: `days` of candles ending `gap_days` before now.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HistoryRequest {
    pub broker: String,
    pub ticker: String,
    pub interval: Interval,
    pub days: u32,
    pub gap_days: u32,
}

/// Source of historical candles. Caching and retries are the implementor's concern.
#[async_trait::async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Returns candles ordered by timestamp.
    async fn get_history(&self, request: &HistoryRequest) -> anyhow::Result<Vec<Candle>>;
}

/// History provider over an in-memory candle vector. Returns the last
/// `days` worth of candles, skipping the trailing `gap_days`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistory {
    candles: Vec<Candle>,
}

impl InMemoryHistory {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn get_candles(&self) -> &[Candle] {
        &self.candles
    }

}

#[async_trait::async_trait]
impl HistoryProvider for InMemoryHistory {
    async fn get_history(&self, request: &HistoryRequest) -> anyhow::Result<Vec<Candle>> {
        let Some(last) = self.candles.last() else {
            anyhow::bail!("No candles available for {}:{}", request.broker, request.ticker);
        };

        let end = last.timestamp - chrono::Duration::days(request.gap_days as i64);
        let start = end - chrono::Duration::days(request.days as i64);

        anyhow::Ok(
            self.candles
                .iter()
                .filter(|candle| candle.timestamp > start && candle.timestamp <= end)
                .cloned()
                .collect()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minute: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::<chrono::Utc>::from_timestamp(minute * 60, 0).unwrap()
    }

    #[test]
    fn merge_extends_range_and_takes_last_close() {
        let mut candle = Candle::new(at(0), 10.0, 11.0, 9.5, 10.5, 1.0);
        candle.merge(&Candle::new(at(0), 10.0, 12.0, 9.0, 11.5, 3.0));

        assert_eq!(candle.open, 10.0);
        assert_eq!(candle.high, 12.0);
        assert_eq!(candle.low, 9.0);
        assert_eq!(candle.close, 11.5);
        assert_eq!(candle.volume, 3.0);
    }

    #[test]
    fn interval_parses_and_rejects_unknown() {
        let interval: Interval = "15m".parse().unwrap();
        assert_eq!(interval, Interval::FifteenMinutes);
        assert_eq!(interval.duration(), chrono::Duration::minutes(15));
        assert!("2m".parse::<Interval>().is_err());
    }

    #[tokio::test]
    async fn in_memory_history_honours_gap_days() {
        let day = 24 * 60;
        let candles: Vec<Candle> = (0..10)
            .map(|d| Candle::new(at(d * day), 1.0, 1.0, 1.0, 1.0, 0.0))
            .collect();
        let history = InMemoryHistory::new(candles);

        let request = HistoryRequest {
            broker: "sim".to_string(),
            ticker: "TEST".to_string(),
            interval: Interval::OneDay,
            days: 3,
            gap_days: 2,
        };
        let result = history.get_history(&request).await.unwrap();

        let stamps: Vec<_> = result.iter().map(|c| c.timestamp).collect();
        assert_eq!(stamps, vec![at(5 * day), at(6 * day), at(7 * day)]);
    }
}
