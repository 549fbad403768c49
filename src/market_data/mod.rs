pub mod stream;

pub use stream::*;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::TradingResult;
use crate::types::{Candle, CandleBuffer, CandleInterval, UpsertOutcome};

/// A remote provider of historical/recent candles. Implemented by the venue
/// REST client; mocked in tests.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_candles(
        &self,
        coin: &str,
        interval: CandleInterval,
        start_ms: i64,
        end_ms: i64,
    ) -> TradingResult<Vec<Candle>>;
}

/// Candle update delivered to subscribers. `is_closed = true` is emitted
/// exactly once per bucket, when the first strictly newer bucket appears.
#[derive(Debug, Clone)]
pub struct CandleEvent {
    pub coin: String,
    pub interval: CandleInterval,
    pub candle: Candle,
    pub is_closed: bool,
}

/// Last observed close per symbol, shared with the web surface.
#[derive(Default)]
pub struct PriceCache {
    inner: tokio::sync::RwLock<std::collections::HashMap<String, f64>>,
}

impl PriceCache {
    pub async fn set(&self, coin: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.inner.write().await.insert(coin.to_string(), price);
        }
    }

    pub async fn get(&self, coin: &str) -> Option<f64> {
        self.inner.read().await.get(coin).copied()
    }

    pub async fn all(&self) -> std::collections::HashMap<String, f64> {
        self.inner.read().await.clone()
    }
}

/// Owns the ordered candle sequence for one `(symbol, interval, source)`.
/// Readers get snapshots; nothing else writes the sequence.
pub struct CandleIngestor {
    coin: String,
    interval: CandleInterval,
    source: Arc<dyn CandleSource>,
    buffer: CandleBuffer,
}

impl CandleIngestor {
    pub fn new(
        coin: &str,
        interval: CandleInterval,
        source: Arc<dyn CandleSource>,
        capacity: usize,
    ) -> Self {
        Self {
            coin: coin.to_string(),
            interval,
            source,
            buffer: CandleBuffer::new(capacity),
        }
    }

    pub fn coin(&self) -> &str {
        &self.coin
    }

    pub fn interval(&self) -> CandleInterval {
        self.interval
    }

    pub fn candles(&self) -> &[Candle] {
        &self.buffer.candles
    }

    pub fn snapshot(&self) -> Vec<Candle> {
        self.buffer.candles.clone()
    }

    pub fn last_time(&self) -> Option<i64> {
        self.buffer.last_time()
    }

    /// Fetches the last `bars` candles, discards anything failing validation,
    /// and seeds the sequence with what remains.
    pub async fn warmup(&mut self, bars: usize) -> TradingResult<usize> {
        let now = Utc::now().timestamp_millis();
        let start = now - bars as i64 * self.interval.to_millis();
        let fetched = self
            .source
            .fetch_candles(&self.coin, self.interval, start, now)
            .await?;

        let total = fetched.len();
        let mut kept = 0usize;
        for candle in fetched {
            if !candle.is_valid() {
                warn!(
                    "{} {}: discarding invalid warmup candle at t={}",
                    self.coin, self.interval, candle.time
                );
                continue;
            }
            if self.buffer.upsert(candle) != UpsertOutcome::RejectedOutOfOrder {
                kept += 1;
            }
        }
        debug!(
            "{} {}: warmup kept {}/{} candles",
            self.coin, self.interval, kept, total
        );
        Ok(kept)
    }

    /// Fetches everything from the last known bucket onward and merges it:
    /// a candle matching an existing timestamp replaces it (in-progress
    /// update), a newer one appends, an older one is rejected and logged.
    /// Returns the latest candle, or `None` when the venue had nothing new.
    pub async fn poll(&mut self) -> TradingResult<Option<Candle>> {
        let now = Utc::now().timestamp_millis();
        let start = self.buffer.last_time().unwrap_or(now - self.interval.to_millis());
        let fetched = self
            .source
            .fetch_candles(&self.coin, self.interval, start, now)
            .await?;
        if fetched.is_empty() {
            return Ok(None);
        }

        for candle in fetched {
            self.merge(candle);
        }
        Ok(self.buffer.last().copied())
    }

    /// Applies one live candle update to the owned sequence.
    pub fn merge(&mut self, candle: Candle) -> UpsertOutcome {
        if !candle.is_valid() {
            warn!(
                "{} {}: rejecting invalid candle at t={}",
                self.coin, self.interval, candle.time
            );
            return UpsertOutcome::RejectedOutOfOrder;
        }
        let outcome = self.buffer.upsert(candle);
        if outcome == UpsertOutcome::RejectedOutOfOrder {
            warn!(
                "{} {}: out-of-order candle t={} behind {}",
                self.coin,
                self.interval,
                candle.time,
                self.buffer.last_time().unwrap_or_default()
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockSource {
        responses: Mutex<Vec<Vec<Candle>>>,
    }

    impl MockSource {
        fn new(responses: Vec<Vec<Candle>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl CandleSource for MockSource {
        async fn fetch_candles(
            &self,
            _coin: &str,
            _interval: CandleInterval,
            _start_ms: i64,
            _end_ms: i64,
        ) -> TradingResult<Vec<Candle>> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
            trades: 1,
        }
    }

    #[tokio::test]
    async fn warmup_discards_invalid_candles() {
        let mut bad = candle(60_000, 100.0);
        bad.close = f64::NAN;
        let mut inverted = candle(120_000, 100.0);
        inverted.high = inverted.low - 5.0;
        let source = MockSource::new(vec![vec![candle(0, 99.0), bad, inverted, candle(180_000, 101.0)]]);
        let mut ingestor = CandleIngestor::new("ETH", CandleInterval::M1, source, 100);
        let kept = ingestor.warmup(10).await.unwrap();
        assert_eq!(kept, 2);
        assert_eq!(ingestor.candles().len(), 2);
        assert_eq!(ingestor.last_time(), Some(180_000));
    }

    #[tokio::test]
    async fn poll_replaces_in_progress_and_appends_new() {
        let source = MockSource::new(vec![
            vec![candle(0, 100.0)],
            // same bucket updated, then a new bucket
            vec![candle(0, 102.0), candle(60_000, 103.0)],
        ]);
        let mut ingestor = CandleIngestor::new("ETH", CandleInterval::M1, source, 100);
        ingestor.poll().await.unwrap();
        let latest = ingestor.poll().await.unwrap().unwrap();
        assert_eq!(latest.time, 60_000);
        assert_eq!(ingestor.candles().len(), 2);
        assert_eq!(ingestor.candles()[0].close, 102.0);
    }

    #[tokio::test]
    async fn poll_empty_response_is_noop() {
        let source = MockSource::new(vec![vec![candle(0, 100.0)], vec![]]);
        let mut ingestor = CandleIngestor::new("ETH", CandleInterval::M1, source, 100);
        ingestor.poll().await.unwrap();
        let latest = ingestor.poll().await.unwrap();
        assert!(latest.is_none());
        assert_eq!(ingestor.candles().len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_candles_are_rejected() {
        let source = MockSource::new(vec![vec![candle(120_000, 100.0)], vec![candle(0, 90.0)]]);
        let mut ingestor = CandleIngestor::new("ETH", CandleInterval::M1, source, 100);
        ingestor.poll().await.unwrap();
        ingestor.poll().await.unwrap();
        assert_eq!(ingestor.candles().len(), 1);
        assert_eq!(ingestor.last_time(), Some(120_000));
    }
}
