use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::RwLock;

use crate::config::{Config, TradingMode};
use crate::database::Database;
use crate::engine::SignalExecutor;
use crate::market_data::{CandleEvent, PriceCache};
use crate::portfolio::PositionBook;
use crate::types::{Candle, CandleBuffer};

const CANDLE_HISTORY: usize = 1_000;

/// Shared state behind the HTTP/WS surface. Reads are snapshots; the surface
/// never mutates trading state except through the signal executor.
pub struct AppState {
    pub book: Arc<PositionBook>,
    pub db: Arc<Database>,
    pub prices: Arc<PriceCache>,
    pub executor: Arc<SignalExecutor>,
    pub candle_feed: broadcast::Sender<CandleEvent>,
    pub mode: TradingMode,
    pub started_at: DateTime<Utc>,
    pub config_summary: serde_json::Value,
    candles: RwLock<HashMap<String, CandleBuffer>>,
}

impl AppState {
    pub fn new(
        book: Arc<PositionBook>,
        db: Arc<Database>,
        prices: Arc<PriceCache>,
        executor: Arc<SignalExecutor>,
        candle_feed: broadcast::Sender<CandleEvent>,
        config: &Config,
    ) -> Arc<Self> {
        // The surface shows configuration without symbols' credentials or
        // any secrets; the document carries none, so serialize as-is.
        let config_summary = serde_json::to_value(config).unwrap_or_default();
        Arc::new(Self {
            book,
            db,
            prices,
            executor,
            candle_feed,
            mode: config.mode,
            started_at: Utc::now(),
            config_summary,
            candles: RwLock::new(HashMap::new()),
        })
    }

    /// Fed from the candle broadcast so `GET /candles` has history to serve.
    pub async fn record_candle(&self, event: &CandleEvent) {
        let mut candles = self.candles.write().await;
        candles
            .entry(event.coin.clone())
            .or_insert_with(|| CandleBuffer::new(CANDLE_HISTORY))
            .upsert(event.candle);
    }

    pub async fn candles_before(
        &self,
        coin: &str,
        before: Option<i64>,
        limit: usize,
    ) -> Vec<Candle> {
        let candles = self.candles.read().await;
        let Some(buffer) = candles.get(coin) else {
            return Vec::new();
        };
        let filtered: Vec<Candle> = buffer
            .candles
            .iter()
            .filter(|c| before.map(|b| c.time < b).unwrap_or(true))
            .copied()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    pub async fn default_coin(&self) -> Option<String> {
        self.candles.read().await.keys().next().cloned()
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Guardrails, MarginType, Sizing, SymbolConfig};
    use crate::events::EventLog;
    use crate::exchange::DryRunExchange;
    use crate::notifications::NotificationManager;
    use crate::session::Session;
    use crate::types::CandleInterval;

    async fn state() -> Arc<AppState> {
        let exchange = Arc::new(DryRunExchange::new(10_000.0, &["ETH".to_string()]));
        let book = Arc::new(PositionBook::new());
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventLog::new(
            std::env::temp_dir().join(format!("web-{}.ndjson", uuid::Uuid::new_v4())),
        ));
        let notifications = Arc::new(NotificationManager::new(events.clone(), false));
        let executor = Arc::new(SignalExecutor::new(
            exchange,
            book.clone(),
            db.clone(),
            events,
            notifications,
            Arc::new(Session::default()),
            Guardrails::default(),
            Sizing::default(),
            TradingMode::DryRun,
            vec![SymbolConfig {
                coin: "ETH".to_string(),
                leverage: 3,
                margin_type: MarginType::Cross,
                data_source: "hyperliquid".to_string(),
                strategies: vec![],
            }],
        ));
        let (feed, _) = broadcast::channel(16);
        let config = Config {
            mode: TradingMode::DryRun,
            symbols: vec![],
            guardrails: Guardrails::default(),
            sizing: Sizing::default(),
            execution: Default::default(),
            runtime: Default::default(),
        };
        AppState::new(book, db, Arc::new(PriceCache::default()), executor, feed, &config)
    }

    fn event(time: i64, close: f64) -> CandleEvent {
        CandleEvent {
            coin: "ETH".to_string(),
            interval: CandleInterval::M15,
            candle: Candle {
                time,
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1.0,
                trades: 1,
            },
            is_closed: true,
        }
    }

    #[tokio::test]
    async fn candle_history_pagination() {
        let state = state().await;
        for i in 0..10i64 {
            state.record_candle(&event(i * 900_000, 100.0 + i as f64)).await;
        }
        let all = state.candles_before("ETH", None, 100).await;
        assert_eq!(all.len(), 10);

        let page = state.candles_before("ETH", Some(5 * 900_000), 3).await;
        assert_eq!(page.len(), 3);
        assert!(page.iter().all(|c| c.time < 5 * 900_000));
        assert_eq!(page.last().unwrap().time, 4 * 900_000);

        assert!(state.candles_before("BTC", None, 10).await.is_empty());
    }
}
