use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::MarginType;
use crate::error::TradingResult;

use super::{
    sane_price, sane_size, Exchange, HistoricalOrder, OrderResult, SymbolMeta, VenueOrder,
    VenuePosition,
};

/// Dry-run venue: honors the full exchange contract with locally generated
/// order ids and an empty account. Orders rest in memory so recovery and
/// reconciliation paths behave like the real thing.
pub struct DryRunExchange {
    next_order_id: AtomicU64,
    equity: f64,
    marks: RwLock<HashMap<String, f64>>,
    open_orders: RwLock<Vec<VenueOrder>>,
    meta: Vec<SymbolMeta>,
}

impl DryRunExchange {
    pub fn new(equity: f64, coins: &[String]) -> Self {
        let meta = coins
            .iter()
            .enumerate()
            .map(|(i, coin)| SymbolMeta {
                coin: coin.clone(),
                asset_id: i as u32,
                sz_decimals: 4,
            })
            .collect();
        Self {
            next_order_id: AtomicU64::new(1),
            equity,
            marks: RwLock::new(HashMap::new()),
            open_orders: RwLock::new(Vec::new()),
            meta,
        }
    }

    /// The runtime feeds closes here so simulated market orders have a fill
    /// price.
    pub async fn set_mark(&self, coin: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.marks.write().await.insert(coin.to_string(), price);
        }
    }

    fn next_id(&self) -> u64 {
        self.next_order_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchange for DryRunExchange {
    async fn connect(&self) -> TradingResult<()> {
        info!("dry-run exchange ready ({} symbols)", self.meta.len());
        Ok(())
    }

    async fn note_mark(&self, coin: &str, price: f64) {
        self.set_mark(coin, price).await;
    }

    async fn set_leverage(
        &self,
        coin: &str,
        leverage: u32,
        _margin: MarginType,
    ) -> TradingResult<()> {
        info!("dry-run: leverage {}x acknowledged for {}", leverage, coin);
        Ok(())
    }

    async fn place_market(
        &self,
        coin: &str,
        _is_buy: bool,
        size: f64,
    ) -> TradingResult<OrderResult> {
        sane_size(size, "dry-run market size")?;
        let avg_price = self.marks.read().await.get(coin).copied();
        Ok(OrderResult {
            order_id: self.next_id(),
            filled_size: size,
            avg_price,
            resting: false,
        })
    }

    async fn place_stop_trigger(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        trigger_price: f64,
        reduce_only: bool,
    ) -> TradingResult<OrderResult> {
        sane_size(size, "dry-run stop size")?;
        sane_price(trigger_price, "dry-run trigger price")?;
        let order_id = self.next_id();
        self.open_orders.write().await.push(VenueOrder {
            order_id,
            coin: coin.to_string(),
            side: if is_buy {
                crate::types::Side::Buy
            } else {
                crate::types::Side::Sell
            },
            size,
            limit_price: None,
            trigger_price: Some(trigger_price),
            reduce_only,
        });
        Ok(OrderResult {
            order_id,
            filled_size: 0.0,
            avg_price: None,
            resting: true,
        })
    }

    async fn place_limit(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> TradingResult<OrderResult> {
        sane_size(size, "dry-run limit size")?;
        sane_price(price, "dry-run limit price")?;
        let order_id = self.next_id();
        self.open_orders.write().await.push(VenueOrder {
            order_id,
            coin: coin.to_string(),
            side: if is_buy {
                crate::types::Side::Buy
            } else {
                crate::types::Side::Sell
            },
            size,
            limit_price: Some(price),
            trigger_price: None,
            reduce_only,
        });
        Ok(OrderResult {
            order_id,
            filled_size: 0.0,
            avg_price: None,
            resting: true,
        })
    }

    async fn cancel(&self, _coin: &str, order_id: u64) -> TradingResult<()> {
        self.open_orders
            .write()
            .await
            .retain(|o| o.order_id != order_id);
        Ok(())
    }

    async fn get_positions(&self) -> TradingResult<Vec<VenuePosition>> {
        Ok(Vec::new())
    }

    async fn get_open_orders(&self) -> TradingResult<Vec<VenueOrder>> {
        Ok(self.open_orders.read().await.clone())
    }

    async fn get_historical_orders(&self) -> TradingResult<Vec<HistoricalOrder>> {
        Ok(Vec::new())
    }

    async fn get_account_equity(&self) -> TradingResult<f64> {
        Ok(self.equity)
    }

    async fn get_symbol_meta(&self) -> TradingResult<Vec<SymbolMeta>> {
        Ok(self.meta.clone())
    }
}
