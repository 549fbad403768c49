pub mod dry_run;
pub mod hyperliquid;
pub mod precision;
pub mod recovery;
pub mod websocket;

pub use dry_run::*;
pub use hyperliquid::*;
pub use precision::*;
pub use recovery::*;
pub use websocket::*;

use async_trait::async_trait;

use crate::config::MarginType;
use crate::error::{TradingError, TradingResult};
use crate::types::{Direction, Side};

/// Per-symbol venue metadata; `sz_decimals` drives size truncation.
#[derive(Debug, Clone)]
pub struct SymbolMeta {
    pub coin: String,
    pub asset_id: u32,
    pub sz_decimals: u32,
}

/// A position as the venue reports it.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub coin: String,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub liquidation_price: Option<f64>,
    pub unrealized_pnl: f64,
}

/// An order resting (or historically recorded) at the venue.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub order_id: u64,
    pub coin: String,
    pub side: Side,
    pub size: f64,
    pub limit_price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
}

/// Historical order plus the venue's raw status string, which the reconciler
/// maps into the internal lifecycle.
#[derive(Debug, Clone)]
pub struct HistoricalOrder {
    pub order: VenueOrder,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: u64,
    pub filled_size: f64,
    pub avg_price: Option<f64>,
    pub resting: bool,
}

/// Venue capability set. One implementation talks to Hyperliquid; the dry-run
/// implementation honors the same contract with simulated ids and an empty
/// account.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn connect(&self) -> TradingResult<()>;

    /// Latest observed close, fed by the runtime. Only the dry-run venue
    /// needs it (to price simulated market fills); the default is a no-op.
    async fn note_mark(&self, _coin: &str, _price: f64) {}

    async fn set_leverage(
        &self,
        coin: &str,
        leverage: u32,
        margin: MarginType,
    ) -> TradingResult<()>;

    async fn place_market(&self, coin: &str, is_buy: bool, size: f64)
        -> TradingResult<OrderResult>;

    async fn place_stop_trigger(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        trigger_price: f64,
        reduce_only: bool,
    ) -> TradingResult<OrderResult>;

    async fn place_limit(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> TradingResult<OrderResult>;

    async fn cancel(&self, coin: &str, order_id: u64) -> TradingResult<()>;

    async fn get_positions(&self) -> TradingResult<Vec<VenuePosition>>;

    async fn get_open_orders(&self) -> TradingResult<Vec<VenueOrder>>;

    async fn get_historical_orders(&self) -> TradingResult<Vec<HistoricalOrder>>;

    async fn get_account_equity(&self) -> TradingResult<f64>;

    async fn get_symbol_meta(&self) -> TradingResult<Vec<SymbolMeta>>;
}

/// Sanity ranges for values crossing the venue boundary, applied in both
/// directions. Values outside them are venue bugs or parse garbage, never
/// something to trade on.
pub fn sane_price(price: f64, context: &str) -> TradingResult<f64> {
    if price.is_finite() && price > 0.0 && price < 1e7 {
        Ok(price)
    } else {
        Err(TradingError::VenueFatal(format!(
            "{}: price {} outside sanity range",
            context, price
        )))
    }
}

pub fn sane_size(size: f64, context: &str) -> TradingResult<f64> {
    if size.is_finite() && (0.0..1e6).contains(&size) {
        Ok(size)
    } else {
        Err(TradingError::VenueFatal(format!(
            "{}: size {} outside sanity range",
            context, size
        )))
    }
}

pub fn sane_equity(equity: f64, context: &str) -> TradingResult<f64> {
    if equity.is_finite() && equity > -1e6 && equity < 1e8 {
        Ok(equity)
    } else {
        Err(TradingError::VenueFatal(format!(
            "{}: equity {} outside sanity range",
            context, equity
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_sanity_range() {
        assert!(sane_price(1.0, "t").is_ok());
        assert!(sane_price(9_999_999.0, "t").is_ok());
        assert!(sane_price(0.0, "t").is_err());
        assert!(sane_price(-5.0, "t").is_err());
        assert!(sane_price(1e7, "t").is_err());
        assert!(sane_price(f64::NAN, "t").is_err());
    }

    #[test]
    fn size_sanity_range() {
        assert!(sane_size(0.0, "t").is_ok());
        assert!(sane_size(999_999.0, "t").is_ok());
        assert!(sane_size(1e6, "t").is_err());
        assert!(sane_size(-1.0, "t").is_err());
        assert!(sane_size(f64::INFINITY, "t").is_err());
    }

    #[test]
    fn equity_sanity_range() {
        assert!(sane_equity(-999_999.0, "t").is_ok());
        assert!(sane_equity(0.0, "t").is_ok());
        assert!(sane_equity(-1e6, "t").is_err());
        assert!(sane_equity(1e8, "t").is_err());
    }
}
