use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::num::NonZeroU32;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::MarginType;
use crate::error::{with_retry, RetryPolicy, TradingError, TradingResult};
use crate::market_data::CandleSource;
use crate::types::{Candle, CandleInterval, Direction, Side};

use super::{
    format_price, format_size, round_price, sane_equity, sane_price, sane_size, Exchange,
    HistoricalOrder, OrderResult, SymbolMeta, VenueOrder, VenuePosition,
};

pub const HYPERLIQUID_API: &str = "https://api.hyperliquid.xyz";
pub const HYPERLIQUID_TESTNET_API: &str = "https://api.hyperliquid-testnet.xyz";
pub const HYPERLIQUID_WS: &str = "wss://api.hyperliquid.xyz/ws";
pub const HYPERLIQUID_TESTNET_WS: &str = "wss://api.hyperliquid-testnet.xyz/ws";

type HmacSha256 = Hmac<Sha256>;

/// REST adapter for the venue. Read traffic goes through the `info` endpoint,
/// order actions through `exchange` with an HMAC-signed payload. Symbol
/// metadata is cached for the session.
pub struct HyperliquidClient {
    client: reqwest::Client,
    base_url: String,
    wallet: String,
    api_secret: String,
    limiter: DefaultDirectRateLimiter,
    meta_cache: RwLock<Vec<SymbolMeta>>,
}

impl HyperliquidClient {
    pub fn new(base_url: &str, wallet: String, api_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            wallet,
            api_secret,
            limiter: RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap())),
            meta_cache: RwLock::new(Vec::new()),
        }
    }

    fn sign(&self, nonce: i64, action: &Value) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(nonce.to_string().as_bytes());
        mac.update(action.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn post(&self, path: &str, body: Value) -> TradingResult<Value> {
        self.limiter.until_ready().await;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TradingError::VenueTransient(format!("{}: {}", path, e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(TradingError::VenueTransient(format!(
                "{}: http {}",
                path, status
            )));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TradingError::VenueFatal(format!(
                "{}: authentication failed ({})",
                path, status
            )));
        }
        if !status.is_success() {
            return Err(TradingError::VenueFatal(format!(
                "{}: http {}",
                path, status
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TradingError::VenueFatal(format!("{}: malformed response: {}", path, e)))
    }

    /// Read query against the info endpoint, retried with backoff.
    async fn info(&self, body: Value) -> TradingResult<Value> {
        with_retry("info", RetryPolicy::default(), || {
            self.post("/info", body.clone())
        })
        .await
    }

    /// Signed action against the exchange endpoint. Not retried: a repeated
    /// order action is not idempotent.
    async fn action(&self, action: Value) -> TradingResult<Value> {
        let nonce = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(nonce, &action);
        let body = json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "wallet": self.wallet,
        });
        let response = self.post("/exchange", body).await?;
        if response.get("status").and_then(Value::as_str) == Some("ok") {
            Ok(response)
        } else {
            Err(TradingError::VenueFatal(format!(
                "exchange action rejected: {}",
                response
            )))
        }
    }

    async fn ensure_meta(&self) -> TradingResult<()> {
        if !self.meta_cache.read().await.is_empty() {
            return Ok(());
        }
        let response = self.info(json!({"type": "meta"})).await?;
        let meta = parse_meta(&response)?;
        info!("loaded venue metadata for {} symbols", meta.len());
        *self.meta_cache.write().await = meta;
        Ok(())
    }

    async fn asset_id(&self, coin: &str) -> TradingResult<u32> {
        self.ensure_meta().await?;
        self.meta_cache
            .read()
            .await
            .iter()
            .find(|m| m.coin == coin)
            .map(|m| m.asset_id)
            .ok_or_else(|| TradingError::Validation(format!("unknown symbol {}", coin)))
    }

    async fn sz_decimals(&self, coin: &str) -> TradingResult<u32> {
        self.ensure_meta().await?;
        self.meta_cache
            .read()
            .await
            .iter()
            .find(|m| m.coin == coin)
            .map(|m| m.sz_decimals)
            .ok_or_else(|| TradingError::Validation(format!("unknown symbol {}", coin)))
    }

    async fn mid_price(&self, coin: &str) -> TradingResult<f64> {
        let mids = self.info(json!({"type": "allMids"})).await?;
        let raw = mids
            .get(coin)
            .and_then(Value::as_str)
            .ok_or_else(|| TradingError::VenueFatal(format!("no mid price for {}", coin)))?;
        let price = raw
            .parse::<f64>()
            .map_err(|_| TradingError::VenueFatal(format!("bad mid price for {}: {}", coin, raw)))?;
        sane_price(price, "allMids")
    }

    async fn place_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        price: f64,
        order_type: Value,
        reduce_only: bool,
    ) -> TradingResult<OrderResult> {
        sane_size(size, "order size")?;
        sane_price(price, "order price")?;
        let asset = self.asset_id(coin).await?;
        let sz_decimals = self.sz_decimals(coin).await?;

        let action = json!({
            "type": "order",
            "orders": [{
                "a": asset,
                "b": is_buy,
                "p": format_price(price),
                "s": format_size(size, sz_decimals),
                "r": reduce_only,
                "t": order_type,
            }],
            "grouping": "na",
        });
        let response = self.action(action).await?;
        parse_order_result(&response)
    }
}

#[async_trait]
impl Exchange for HyperliquidClient {
    async fn connect(&self) -> TradingResult<()> {
        self.ensure_meta().await
    }

    async fn set_leverage(
        &self,
        coin: &str,
        leverage: u32,
        margin: MarginType,
    ) -> TradingResult<()> {
        let asset = self.asset_id(coin).await?;
        let action = json!({
            "type": "updateLeverage",
            "asset": asset,
            "isCross": matches!(margin, MarginType::Cross),
            "leverage": leverage,
        });
        self.action(action).await?;
        debug!("{}: leverage set to {}x", coin, leverage);
        Ok(())
    }

    async fn place_market(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
    ) -> TradingResult<OrderResult> {
        // Market orders are aggressive IOC limits: pad the mid by 1% so the
        // order crosses the book.
        let mid = self.mid_price(coin).await?;
        let price = round_price(if is_buy { mid * 1.01 } else { mid * 0.99 });
        self.place_order(
            coin,
            is_buy,
            size,
            price,
            json!({"limit": {"tif": "Ioc"}}),
            false,
        )
        .await
    }

    async fn place_stop_trigger(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        trigger_price: f64,
        reduce_only: bool,
    ) -> TradingResult<OrderResult> {
        let px = round_price(trigger_price);
        self.place_order(
            coin,
            is_buy,
            size,
            px,
            json!({"trigger": {"isMarket": true, "triggerPx": format_price(px), "tpsl": "sl"}}),
            reduce_only,
        )
        .await
    }

    async fn place_limit(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> TradingResult<OrderResult> {
        self.place_order(
            coin,
            is_buy,
            size,
            round_price(price),
            json!({"limit": {"tif": "Gtc"}}),
            reduce_only,
        )
        .await
    }

    async fn cancel(&self, coin: &str, order_id: u64) -> TradingResult<()> {
        let asset = self.asset_id(coin).await?;
        let action = json!({
            "type": "cancel",
            "cancels": [{"a": asset, "o": order_id}],
        });
        self.action(action).await?;
        Ok(())
    }

    async fn get_positions(&self) -> TradingResult<Vec<VenuePosition>> {
        let state = self
            .info(json!({"type": "clearinghouseState", "user": self.wallet}))
            .await?;
        parse_positions(&state)
    }

    async fn get_open_orders(&self) -> TradingResult<Vec<VenueOrder>> {
        let response = self
            .info(json!({"type": "frontendOpenOrders", "user": self.wallet}))
            .await?;
        parse_open_orders(&response)
    }

    async fn get_historical_orders(&self) -> TradingResult<Vec<HistoricalOrder>> {
        let response = self
            .info(json!({"type": "historicalOrders", "user": self.wallet}))
            .await?;
        parse_historical_orders(&response)
    }

    async fn get_account_equity(&self) -> TradingResult<f64> {
        let state = self
            .info(json!({"type": "clearinghouseState", "user": self.wallet}))
            .await?;
        let raw = state
            .pointer("/marginSummary/accountValue")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TradingError::VenueFatal("clearinghouseState missing accountValue".to_string())
            })?;
        let equity = raw.parse::<f64>().map_err(|_| {
            TradingError::VenueFatal(format!("bad accountValue: {}", raw))
        })?;
        sane_equity(equity, "accountValue")
    }

    async fn get_symbol_meta(&self) -> TradingResult<Vec<SymbolMeta>> {
        self.ensure_meta().await?;
        Ok(self.meta_cache.read().await.clone())
    }
}

#[async_trait]
impl CandleSource for HyperliquidClient {
    async fn fetch_candles(
        &self,
        coin: &str,
        interval: CandleInterval,
        start_ms: i64,
        end_ms: i64,
    ) -> TradingResult<Vec<Candle>> {
        let response = self
            .info(json!({
                "type": "candleSnapshot",
                "req": {
                    "coin": coin,
                    "interval": interval.as_str(),
                    "startTime": start_ms,
                    "endTime": end_ms,
                }
            }))
            .await?;
        parse_candle_snapshot(&response)
    }
}

fn str_f64(value: &Value, field: &str, context: &str) -> TradingResult<f64> {
    let raw = value.get(field).ok_or_else(|| {
        TradingError::VenueFatal(format!("{}: missing field {}", context, field))
    })?;
    let parsed = match raw {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(TradingError::VenueFatal(format!(
            "{}: non-finite {} in {}",
            context, field, raw
        ))),
    }
}

pub fn parse_meta(response: &Value) -> TradingResult<Vec<SymbolMeta>> {
    let universe = response
        .pointer("/universe")
        .and_then(Value::as_array)
        .ok_or_else(|| TradingError::VenueFatal("meta missing universe".to_string()))?;
    let mut out = Vec::with_capacity(universe.len());
    for (i, entry) in universe.iter().enumerate() {
        let coin = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TradingError::VenueFatal("meta entry missing name".to_string()))?;
        let sz_decimals = entry
            .get("szDecimals")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        out.push(SymbolMeta {
            coin: coin.to_string(),
            asset_id: i as u32,
            sz_decimals,
        });
    }
    Ok(out)
}

pub fn parse_positions(state: &Value) -> TradingResult<Vec<VenuePosition>> {
    let entries = state
        .pointer("/assetPositions")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            TradingError::VenueFatal("clearinghouseState missing assetPositions".to_string())
        })?;
    let mut out = Vec::new();
    for entry in entries {
        let position = entry
            .get("position")
            .ok_or_else(|| TradingError::VenueFatal("assetPosition missing position".to_string()))?;
        let coin = position
            .get("coin")
            .and_then(Value::as_str)
            .ok_or_else(|| TradingError::VenueFatal("position missing coin".to_string()))?;
        let signed_size = str_f64(position, "szi", "position")?;
        if signed_size == 0.0 {
            continue;
        }
        let entry_price = sane_price(str_f64(position, "entryPx", "position")?, "entryPx")?;
        let unrealized = str_f64(position, "unrealizedPnl", "position")?;
        let liquidation = position
            .get("liquidationPx")
            .and_then(|v| match v {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
            .filter(|p| p.is_finite() && *p > 0.0);

        out.push(VenuePosition {
            coin: coin.to_string(),
            direction: if signed_size > 0.0 {
                Direction::Long
            } else {
                Direction::Short
            },
            size: sane_size(signed_size.abs(), "szi")?,
            entry_price,
            liquidation_price: liquidation,
            unrealized_pnl: unrealized,
        });
    }
    Ok(out)
}

fn parse_one_order(entry: &Value, context: &str) -> TradingResult<VenueOrder> {
    let order_id = entry
        .get("oid")
        .and_then(Value::as_u64)
        .ok_or_else(|| TradingError::VenueFatal(format!("{}: order missing oid", context)))?;
    let coin = entry
        .get("coin")
        .and_then(Value::as_str)
        .ok_or_else(|| TradingError::VenueFatal(format!("{}: order missing coin", context)))?;
    let side = match entry.get("side").and_then(Value::as_str) {
        Some("B") => Side::Buy,
        Some("A") => Side::Sell,
        other => {
            return Err(TradingError::VenueFatal(format!(
                "{}: unknown order side {:?}",
                context, other
            )))
        }
    };
    let size = sane_size(str_f64(entry, "sz", context)?, "order sz")?;
    let limit_price = str_f64(entry, "limitPx", context).ok();
    let is_trigger = entry
        .get("isTrigger")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let trigger_price = if is_trigger {
        Some(sane_price(str_f64(entry, "triggerPx", context)?, "triggerPx")?)
    } else {
        None
    };
    let reduce_only = entry
        .get("reduceOnly")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(VenueOrder {
        order_id,
        coin: coin.to_string(),
        side,
        size,
        limit_price,
        trigger_price,
        reduce_only,
    })
}

pub fn parse_open_orders(response: &Value) -> TradingResult<Vec<VenueOrder>> {
    let entries = response
        .as_array()
        .ok_or_else(|| TradingError::VenueFatal("open orders is not an array".to_string()))?;
    entries
        .iter()
        .map(|e| parse_one_order(e, "openOrders"))
        .collect()
}

pub fn parse_historical_orders(response: &Value) -> TradingResult<Vec<HistoricalOrder>> {
    let entries = response
        .as_array()
        .ok_or_else(|| TradingError::VenueFatal("historical orders is not an array".to_string()))?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let order = entry
            .get("order")
            .ok_or_else(|| TradingError::VenueFatal("historical entry missing order".to_string()))?;
        let status = entry
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        out.push(HistoricalOrder {
            order: parse_one_order(order, "historicalOrders")?,
            status,
        });
    }
    Ok(out)
}

pub fn parse_candle_snapshot(response: &Value) -> TradingResult<Vec<Candle>> {
    let entries = response
        .as_array()
        .ok_or_else(|| TradingError::VenueFatal("candle snapshot is not an array".to_string()))?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let time = entry
            .get("t")
            .and_then(Value::as_i64)
            .ok_or_else(|| TradingError::VenueFatal("candle missing t".to_string()))?;
        out.push(Candle {
            time,
            open: str_f64(entry, "o", "candle")?,
            high: str_f64(entry, "h", "candle")?,
            low: str_f64(entry, "l", "candle")?,
            close: str_f64(entry, "c", "candle")?,
            volume: str_f64(entry, "v", "candle")?,
            trades: entry.get("n").and_then(Value::as_u64).unwrap_or(0),
        });
    }
    Ok(out)
}

pub fn parse_order_result(response: &Value) -> TradingResult<OrderResult> {
    let status = response
        .pointer("/response/data/statuses/0")
        .ok_or_else(|| TradingError::VenueFatal("order response missing status".to_string()))?;

    if let Some(err) = status.get("error").and_then(Value::as_str) {
        return Err(TradingError::VenueFatal(format!("order rejected: {}", err)));
    }
    if let Some(filled) = status.get("filled") {
        let oid = filled
            .get("oid")
            .and_then(Value::as_u64)
            .ok_or_else(|| TradingError::VenueFatal("fill missing oid".to_string()))?;
        return Ok(OrderResult {
            order_id: oid,
            filled_size: str_f64(filled, "totalSz", "fill")?,
            avg_price: Some(sane_price(str_f64(filled, "avgPx", "fill")?, "avgPx")?),
            resting: false,
        });
    }
    if let Some(resting) = status.get("resting") {
        let oid = resting
            .get("oid")
            .and_then(Value::as_u64)
            .ok_or_else(|| TradingError::VenueFatal("resting missing oid".to_string()))?;
        return Ok(OrderResult {
            order_id: oid,
            filled_size: 0.0,
            avg_price: None,
            resting: true,
        });
    }
    Err(TradingError::VenueFatal(format!(
        "unrecognized order status: {}",
        status
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_meta_universe() {
        let response = json!({"universe": [
            {"name": "BTC", "szDecimals": 5},
            {"name": "ETH", "szDecimals": 4},
        ]});
        let meta = parse_meta(&response).unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta[1].coin, "ETH");
        assert_eq!(meta[1].asset_id, 1);
        assert_eq!(meta[1].sz_decimals, 4);
    }

    #[test]
    fn parses_positions_with_signed_size() {
        let state = json!({"assetPositions": [
            {"position": {"coin": "ETH", "szi": "2.5", "entryPx": "2000.0",
                          "unrealizedPnl": "12.5", "liquidationPx": "1500.0"}},
            {"position": {"coin": "BTC", "szi": "-0.1", "entryPx": "60000",
                          "unrealizedPnl": "-3.0", "liquidationPx": null}},
            {"position": {"coin": "SOL", "szi": "0.0", "entryPx": "100",
                          "unrealizedPnl": "0"}},
        ]});
        let positions = parse_positions(&state).unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].direction, Direction::Long);
        assert_eq!(positions[0].size, 2.5);
        assert_eq!(positions[0].liquidation_price, Some(1500.0));
        assert_eq!(positions[1].direction, Direction::Short);
        assert_eq!(positions[1].size, 0.1);
        assert_eq!(positions[1].liquidation_price, None);
    }

    #[test]
    fn nan_in_position_batch_fails_the_batch() {
        let state = json!({"assetPositions": [
            {"position": {"coin": "ETH", "szi": "NaN", "entryPx": "2000.0",
                          "unrealizedPnl": "0"}},
        ]});
        assert!(parse_positions(&state).is_err());
    }

    #[test]
    fn parses_open_orders_with_triggers() {
        let response = json!([
            {"coin": "ETH", "oid": 7, "side": "A", "sz": "2.0", "limitPx": "2100.0",
             "reduceOnly": true, "isTrigger": false},
            {"coin": "ETH", "oid": 8, "side": "A", "sz": "2.0", "limitPx": "1900.0",
             "reduceOnly": true, "isTrigger": true, "triggerPx": "1900.0"},
        ]);
        let orders = parse_open_orders(&response).unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].trigger_price, None);
        assert_eq!(orders[1].trigger_price, Some(1900.0));
        assert!(orders[1].reduce_only);
        assert_eq!(orders[1].side, Side::Sell);
    }

    #[test]
    fn parses_historical_orders_with_status() {
        let response = json!([
            {"order": {"coin": "ETH", "oid": 9, "side": "B", "sz": "1.0",
                       "limitPx": "2000"},
             "status": "filled"},
        ]);
        let orders = parse_historical_orders(&response).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "filled");
        assert_eq!(orders[0].order.order_id, 9);
    }

    #[test]
    fn parses_candle_snapshot_strings() {
        let response = json!([
            {"t": 1700000000000i64, "o": "2000", "h": "2010", "l": "1990",
             "c": "2005", "v": "150.5", "n": 320},
        ]);
        let candles = parse_candle_snapshot(&response).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 2005.0);
        assert_eq!(candles[0].trades, 320);
    }

    #[test]
    fn order_result_filled_and_resting() {
        let filled = json!({"status": "ok", "response": {"type": "order", "data": {"statuses": [
            {"filled": {"oid": 77, "totalSz": "2.0", "avgPx": "2001.5"}}
        ]}}});
        let result = parse_order_result(&filled).unwrap();
        assert_eq!(result.order_id, 77);
        assert_eq!(result.avg_price, Some(2001.5));
        assert!(!result.resting);

        let resting = json!({"status": "ok", "response": {"type": "order", "data": {"statuses": [
            {"resting": {"oid": 78}}
        ]}}});
        let result = parse_order_result(&resting).unwrap();
        assert!(result.resting);

        let error = json!({"status": "ok", "response": {"type": "order", "data": {"statuses": [
            {"error": "Insufficient margin"}
        ]}}});
        assert!(parse_order_result(&error).is_err());
    }
}
