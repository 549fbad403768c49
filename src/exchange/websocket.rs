use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::types::Side;

/// One order-state transition reported by the venue stream.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: u64,
    pub coin: String,
    pub side: Side,
    pub size: f64,
    pub price: Option<f64>,
    /// Raw venue status; mapped by the consumer.
    pub status: String,
}

/// One execution against our orders.
#[derive(Debug, Clone)]
pub struct VenueFill {
    pub order_id: u64,
    pub coin: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub closed_pnl: f64,
    pub time: i64,
}

/// Events delivered to the trading loop. Updates arrive in venue-delivery
/// order; each batch is handed over whole so the consumer can process it
/// under one lock acquisition.
#[derive(Debug, Clone)]
pub enum VenueEvent {
    OrderUpdates(Vec<OrderUpdate>),
    Fills(Vec<VenueFill>),
    Disconnected,
}

/// Subscribes to the authenticated order-update and fill channels,
/// reconnecting forever.
pub struct EventStream {
    ws_url: String,
    wallet: String,
}

impl EventStream {
    pub fn new(ws_url: &str, wallet: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            wallet: wallet.to_string(),
        }
    }

    pub fn spawn(self, tx: mpsc::Sender<VenueEvent>) {
        tokio::spawn(async move {
            loop {
                match self.run_connection(&tx).await {
                    Ok(_) => warn!("event stream closed, reconnecting..."),
                    Err(e) => error!("event stream error: {}, reconnecting...", e),
                }
                if tx.send(VenueEvent::Disconnected).await.is_err() {
                    return;
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    async fn run_connection(&self, tx: &mpsc::Sender<VenueEvent>) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        for channel in ["orderUpdates", "userFills"] {
            let subscribe = json!({
                "method": "subscribe",
                "subscription": {"type": channel, "user": self.wallet},
            });
            write.send(Message::Text(subscribe.to_string())).await?;
        }
        info!("venue event stream connected");

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(event) = parse_event(&text) {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok(Message::Ping(data)) => {
                    write.send(Message::Pong(data)).await.ok();
                }
                Ok(Message::Close(_)) => {
                    info!("event stream closed by server");
                    break;
                }
                Err(e) => return Err(anyhow!("websocket error: {}", e)),
                _ => {}
            }
        }
        Ok(())
    }
}

fn side_from_str(raw: Option<&str>) -> Option<Side> {
    match raw {
        Some("B") => Some(Side::Buy),
        Some("A") => Some(Side::Sell),
        _ => None,
    }
}

fn finite_str_f64(value: &Value, field: &str) -> Option<f64> {
    let parsed = match value.get(field)? {
        Value::String(s) => s.parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    parsed.is_finite().then_some(parsed)
}

/// Parses one venue frame into an event. A malformed or non-finite entry
/// poisons its whole batch: the batch is dropped and logged rather than
/// half-applied.
pub fn parse_event(text: &str) -> Option<VenueEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    let channel = value.get("channel").and_then(Value::as_str)?;
    let data = value.get("data")?;

    match channel {
        "orderUpdates" => {
            let entries = data.as_array()?;
            let mut updates = Vec::with_capacity(entries.len());
            for entry in entries {
                match parse_order_update(entry) {
                    Some(update) => updates.push(update),
                    None => {
                        warn!("dropping malformed orderUpdates batch: {}", text);
                        return None;
                    }
                }
            }
            Some(VenueEvent::OrderUpdates(updates))
        }
        "userFills" => {
            let entries = data.get("fills")?.as_array()?;
            let mut fills = Vec::with_capacity(entries.len());
            for entry in entries {
                match parse_fill(entry) {
                    Some(fill) => fills.push(fill),
                    None => {
                        warn!("dropping malformed userFills batch: {}", text);
                        return None;
                    }
                }
            }
            // The first frame replays historical fills; the consumer dedupes
            // by order id, so forwarding is safe.
            Some(VenueEvent::Fills(fills))
        }
        other => {
            debug!("ignoring frame on channel {}", other);
            None
        }
    }
}

fn parse_order_update(entry: &Value) -> Option<OrderUpdate> {
    let order = entry.get("order")?;
    Some(OrderUpdate {
        order_id: order.get("oid").and_then(Value::as_u64)?,
        coin: order.get("coin").and_then(Value::as_str)?.to_string(),
        side: side_from_str(order.get("side").and_then(Value::as_str))?,
        size: finite_str_f64(order, "sz")?,
        price: finite_str_f64(order, "limitPx"),
        status: entry.get("status").and_then(Value::as_str)?.to_string(),
    })
}

fn parse_fill(entry: &Value) -> Option<VenueFill> {
    Some(VenueFill {
        order_id: entry.get("oid").and_then(Value::as_u64)?,
        coin: entry.get("coin").and_then(Value::as_str)?.to_string(),
        side: side_from_str(entry.get("side").and_then(Value::as_str))?,
        price: finite_str_f64(entry, "px")?,
        size: finite_str_f64(entry, "sz")?,
        fee: finite_str_f64(entry, "fee").unwrap_or(0.0),
        closed_pnl: finite_str_f64(entry, "closedPnl").unwrap_or(0.0),
        time: entry.get("time").and_then(Value::as_i64)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_order_update_batch() {
        let text = r#"{"channel":"orderUpdates","data":[
            {"order":{"oid":42,"coin":"ETH","side":"B","sz":"2.0","limitPx":"2000"},
             "status":"filled","statusTimestamp":1700000000000}
        ]}"#;
        match parse_event(text) {
            Some(VenueEvent::OrderUpdates(updates)) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].order_id, 42);
                assert_eq!(updates[0].status, "filled");
                assert_eq!(updates[0].side, Side::Buy);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_fill_batch() {
        let text = r#"{"channel":"userFills","data":{"isSnapshot":false,"fills":[
            {"coin":"ETH","px":"2001.5","sz":"1.0","side":"A","time":1700000000000,
             "oid":42,"fee":"0.9","closedPnl":"15.0","dir":"Close Long"}
        ]}}"#;
        match parse_event(text) {
            Some(VenueEvent::Fills(fills)) => {
                assert_eq!(fills.len(), 1);
                assert_eq!(fills[0].order_id, 42);
                assert_eq!(fills[0].price, 2001.5);
                assert_eq!(fills[0].closed_pnl, 15.0);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn nan_poisons_the_whole_batch() {
        let text = r#"{"channel":"userFills","data":{"fills":[
            {"coin":"ETH","px":"2001.5","sz":"1.0","side":"A","time":1,"oid":1},
            {"coin":"ETH","px":"NaN","sz":"1.0","side":"A","time":2,"oid":2}
        ]}}"#;
        assert!(parse_event(text).is_none());
    }

    #[test]
    fn unknown_channels_are_ignored() {
        assert!(parse_event(r#"{"channel":"pong","data":{}}"#).is_none());
        assert!(parse_event("garbage").is_none());
    }
}
