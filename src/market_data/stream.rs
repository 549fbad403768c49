use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::types::{Candle, CandleInterval};

use super::CandleEvent;

/// Turns a stream of raw candle updates into the subscriber contract: every
/// update is forwarded with `is_closed = false`, and the previous bucket is
/// emitted once with `is_closed = true` the first time a strictly newer
/// bucket shows up. Out-of-order updates are dropped.
#[derive(Debug, Default)]
pub struct ClosedCandleTracker {
    last: Option<Candle>,
}

impl ClosedCandleTracker {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Re-anchor after a reconnect so the close of the last known bucket is
    /// not re-emitted.
    pub fn anchor(&mut self, candle: Candle) {
        self.last = Some(candle);
    }

    pub fn on_update(&mut self, candle: Candle) -> Vec<(Candle, bool)> {
        match self.last {
            Some(prev) if candle.time < prev.time => {
                warn!(
                    "dropping out-of-order candle update t={} behind {}",
                    candle.time, prev.time
                );
                Vec::new()
            }
            Some(prev) if candle.time > prev.time => {
                self.last = Some(candle);
                vec![(prev, true), (candle, false)]
            }
            _ => {
                self.last = Some(candle);
                vec![(candle, false)]
            }
        }
    }
}

/// Streams live candles for one `(coin, interval)` over the venue WebSocket,
/// reconnecting forever with a fixed pause. Ordering across reconnects is
/// re-established from the last seen bucket.
pub struct CandleStreamer {
    ws_url: String,
    coin: String,
    interval: CandleInterval,
}

impl CandleStreamer {
    pub fn new(ws_url: &str, coin: &str, interval: CandleInterval) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            coin: coin.to_string(),
            interval,
        }
    }

    pub fn spawn(self, tx: mpsc::Sender<CandleEvent>) {
        tokio::spawn(async move {
            let mut tracker = ClosedCandleTracker::new();
            loop {
                match self.run_connection(&tx, &mut tracker).await {
                    Ok(_) => warn!(
                        "{} {} candle stream closed, reconnecting...",
                        self.coin, self.interval
                    ),
                    Err(e) => error!(
                        "{} {} candle stream error: {}, reconnecting...",
                        self.coin, self.interval, e
                    ),
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    async fn run_connection(
        &self,
        tx: &mpsc::Sender<CandleEvent>,
        tracker: &mut ClosedCandleTracker,
    ) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({
            "method": "subscribe",
            "subscription": {
                "type": "candle",
                "coin": self.coin,
                "interval": self.interval.as_str(),
            }
        });
        write.send(Message::Text(subscribe.to_string())).await?;
        info!("{} {} candle stream connected", self.coin, self.interval);

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(candle) = parse_candle_message(&text) {
                        if !candle.is_valid() {
                            warn!(
                                "{} {}: dropping invalid candle frame at t={}",
                                self.coin, self.interval, candle.time
                            );
                            continue;
                        }
                        for (c, is_closed) in tracker.on_update(candle) {
                            let event = CandleEvent {
                                coin: self.coin.clone(),
                                interval: self.interval,
                                candle: c,
                                is_closed,
                            };
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Ok(Message::Ping(data)) => {
                    debug!("candle stream ping");
                    write.send(Message::Pong(data)).await.ok();
                }
                Ok(Message::Close(_)) => {
                    info!("candle stream closed by server");
                    break;
                }
                Err(e) => return Err(anyhow!("websocket error: {}", e)),
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    channel: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WsCandle {
    #[serde(rename = "t")]
    start_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n", default)]
    trades: u64,
}

/// Parses one venue candle frame; prices arrive as strings.
pub fn parse_candle_message(text: &str) -> Option<Candle> {
    let envelope: WsEnvelope = serde_json::from_str(text).ok()?;
    if envelope.channel != "candle" {
        return None;
    }
    let raw: WsCandle = serde_json::from_value(envelope.data).ok()?;
    Some(Candle {
        time: raw.start_time,
        open: raw.open.parse().ok()?,
        high: raw.high.parse().ok()?,
        low: raw.low.parse().ok()?,
        close: raw.close.parse().ok()?,
        volume: raw.volume.parse().ok()?,
        trades: raw.trades,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn first_update_is_open_bucket() {
        let mut tracker = ClosedCandleTracker::new();
        let events = tracker.on_update(candle(0, 100.0));
        assert_eq!(events.len(), 1);
        assert!(!events[0].1);
    }

    #[test]
    fn same_bucket_updates_never_close() {
        let mut tracker = ClosedCandleTracker::new();
        tracker.on_update(candle(0, 100.0));
        let events = tracker.on_update(candle(0, 101.0));
        assert_eq!(events.len(), 1);
        assert!(!events[0].1);
        assert_eq!(events[0].0.close, 101.0);
    }

    #[test]
    fn new_bucket_closes_previous_exactly_once() {
        let mut tracker = ClosedCandleTracker::new();
        tracker.on_update(candle(0, 100.0));
        tracker.on_update(candle(0, 102.0));
        let events = tracker.on_update(candle(60_000, 103.0));
        assert_eq!(events.len(), 2);
        // close of the previous bucket first, with its final values
        assert!(events[0].1);
        assert_eq!(events[0].0.time, 0);
        assert_eq!(events[0].0.close, 102.0);
        assert!(!events[1].1);
        assert_eq!(events[1].0.time, 60_000);

        // the old bucket never closes again
        let more = tracker.on_update(candle(60_000, 104.0));
        assert_eq!(more.len(), 1);
        assert!(!more[0].1);
    }

    #[test]
    fn out_of_order_updates_are_dropped() {
        let mut tracker = ClosedCandleTracker::new();
        tracker.on_update(candle(60_000, 100.0));
        assert!(tracker.on_update(candle(0, 99.0)).is_empty());
    }

    #[test]
    fn anchor_suppresses_replayed_close() {
        let mut tracker = ClosedCandleTracker::new();
        tracker.anchor(candle(60_000, 100.0));
        // reconnect replays the same bucket
        let events = tracker.on_update(candle(60_000, 100.5));
        assert_eq!(events.len(), 1);
        assert!(!events[0].1);
    }

    #[test]
    fn parses_venue_candle_frame() {
        let text = r#"{"channel":"candle","data":{"t":1700000000000,"T":1700000899999,"s":"ETH","i":"15m","o":"2000.5","c":"2010.0","h":"2012.25","l":"1998.0","v":"1234.5","n":42}}"#;
        let candle = parse_candle_message(text).unwrap();
        assert_eq!(candle.time, 1_700_000_000_000);
        assert_eq!(candle.open, 2000.5);
        assert_eq!(candle.close, 2010.0);
        assert_eq!(candle.trades, 42);
    }

    #[test]
    fn non_candle_frames_are_ignored() {
        assert!(parse_candle_message(r#"{"channel":"subscriptionResponse","data":{}}"#).is_none());
        assert!(parse_candle_message("not json").is_none());
    }
}
