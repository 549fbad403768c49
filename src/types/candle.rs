use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One OHLCV bar. `time` is the bucket start in epoch milliseconds, UTC,
/// aligned to the interval boundary. The most recent candle of a live stream
/// may still be in progress; its values mutate until a later bucket appears.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: u64,
}

impl Candle {
    pub fn open_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.time).single().unwrap_or_default()
    }

    /// Validation applied to every candle entering the system: prices must be
    /// finite and positive and the range must not be inverted.
    pub fn is_valid(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.open > 0.0
            && self.close > 0.0
            && self.high >= self.low
            && self.volume.is_finite()
            && self.volume >= 0.0
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body_size(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Supported candle intervals. Each maps to a canonical duration in
/// milliseconds; the 1M bucket is fixed at 30 days so that interval
/// arithmetic stays consistent everywhere it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl CandleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::M1 => "1m",
            CandleInterval::M3 => "3m",
            CandleInterval::M5 => "5m",
            CandleInterval::M15 => "15m",
            CandleInterval::M30 => "30m",
            CandleInterval::H1 => "1h",
            CandleInterval::H2 => "2h",
            CandleInterval::H4 => "4h",
            CandleInterval::H8 => "8h",
            CandleInterval::H12 => "12h",
            CandleInterval::D1 => "1d",
            CandleInterval::D3 => "3d",
            CandleInterval::W1 => "1w",
            CandleInterval::Mo1 => "1M",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(CandleInterval::M1),
            "3m" => Some(CandleInterval::M3),
            "5m" => Some(CandleInterval::M5),
            "15m" => Some(CandleInterval::M15),
            "30m" => Some(CandleInterval::M30),
            "1h" => Some(CandleInterval::H1),
            "2h" => Some(CandleInterval::H2),
            "4h" => Some(CandleInterval::H4),
            "8h" => Some(CandleInterval::H8),
            "12h" => Some(CandleInterval::H12),
            "1d" => Some(CandleInterval::D1),
            "3d" => Some(CandleInterval::D3),
            "1w" => Some(CandleInterval::W1),
            "1M" => Some(CandleInterval::Mo1),
            _ => None,
        }
    }

    pub fn to_millis(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            CandleInterval::M1 => MINUTE,
            CandleInterval::M3 => 3 * MINUTE,
            CandleInterval::M5 => 5 * MINUTE,
            CandleInterval::M15 => 15 * MINUTE,
            CandleInterval::M30 => 30 * MINUTE,
            CandleInterval::H1 => 60 * MINUTE,
            CandleInterval::H2 => 120 * MINUTE,
            CandleInterval::H4 => 240 * MINUTE,
            CandleInterval::H8 => 480 * MINUTE,
            CandleInterval::H12 => 720 * MINUTE,
            CandleInterval::D1 => 1_440 * MINUTE,
            CandleInterval::D3 => 3 * 1_440 * MINUTE,
            CandleInterval::W1 => 7 * 1_440 * MINUTE,
            CandleInterval::Mo1 => 30 * 1_440 * MINUTE,
        }
    }

    /// Start of the bucket containing `t`, aligned to this interval in UTC.
    pub fn align(&self, t: i64) -> i64 {
        let ms = self.to_millis();
        t - t.rem_euclid(ms)
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rolling candle buffer with bounded capacity. The buffer accepts in-place
/// replacement of the newest (in-progress) candle and rejects anything older
/// than its tail.
#[derive(Debug, Clone, Default)]
pub struct CandleBuffer {
    pub candles: Vec<Candle>,
    pub max_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Appended,
    Replaced,
    RejectedOutOfOrder,
}

impl CandleBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            candles: Vec::with_capacity(max_size),
            max_size,
        }
    }

    pub fn from_candles(candles: Vec<Candle>, max_size: usize) -> Self {
        let mut buf = Self::new(max_size);
        for c in candles {
            buf.upsert(c);
        }
        buf
    }

    /// Same timestamp replaces (in-progress update), newer appends, older is
    /// rejected.
    pub fn upsert(&mut self, candle: Candle) -> UpsertOutcome {
        match self.candles.last() {
            Some(last) if candle.time == last.time => {
                *self.candles.last_mut().unwrap() = candle;
                UpsertOutcome::Replaced
            }
            Some(last) if candle.time < last.time => UpsertOutcome::RejectedOutOfOrder,
            _ => {
                if self.candles.len() >= self.max_size && self.max_size > 0 {
                    self.candles.remove(0);
                }
                self.candles.push(candle);
                UpsertOutcome::Appended
            }
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn last_time(&self) -> Option<i64> {
        self.candles.last().map(|c| c.time)
    }

    pub fn last_n(&self, n: usize) -> &[Candle] {
        let len = self.candles.len();
        if n >= len {
            &self.candles[..]
        } else {
            &self.candles[len - n..]
        }
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.low).collect()
    }
}
