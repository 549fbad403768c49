use crate::types::{Candle, CandleInterval};

/// Aggregates base-interval candles into a higher timeframe. Buckets align to
/// `target` boundaries in UTC; each bucket takes the first open, the extrema,
/// the last close and the volume/trade sums, stamped with the bucket start.
/// A trailing bucket whose last base candle does not reach the bucket end is
/// dropped as incomplete.
pub fn aggregate(
    base: &[Candle],
    base_interval: CandleInterval,
    target_interval: CandleInterval,
) -> Vec<Candle> {
    let base_ms = base_interval.to_millis();
    let target_ms = target_interval.to_millis();
    if base.is_empty() || target_ms < base_ms {
        return Vec::new();
    }

    let mut out: Vec<Candle> = Vec::with_capacity(base.len() * (base_ms as usize) / (target_ms as usize) + 1);
    let mut bucket: Option<Candle> = None;
    let mut bucket_last_time = 0i64;

    for c in base {
        let start = target_interval.align(c.time);
        match bucket.as_mut() {
            Some(b) if b.time == start => {
                b.high = b.high.max(c.high);
                b.low = b.low.min(c.low);
                b.close = c.close;
                b.volume += c.volume;
                b.trades += c.trades;
                bucket_last_time = c.time;
            }
            _ => {
                if let Some(b) = bucket.take() {
                    out.push(b);
                }
                bucket = Some(Candle {
                    time: start,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                    trades: c.trades,
                });
                bucket_last_time = c.time;
            }
        }
    }

    // Keep the trailing bucket only when its final base candle closes it.
    if let Some(b) = bucket {
        if bucket_last_time + base_ms >= b.time + target_ms {
            out.push(b);
        }
    }
    out
}

/// Warmup requirement of a strategy: an exact bar count on the source
/// interval plus per-HTF bar counts.
#[derive(Debug, Clone, Default)]
pub struct WarmupSpec {
    pub source: usize,
    pub higher: Vec<(CandleInterval, usize)>,
}

/// Minimum number of base bars to satisfy a warmup spec. Each HTF requirement
/// of `M` bars at interval `H` over base `S` needs `ceil(M × ceil(H/S) × 1.2)`
/// base bars (20% margin for bucket alignment); the source requirement is
/// exact. Returns the maximum across all requirements.
pub fn compute_min_warmup(spec: &WarmupSpec, source_interval: CandleInterval) -> usize {
    let s_ms = source_interval.to_millis();
    let mut needed = spec.source;
    for (htf, bars) in &spec.higher {
        let ratio = (htf.to_millis() + s_ms - 1) / s_ms;
        let with_margin = (*bars as f64 * ratio as f64 * 1.2).ceil() as usize;
        needed = needed.max(with_margin);
    }
    needed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_candle;

    fn minute_candles(start: i64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let t = start + i as i64 * 60_000;
                let base = 100.0 + i as f64;
                test_candle(t, base, base + 2.0, base - 2.0, base + 1.0)
            })
            .collect()
    }

    #[test]
    fn aggregates_minutes_into_hour() {
        let candles = minute_candles(0, 120);
        let hourly = aggregate(&candles, CandleInterval::M1, CandleInterval::H1);
        assert_eq!(hourly.len(), 2);
        let first = &hourly[0];
        assert_eq!(first.time, 0);
        assert_eq!(first.open, candles[0].open);
        assert_eq!(first.close, candles[59].close);
        assert_eq!(first.high, candles[59].high);
        assert_eq!(first.low, candles[0].low);
        assert_eq!(first.volume, 60.0 * 100.0);
        assert_eq!(first.trades, 60 * 10);
    }

    #[test]
    fn drops_incomplete_trailing_bucket() {
        let candles = minute_candles(0, 90);
        let hourly = aggregate(&candles, CandleInterval::M1, CandleInterval::H1);
        assert_eq!(hourly.len(), 1);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let candles = minute_candles(0, 240);
        let hourly = aggregate(&candles, CandleInterval::M1, CandleInterval::H1);
        let again = aggregate(&hourly, CandleInterval::H1, CandleInterval::H1);
        assert_eq!(hourly, again);
    }

    #[test]
    fn buckets_align_to_target_boundary() {
        // Start mid-hour; the partial leading hour still buckets at its start,
        // and only full buckets beyond it survive when data runs out.
        let candles = minute_candles(30 * 60_000, 90);
        let hourly = aggregate(&candles, CandleInterval::M1, CandleInterval::H1);
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].time, 0);
        assert_eq!(hourly[1].time, 3_600_000);
    }

    #[test]
    fn warmup_spec_example() {
        // source 22, 1h: 15, 4h: 22 on a 15m base
        let spec = WarmupSpec {
            source: 22,
            higher: vec![(CandleInterval::H1, 15), (CandleInterval::H4, 22)],
        };
        assert_eq!(compute_min_warmup(&spec, CandleInterval::M15), 423);
    }

    #[test]
    fn warmup_source_is_exact() {
        let spec = WarmupSpec {
            source: 300,
            higher: vec![(CandleInterval::H1, 10)],
        };
        // 1h over 15m: ceil(10 × 4 × 1.2) = 48 < 300
        assert_eq!(compute_min_warmup(&spec, CandleInterval::M15), 300);
    }
}
