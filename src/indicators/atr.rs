use super::{true_ranges, IndicatorError, IndicatorResult};
use crate::types::Candle;

/// Average true range with Wilder smoothing. The seed at index `period` is
/// the simple average of the true ranges at indices `1..=period` (each of
/// which has a previous close); from there `ATR[i] = (ATR[i-1]·(p-1) + TR[i]) / p`.
/// The first `period` outputs are NaN.
pub fn atr(candles: &[Candle], period: usize) -> IndicatorResult {
    if period < 1 {
        return Err(IndicatorError::InvalidPeriod(period));
    }
    let mut out = vec![f64::NAN; candles.len()];
    if candles.len() <= period {
        return Ok(out);
    }

    let tr = true_ranges(candles);
    let seed: f64 = tr[1..=period].iter().sum::<f64>() / period as f64;
    out[period] = seed;

    let p = period as f64;
    let mut current = seed;
    for i in (period + 1)..candles.len() {
        current = (current * (p - 1.0) + tr[i]) / p;
        out[i] = current;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_candle;

    fn flat_range_candles(n: usize, range: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let mid = 100.0;
                test_candle(i as i64, mid, mid + range / 2.0, mid - range / 2.0, mid)
            })
            .collect()
    }

    #[test]
    fn atr_warmup_is_period() {
        let candles = flat_range_candles(20, 10.0);
        let out = atr(&candles, 5).unwrap();
        assert_eq!(out.len(), 20);
        for x in &out[..5] {
            assert!(x.is_nan());
        }
        for x in &out[5..] {
            assert!(x.is_finite());
        }
    }

    #[test]
    fn atr_of_constant_range_is_the_range() {
        let candles = flat_range_candles(30, 8.0);
        let out = atr(&candles, 14).unwrap();
        assert!((out[29] - 8.0).abs() < 1e-9);
    }

    #[test]
    fn atr_short_input_is_all_nan() {
        let candles = flat_range_candles(5, 4.0);
        let out = atr(&candles, 14).unwrap();
        assert!(out.iter().all(|x| x.is_nan()));
    }

    #[test]
    fn atr_reflects_gap_through_true_range() {
        let mut candles = vec![
            test_candle(0, 100.0, 105.0, 95.0, 95.0),
            // gap up: |115 - 95| = 20
            test_candle(1, 110.0, 115.0, 108.0, 112.0),
        ];
        for i in 2..10 {
            candles.push(test_candle(i, 112.0, 114.0, 110.0, 112.0));
        }
        let out = atr(&candles, 3).unwrap();
        // the 20-point gap TR is inside the seed window
        assert!(out[3] > 7.0);
    }
}
