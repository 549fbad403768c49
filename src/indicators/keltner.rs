use super::{ema, true_ranges, IndicatorError};
use crate::types::Candle;

#[derive(Debug, Clone)]
pub struct KeltnerOutput {
    pub upper: Vec<f64>,
    pub mid: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Keltner channel: mid is the EMA of closes, band half-width is
/// `mult × EMA(true range)`. Note the smoothing of the true range is a plain
/// EMA, not Wilder's ATR.
pub fn keltner(
    candles: &[Candle],
    ema_period: usize,
    tr_period: usize,
    multiplier: f64,
) -> Result<KeltnerOutput, IndicatorError> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mid = ema(&closes, ema_period)?;
    let tr = true_ranges(candles);
    let tr_ema = ema(&tr, tr_period)?;

    let n = candles.len();
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    for i in 0..n {
        // NaN until both smoothings are warm.
        upper[i] = mid[i] + multiplier * tr_ema[i];
        lower[i] = mid[i] - multiplier * tr_ema[i];
    }
    Ok(KeltnerOutput { upper, mid, lower })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_candle;

    fn flat(n: usize, range: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| test_candle(i as i64, 100.0, 100.0 + range / 2.0, 100.0 - range / 2.0, 100.0))
            .collect()
    }

    #[test]
    fn warmup_is_max_of_periods() {
        let candles = flat(30, 4.0);
        let out = keltner(&candles, 10, 20, 2.0).unwrap();
        assert!(out.upper[18].is_nan());
        assert!(out.upper[19].is_finite());
        assert!(out.mid[9].is_finite());
    }

    #[test]
    fn constant_input_bands_converge() {
        let candles = flat(120, 4.0);
        let out = keltner(&candles, 20, 10, 2.0).unwrap();
        let i = 119;
        assert!((out.mid[i] - 100.0).abs() < 1e-6);
        assert!((out.upper[i] - 108.0).abs() < 1e-3);
        assert!((out.lower[i] - 92.0).abs() < 1e-3);
    }

    #[test]
    fn bands_are_symmetric_around_mid() {
        let candles: Vec<_> = (0..60)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 3.0;
                test_candle(i as i64, base, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        let out = keltner(&candles, 20, 10, 1.5).unwrap();
        for i in 25..60 {
            let up = out.upper[i] - out.mid[i];
            let down = out.mid[i] - out.lower[i];
            assert!((up - down).abs() < 1e-9);
        }
    }
}
