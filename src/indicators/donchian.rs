use super::IndicatorError;
use crate::types::Candle;

#[derive(Debug, Clone)]
pub struct DonchianOutput {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
    pub mid: Vec<f64>,
}

/// Donchian channel: rolling max high and min low over `period` bars, mid at
/// the midpoint. Warmup `period - 1`.
pub fn donchian(candles: &[Candle], period: usize) -> Result<DonchianOutput, IndicatorError> {
    if period < 1 {
        return Err(IndicatorError::InvalidPeriod(period));
    }
    let n = candles.len();
    let mut out = DonchianOutput {
        upper: vec![f64::NAN; n],
        lower: vec![f64::NAN; n],
        mid: vec![f64::NAN; n],
    };

    for i in (period - 1)..n {
        let window = &candles[i + 1 - period..=i];
        let mut hi = f64::NEG_INFINITY;
        let mut lo = f64::INFINITY;
        for c in window {
            if c.high > hi {
                hi = c.high;
            }
            if c.low < lo {
                lo = c.low;
            }
        }
        out.upper[i] = hi;
        out.lower[i] = lo;
        out.mid[i] = (hi + lo) / 2.0;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_candle;

    #[test]
    fn period_one_is_bar_extremes() {
        let candles = vec![
            test_candle(0, 100.0, 105.0, 95.0, 102.0),
            test_candle(1, 102.0, 110.0, 101.0, 108.0),
        ];
        let out = donchian(&candles, 1).unwrap();
        assert_eq!(out.upper, vec![105.0, 110.0]);
        assert_eq!(out.lower, vec![95.0, 101.0]);
    }

    #[test]
    fn rolling_extremes_and_mid() {
        let candles = vec![
            test_candle(0, 100.0, 105.0, 95.0, 100.0),
            test_candle(1, 100.0, 103.0, 97.0, 100.0),
            test_candle(2, 100.0, 108.0, 99.0, 100.0),
            test_candle(3, 100.0, 102.0, 96.0, 100.0),
        ];
        let out = donchian(&candles, 3).unwrap();
        assert!(out.upper[1].is_nan());
        assert_eq!(out.upper[2], 108.0);
        assert_eq!(out.lower[2], 95.0);
        assert_eq!(out.mid[2], 101.5);
        assert_eq!(out.upper[3], 108.0);
        assert_eq!(out.lower[3], 96.0);
    }

    #[test]
    fn length_matches_input() {
        let candles: Vec<_> = (0..10)
            .map(|i| test_candle(i, 100.0, 101.0, 99.0, 100.0))
            .collect();
        let out = donchian(&candles, 5).unwrap();
        assert_eq!(out.upper.len(), 10);
        assert_eq!(out.lower.len(), 10);
        assert_eq!(out.mid.len(), 10);
    }
}
