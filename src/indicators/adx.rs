use super::IndicatorError;
use crate::types::Candle;

/// Directional movement outputs. All three arrays match the input length;
/// +DI/−DI become valid at index `period − 1`, ADX at `2·period − 2`. Values
/// are clamped to [0, 100].
#[derive(Debug, Clone)]
pub struct AdxOutput {
    pub adx: Vec<f64>,
    pub di_plus: Vec<f64>,
    pub di_minus: Vec<f64>,
}

pub fn adx(candles: &[Candle], period: usize) -> Result<AdxOutput, IndicatorError> {
    if period < 2 {
        return Err(IndicatorError::InvalidPeriod(period));
    }
    let n = candles.len();
    let mut out = AdxOutput {
        adx: vec![f64::NAN; n],
        di_plus: vec![f64::NAN; n],
        di_minus: vec![f64::NAN; n],
    };
    if n < period {
        return Ok(out);
    }

    // Per-bar directional movement and true range, defined from index 1.
    let mut dm_plus = vec![0.0; n];
    let mut dm_minus = vec![0.0; n];
    let mut tr = vec![0.0; n];
    for i in 1..n {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        dm_plus[i] = if up > down && up > 0.0 { up } else { 0.0 };
        dm_minus[i] = if down > up && down > 0.0 { down } else { 0.0 };
        let prev_close = candles[i - 1].close;
        tr[i] = (candles[i].high - candles[i].low)
            .max((candles[i].high - prev_close).abs())
            .max((candles[i].low - prev_close).abs());
    }

    // Seed the smoothed sums over the first period-1 movement values so the
    // first DI lands at index period-1, then apply Wilder smoothing.
    let first = period - 1;
    let mut sm_tr: f64 = tr[1..=first].iter().sum();
    let mut sm_dmp: f64 = dm_plus[1..=first].iter().sum();
    let mut sm_dmm: f64 = dm_minus[1..=first].iter().sum();

    let p = period as f64;
    let mut dx = vec![f64::NAN; n];
    for i in first..n {
        if i > first {
            sm_tr = sm_tr - sm_tr / p + tr[i];
            sm_dmp = sm_dmp - sm_dmp / p + dm_plus[i];
            sm_dmm = sm_dmm - sm_dmm / p + dm_minus[i];
        }
        let (dip, dim) = if sm_tr > 0.0 {
            (100.0 * sm_dmp / sm_tr, 100.0 * sm_dmm / sm_tr)
        } else {
            (0.0, 0.0)
        };
        out.di_plus[i] = dip.clamp(0.0, 100.0);
        out.di_minus[i] = dim.clamp(0.0, 100.0);
        let di_sum = dip + dim;
        dx[i] = if di_sum > 0.0 {
            (100.0 * (dip - dim).abs() / di_sum).clamp(0.0, 100.0)
        } else {
            0.0
        };
    }

    // ADX: simple average of the first period DX values, Wilder thereafter.
    let adx_start = 2 * period - 2;
    if n > adx_start {
        let seed: f64 = dx[first..=adx_start].iter().sum::<f64>() / p;
        out.adx[adx_start] = seed.clamp(0.0, 100.0);
        let mut current = seed;
        for i in (adx_start + 1)..n {
            current = (current * (p - 1.0) + dx[i]) / p;
            out.adx[i] = current.clamp(0.0, 100.0);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_candle;

    fn trending_up(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                test_candle(i as i64, base, base + 1.5, base - 1.0, base + 1.0)
            })
            .collect()
    }

    fn choppy(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 };
                test_candle(i as i64, base, base + 2.0, base - 2.0, base)
            })
            .collect()
    }

    #[test]
    fn adx_warmup_boundaries() {
        let candles = trending_up(60);
        let out = adx(&candles, 14).unwrap();
        assert!(out.di_plus[12].is_nan());
        assert!(out.di_plus[13].is_finite());
        assert!(out.adx[25].is_nan());
        assert!(out.adx[26].is_finite());
    }

    #[test]
    fn strong_trend_reads_high_adx() {
        let candles = trending_up(80);
        let out = adx(&candles, 14).unwrap();
        let last = out.adx[79];
        assert!(last > 40.0, "expected strong trend ADX, got {last}");
        assert!(out.di_plus[79] > out.di_minus[79]);
    }

    #[test]
    fn chop_reads_low_adx() {
        let candles = choppy(80);
        let out = adx(&candles, 14).unwrap();
        assert!(out.adx[79] < 25.0, "expected low ADX in chop, got {}", out.adx[79]);
    }

    #[test]
    fn outputs_clamped_to_0_100() {
        let candles = trending_up(60);
        let out = adx(&candles, 5).unwrap();
        for arr in [&out.adx, &out.di_plus, &out.di_minus] {
            for v in arr.iter().filter(|v| v.is_finite()) {
                assert!(*v >= 0.0 && *v <= 100.0);
            }
        }
    }
}
