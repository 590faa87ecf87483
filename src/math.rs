use itertools::Itertools;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Log of the sum of exponentials, with an implicit zero term when
/// `with_zero` is set (the reference class of a multinomial logit).
pub(crate) fn logsumexp(values: &[f64], with_zero: bool) -> f64 {
    let init = if with_zero { 0f64 } else { f64::NEG_INFINITY };
    values.iter().fold(init, |acc, &val| {
        if acc == f64::NEG_INFINITY {
            val
        } else {
            logaddexp(acc, val)
        }
    })
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (divides by `n`).
pub(crate) fn variance(values: &[f64]) -> f64 {
    let mu = mean(values);
    mean(&values.iter().map(|&x| (x - mu) * (x - mu)).collect_vec())
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut values = values.to_vec();
    values.sort_unstable_by(f64::total_cmp);
    values
}

/// Median, averaging the two central values for even lengths.
pub(crate) fn median(values: &[f64]) -> f64 {
    percentile_sorted(&sorted(values), 0.5)
}

/// Percentile `q` in [0, 1] with linear interpolation between order statistics.
pub(crate) fn percentile(values: &[f64], q: f64) -> f64 {
    percentile_sorted(&sorted(values), q)
}

fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let pos = q.clamp(0., 1.) * (n - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Median absolute deviation from the median, unscaled.
pub(crate) fn median_abs_deviation(values: &[f64]) -> f64 {
    let center = median(values);
    median(&values.iter().map(|&x| (x - center).abs()).collect_vec())
}
