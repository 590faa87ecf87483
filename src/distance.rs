use serde::{Deserialize, Serialize};

use crate::{
    error::{AbcError, Result},
    math::percentile,
};

/// Which distance compares scaled summary statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    #[serde(alias = "default")]
    Euclidean,
    Custom,
}

pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// How the acceptance threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdPolicy {
    /// A user supplied distance.
    Fixed(f64),
    /// Keep the closest fraction of all particles, e.g. 0.05 for 5%.
    Percentile(f64),
    /// Keep the closest `k` particles.
    Keep(usize),
}

impl ThresholdPolicy {
    /// Compute the threshold for a set of distances.
    ///
    /// Percentiles interpolate linearly between order statistics. A keep
    /// count `k` out of `n` distances uses the percentile `k / n`, which lies
    /// between the k-th and the (k+1)-th smallest distance, so that rejection
    /// with a strict comparison accepts exactly `k` particles when there are
    /// no ties. Keeping everything puts the threshold just above the largest
    /// distance.
    pub fn threshold(&self, distances: &[f64]) -> Result<f64> {
        if distances.is_empty() {
            return Err(AbcError::Configuration(
                "Can not compute a threshold without distances".to_string(),
            ));
        }
        if distances.iter().any(|d| d.is_nan()) {
            return Err(AbcError::Configuration(
                "Distances contain NaN; check the distance function".to_string(),
            ));
        }
        match *self {
            ThresholdPolicy::Fixed(value) => Ok(value),
            ThresholdPolicy::Percentile(q) => {
                if !(0. ..=1.).contains(&q) {
                    return Err(AbcError::Configuration(format!(
                        "Percentile must be in [0, 1], got {}",
                        q
                    )));
                }
                if q == 1. {
                    return Ok(above_all(distances));
                }
                Ok(percentile(distances, q))
            }
            ThresholdPolicy::Keep(k) => {
                if k == 0 || k > distances.len() {
                    return Err(AbcError::Configuration(format!(
                        "Can not keep {} of {} particles",
                        k,
                        distances.len()
                    )));
                }
                if k == distances.len() {
                    return Ok(above_all(distances));
                }
                Ok(percentile(distances, k as f64 / distances.len() as f64))
            }
        }
    }
}

/// A finite threshold strictly above every distance.
fn above_all(distances: &[f64]) -> f64 {
    let max = distances.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let up = max + max.abs() * f64::EPSILON;
    if up > max {
        up
    } else {
        max + f64::MIN_POSITIVE
    }
}
