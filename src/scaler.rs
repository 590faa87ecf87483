//! Robust per-dimension scaling of summary statistics.

use faer::Mat;
use itertools::Itertools;

use crate::{
    error::{AbcError, Result},
    math::median_abs_deviation,
};

/// One scale per summary statistic dimension, frozen after fitting.
///
/// The same factors are applied to the observed statistic, the reference
/// table and every statistic simulated later during MCMC.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingFactors {
    factors: Box<[f64]>,
    degenerate: Vec<usize>,
}

impl ScalingFactors {
    /// Fit the median absolute deviation of every column of `statistics`
    /// (one row per particle, all models pooled).
    ///
    /// Columns with zero spread can not be scaled. They keep a factor of 1,
    /// pass through unchanged and are listed in [`Self::degenerate`].
    pub fn fit(statistics: &Mat<f64>) -> Self {
        let mut degenerate = Vec::new();
        let factors = (0..statistics.ncols())
            .map(|col| {
                let column = (0..statistics.nrows())
                    .map(|row| statistics[(row, col)])
                    .collect_vec();
                let mad = median_abs_deviation(&column);
                if mad > 0. && mad.is_finite() {
                    mad
                } else {
                    degenerate.push(col);
                    1.
                }
            })
            .collect();
        if !degenerate.is_empty() {
            log::warn!(
                "Summary statistic dimensions {:?} have zero spread and are not scaled",
                degenerate
            );
        }
        Self {
            factors,
            degenerate,
        }
    }

    pub fn factors(&self) -> &[f64] {
        &self.factors
    }

    pub fn dim(&self) -> usize {
        self.factors.len()
    }

    /// Dimensions that fell back to a factor of 1.
    pub fn degenerate(&self) -> &[usize] {
        &self.degenerate
    }

    /// Fail if any dimension was degenerate.
    pub fn check(&self) -> Result<()> {
        if self.degenerate.is_empty() {
            Ok(())
        } else {
            Err(AbcError::DegenerateScale {
                dims: self.degenerate.clone(),
            })
        }
    }

    pub fn transform(&self, statistic: &[f64]) -> Box<[f64]> {
        assert!(statistic.len() == self.factors.len());
        statistic
            .iter()
            .zip(self.factors.iter())
            .map(|(x, scale)| x / scale)
            .collect()
    }

    pub fn transform_matrix(&self, statistics: &Mat<f64>) -> Mat<f64> {
        assert!(statistics.ncols() == self.factors.len());
        Mat::from_fn(statistics.nrows(), statistics.ncols(), |row, col| {
            statistics[(row, col)] / self.factors[col]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table() -> Mat<f64> {
        let rows = [[1., 5.], [1., 5.], [2., 5.], [2., 5.], [4., 5.], [6., 5.], [9., 5.]];
        Mat::from_fn(rows.len(), 2, |i, j| rows[i][j])
    }

    #[test]
    fn mad_factors() {
        let factors = ScalingFactors::fit(&table());
        assert_eq!(factors.factors(), &[1., 1.]);
        assert_eq!(factors.degenerate(), &[1]);
        assert!(matches!(
            factors.check(),
            Err(AbcError::DegenerateScale { ref dims }) if dims == &vec![1]
        ));
    }

    #[test]
    fn scaled_values() {
        let rows = [[0., 10.], [2., 20.], [4., 30.], [6., 40.], [8., 50.]];
        let stats = Mat::from_fn(5, 2, |i, j| rows[i][j]);
        let factors = ScalingFactors::fit(&stats);
        assert_eq!(factors.factors(), &[2., 10.]);
        assert!(factors.check().is_ok());

        let scaled = factors.transform_matrix(&stats);
        assert_eq!(scaled[(4, 0)], 4.);
        assert_eq!(scaled[(4, 1)], 5.);
        assert_eq!(&*factors.transform(&[3., 25.]), &[1.5, 2.5]);
    }

    #[test]
    fn deterministic_transform() {
        let factors = ScalingFactors::fit(&table());
        let obs = [3.0, 7.0];
        assert_eq!(factors.transform(&obs), factors.transform(&obs));
        // a degenerate dimension passes through unchanged
        assert_eq!(factors.transform(&obs)[1], 7.0);
    }
}
