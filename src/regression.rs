//! Kernel weighted regression adjustment of rejection estimates.
//!
//! Particles are weighted with an Epanechnikov kernel whose bandwidth is the
//! acceptance threshold. Parameter draws are corrected with a weighted linear
//! regression on the scaled summary statistics, model probabilities are
//! estimated with a weighted multinomial logistic regression.

use faer::Mat;
use itertools::Itertools;

use crate::{
    error::{AbcError, Result},
    math::logsumexp,
    reference_table::ReferenceTable,
};

/// Eigenvalues of a normal-equation matrix below this fraction of the largest
/// one mark the design as rank deficient.
const RANK_TOLERANCE: f64 = 1e-10;

/// Epanechnikov weights `(1 / h) * (1 - (d / h)^2)` for `d <= h`, else zero.
pub fn epanechnikov_weights(distances: &[f64], bandwidth: f64) -> Vec<f64> {
    distances
        .iter()
        .map(|&d| {
            if bandwidth > 0. && d <= bandwidth {
                let ratio = d / bandwidth;
                (1. - ratio * ratio) / bandwidth
            } else {
                0.
            }
        })
        .collect()
}

/// Solve `a x = b` for a symmetric positive definite `a`.
fn solve_spd(a: Mat<f64>, b: &[f64]) -> Result<Vec<f64>> {
    let n = a.nrows();
    assert!(b.len() == n);
    let eig = a
        .self_adjoint_eigen(faer::Side::Lower)
        .map_err(|err| AbcError::RegressionFit(format!("eigendecomposition failed: {:?}", err)))?;
    let vals = eig.S().column_vector().to_owned();
    let vecs = eig.U().to_owned();
    let vals = (0..n).map(|i| vals[i]).collect_vec();

    let largest = vals.iter().fold(0f64, |acc, &val| acc.max(val.abs()));
    if !largest.is_finite() || largest == 0. {
        return Err(AbcError::RegressionFit(
            "design matrix is zero or not finite".to_string(),
        ));
    }
    if let Some(small) = vals.iter().find(|&&val| val <= largest * RANK_TOLERANCE) {
        return Err(AbcError::RegressionFit(format!(
            "design matrix is rank deficient (eigenvalue {:e} of {:e})",
            small, largest
        )));
    }

    // x = U diag(1 / s) U^T b
    let projected = (0..n)
        .map(|j| (0..n).map(|i| vecs[(i, j)] * b[i]).sum::<f64>() / vals[j])
        .collect_vec();
    Ok((0..n)
        .map(|i| (0..n).map(|j| vecs[(i, j)] * projected[j]).sum())
        .collect())
}

/// Row of a design matrix with intercept.
fn design_row(statistic: impl Iterator<Item = f64>) -> Vec<f64> {
    std::iter::once(1.).chain(statistic).collect()
}

/// Weighted least squares fit of several responses on shared regressors.
#[derive(Debug, Clone)]
pub struct WeightedLeastSquares {
    /// One coefficient vector (intercept first) per response.
    coefficients: Vec<Vec<f64>>,
}

impl WeightedLeastSquares {
    /// `x` holds one regressor row per observation without intercept, `ys`
    /// one column per response.
    pub fn fit(x: &Mat<f64>, ys: &Mat<f64>, weights: &[f64]) -> Result<Self> {
        let n = x.nrows();
        assert!(ys.nrows() == n && weights.len() == n);
        let p = x.ncols() + 1;

        let rows = (0..n)
            .map(|i| design_row((0..x.ncols()).map(|j| x[(i, j)])))
            .collect_vec();

        let mut xtwx = Mat::<f64>::zeros(p, p);
        for (row, &w) in rows.iter().zip(weights) {
            for a in 0..p {
                for b in 0..p {
                    xtwx[(a, b)] += w * row[a] * row[b];
                }
            }
        }

        let coefficients = (0..ys.ncols())
            .map(|col| {
                let xtwy = (0..p)
                    .map(|a| {
                        rows.iter()
                            .zip(weights)
                            .enumerate()
                            .map(|(i, (row, &w))| w * row[a] * ys[(i, col)])
                            .sum::<f64>()
                    })
                    .collect_vec();
                solve_spd(xtwx.clone(), &xtwy)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { coefficients })
    }

    pub fn coefficients(&self) -> &[Vec<f64>] {
        &self.coefficients
    }

    pub fn predict(&self, response: usize, x: &[f64]) -> f64 {
        let beta = &self.coefficients[response];
        assert!(x.len() + 1 == beta.len());
        beta[0] + x.iter().zip(&beta[1..]).map(|(a, b)| a * b).sum::<f64>()
    }
}

/// Particles with nonzero kernel weight: their row indices and weights.
fn weighted_rows(table: &ReferenceTable, threshold: f64) -> Result<(Vec<usize>, Vec<f64>)> {
    let weights = epanechnikov_weights(&table.distances(), threshold);
    let (rows, weights): (Vec<usize>, Vec<f64>) = weights
        .into_iter()
        .enumerate()
        .filter(|&(_, w)| w > 0.)
        .unzip();
    if rows.is_empty() {
        return Err(AbcError::RegressionFit(
            "no particle lies within the threshold".to_string(),
        ));
    }
    Ok((rows, weights))
}

fn scaled_rows(table: &ReferenceTable, rows: &[usize]) -> Result<Mat<f64>> {
    let scaled = table.scaled_statistics().ok_or_else(|| {
        AbcError::Configuration("Regression needs a scored reference table".to_string())
    })?;
    Ok(Mat::from_fn(rows.len(), scaled.ncols(), |i, j| {
        scaled[(rows[i], j)]
    }))
}

/// Regression-adjusted posterior draws of a single-model table.
///
/// Every particle with nonzero weight contributes one row:
/// `prediction(observed) + (parameter - prediction(statistic))`.
pub fn adjust_parameters(
    table: &ReferenceTable,
    observed_scaled: &[f64],
    threshold: f64,
) -> Result<Mat<f64>> {
    assert!(table.n_models() == 1);
    let (rows, weights) = weighted_rows(table, threshold)?;
    let x = scaled_rows(table, &rows)?;
    let particles = table.particles();
    let dim = particles[rows[0]].parameters.len();
    let ys = Mat::from_fn(rows.len(), dim, |i, j| particles[rows[i]].parameters[j]);

    let fit = WeightedLeastSquares::fit(&x, &ys, &weights)?;
    log::debug!(
        "Linear adjustment on {} particles, coefficients {:?}",
        rows.len(),
        fit.coefficients()
    );

    let at_observed = (0..dim)
        .map(|j| fit.predict(j, observed_scaled))
        .collect_vec();
    let mut stat = vec![0f64; x.ncols()];
    let mut adjusted = Mat::<f64>::zeros(rows.len(), dim);
    for i in 0..rows.len() {
        stat.iter_mut()
            .enumerate()
            .for_each(|(k, val)| *val = x[(i, k)]);
        for j in 0..dim {
            adjusted[(i, j)] = at_observed[j] + (ys[(i, j)] - fit.predict(j, &stat));
        }
    }
    Ok(adjusted)
}

/// Settings of the multinomial logistic regression.
#[derive(Debug, Clone, Copy)]
pub struct LogisticOptions {
    /// L2 penalty on slopes; intercepts are not penalised.
    pub penalty: f64,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for LogisticOptions {
    fn default() -> Self {
        Self {
            penalty: 1.,
            max_iter: 100,
            tolerance: 1e-8,
        }
    }
}

/// Weighted multinomial logistic regression, first class as reference.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    classes: Vec<usize>,
    /// Coefficients of all non-reference classes, intercept first.
    coefficients: Vec<Vec<f64>>,
}

impl LogisticRegression {
    pub fn fit(
        x: &Mat<f64>,
        labels: &[usize],
        weights: &[f64],
        options: LogisticOptions,
    ) -> Result<Self> {
        let n = x.nrows();
        assert!(labels.len() == n && weights.len() == n);
        let classes = labels.iter().copied().sorted().dedup().collect_vec();
        if classes.len() < 2 {
            return Err(AbcError::RegressionFit(
                "logistic regression needs at least two classes".to_string(),
            ));
        }
        let p = x.ncols() + 1;
        let k = classes.len() - 1;
        let rows = (0..n)
            .map(|i| design_row((0..x.ncols()).map(|j| x[(i, j)])))
            .collect_vec();
        let targets = labels
            .iter()
            .map(|label| classes.iter().position(|c| c == label).unwrap_or(0))
            .collect_vec();

        let mut model = Self {
            classes,
            coefficients: vec![vec![0.; p]; k],
        };
        let mut objective = model.objective(&rows, &targets, weights, options.penalty);

        for iter in 0..options.max_iter {
            let (grad, hess) = model.derivatives(&rows, &targets, weights, options.penalty);
            let step = solve_spd(hess, &grad)?;

            let mut scale = 1.;
            let mut accepted = None;
            for _ in 0..30 {
                let candidate = Self {
                    classes: model.classes.clone(),
                    coefficients: model
                        .coefficients
                        .iter()
                        .enumerate()
                        .map(|(c, beta)| {
                            beta.iter()
                                .enumerate()
                                .map(|(a, b)| b + scale * step[c * p + a])
                                .collect()
                        })
                        .collect(),
                };
                let value = candidate.objective(&rows, &targets, weights, options.penalty);
                if value.is_finite() && value >= objective - 1e-12 * objective.abs().max(1.) {
                    accepted = Some((candidate, value));
                    break;
                }
                scale *= 0.5;
            }
            let Some((candidate, value)) = accepted else {
                return Err(AbcError::RegressionFit(
                    "logistic regression line search failed".to_string(),
                ));
            };
            model = candidate;
            objective = value;

            let change = step.iter().fold(0f64, |acc, s| acc.max((scale * s).abs()));
            if change < options.tolerance {
                log::debug!("Logistic regression converged after {} iterations", iter + 1);
                return Ok(model);
            }
        }
        log::warn!(
            "Logistic regression did not converge within {} iterations",
            options.max_iter
        );
        Ok(model)
    }

    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    fn log_probs(&self, row: &[f64]) -> Vec<f64> {
        let eta = self
            .coefficients
            .iter()
            .map(|beta| beta.iter().zip(row).map(|(b, x)| b * x).sum::<f64>())
            .collect_vec();
        let norm = logsumexp(&eta, true);
        std::iter::once(-norm)
            .chain(eta.iter().map(|e| e - norm))
            .collect()
    }

    /// Penalised weighted log likelihood.
    fn objective(&self, rows: &[Vec<f64>], targets: &[usize], weights: &[f64], penalty: f64) -> f64 {
        let loglik = rows
            .iter()
            .zip(targets)
            .zip(weights)
            .map(|((row, &t), &w)| w * self.log_probs(row)[t])
            .sum::<f64>();
        let norm = self
            .coefficients
            .iter()
            .map(|beta| beta[1..].iter().map(|b| b * b).sum::<f64>())
            .sum::<f64>();
        loglik - 0.5 * penalty * norm
    }

    /// Gradient and negative Hessian of the objective.
    fn derivatives(
        &self,
        rows: &[Vec<f64>],
        targets: &[usize],
        weights: &[f64],
        penalty: f64,
    ) -> (Vec<f64>, Mat<f64>) {
        let k = self.coefficients.len();
        let p = self.coefficients[0].len();
        let mut grad = vec![0f64; k * p];
        let mut hess = Mat::<f64>::zeros(k * p, k * p);

        for ((row, &t), &w) in rows.iter().zip(targets).zip(weights) {
            let probs = self.log_probs(row).iter().map(|l| l.exp()).collect_vec();
            for c in 0..k {
                let indicator = if t == c + 1 { 1. } else { 0. };
                let resid = indicator - probs[c + 1];
                for a in 0..p {
                    grad[c * p + a] += w * resid * row[a];
                }
                for d in 0..k {
                    let cov = probs[c + 1] * (if c == d { 1. } else { 0. } - probs[d + 1]);
                    for a in 0..p {
                        for b in 0..p {
                            hess[(c * p + a, d * p + b)] += w * cov * row[a] * row[b];
                        }
                    }
                }
            }
        }
        for c in 0..k {
            for a in 1..p {
                grad[c * p + a] -= penalty * self.coefficients[c][a];
                hess[(c * p + a, c * p + a)] += penalty;
            }
        }
        (grad, hess)
    }

    /// Class probabilities at `x`, in the order of [`Self::classes`].
    pub fn predict_proba(&self, x: &[f64]) -> Vec<f64> {
        let row = design_row(x.iter().copied());
        self.log_probs(&row).iter().map(|l| l.exp()).collect()
    }
}

/// Posterior model probabilities from a weighted logistic regression of the
/// model index on the scaled statistics, evaluated at the observed statistic.
///
/// If only one model remains among weighted particles it gets probability 1.
pub fn model_probabilities(
    table: &ReferenceTable,
    observed_scaled: &[f64],
    threshold: f64,
    options: LogisticOptions,
) -> Result<Vec<f64>> {
    let (rows, weights) = weighted_rows(table, threshold)?;
    let particles = table.particles();
    let labels = rows
        .iter()
        .map(|&row| particles[row].model_index)
        .collect_vec();

    let mut probabilities = vec![0f64; table.n_models()];
    let present = labels.iter().copied().sorted().dedup().collect_vec();
    if present.len() == 1 {
        log::info!(
            "Only model {} lies within the threshold, skipping logistic regression",
            present[0]
        );
        probabilities[present[0]] = 1.;
        return Ok(probabilities);
    }

    let x = scaled_rows(table, &rows)?;
    let fit = LogisticRegression::fit(&x, &labels, &weights, options)?;
    fit.classes()
        .iter()
        .zip(fit.predict_proba(observed_scaled))
        .for_each(|(&class, prob)| probabilities[class] = prob);
    Ok(probabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::test_models::null_model, particle::Particle, scaler::ScalingFactors};
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn weights_vanish_at_threshold() {
        let w = epanechnikov_weights(&[0., 0.5, 1., 2.], 1.);
        assert_eq!(w, vec![1., 0.75, 0., 0.]);
        assert_eq!(epanechnikov_weights(&[0.], 0.), vec![0.]);
    }

    #[test]
    fn wls_recovers_line() {
        let x = Mat::from_fn(20, 1, |i, _| i as f64);
        let ys = Mat::from_fn(20, 2, |i, j| if j == 0 { 2. + 3. * i as f64 } else { -1. });
        let w = vec![1.; 20];
        let fit = WeightedLeastSquares::fit(&x, &ys, &w).unwrap();
        assert_relative_eq!(fit.coefficients()[0][0], 2., epsilon = 1e-8);
        assert_relative_eq!(fit.coefficients()[0][1], 3., epsilon = 1e-8);
        assert_relative_eq!(fit.predict(1, &[7.]), -1., epsilon = 1e-8);
    }

    #[test]
    fn rank_deficient_design_is_reported() {
        // two identical statistic columns
        let x = Mat::from_fn(10, 2, |i, _| i as f64);
        let ys = Mat::from_fn(10, 1, |i, _| i as f64);
        let err = WeightedLeastSquares::fit(&x, &ys, &[1.; 10]).unwrap_err();
        assert!(matches!(err, AbcError::RegressionFit(_)));
        assert!(err.is_recoverable());
    }

    fn table(particles: Vec<Particle>, n_models: usize, observed: &[f64]) -> ReferenceTable {
        let mut table = ReferenceTable::new(particles, n_models);
        let factors = ScalingFactors::fit(&table.statistics());
        let models = (0..n_models).map(|_| null_model(1)).collect_vec();
        let observed = factors.transform(observed);
        table.score(&factors, &observed, &models).unwrap();
        table
    }

    #[test]
    fn adjustment_removes_linear_trend() {
        // parameter = statistic + noise, observed statistic 0
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let particles = (0..400)
            .map(|_| {
                let theta: f64 = rng.random_range(-2.0..2.0);
                let noise: f64 = rng.random_range(-0.05..0.05);
                Particle {
                    model_index: 0,
                    parameters: vec![theta].into(),
                    statistic: vec![theta + noise].into(),
                    distance: None,
                }
            })
            .collect_vec();
        let table = table(particles, 1, &[0.]);
        let threshold = 0.5;
        let adjusted = adjust_parameters(&table, &[0.], threshold).unwrap();
        let n_weighted = table.distances().iter().filter(|&&d| d < threshold).count();
        assert_eq!(adjusted.nrows(), n_weighted);
        for i in 0..adjusted.nrows() {
            assert!(adjusted[(i, 0)].abs() < 0.15);
        }
    }

    #[test]
    fn single_class_gets_probability_one() {
        let particles = (0..20)
            .map(|i| Particle {
                model_index: if i < 10 { 0 } else { 1 },
                parameters: vec![].into(),
                statistic: vec![if i < 10 { i as f64 } else { 100. + i as f64 }].into(),
                distance: None,
            })
            .collect_vec();
        let table = table(particles, 2, &[0.]);
        let probs = model_probabilities(&table, &[0.], 1.0, LogisticOptions::default()).unwrap();
        assert_eq!(probs, vec![1., 0.]);
    }

    #[test]
    fn logistic_probabilities_follow_statistic() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let n = 600;
        let mut x = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for _ in 0..n {
            let label = rng.random_range(0..3usize);
            x.push(label as f64 + rng.random_range(-1.0..1.0));
            labels.push(label);
        }
        let x = Mat::from_fn(n, 1, |i, _| x[i]);
        let fit = LogisticRegression::fit(&x, &labels, &vec![1.; n], LogisticOptions::default())
            .unwrap();
        assert_eq!(fit.classes(), &[0, 1, 2]);
        let low = fit.predict_proba(&[-0.5]);
        let high = fit.predict_proba(&[2.5]);
        assert_relative_eq!(low.iter().sum::<f64>(), 1., epsilon = 1e-10);
        assert!(low[0] > low[2]);
        assert!(high[2] > high[0]);
    }

    proptest! {
        #[test]
        fn weights_positive_inside(
            distances in prop::collection::vec(0f64..10., 1..100),
            h in 0.1f64..10.,
        ) {
            let w = epanechnikov_weights(&distances, h);
            for (d, w) in distances.iter().zip(&w) {
                if *d >= h {
                    prop_assert_eq!(*w, 0.);
                } else {
                    prop_assert!(*w > 0. && w.is_finite());
                }
            }
            if distances.iter().any(|&d| d < h) {
                prop_assert!(w.iter().sum::<f64>() > 0.);
            }
        }
    }
}
