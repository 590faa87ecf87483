//! Leave-one-out cross validation of the rejection estimator.

use itertools::Itertools;
use rand::Rng;

use crate::{
    distance::ThresholdPolicy,
    error::{AbcError, Result},
    math::{mean, variance},
    model::Model,
    particle::{particle_rng, CROSSVAL_STREAM},
    reference_table::ReferenceTable,
};

/// Repeatedly treats a random particle of the table as observed and estimates
/// its parameters from the remaining particles.
pub struct CrossValidation<'a> {
    table: &'a ReferenceTable,
    models: &'a [Model],
    model_index: usize,
    policy: ThresholdPolicy,
    seed: u64,
}

impl<'a> CrossValidation<'a> {
    pub fn new(
        table: &'a ReferenceTable,
        models: &'a [Model],
        policy: ThresholdPolicy,
        seed: u64,
    ) -> Self {
        Self {
            table,
            models,
            model_index: 0,
            policy,
            seed,
        }
    }

    pub fn with_model(mut self, model_index: usize) -> Self {
        self.model_index = model_index;
        self
    }

    /// Rejection estimate (subset mean) of every held out particle.
    ///
    /// Returns the picked rows and one estimate per pick. If no particle lies
    /// strictly below the threshold the closest one is used.
    pub fn estimates(&self, times: usize) -> Result<(Vec<usize>, Vec<Vec<f64>>)> {
        let scaled = self.table.scaled_statistics().ok_or_else(|| {
            AbcError::Configuration("Cross validation needs a scored reference table".to_string())
        })?;
        let particles = self.table.particles();
        let rows = particles
            .iter()
            .positions(|p| p.model_index == self.model_index)
            .collect_vec();
        if rows.len() < 2 {
            return Err(AbcError::Configuration(format!(
                "Cross validation needs at least two particles of model {}",
                self.model_index
            )));
        }
        let model = &self.models[self.model_index];
        let row_of = |idx: usize| (0..scaled.ncols()).map(|j| scaled[(idx, j)]).collect_vec();

        // a keep count applies to the full table, held out runs keep the same fraction
        let policy = match self.policy {
            ThresholdPolicy::Keep(k) => {
                ThresholdPolicy::Percentile(k as f64 / self.table.len() as f64)
            }
            other => other,
        };

        let mut rng = particle_rng(self.seed, CROSSVAL_STREAM);
        let mut picks = Vec::with_capacity(times);
        let mut estimates = Vec::with_capacity(times);
        for _ in 0..times {
            let picked = rows[rng.random_range(0..rows.len())];
            let observed = row_of(picked);
            let others = rows.iter().copied().filter(|&r| r != picked).collect_vec();
            let distances = others
                .iter()
                .map(|&r| model.distance(&row_of(r), &observed))
                .collect_vec();
            let threshold = policy.threshold(&distances)?;

            let mut subset = others
                .iter()
                .zip(&distances)
                .filter(|(_, &d)| d < threshold)
                .map(|(&r, _)| r)
                .collect_vec();
            if subset.is_empty() {
                if let Some((&closest, _)) = others
                    .iter()
                    .zip(&distances)
                    .min_by(|a, b| a.1.total_cmp(b.1))
                {
                    subset.push(closest);
                }
            }

            let dim = particles[picked].parameters.len();
            let estimate = (0..dim)
                .map(|j| mean(&subset.iter().map(|&r| particles[r].parameters[j]).collect_vec()))
                .collect_vec();
            picks.push(picked);
            estimates.push(estimate);
        }
        Ok((picks, estimates))
    }

    /// Prediction error per parameter:
    /// `sum((estimate - truth)^2) / (times * var(truth))`.
    pub fn prediction_error(&self, times: usize) -> Result<Vec<f64>> {
        let (picks, estimates) = self.estimates(times)?;
        let particles = self.table.particles();
        let dim = self.models[self.model_index].dim();
        let errors = (0..dim)
            .map(|j| {
                let truth = picks
                    .iter()
                    .map(|&r| particles[r].parameters[j])
                    .collect_vec();
                let sq = estimates
                    .iter()
                    .zip(&truth)
                    .map(|(est, t)| (est[j] - t).powi(2))
                    .sum::<f64>();
                sq / (times as f64 * variance(&truth))
            })
            .collect_vec();
        log::info!("Cross validation prediction error: {:?}", errors);
        Ok(errors)
    }
}
