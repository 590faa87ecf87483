use faer::Mat;
use itertools::Itertools;

use crate::{
    math::{mean, variance},
    reference_table::ReferenceTable,
};

/// The particles of a scored table whose distance is strictly below the
/// threshold.
#[derive(Debug, Clone)]
pub struct Rejection<'a> {
    table: &'a ReferenceTable,
    threshold: f64,
    accepted: Vec<usize>,
}

impl<'a> Rejection<'a> {
    pub fn new(table: &'a ReferenceTable, threshold: f64) -> Self {
        assert!(table.is_scored(), "Reference table has no distances yet");
        let accepted = table
            .particles()
            .iter()
            .positions(|p| p.distance.is_some_and(|d| d < threshold))
            .collect();
        Self {
            table,
            threshold,
            accepted,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Row indices of accepted particles in the reference table.
    pub fn accepted(&self) -> &[usize] {
        &self.accepted
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    /// Number of accepted particles of every model.
    pub fn acceptance_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.table.n_models()];
        let particles = self.table.particles();
        self.accepted
            .iter()
            .for_each(|&idx| counts[particles[idx].model_index] += 1);
        counts
    }

    /// Accepted parameters of one model, one row per particle.
    pub fn parameters(&self, model_index: usize) -> Mat<f64> {
        let particles = self.table.particles();
        let rows = self
            .accepted
            .iter()
            .map(|&idx| &particles[idx])
            .filter(|p| p.model_index == model_index)
            .collect_vec();
        let dim = rows.first().map_or(0, |p| p.parameters.len());
        Mat::from_fn(rows.len(), dim, |row, col| rows[row].parameters[col])
    }

    fn columns(&self, model_index: usize) -> Vec<Vec<f64>> {
        let params = self.parameters(model_index);
        (0..params.ncols())
            .map(|col| (0..params.nrows()).map(|row| params[(row, col)]).collect())
            .collect()
    }

    pub fn means(&self, model_index: usize) -> Vec<f64> {
        self.columns(model_index).iter().map(|col| mean(col)).collect()
    }

    pub fn variances(&self, model_index: usize) -> Vec<f64> {
        self.columns(model_index)
            .iter()
            .map(|col| variance(col))
            .collect()
    }

    /// Smallest and largest accepted value of each parameter.
    pub fn ranges(&self, model_index: usize) -> Vec<(f64, f64)> {
        self.columns(model_index)
            .iter()
            .map(|col| {
                col.iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
                        (lo.min(x), hi.max(x))
                    })
            })
            .collect()
    }
}
