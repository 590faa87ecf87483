//! Parallel construction of the reference table.

use faer::Mat;
use itertools::Itertools;
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{
    error::{AbcError, Result},
    model::Model,
    particle::{Particle, ParticleGenerator},
    progress::{Phase, ProgressCallback, ProgressTracker},
    scaler::ScalingFactors,
};

/// Split `total` particles across `n_models` models.
///
/// Every model gets `total / n_models` particles and the remainder goes one
/// each to the first models, so no particle is dropped.
pub fn split_particles(total: usize, n_models: usize) -> Vec<usize> {
    assert!(n_models > 0);
    let base = total / n_models;
    let rest = total % n_models;
    (0..n_models)
        .map(|idx| base + usize::from(idx < rest))
        .collect()
}

/// All particles of one run, grouped by model index.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    particles: Vec<Particle>,
    n_models: usize,
    scaled: Option<Mat<f64>>,
}

impl ReferenceTable {
    /// Assemble a table from particles in any order.
    pub fn new(mut particles: Vec<Particle>, n_models: usize) -> Self {
        assert!(particles.iter().all(|p| p.model_index < n_models));
        particles.sort_by_key(|p| p.model_index);
        Self {
            particles,
            n_models,
            scaled: None,
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn n_models(&self) -> usize {
        self.n_models
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn statistic_dim(&self) -> usize {
        self.particles.first().map_or(0, |p| p.statistic.len())
    }

    pub fn model_indices(&self) -> Vec<usize> {
        self.particles.iter().map(|p| p.model_index).collect()
    }

    pub fn counts_per_model(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_models];
        self.particles
            .iter()
            .for_each(|p| counts[p.model_index] += 1);
        counts
    }

    /// Unscaled summary statistics, one row per particle.
    pub fn statistics(&self) -> Mat<f64> {
        Mat::from_fn(self.len(), self.statistic_dim(), |row, col| {
            self.particles[row].statistic[col]
        })
    }

    /// Parameters of all particles of one model, one row per particle.
    pub fn parameters(&self, model_index: usize) -> Mat<f64> {
        let rows = self
            .particles
            .iter()
            .filter(|p| p.model_index == model_index)
            .collect_vec();
        let dim = rows.first().map_or(0, |p| p.parameters.len());
        Mat::from_fn(rows.len(), dim, |row, col| rows[row].parameters[col])
    }

    /// Scaled statistics, available once the table has been scored.
    pub fn scaled_statistics(&self) -> Option<&Mat<f64>> {
        self.scaled.as_ref()
    }

    pub fn is_scored(&self) -> bool {
        self.scaled.is_some()
    }

    /// Distances of all particles, NaN while the table is unscored.
    pub fn distances(&self) -> Vec<f64> {
        self.particles
            .iter()
            .map(|p| p.distance.unwrap_or(f64::NAN))
            .collect()
    }

    /// Scale all statistics with frozen factors and fill in the distance of
    /// every particle to the scaled observed statistic.
    ///
    /// Distances are set exactly once per table.
    pub fn score(
        &mut self,
        factors: &ScalingFactors,
        observed_scaled: &[f64],
        models: &[Model],
    ) -> Result<()> {
        if self.is_scored() {
            return Err(AbcError::Configuration(
                "Reference table distances were already computed".to_string(),
            ));
        }
        let scaled = factors.transform_matrix(&self.statistics());
        let mut row = vec![0f64; scaled.ncols()];
        for (idx, particle) in self.particles.iter_mut().enumerate() {
            row.iter_mut()
                .enumerate()
                .for_each(|(col, val)| *val = scaled[(idx, col)]);
            particle.distance = Some(models[particle.model_index].distance(&row, observed_scaled));
        }
        self.scaled = Some(scaled);
        Ok(())
    }
}

/// Builds reference tables on a dedicated worker pool.
pub struct TableBuilder<'a> {
    generator: &'a ParticleGenerator<'a>,
    jobs: usize,
    progress: Option<&'a ProgressCallback>,
}

impl<'a> TableBuilder<'a> {
    pub fn new(generator: &'a ParticleGenerator<'a>, jobs: usize) -> Self {
        Self {
            generator,
            jobs,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<&'a ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Simulate `total` particles split across all models.
    ///
    /// The first error aborts the build; outstanding work is dropped.
    pub fn build(&self, total: usize) -> Result<ReferenceTable> {
        let models = self.generator.models();
        let work = split_particles(total, models.len())
            .into_iter()
            .enumerate()
            .flat_map(|(model_index, count)| std::iter::repeat(model_index).take(count))
            .collect_vec();

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .thread_name(|idx| format!("abc-worker-{}", idx))
            .build()
            .map_err(|err| {
                AbcError::Configuration(format!("Could not start worker pool: {}", err))
            })?;

        log::info!(
            "Simulating {} particles for {} model(s) on {} worker(s)",
            work.len(),
            models.len(),
            pool.current_num_threads()
        );

        let tracker = ProgressTracker::new(self.progress, Phase::Simulation, work.len());
        let particles = pool.install(|| {
            work.par_iter()
                .enumerate()
                .map(|(particle, &model_index)| {
                    let out = self.generator.generate(model_index, particle);
                    tracker.advance();
                    out
                })
                .collect::<Result<Vec<_>>>()
        })?;
        tracker.finish();

        log::debug!("Reference table finished after {:?}", tracker.elapsed());
        Ok(ReferenceTable::new(particles, models.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{
            test_models::{effect_model, null_model, standardized_mean_difference},
            AbcRng, Dataset, Parameters,
        },
        particle::DataContract,
    };
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    fn contract() -> DataContract {
        DataContract {
            nrows: 20,
            ncols: 2,
            statistic_len: 1,
        }
    }

    #[test]
    fn split_distributes_remainder() {
        assert_eq!(split_particles(10, 2), vec![5, 5]);
        assert_eq!(split_particles(10, 3), vec![4, 3, 3]);
        assert_eq!(split_particles(11, 4), vec![3, 3, 3, 2]);
        assert_eq!(split_particles(2, 3), vec![1, 1, 0]);
        assert_eq!(split_particles(10, 3).iter().sum::<usize>(), 10);
    }

    #[test]
    fn build_groups_by_model() {
        let models = vec![effect_model(20), null_model(20)];
        let gen = ParticleGenerator::new(&models, &standardized_mean_difference, contract(), 3);
        let table = TableBuilder::new(&gen, 4).build(101).unwrap();
        assert_eq!(table.len(), 101);
        assert_eq!(table.counts_per_model(), vec![51, 50]);
        let indices = table.model_indices();
        assert!(indices.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(table.parameters(0).ncols(), 1);
        assert_eq!(table.parameters(1).nrows(), 50);
        assert_eq!(table.statistics().nrows(), 101);
        assert!(!table.is_scored());
    }

    #[test]
    fn build_is_independent_of_worker_count() {
        let models = vec![effect_model(20)];
        let gen = ParticleGenerator::new(&models, &standardized_mean_difference, contract(), 9);
        let mut a = TableBuilder::new(&gen, 1).build(40).unwrap();
        let mut b = TableBuilder::new(&gen, 3).build(40).unwrap();
        assert_eq!(a.particles(), b.particles());

        let factors = ScalingFactors::fit(&a.statistics());
        a.score(&factors, &[0.2], &models).unwrap();
        b.score(&factors, &[0.2], &models).unwrap();
        assert!(a.particles().iter().all(|p| p.distance.is_some()));
        assert_eq!(a.particles(), b.particles());
    }

    #[test]
    fn failing_particle_aborts_build() {
        let models = vec![Model::new(
            "flaky",
            vec![],
            |_: &Parameters<'_>, rng: &mut AbcRng| -> anyhow::Result<Dataset> {
                use rand::Rng;
                if rng.random::<f64>() < 0.2 {
                    return Err(anyhow!("unlucky"));
                }
                Ok(Dataset::zeros(20, 2))
            },
        )
        .unwrap()];
        let summary = |_: &Dataset| -> anyhow::Result<Vec<f64>> { Ok(vec![0.]) };
        let gen = ParticleGenerator::new(&models, &summary, contract(), 1);
        let err = TableBuilder::new(&gen, 2).build(200).unwrap_err();
        assert!(matches!(err, AbcError::SimulationContract { .. }));
    }

    #[test]
    fn scoring_happens_once() {
        let models = vec![effect_model(20)];
        let gen = ParticleGenerator::new(&models, &standardized_mean_difference, contract(), 2);
        let mut table = TableBuilder::new(&gen, 2).build(30).unwrap();
        let factors = ScalingFactors::fit(&table.statistics());
        table.score(&factors, &[0.], &models).unwrap();
        assert!(table.is_scored());
        assert!(table.distances().iter().all(|d| d.is_finite() && *d >= 0.));
        assert!(table.score(&factors, &[0.], &models).is_err());
    }
}
