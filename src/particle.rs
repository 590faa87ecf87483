use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use rand::SeedableRng;

use crate::{
    error::{AbcError, Result},
    model::{AbcRng, Dataset, Model, SummaryStatistic},
};

/// The outcome of one simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub model_index: usize,
    pub parameters: Box<[f64]>,
    /// Unscaled summary statistic.
    pub statistic: Box<[f64]>,
    /// Distance to the observed statistic, `None` until the table is scored.
    pub distance: Option<f64>,
}

/// Shape requirements derived from the observed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataContract {
    pub nrows: usize,
    pub ncols: usize,
    pub statistic_len: usize,
}

impl DataContract {
    pub fn check_dataset(&self, data: &Dataset) -> anyhow::Result<()> {
        if (data.nrows(), data.ncols()) != (self.nrows, self.ncols) {
            return Err(anyhow!(
                "simulated dataset has shape {}x{}, observed data has shape {}x{}",
                data.nrows(),
                data.ncols(),
                self.nrows,
                self.ncols
            ));
        }
        Ok(())
    }

    pub fn check_statistic(&self, statistic: &[f64]) -> anyhow::Result<()> {
        if statistic.len() != self.statistic_len {
            return Err(anyhow!(
                "summary statistic has {} entries, the observed one has {}",
                statistic.len(),
                self.statistic_len
            ));
        }
        if let Some(pos) = statistic.iter().position(|x| !x.is_finite()) {
            return Err(anyhow!(
                "summary statistic entry {} is not finite ({})",
                pos,
                statistic[pos]
            ));
        }
        Ok(())
    }
}

/// Stream of the pseudo-observed data.
pub(crate) const OBSERVED_STREAM: usize = usize::MAX;
/// Stream that picks the rows held out in cross validation.
pub(crate) const CROSSVAL_STREAM: usize = usize::MAX - 1;

/// Stream of an MCMC chain, disjoint from all particle streams.
pub(crate) fn chain_stream(chain: usize) -> usize {
    usize::MAX - 2 - chain
}

/// Random stream of one particle: independent of the worker that runs it.
pub fn particle_rng(seed: u64, particle: usize) -> AbcRng {
    let mut rng = AbcRng::seed_from_u64(seed);
    rng.set_stream(particle as u64);
    rng
}

/// Produces particles: draw parameters, simulate, summarize.
pub struct ParticleGenerator<'a> {
    models: &'a [Model],
    summary: &'a dyn SummaryStatistic,
    contract: DataContract,
    seed: u64,
    time_limit: Option<Duration>,
}

impl<'a> ParticleGenerator<'a> {
    pub fn new(
        models: &'a [Model],
        summary: &'a dyn SummaryStatistic,
        contract: DataContract,
        seed: u64,
    ) -> Self {
        Self {
            models,
            summary,
            contract,
            seed,
            time_limit: None,
        }
    }

    /// Fail any simulate + summarize call that takes longer than `limit`.
    ///
    /// User code can not be interrupted, so the limit is enforced when the
    /// call returns.
    pub fn with_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn models(&self) -> &'a [Model] {
        self.models
    }

    pub fn contract(&self) -> DataContract {
        self.contract
    }

    /// Generate particle number `particle` of the reference table.
    pub fn generate(&self, model_index: usize, particle: usize) -> Result<Particle> {
        let model = &self.models[model_index];
        let mut rng = particle_rng(self.seed, particle);
        let parameters = model
            .draw_parameters(&mut rng)
            .map_err(|err| AbcError::contract(model.name(), particle, err.into()))?;
        let statistic = self.evaluate(model_index, &parameters, particle, &mut rng)?;
        Ok(Particle {
            model_index,
            parameters,
            statistic,
            distance: None,
        })
    }

    /// Simulate and summarize at fixed parameters, checking the data contract.
    ///
    /// `particle` only identifies the call in error messages.
    pub fn evaluate(
        &self,
        model_index: usize,
        parameters: &[f64],
        particle: usize,
        rng: &mut AbcRng,
    ) -> Result<Box<[f64]>> {
        let model = &self.models[model_index];
        let start = Instant::now();
        let statistic = model
            .simulate(parameters, rng)
            .context("simulate failed")
            .and_then(|data| {
                self.contract.check_dataset(&data)?;
                self.summary.summarize(&data).context("summary failed")
            })
            .and_then(|statistic| {
                self.contract.check_statistic(&statistic)?;
                Ok(statistic)
            })
            .map_err(|err| AbcError::contract(model.name(), particle, err))?;
        if let Some(limit) = self.time_limit {
            if start.elapsed() > limit {
                return Err(AbcError::SimulationTimeout {
                    model: model.name().to_string(),
                    particle,
                    limit,
                });
            }
        }
        Ok(statistic.into())
    }
}
