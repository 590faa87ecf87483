//! Likelihood free Metropolis sampling.
//!
//! A proposal is accepted only if data simulated at the proposal lands within
//! the acceptance threshold of the observed statistic, and then with the
//! usual Metropolis probability of the prior ratio.

use faer::Mat;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AbcError, Result},
    model::Model,
    particle::{chain_stream, particle_rng, ParticleGenerator},
    progress::{Phase, ProgressCallback, ProgressTracker},
    rejection::Rejection,
    scaler::ScalingFactors,
};

/// Perturbation added to one parameter per proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kernel", rename_all = "lowercase")]
pub enum ProposalKernel {
    Normal { scale: f64 },
    Uniform { half_width: f64 },
    /// Never moves, used for point priors.
    Fixed,
}

impl ProposalKernel {
    fn check(&self) -> Result<()> {
        let (name, value) = match *self {
            ProposalKernel::Normal { scale } => ("scale", scale),
            ProposalKernel::Uniform { half_width } => ("half width", half_width),
            ProposalKernel::Fixed => return Ok(()),
        };
        if value > 0. && value.is_finite() {
            Ok(())
        } else {
            Err(AbcError::Configuration(format!(
                "Proposal {} must be positive and finite, got {}",
                name, value
            )))
        }
    }

    fn perturb<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            ProposalKernel::Normal { scale } => {
                let normal: f64 = rng.sample(rand_distr::StandardNormal);
                normal * scale
            }
            ProposalKernel::Uniform { half_width } => rng.random_range(-half_width..half_width),
            ProposalKernel::Fixed => 0.,
        }
    }
}

/// Kernel family used when the proposal is derived from the rejection subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelFamily {
    #[default]
    Normal,
    Uniform,
}

/// Settings of the ABC-MCMC sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct McmcSettings {
    /// Number of states of the chain, including the start.
    pub chain_length: usize,
    /// Number of initial states that are not recorded.
    pub burn: usize,
    /// Record every `thin`-th state after burn-in.
    pub thin: usize,
    pub kernel: KernelFamily,
    /// Starting point. Defaults to the mean of the rejection subset.
    pub start: Option<Vec<f64>>,
    /// Proposal per parameter. Defaults to a `kernel` proposal scaled by the
    /// spread of the rejection subset.
    pub proposal: Option<Vec<ProposalKernel>>,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            chain_length: 10_000,
            burn: 0,
            thin: 1,
            kernel: KernelFamily::Normal,
            start: None,
            proposal: None,
        }
    }
}

impl McmcSettings {
    pub fn validate(&self, dim: usize) -> Result<()> {
        if self.chain_length == 0 {
            return Err(AbcError::Configuration(
                "MCMC chain length must be positive".to_string(),
            ));
        }
        if self.burn >= self.chain_length {
            return Err(AbcError::Configuration(format!(
                "MCMC burn-in {} must be smaller than the chain length {}",
                self.burn, self.chain_length
            )));
        }
        if self.thin == 0 {
            return Err(AbcError::Configuration(
                "MCMC thinning must be at least 1".to_string(),
            ));
        }
        if let Some(start) = &self.start {
            if start.len() != dim {
                return Err(AbcError::Configuration(format!(
                    "MCMC start has {} values but the model has {} parameters",
                    start.len(),
                    dim
                )));
            }
            if start.iter().any(|x| !x.is_finite()) {
                return Err(AbcError::Configuration(
                    "MCMC start must be finite".to_string(),
                ));
            }
        }
        if let Some(proposal) = &self.proposal {
            if proposal.len() != dim {
                return Err(AbcError::Configuration(format!(
                    "MCMC proposal has {} kernels but the model has {} parameters",
                    proposal.len(),
                    dim
                )));
            }
            proposal.iter().try_for_each(ProposalKernel::check)?;
        }
        Ok(())
    }

    /// Number of states that end up in the output.
    pub fn recorded_len(&self) -> usize {
        if self.chain_length > self.burn && self.thin > 0 {
            (self.chain_length - 1 - self.burn) / self.thin + 1
        } else {
            0
        }
    }

    fn is_recorded(&self, step: usize) -> bool {
        step >= self.burn && (step - self.burn) % self.thin == 0
    }

    /// Starting point and proposal, falling back to the rejection subset of
    /// `model_index` for anything not set explicitly.
    ///
    /// The start is the subset mean. A normal proposal gets twice the subset
    /// variance as scale, a uniform proposal half the subset range as half
    /// width. Parameters with a point prior get a fixed kernel.
    pub fn initialize(
        &self,
        rejection: &Rejection<'_>,
        model_index: usize,
        model: &Model,
    ) -> Result<(Vec<f64>, Vec<ProposalKernel>)> {
        let needs_subset = self.start.is_none() || self.proposal.is_none();
        let subset = rejection.acceptance_counts()[model_index];
        if needs_subset && subset == 0 {
            return Err(AbcError::Configuration(
                "The rejection subset is empty; can not initialise the MCMC chain. \
                 Set `start` and `proposal` or use a larger threshold"
                    .to_string(),
            ));
        }
        let start = match &self.start {
            Some(start) => start.clone(),
            None => rejection.means(model_index),
        };
        let proposal = match &self.proposal {
            Some(proposal) => proposal.clone(),
            None => {
                let derived: Vec<_> = match self.kernel {
                    KernelFamily::Normal => rejection
                        .variances(model_index)
                        .into_iter()
                        .map(|var| ProposalKernel::Normal { scale: 2. * var })
                        .collect(),
                    KernelFamily::Uniform => rejection
                        .ranges(model_index)
                        .into_iter()
                        .map(|(lo, hi)| ProposalKernel::Uniform {
                            half_width: 0.5 * (hi - lo),
                        })
                        .collect(),
                };
                let proposal = hold_points(&derived, &model.point_parameters());
                proposal.iter().try_for_each(ProposalKernel::check).map_err(|_| {
                    AbcError::Configuration(format!(
                        "The rejection subset ({} particles) has no spread to derive \
                         an MCMC proposal from; set `proposal` explicitly",
                        subset
                    ))
                })?;
                proposal
            }
        };
        log::debug!("MCMC starts at {:?} with proposal {:?}", start, proposal);
        Ok((start, proposal))
    }
}

/// Replace the kernels of point parameters so they stay on their support.
fn hold_points(proposal: &[ProposalKernel], points: &[bool]) -> Vec<ProposalKernel> {
    proposal
        .iter()
        .enumerate()
        .map(|(idx, &kernel)| {
            if points.get(idx).copied().unwrap_or(false) {
                ProposalKernel::Fixed
            } else {
                kernel
            }
        })
        .collect()
}

/// Probability to move to a proposal.
///
/// Zero unless the simulated statistic passed the distance check, otherwise
/// the prior ratio clipped to one.
pub fn acceptance_probability(distance_ok: bool, log_prior_new: f64, log_prior_old: f64) -> f64 {
    if !distance_ok {
        return 0.;
    }
    let ratio = (log_prior_new - log_prior_old).exp();
    if ratio.is_nan() {
        0.
    } else {
        ratio.min(1.)
    }
}

#[derive(Debug, Clone)]
pub struct McmcOutput {
    /// Recorded states, one row per state.
    pub samples: Mat<f64>,
    pub accepted: usize,
    pub proposals: usize,
}

impl McmcOutput {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposals == 0 {
            0.
        } else {
            self.accepted as f64 / self.proposals as f64
        }
    }
}

/// One ABC-MCMC chain for a single model.
///
/// Scaling factors, observed statistic and threshold are fixed for the whole
/// chain.
pub struct AbcMcmc<'a> {
    generator: &'a ParticleGenerator<'a>,
    model_index: usize,
    factors: &'a ScalingFactors,
    observed_scaled: &'a [f64],
    threshold: f64,
    seed: u64,
    chain: usize,
}

impl<'a> AbcMcmc<'a> {
    pub fn new(
        generator: &'a ParticleGenerator<'a>,
        factors: &'a ScalingFactors,
        observed_scaled: &'a [f64],
        threshold: f64,
        seed: u64,
    ) -> Self {
        Self {
            generator,
            model_index: 0,
            factors,
            observed_scaled,
            threshold,
            seed,
            chain: 0,
        }
    }

    pub fn with_model(mut self, model_index: usize) -> Self {
        self.model_index = model_index;
        self
    }

    pub fn with_chain(mut self, chain: usize) -> Self {
        self.chain = chain;
        self
    }

    pub fn run(
        &self,
        settings: &McmcSettings,
        start: Vec<f64>,
        proposal: &[ProposalKernel],
        progress: Option<&ProgressCallback>,
    ) -> Result<McmcOutput> {
        let model = &self.generator.models()[self.model_index];
        let dim = model.dim();
        settings.validate(dim)?;
        if start.len() != dim || proposal.len() != dim {
            return Err(AbcError::Configuration(format!(
                "MCMC start and proposal must have {} entries",
                dim
            )));
        }
        proposal.iter().try_for_each(ProposalKernel::check)?;
        let proposal = hold_points(proposal, &model.point_parameters());

        let mut rng = particle_rng(self.seed, chain_stream(self.chain));
        let mut current = start;
        let mut current_log_prior = model.log_prior(&current);
        if current_log_prior == f64::NEG_INFINITY {
            log::warn!(
                "MCMC start {:?} lies outside the support of the prior",
                current
            );
        }

        let mut samples = Mat::<f64>::zeros(settings.recorded_len(), dim);
        let mut recorded = 0;
        let mut accepted = 0;
        let mut proposed = vec![0f64; dim];
        let tracker = ProgressTracker::new(progress, Phase::Mcmc, settings.chain_length);

        for step in 0..settings.chain_length {
            if step > 0 {
                proposed
                    .iter_mut()
                    .zip(&current)
                    .zip(&proposal)
                    .for_each(|((new, old), kernel)| *new = old + kernel.perturb(&mut rng));
                let log_prior = model.log_prior(&proposed);

                // Proposals outside the prior support are never accepted.
                let prior_prob = acceptance_probability(true, log_prior, current_log_prior);
                let distance_ok = if prior_prob > 0. {
                    let statistic =
                        self.generator
                            .evaluate(self.model_index, &proposed, step, &mut rng)?;
                    let scaled = self.factors.transform(&statistic);
                    model.distance(&scaled, self.observed_scaled) < self.threshold
                } else {
                    false
                };

                let prob = acceptance_probability(distance_ok, log_prior, current_log_prior);
                let draw: f64 = rng.random();
                if draw < prob {
                    current.copy_from_slice(&proposed);
                    current_log_prior = log_prior;
                    accepted += 1;
                }
            }
            if settings.is_recorded(step) {
                current
                    .iter()
                    .enumerate()
                    .for_each(|(col, &val)| samples[(recorded, col)] = val);
                recorded += 1;
            }
            tracker.advance();
        }
        tracker.finish();

        let output = McmcOutput {
            samples,
            accepted,
            proposals: settings.chain_length - 1,
        };
        log::info!(
            "MCMC accepted {} of {} proposals ({:.1}%)",
            output.accepted,
            output.proposals,
            100. * output.acceptance_rate()
        );
        Ok(output)
    }
}
