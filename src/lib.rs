//! Approximate Bayesian computation for models with a simulator but no
//! tractable likelihood.
//!
//! A run simulates a reference table from the priors of all candidate models,
//! scales the summary statistics by their median absolute deviation and
//! accepts the particles closest to the observed statistic. On top of the
//! rejection subset the posterior can be corrected by weighted regression or
//! refined with ABC-MCMC.
//!
//! ```no_run
//! use abc_rs::{Abc, AbcConfig, DataSource, Dataset, Dist, Model, Parameters, PriorSpec, Settings};
//!
//! # fn main() -> anyhow::Result<()> {
//! let model = Model::new(
//!     "shift",
//!     vec![PriorSpec::new("mu", Dist::Normal { loc: 0f64.into(), scale: 1f64.into() })],
//!     |params: &Parameters<'_>, rng: &mut abc_rs::AbcRng| -> anyhow::Result<Dataset> {
//!         use rand::Rng;
//!         let mu = params.require("mu")?;
//!         Ok(Dataset::from_fn(50, 1, |_, _| mu + rng.random::<f64>() - 0.5))
//!     },
//! )?;
//! let mean = |data: &Dataset| -> anyhow::Result<Vec<f64>> {
//!     Ok(vec![(0..data.nrows()).map(|i| data[(i, 0)]).sum::<f64>() / data.nrows() as f64])
//! };
//! let data = DataSource::Matrix(Dataset::from_fn(50, 1, |i, _| 0.3 + 0.01 * i as f64));
//! let config = AbcConfig::new(Settings::default(), data, mean).model(model);
//! let result = Abc::new(config)?.run()?;
//! println!("{:?}", result.posterior().map(|p| &p.summary));
//! # Ok(())
//! # }
//! ```

pub(crate) mod abc;
pub(crate) mod crossval;
pub(crate) mod data;
pub(crate) mod distance;
pub(crate) mod error;
pub(crate) mod math;
pub(crate) mod mcmc;
pub(crate) mod model;
pub(crate) mod particle;
pub(crate) mod prior;
pub(crate) mod progress;
pub(crate) mod reference_table;
pub(crate) mod regression;
pub(crate) mod rejection;
pub(crate) mod result;
pub(crate) mod scaler;
pub(crate) mod settings;

pub use abc::{Abc, AbcConfig};
pub use crossval::CrossValidation;
pub use data::{parse_delimited, DataSource};
pub use distance::{euclidean, DistanceMetric, ThresholdPolicy};
pub use error::{AbcError, Result};
pub use mcmc::{acceptance_probability, AbcMcmc, KernelFamily, McmcOutput, McmcSettings, ProposalKernel};
pub use model::{AbcRng, Dataset, DistanceFn, Model, Parameters, Simulator, SummaryStatistic};
pub use particle::{particle_rng, DataContract, Particle, ParticleGenerator};
pub use prior::{Dist, ParamValue, PriorGraph, PriorSpec};
pub use progress::{Phase, Progress, ProgressCallback};
pub use reference_table::{split_particles, ReferenceTable, TableBuilder};
pub use regression::{
    adjust_parameters, epanechnikov_weights, model_probabilities, LogisticOptions,
    LogisticRegression, WeightedLeastSquares,
};
pub use rejection::Rejection;
pub use result::{
    bayes_factors, describe, AbcResult, ChainStats, ModelComparison, Outcome, ParameterSummary,
    Posterior,
};
pub use scaler::ScalingFactors;
pub use settings::{Method, Objective, Settings};
