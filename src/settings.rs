use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    distance::{DistanceMetric, ThresholdPolicy},
    error::{AbcError, Result},
    mcmc::McmcSettings,
    model::Model,
};

/// What a run estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    /// Posterior of the parameters of a single model.
    #[default]
    Inference,
    /// Posterior probabilities of two or more models.
    Comparison,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Plain rejection.
    #[default]
    Rejection,
    /// Rejection followed by a weighted linear adjustment (inference).
    Regression,
    /// Weighted multinomial logistic regression (comparison).
    Logistic,
    /// ABC-MCMC seeded from the rejection subset (inference).
    Mcmc,
}

impl Method {
    fn supports(&self, objective: Objective) -> bool {
        match self {
            Method::Rejection => true,
            Method::Regression | Method::Mcmc => objective == Objective::Inference,
            Method::Logistic => objective == Objective::Comparison,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Algorithm settings of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub objective: Objective,
    pub method: Method,
    /// Total number of particles in the reference table.
    pub simulations: usize,
    /// A fixed acceptance threshold. Negative values select the threshold
    /// from `keep` or `percentile`.
    pub threshold: f64,
    /// Fraction of particles to accept.
    pub percentile: f64,
    /// Number of particles to accept, takes precedence over `percentile`.
    pub keep: Option<usize>,
    pub distance_metric: DistanceMetric,
    /// Worker threads used for the reference table.
    pub jobs: usize,
    pub seed: u64,
    /// Directory for `results.json`; nothing is written if unset.
    pub outputdir: Option<PathBuf>,
    /// Upper bound in seconds for a single simulate and summary call.
    pub max_simulation_time: Option<f64>,
    /// Fail instead of falling back when a statistic has zero spread.
    pub strict_scaling: bool,
    /// Number of leave-one-out repetitions; zero disables cross validation.
    pub cross_validation: usize,
    pub mcmc: Option<McmcSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            objective: Objective::Inference,
            method: Method::Rejection,
            simulations: 10_000,
            threshold: -1.,
            percentile: 0.05,
            keep: None,
            distance_metric: DistanceMetric::Euclidean,
            jobs: default_jobs(),
            seed: 42,
            outputdir: None,
            max_simulation_time: None,
            strict_scaling: false,
            cross_validation: 0,
            mcmc: None,
        }
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|err| AbcError::Configuration(format!("Invalid settings: {}", err)))
    }

    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map_err(|err| match err {
            AbcError::Configuration(msg) => {
                AbcError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// The acceptance threshold rule these settings select.
    pub fn threshold_policy(&self) -> ThresholdPolicy {
        if self.threshold >= 0. {
            ThresholdPolicy::Fixed(self.threshold)
        } else if let Some(keep) = self.keep {
            ThresholdPolicy::Keep(keep)
        } else {
            ThresholdPolicy::Percentile(self.percentile)
        }
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.max_simulation_time.map(Duration::from_secs_f64)
    }

    /// Check the settings against the models of a run.
    ///
    /// Runs before any simulation, so that a bad configuration fails fast.
    pub fn validate(&self, models: &[Model]) -> Result<()> {
        let fail = |msg: String| Err(AbcError::Configuration(msg));

        match (self.objective, models.len()) {
            (_, 0) => return fail("At least one model is required".to_string()),
            (Objective::Inference, n) if n != 1 => {
                return fail(format!("Inference needs exactly one model, got {}", n))
            }
            (Objective::Comparison, 1) => {
                return fail("Model comparison needs at least two models".to_string())
            }
            _ => (),
        }
        if !self.method.supports(self.objective) {
            return fail(format!(
                "Method {:?} is not available for objective {:?}",
                self.method, self.objective
            ));
        }
        if self.simulations < models.len() {
            return fail(format!(
                "{} simulations can not cover {} models",
                self.simulations,
                models.len()
            ));
        }
        if self.jobs == 0 {
            return fail("jobs must be at least 1".to_string());
        }

        match self.threshold_policy() {
            ThresholdPolicy::Fixed(value) if !value.is_finite() => {
                return fail(format!("Threshold must be finite, got {}", value))
            }
            ThresholdPolicy::Percentile(q) if !(q > 0. && q <= 1.) => {
                return fail(format!("Percentile must lie in (0, 1], got {}", q))
            }
            ThresholdPolicy::Keep(k) if k == 0 || k > self.simulations => {
                return fail(format!(
                    "keep must lie between 1 and the number of simulations ({}), got {}",
                    self.simulations, k
                ))
            }
            _ => (),
        }
        if self.threshold.is_nan() {
            return fail("Threshold is NaN".to_string());
        }

        if let Some(limit) = self.max_simulation_time {
            if !(limit > 0. && limit.is_finite()) {
                return fail(format!(
                    "max_simulation_time must be positive, got {}",
                    limit
                ));
            }
        }
        if let Some(dir) = &self.outputdir {
            if dir.as_os_str().is_empty() {
                return fail("outputdir is empty".to_string());
            }
        }

        match self.distance_metric {
            DistanceMetric::Custom => {
                if let Some(model) = models.iter().find(|m| !m.has_custom_distance()) {
                    return fail(format!(
                        "distance_metric is custom but model '{}' has no distance function",
                        model.name()
                    ));
                }
            }
            DistanceMetric::Euclidean => {
                if models.iter().any(Model::has_custom_distance) {
                    log::warn!("Custom distance functions are ignored with the euclidean metric");
                }
            }
        }

        match (&self.mcmc, self.method) {
            (None, Method::Mcmc) => {
                return fail("Method mcmc needs an [mcmc] section".to_string())
            }
            (Some(mcmc), Method::Mcmc) => mcmc.validate(models[0].dim())?,
            _ => (),
        }
        Ok(())
    }
}
