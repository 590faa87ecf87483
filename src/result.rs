//! Results of a run and their JSON report.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use faer::Mat;
use serde::{Serialize, Serializer};

use crate::{
    error::Result,
    math::{mean, variance},
    settings::Method,
};

fn serialize_matrix<S: Serializer>(
    mat: &Mat<f64>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let rows: Vec<Vec<f64>> = (0..mat.nrows())
        .map(|i| (0..mat.ncols()).map(|j| mat[(i, j)]).collect())
        .collect();
    rows.serialize(serializer)
}

fn serialize_seconds<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Pairwise Bayes factors of model `i` over model `j`.
///
/// Entries below the diagonal are `weights[i] / weights[j]`, entries above are
/// their reciprocals and the diagonal is 1. A positive weight over a zero
/// weight is `+inf`, two zero weights give NaN.
pub fn bayes_factors(weights: &[f64]) -> Mat<f64> {
    let n = weights.len();
    let mut bf = Mat::<f64>::zeros(n, n);
    for i in 0..n {
        bf[(i, i)] = 1.;
        for j in 0..i {
            let ratio = if weights[j] == 0. {
                if weights[i] == 0. {
                    f64::NAN
                } else {
                    f64::INFINITY
                }
            } else {
                weights[i] / weights[j]
            };
            bf[(i, j)] = ratio;
            bf[(j, i)] = 1. / ratio;
        }
    }
    bf
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
}

/// Mean and standard deviation of every column of `samples`.
pub fn describe(names: &[String], samples: &Mat<f64>) -> Vec<ParameterSummary> {
    names
        .iter()
        .enumerate()
        .map(|(col, name)| {
            let column: Vec<f64> = (0..samples.nrows())
                .map(|row| samples[(row, col)])
                .collect();
            ParameterSummary {
                name: name.clone(),
                mean: mean(&column),
                sd: variance(&column).sqrt(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub accepted: usize,
    pub proposals: usize,
    pub acceptance_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Posterior {
    pub model: String,
    pub param_names: Vec<String>,
    /// One row per draw, one column per parameter.
    #[serde(serialize_with = "serialize_matrix")]
    pub samples: Mat<f64>,
    pub summary: Vec<ParameterSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainStats>,
}

impl Posterior {
    pub fn new(model: &str, param_names: &[String], samples: Mat<f64>) -> Self {
        Self {
            model: model.to_string(),
            param_names: param_names.to_vec(),
            summary: describe(param_names, &samples),
            samples,
            chain: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelComparison {
    pub models: Vec<String>,
    /// Accepted particles per model.
    pub accepted: Vec<usize>,
    pub probabilities: Vec<f64>,
    #[serde(serialize_with = "serialize_matrix")]
    pub bayes_factors: Mat<f64>,
}

impl ModelComparison {
    /// Comparison from posterior model probabilities.
    pub fn new(models: Vec<String>, accepted: Vec<usize>, probabilities: Vec<f64>) -> Self {
        Self {
            bayes_factors: bayes_factors(&probabilities),
            models,
            accepted,
            probabilities,
        }
    }

    /// Comparison from plain acceptance counts. Probabilities are NaN if
    /// nothing was accepted.
    pub fn from_counts(models: Vec<String>, accepted: Vec<usize>) -> Self {
        let total = accepted.iter().sum::<usize>() as f64;
        let probabilities = accepted.iter().map(|&c| c as f64 / total).collect();
        let mut comparison = Self::new(models, accepted, probabilities);
        comparison.bayes_factors =
            bayes_factors(&comparison.accepted.iter().map(|&c| c as f64).collect::<Vec<_>>());
        comparison
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "objective", rename_all = "lowercase")]
pub enum Outcome {
    Inference(Posterior),
    Comparison(ModelComparison),
}

#[derive(Debug, Clone, Serialize)]
pub struct AbcResult {
    /// The method requested in the settings.
    pub method: Method,
    /// Why the estimate fell back to plain rejection, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    pub threshold: f64,
    pub particles: usize,
    /// Particles strictly below the threshold.
    pub accepted: usize,
    /// Summary statistic dimensions that were not scaled.
    pub degenerate_dims: Vec<usize>,
    #[serde(serialize_with = "serialize_seconds")]
    pub elapsed: Duration,
    pub outcome: Outcome,
    /// Leave-one-out prediction error per parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_validation: Option<Vec<f64>>,
}

impl AbcResult {
    pub fn posterior(&self) -> Option<&Posterior> {
        match &self.outcome {
            Outcome::Inference(posterior) => Some(posterior),
            Outcome::Comparison(_) => None,
        }
    }

    pub fn comparison(&self) -> Option<&ModelComparison> {
        match &self.outcome {
            Outcome::Comparison(comparison) => Some(comparison),
            Outcome::Inference(_) => None,
        }
    }

    /// Write `results.json` into `dir`, creating it if needed.
    ///
    /// Infinite and NaN Bayes factors are written as `null`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("results.json");
        let file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        serde_json::to_writer_pretty(file, self)?;
        log::info!("Results written to {}", path.display());
        Ok(path)
    }

    pub fn log_summary(&self) {
        log::info!(
            "Finished after {:.2?}: threshold {:.4}, {} of {} particles accepted",
            self.elapsed,
            self.threshold,
            self.accepted,
            self.particles
        );
        if let Some(reason) = &self.fallback {
            log::warn!("Estimate fell back to plain rejection: {}", reason);
        }
        match &self.outcome {
            Outcome::Inference(posterior) => {
                for param in &posterior.summary {
                    log::info!("{}: mean {:.4}, sd {:.4}", param.name, param.mean, param.sd);
                }
            }
            Outcome::Comparison(comparison) => {
                for (i, name) in comparison.models.iter().enumerate() {
                    log::info!(
                        "{}: accepted {}, probability {:.4}",
                        name,
                        comparison.accepted[i],
                        comparison.probabilities[i]
                    );
                }
            }
        }
    }
}
