//! Generative models and the user-supplied callables they hold.
//!
//! Simulation, summarisation and custom distances are plain strategy traits.
//! Closures with the matching signature implement them automatically.

use std::{fmt, sync::Arc};

use anyhow::{anyhow, Result};
use faer::Mat;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::{
    distance::euclidean,
    error::AbcError,
    prior::{PriorGraph, PriorSpec},
};

/// A simulated or observed dataset: rows are observations.
pub type Dataset = Mat<f64>;

/// The random stream handed to simulators.
pub type AbcRng = ChaCha8Rng;

/// A parameter vector together with the names of its entries.
#[derive(Debug, Clone, Copy)]
pub struct Parameters<'a> {
    names: &'a [String],
    values: &'a [f64],
}

impl<'a> Parameters<'a> {
    pub fn new(names: &'a [String], values: &'a [f64]) -> Self {
        assert!(names.len() == values.len());
        Self { names, values }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|other| other == name)
            .map(|idx| self.values[idx])
    }

    /// Like `get`, but with an error that can be propagated from a simulator.
    pub fn require(&self, name: &str) -> Result<f64> {
        self.get(name)
            .ok_or_else(|| anyhow!("No parameter named '{}'", name))
    }

    pub fn values(&self) -> &'a [f64] {
        self.values
    }

    pub fn names(&self) -> &'a [String] {
        self.names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Forward simulator of a model.
///
/// Implementations must be pure apart from the random stream they are given.
pub trait Simulator: Send + Sync {
    fn simulate(&self, params: &Parameters<'_>, rng: &mut AbcRng) -> Result<Dataset>;
}

impl<F> Simulator for F
where
    F: Fn(&Parameters<'_>, &mut AbcRng) -> Result<Dataset> + Send + Sync,
{
    fn simulate(&self, params: &Parameters<'_>, rng: &mut AbcRng) -> Result<Dataset> {
        self(params, rng)
    }
}

/// Maps a dataset to a fixed-size vector of summary statistics.
pub trait SummaryStatistic: Send + Sync {
    fn summarize(&self, data: &Dataset) -> Result<Vec<f64>>;
}

impl<F> SummaryStatistic for F
where
    F: Fn(&Dataset) -> Result<Vec<f64>> + Send + Sync,
{
    fn summarize(&self, data: &Dataset) -> Result<Vec<f64>> {
        self(data)
    }
}

/// A custom distance between a scaled simulated and the scaled observed
/// summary statistic.
pub trait DistanceFn: Send + Sync {
    fn distance(&self, simulated: &[f64], observed: &[f64]) -> f64;
}

impl<F> DistanceFn for F
where
    F: Fn(&[f64], &[f64]) -> f64 + Send + Sync,
{
    fn distance(&self, simulated: &[f64], observed: &[f64]) -> f64 {
        self(simulated, observed)
    }
}

/// An immutable model definition: name, priors and simulator.
#[derive(Clone)]
pub struct Model {
    name: String,
    param_names: Vec<String>,
    priors: PriorGraph,
    simulator: Arc<dyn Simulator>,
    distance: Option<Arc<dyn DistanceFn>>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("params", &self.param_names)
            .field("custom_distance", &self.distance.is_some())
            .finish()
    }
}

impl Model {
    /// Create a model. Fails if the priors can not be resolved.
    pub fn new(
        name: impl Into<String>,
        priors: Vec<PriorSpec>,
        simulator: impl Simulator + 'static,
    ) -> Result<Self, AbcError> {
        let name = name.into();
        let graph = PriorGraph::new(&priors)?;
        Ok(Self {
            param_names: graph.names().map(str::to_string).collect(),
            name,
            priors: graph,
            simulator: Arc::new(simulator),
            distance: None,
        })
    }

    /// Replace the default euclidean distance.
    pub fn with_distance(mut self, distance: Arc<dyn DistanceFn>) -> Self {
        self.distance = Some(distance);
        self
    }

    pub(crate) fn without_distance(mut self) -> Self {
        self.distance = None;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn dim(&self) -> usize {
        self.param_names.len()
    }

    pub fn has_custom_distance(&self) -> bool {
        self.distance.is_some()
    }

    pub fn draw_parameters<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Box<[f64]>, AbcError> {
        self.priors.draw(rng)
    }

    /// Parameters with a point prior, e.g. the fixed effect of a null model.
    pub fn point_parameters(&self) -> Vec<bool> {
        self.priors.point_masses()
    }

    pub fn log_prior(&self, values: &[f64]) -> f64 {
        self.priors.log_density(values)
    }

    pub fn simulate(&self, values: &[f64], rng: &mut AbcRng) -> Result<Dataset> {
        let params = Parameters::new(&self.param_names, values);
        self.simulator.simulate(&params, rng)
    }

    /// Simulate from named parameters, as used for pseudo-observed data.
    pub fn simulate_named(&self, fixed: &[(String, f64)], rng: &mut AbcRng) -> Result<Dataset> {
        let values = self
            .param_names
            .iter()
            .map(|name| {
                fixed
                    .iter()
                    .find(|(other, _)| other == name)
                    .map(|(_, val)| *val)
                    .ok_or_else(|| {
                        anyhow!("No fixed value for parameter '{}' of model '{}'", name, self.name)
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        self.simulate(&values, rng)
    }

    pub fn distance(&self, simulated: &[f64], observed: &[f64]) -> f64 {
        match &self.distance {
            Some(func) => func.distance(simulated, observed),
            None => euclidean(simulated, observed),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_models::*;
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn named_parameters() {
        let names = vec!["a".to_string(), "b".to_string()];
        let values = [1.0, 2.0];
        let params = Parameters::new(&names, &values);
        assert_eq!(params.get("b"), Some(2.0));
        assert_eq!(params.get("c"), None);
        assert!(params.require("c").is_err());
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn simulate_shapes() {
        let model = effect_model(50);
        let mut rng = AbcRng::seed_from_u64(1);
        let values = model.draw_parameters(&mut rng).unwrap();
        assert_eq!(values.len(), 1);
        let data = model.simulate(&values, &mut rng).unwrap();
        assert_eq!((data.nrows(), data.ncols()), (50, 2));
        assert_eq!(model.param_names(), &["d".to_string()]);
    }

    #[test]
    fn simulate_named_requires_all_parameters() {
        let model = effect_model(10);
        let mut rng = AbcRng::seed_from_u64(1);
        assert!(model.simulate_named(&[], &mut rng).is_err());
        let data = model
            .simulate_named(&[("d".to_string(), 0.5)], &mut rng)
            .unwrap();
        assert_eq!(data.nrows(), 10);
    }

    #[test]
    fn custom_distance() {
        let model = null_model(10);
        assert_eq!(model.distance(&[0., 3.], &[4., 0.]), 5.);
        let manhattan = |a: &[f64], b: &[f64]| -> f64 {
            a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
        };
        let model = model.with_distance(Arc::new(manhattan));
        assert!(model.has_custom_distance());
        assert_eq!(model.distance(&[0., 3.], &[4., 0.]), 7.);
    }
}
