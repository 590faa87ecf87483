//! The analysis pipeline: reference table, scaling, threshold, rejection and
//! the configured estimator on top.

use std::{sync::Arc, time::Instant};

use anyhow::Context;

use crate::{
    crossval::CrossValidation,
    data::DataSource,
    distance::DistanceMetric,
    error::{AbcError, Result},
    mcmc::AbcMcmc,
    model::{Dataset, DistanceFn, Model, SummaryStatistic},
    particle::{DataContract, ParticleGenerator},
    progress::ProgressCallback,
    reference_table::{ReferenceTable, TableBuilder},
    regression::{adjust_parameters, model_probabilities, LogisticOptions},
    rejection::Rejection,
    result::{AbcResult, ChainStats, ModelComparison, Outcome, Posterior},
    scaler::ScalingFactors,
    settings::{Method, Objective, Settings},
};

/// Everything a run needs: settings, observed data, models and callables.
pub struct AbcConfig {
    pub settings: Settings,
    pub data: DataSource,
    pub models: Vec<Model>,
    pub summary: Arc<dyn SummaryStatistic>,
    /// Shared distance, set on every model when the analysis is created.
    pub distance: Option<Arc<dyn DistanceFn>>,
    pub progress: Option<ProgressCallback>,
}

impl AbcConfig {
    pub fn new(
        settings: Settings,
        data: DataSource,
        summary: impl SummaryStatistic + 'static,
    ) -> Self {
        Self {
            settings,
            data,
            models: Vec::new(),
            summary: Arc::new(summary),
            distance: None,
            progress: None,
        }
    }

    pub fn model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    /// Use `distance` for every model, including models added later. Only
    /// takes effect with `distance_metric = "custom"`.
    pub fn distance(mut self, distance: impl DistanceFn + 'static) -> Self {
        self.distance = Some(Arc::new(distance));
        self
    }

    pub fn progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// A validated analysis, ready to run.
pub struct Abc {
    settings: Settings,
    models: Vec<Model>,
    summary: Arc<dyn SummaryStatistic>,
    progress: Option<ProgressCallback>,
    observed: Dataset,
    observed_statistic: Vec<f64>,
}

impl Abc {
    /// Validate the configuration, load the observed data and check that
    /// every model produces data and statistics of the observed shape.
    ///
    /// Nothing is simulated for the reference table yet.
    pub fn new(config: AbcConfig) -> Result<Self> {
        let AbcConfig {
            settings,
            data,
            mut models,
            summary,
            distance,
            progress,
        } = config;
        if let Some(distance) = distance {
            models = models
                .into_iter()
                .map(|model| model.with_distance(distance.clone()))
                .collect();
        }
        settings.validate(&models)?;
        if settings.distance_metric == DistanceMetric::Euclidean {
            models = models.into_iter().map(Model::without_distance).collect();
        }

        let observed = data.load(&models, settings.seed)?;
        let observed_statistic = summary
            .summarize(&observed)
            .context("summary of the observed data failed")
            .map_err(|err| AbcError::Configuration(format!("{:#}", err)))?;
        if observed_statistic.is_empty() || observed_statistic.iter().any(|x| !x.is_finite()) {
            return Err(AbcError::Configuration(format!(
                "The observed summary statistic must be non-empty and finite, got {:?}",
                observed_statistic
            )));
        }

        let abc = Self {
            settings,
            models,
            summary,
            progress,
            observed,
            observed_statistic,
        };
        let generator = abc.generator();
        for model_index in 0..abc.models.len() {
            generator.generate(model_index, model_index)?;
        }
        log::debug!(
            "{} model(s) passed the data contract {:?}",
            abc.models.len(),
            generator.contract()
        );
        Ok(abc)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn observed(&self) -> &Dataset {
        &self.observed
    }

    pub fn observed_statistic(&self) -> &[f64] {
        &self.observed_statistic
    }

    fn contract(&self) -> DataContract {
        DataContract {
            nrows: self.observed.nrows(),
            ncols: self.observed.ncols(),
            statistic_len: self.observed_statistic.len(),
        }
    }

    fn generator(&self) -> ParticleGenerator<'_> {
        ParticleGenerator::new(
            &self.models,
            self.summary.as_ref(),
            self.contract(),
            self.settings.seed,
        )
        .with_time_limit(self.settings.time_limit())
    }

    pub fn run(&self) -> Result<AbcResult> {
        let start = Instant::now();
        let settings = &self.settings;
        let generator = self.generator();

        let mut table = TableBuilder::new(&generator, settings.jobs)
            .with_progress(self.progress.as_ref())
            .build(settings.simulations)?;

        let factors = ScalingFactors::fit(&table.statistics());
        if settings.strict_scaling {
            factors.check()?;
        }
        let observed_scaled = factors.transform(&self.observed_statistic);
        table.score(&factors, &observed_scaled, &self.models)?;

        let threshold = settings.threshold_policy().threshold(&table.distances())?;
        let rejection = Rejection::new(&table, threshold);
        log::info!(
            "Threshold {:.6} accepts {} of {} particles",
            threshold,
            rejection.len(),
            table.len()
        );
        if rejection.is_empty() {
            log::warn!("No particle lies below the threshold");
        }

        let mut fallback = None;
        let outcome = match settings.objective {
            Objective::Inference => {
                let model = &self.models[0];
                let posterior = match settings.method {
                    Method::Regression => {
                        match adjust_parameters(&table, &observed_scaled, threshold) {
                            Ok(adjusted) => {
                                Posterior::new(model.name(), model.param_names(), adjusted)
                            }
                            Err(err) if err.is_recoverable() => {
                                log::warn!("Regression adjustment failed: {}", err);
                                fallback = Some(err.to_string());
                                Posterior::new(
                                    model.name(),
                                    model.param_names(),
                                    rejection.parameters(0),
                                )
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    Method::Mcmc => self.run_mcmc(
                        &generator,
                        &factors,
                        &observed_scaled,
                        threshold,
                        &rejection,
                    )?,
                    Method::Rejection | Method::Logistic => {
                        Posterior::new(model.name(), model.param_names(), rejection.parameters(0))
                    }
                };
                Outcome::Inference(posterior)
            }
            Objective::Comparison => {
                let names = self.models.iter().map(|m| m.name().to_string()).collect();
                let counts = rejection.acceptance_counts();
                let comparison = match settings.method {
                    Method::Logistic => match model_probabilities(
                        &table,
                        &observed_scaled,
                        threshold,
                        LogisticOptions::default(),
                    ) {
                        Ok(probabilities) => ModelComparison::new(names, counts, probabilities),
                        Err(err) if err.is_recoverable() => {
                            log::warn!("Logistic regression failed: {}", err);
                            fallback = Some(err.to_string());
                            ModelComparison::from_counts(names, counts)
                        }
                        Err(err) => return Err(err),
                    },
                    _ => ModelComparison::from_counts(names, counts),
                };
                Outcome::Comparison(comparison)
            }
        };

        let cross_validation = self.cross_validate(&table)?;

        let result = AbcResult {
            method: settings.method,
            fallback,
            threshold,
            particles: table.len(),
            accepted: rejection.len(),
            degenerate_dims: factors.degenerate().to_vec(),
            elapsed: start.elapsed(),
            outcome,
            cross_validation,
        };
        result.log_summary();
        if let Some(dir) = &settings.outputdir {
            result.save(dir)?;
        }
        Ok(result)
    }

    fn run_mcmc(
        &self,
        generator: &ParticleGenerator<'_>,
        factors: &ScalingFactors,
        observed_scaled: &[f64],
        threshold: f64,
        rejection: &Rejection<'_>,
    ) -> Result<Posterior> {
        let model = &self.models[0];
        let mcmc = self.settings.mcmc.as_ref().ok_or_else(|| {
            AbcError::Configuration("Method mcmc needs an [mcmc] section".to_string())
        })?;
        let (start, proposal) = mcmc.initialize(rejection, 0, model)?;
        let output = AbcMcmc::new(generator, factors, observed_scaled, threshold, self.settings.seed)
            .run(mcmc, start, &proposal, self.progress.as_ref())?;
        let chain = ChainStats {
            accepted: output.accepted,
            proposals: output.proposals,
            acceptance_rate: output.acceptance_rate(),
        };
        let mut posterior = Posterior::new(model.name(), model.param_names(), output.samples);
        posterior.chain = Some(chain);
        Ok(posterior)
    }

    fn cross_validate(&self, table: &ReferenceTable) -> Result<Option<Vec<f64>>> {
        let times = self.settings.cross_validation;
        if times == 0 {
            return Ok(None);
        }
        if self.settings.objective == Objective::Comparison {
            log::warn!("Cross validation is only available for inference");
            return Ok(None);
        }
        let errors = CrossValidation::new(
            table,
            &self.models,
            self.settings.threshold_policy(),
            self.settings.seed,
        )
        .prediction_error(times)?;
        Ok(Some(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        test_models::{effect_model, null_model, standardized_mean_difference},
        AbcRng, Parameters,
    };
    use std::collections::BTreeMap;

    fn model_test(d: f64) -> DataSource {
        DataSource::ModelTest {
            model: 0,
            parameters: BTreeMap::from([("d".to_string(), d)]),
        }
    }

    #[test]
    fn invalid_settings_fail_before_simulation() {
        let settings = Settings {
            objective: Objective::Comparison,
            ..Default::default()
        };
        let config = AbcConfig::new(settings, model_test(0.5), standardized_mean_difference)
            .model(effect_model(20));
        assert!(matches!(
            Abc::new(config),
            Err(AbcError::Configuration(_))
        ));
    }

    #[test]
    fn contract_is_checked_up_front() {
        // 30 rows observed, the model simulates 20
        let data = DataSource::Matrix(Dataset::from_fn(30, 2, |i, j| (i * (j + 1)) as f64));
        let config = AbcConfig::new(Settings::default(), data, standardized_mean_difference)
            .model(effect_model(20));
        assert!(matches!(
            Abc::new(config),
            Err(AbcError::SimulationContract { .. })
        ));
    }

    #[test]
    fn custom_distance_requires_metric() -> anyhow::Result<()> {
        let far = |_: &[f64], _: &[f64]| 1e6;
        let settings = Settings {
            simulations: 200,
            threshold: 1.,
            jobs: 2,
            ..Default::default()
        };
        // the euclidean metric ignores the custom distance
        let config = AbcConfig::new(settings.clone(), model_test(0.5), standardized_mean_difference)
            .model(effect_model(20))
            .distance(far);
        let result = Abc::new(config)?.run()?;
        assert!(result.accepted > 0);

        let settings = Settings {
            distance_metric: DistanceMetric::Custom,
            ..settings
        };
        let config = AbcConfig::new(settings.clone(), model_test(0.5), standardized_mean_difference)
            .model(effect_model(20))
            .distance(far);
        let result = Abc::new(config)?.run()?;
        assert_eq!(result.accepted, 0);

        // models added after the distance use it as well
        let config = AbcConfig::new(settings, model_test(0.5), standardized_mean_difference)
            .distance(far)
            .model(effect_model(20));
        let abc = Abc::new(config)?;
        assert!(abc.models().iter().all(Model::has_custom_distance));
        assert_eq!(abc.run()?.accepted, 0);
        Ok(())
    }

    fn duplicated_statistic(data: &Dataset) -> anyhow::Result<Vec<f64>> {
        let smd = standardized_mean_difference(data)?[0];
        Ok(vec![smd, smd])
    }

    #[test]
    fn rank_deficient_regression_falls_back_to_rejection() -> anyhow::Result<()> {
        let settings = Settings {
            method: Method::Regression,
            simulations: 500,
            keep: Some(50),
            jobs: 2,
            ..Default::default()
        };
        let config = AbcConfig::new(settings, model_test(0.5), duplicated_statistic)
            .model(effect_model(20));
        let result = Abc::new(config)?.run()?;
        assert!(result.fallback.is_some());
        let posterior = result.posterior().unwrap();
        assert_eq!(posterior.samples.nrows(), 50);
        assert_eq!(result.accepted, 50);
        Ok(())
    }

    #[test]
    fn failed_logistic_regression_falls_back_to_counts() -> anyhow::Result<()> {
        // nothing lies strictly within a zero threshold
        let settings = Settings {
            objective: Objective::Comparison,
            method: Method::Logistic,
            simulations: 200,
            threshold: 0.,
            jobs: 2,
            ..Default::default()
        };
        let config = AbcConfig::new(settings, model_test(0.5), standardized_mean_difference)
            .model(effect_model(20))
            .model(null_model(20));
        let result = Abc::new(config)?.run()?;
        assert!(result.fallback.is_some());
        assert_eq!(result.comparison().unwrap().accepted, vec![0, 0]);
        Ok(())
    }

    fn with_constant(data: &Dataset) -> anyhow::Result<Vec<f64>> {
        Ok(vec![standardized_mean_difference(data)?[0], 1.])
    }

    #[test]
    fn degenerate_scale_is_fatal_only_when_strict() -> anyhow::Result<()> {
        let settings = Settings {
            simulations: 200,
            keep: Some(20),
            jobs: 2,
            ..Default::default()
        };
        let config = AbcConfig::new(settings.clone(), model_test(0.5), with_constant)
            .model(effect_model(20));
        let result = Abc::new(config)?.run()?;
        assert_eq!(result.degenerate_dims, vec![1]);
        assert_eq!(result.accepted, 20);

        let strict = Settings {
            strict_scaling: true,
            ..settings
        };
        let config =
            AbcConfig::new(strict, model_test(0.5), with_constant).model(effect_model(20));
        let err = Abc::new(config)?.run().unwrap_err();
        assert!(matches!(err, AbcError::DegenerateScale { ref dims } if dims == &vec![1]));
        Ok(())
    }

    #[test]
    fn keeping_every_particle_with_cross_validation() -> anyhow::Result<()> {
        let settings = Settings {
            simulations: 200,
            keep: Some(200),
            jobs: 2,
            cross_validation: 5,
            ..Default::default()
        };
        let config = AbcConfig::new(settings, model_test(0.5), standardized_mean_difference)
            .model(effect_model(20));
        let result = Abc::new(config)?.run()?;
        assert_eq!(result.accepted, 200);
        assert_eq!(result.cross_validation.as_ref().map(Vec::len), Some(1));
        Ok(())
    }

    #[test]
    fn comparison_with_logistic() -> anyhow::Result<()> {
        let settings = Settings {
            objective: Objective::Comparison,
            method: Method::Logistic,
            simulations: 2000,
            percentile: 0.1,
            jobs: 2,
            ..Default::default()
        };
        let config = AbcConfig::new(settings, model_test(1.0), standardized_mean_difference)
            .model(effect_model(50))
            .model(null_model(50));
        let result = Abc::new(config)?.run()?;
        let comparison = result.comparison().unwrap();
        assert_eq!(comparison.probabilities.len(), 2);
        assert!((comparison.probabilities.iter().sum::<f64>() - 1.).abs() < 1e-8);
        // a standardized difference of about 1 is far from the null
        assert!(comparison.probabilities[0] > comparison.probabilities[1]);
        Ok(())
    }

    #[test]
    fn mcmc_inference() -> anyhow::Result<()> {
        let settings = Settings::from_toml_str(
            r#"
            method = "mcmc"
            simulations = 1000
            percentile = 0.05
            jobs = 2

            [mcmc]
            chain_length = 300
            burn = 50
            thin = 2
            "#,
        )?;
        let config = AbcConfig::new(settings, model_test(0.5), standardized_mean_difference)
            .model(effect_model(50));
        let result = Abc::new(config)?.run()?;
        let posterior = result.posterior().unwrap();
        assert_eq!(posterior.samples.nrows(), 125);
        let chain = posterior.chain.as_ref().unwrap();
        assert_eq!(chain.proposals, 299);
        assert!(chain.acceptance_rate <= 1.);
        Ok(())
    }

    #[test]
    fn results_are_saved() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = Settings {
            simulations: 300,
            keep: Some(30),
            jobs: 1,
            cross_validation: 10,
            outputdir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let config = AbcConfig::new(settings, model_test(0.5), standardized_mean_difference)
            .model(effect_model(20));
        let result = Abc::new(config)?.run()?;
        assert_eq!(result.accepted, 30);
        assert_eq!(result.cross_validation.as_ref().map(Vec::len), Some(1));
        assert!(dir.path().join("results.json").exists());
        Ok(())
    }

    #[test]
    fn failing_summary_of_observed_data() {
        let summary = |_: &Dataset| -> anyhow::Result<Vec<f64>> { anyhow::bail!("no") };
        let config = AbcConfig::new(Settings::default(), model_test(0.5), summary).model(
            Model::new(
                "m",
                vec![],
                |_: &Parameters<'_>, _: &mut AbcRng| -> anyhow::Result<Dataset> {
                    Ok(Dataset::zeros(3, 1))
                },
            )
            .unwrap(),
        );
        assert!(Abc::new(config).is_err());
    }
}
