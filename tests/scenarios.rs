use std::collections::BTreeMap;

use abc_rs::{
    Abc, AbcConfig, AbcRng, DataSource, Dataset, Dist, Method, Model, Objective, Parameters,
    PriorGraph, PriorSpec, Settings,
};
use anyhow::Result;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const N: usize = 100;

fn two_sample(d: f64, rng: &mut AbcRng) -> Result<Dataset> {
    let first = Normal::new(0., 1.)?;
    let second = Normal::new(d, 1.)?;
    let values: Vec<(f64, f64)> = (0..N)
        .map(|_| (first.sample(rng), second.sample(rng)))
        .collect();
    Ok(Dataset::from_fn(N, 2, |i, j| {
        if j == 0 {
            values[i].0
        } else {
            values[i].1
        }
    }))
}

fn moments(data: &Dataset, col: usize) -> (f64, f64) {
    let n = data.nrows() as f64;
    let mean = (0..data.nrows()).map(|i| data[(i, col)]).sum::<f64>() / n;
    let var = (0..data.nrows())
        .map(|i| (data[(i, col)] - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

fn standardized_mean_difference(data: &Dataset) -> Result<Vec<f64>> {
    let (m0, s0) = moments(data, 0);
    let (m1, s1) = moments(data, 1);
    Ok(vec![(m1 - m0) / ((s0 + s1) / 2.)])
}

fn effect_model() -> Result<Model> {
    Ok(Model::new(
        "effect",
        vec![PriorSpec::new(
            "d",
            Dist::Cauchy {
                loc: 0f64.into(),
                scale: 0.7f64.into(),
            },
        )],
        |params: &Parameters<'_>, rng: &mut AbcRng| two_sample(params.require("d")?, rng),
    )?)
}

fn null_model() -> Result<Model> {
    Ok(Model::new(
        "null",
        vec![],
        |_: &Parameters<'_>, rng: &mut AbcRng| two_sample(0., rng),
    )?)
}

/// Two samples whose standardized mean difference is exactly `d`.
fn observed(d: f64) -> Result<Dataset> {
    let mut rng = AbcRng::seed_from_u64(1234);
    let base = two_sample(0., &mut rng)?;
    let (_, sd) = moments(&base, 0);
    Ok(Dataset::from_fn(N, 2, |i, j| {
        base[(i, 0)] + if j == 1 { d * sd } else { 0. }
    }))
}

#[test]
fn comparison_recovers_bayes_factor() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let settings = Settings {
        objective: Objective::Comparison,
        method: Method::Rejection,
        simulations: 10_000,
        percentile: 0.05,
        seed: 7,
        ..Default::default()
    };
    let config = AbcConfig::new(
        settings,
        DataSource::Matrix(observed(0.)?),
        standardized_mean_difference,
    )
    .model(effect_model()?)
    .model(null_model()?);
    let result = Abc::new(config)?.run()?;
    let comparison = result.comparison().expect("comparison result");

    assert_eq!(result.particles, 10_000);
    assert!(comparison.accepted.iter().all(|&count| count > 0));
    // With a standard error of sqrt(2 / 100) for the statistic, the null is
    // favoured by roughly N(0; 0, 0.141) / Cauchy(0; 0, 0.7) = 6.2.
    let bf01 = comparison.bayes_factors[(1, 0)];
    assert!((3. ..12.).contains(&bf01), "bf01 = {}", bf01);
    assert!((comparison.bayes_factors[(0, 1)] * bf01 - 1.).abs() < 1e-12);
    Ok(())
}

fn inference(seed: u64, method: Method, keep: usize, obs: &Dataset) -> Result<f64> {
    let settings = Settings {
        method,
        simulations: 10_000,
        keep: Some(keep),
        seed,
        ..Default::default()
    };
    let config = AbcConfig::new(
        settings,
        DataSource::Matrix(obs.clone()),
        standardized_mean_difference,
    )
    .model(effect_model()?);
    let result = Abc::new(config)?.run()?;
    assert!(result.fallback.is_none());
    let posterior = result.posterior().expect("posterior");
    Ok(posterior.summary[0].mean)
}

#[test]
fn regression_adjustment_reduces_error() -> Result<()> {
    let obs = observed(0.5)?;

    // Tight acceptance: both estimates land near the truth.
    for method in [Method::Rejection, Method::Regression] {
        let mean = inference(3, method, 100, &obs)?;
        assert!((mean - 0.5).abs() < 0.1, "{:?}: {}", method, mean);
    }

    // Wide acceptance: the window bias of rejection dominates and the
    // regression removes it.
    let mut sq_rejection = 0.;
    let mut sq_adjusted = 0.;
    for seed in 0..4 {
        sq_rejection += (inference(seed, Method::Rejection, 2000, &obs)? - 0.5).powi(2);
        sq_adjusted += (inference(seed, Method::Regression, 2000, &obs)? - 0.5).powi(2);
    }
    assert!(
        sq_adjusted < sq_rejection,
        "adjusted {} rejection {}",
        sq_adjusted,
        sq_rejection
    );
    Ok(())
}

#[test]
fn model_test_data_source() -> Result<()> {
    let settings = Settings {
        simulations: 2000,
        keep: Some(100),
        ..Default::default()
    };
    let data = DataSource::ModelTest {
        model: 0,
        parameters: BTreeMap::from([("d".to_string(), 0.5)]),
    };
    let config =
        AbcConfig::new(settings, data, standardized_mean_difference).model(effect_model()?);
    let abc = Abc::new(config)?;
    assert_eq!(abc.observed().nrows(), N);
    let result = abc.run()?;
    assert_eq!(result.accepted, 100);
    Ok(())
}

#[test]
fn hierarchical_prior_scale_follows_draw() -> Result<()> {
    // mu is declared first but depends on sigma
    let specs = vec![
        PriorSpec::new(
            "mu",
            Dist::Normal {
                loc: 0f64.into(),
                scale: "sigma".into(),
            },
        ),
        PriorSpec::new(
            "sigma",
            Dist::InvGamma {
                shape: 4f64.into(),
                scale: 3f64.into(),
            },
        ),
    ];
    let graph = PriorGraph::new(&specs)?;
    assert_eq!(graph.sampling_order().collect::<Vec<_>>(), vec!["sigma", "mu"]);
    assert_eq!(graph.names().collect::<Vec<_>>(), vec!["mu", "sigma"]);

    let mut rng = AbcRng::seed_from_u64(5);
    let n = 50_000;
    let mut standardized = Vec::with_capacity(n);
    let mut raw = Vec::with_capacity(n);
    for _ in 0..n {
        let draw = graph.draw(&mut rng)?;
        assert!(draw[1] > 0.);
        standardized.push(draw[0] / draw[1]);
        raw.push(draw[0]);
    }
    let var = |xs: &[f64]| {
        let m = xs.iter().sum::<f64>() / xs.len() as f64;
        xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64
    };
    // mu / sigma is standard normal if every mu uses its own sigma
    assert!((var(&standardized) - 1.).abs() < 0.05);
    // E[sigma^2] = 3^2 / ((4 - 1) * (4 - 2)) = 1.5
    assert!((var(&raw) - 1.5).abs() < 0.15);

    // joint density uses the sigma of the same vector
    let narrow = graph.log_density(&[0.1, 0.1]);
    let wide = graph.log_density(&[0.1, 10.]);
    assert!(narrow.is_finite() && wide.is_finite());
    assert_eq!(graph.log_density(&[0.1, -1.]), f64::NEG_INFINITY);
    Ok(())
}
