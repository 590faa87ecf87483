//! Mean and scale of a normal sample with a hierarchical prior, estimated
//! with ABC-MCMC seeded from a rejection run.

use abc_rs::{Abc, AbcConfig, AbcRng, DataSource, Dataset, Model, Parameters, PriorSpec, Settings};
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

const N: usize = 200;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // sigma ~ InvGamma(4, 3), mu ~ Normal(0, sigma)
    #[derive(Deserialize)]
    struct Priors {
        prior: Vec<PriorSpec>,
    }
    let priors: Priors = toml::from_str(
        r#"
        [[prior]]
        name = "mu"
        dist = "normal"
        loc = 0.0
        scale = "sigma"

        [[prior]]
        name = "sigma"
        dist = "invgamma"
        shape = 4.0
        scale = 3.0
        "#,
    )?;

    let model = Model::new(
        "normal",
        priors.prior,
        |params: &Parameters<'_>, rng: &mut AbcRng| -> anyhow::Result<Dataset> {
            let dist = Normal::new(params.require("mu")?, params.require("sigma")?)?;
            Ok(Dataset::from_fn(N, 1, |_, _| dist.sample(rng)))
        },
    )?;
    let summary = |data: &Dataset| -> anyhow::Result<Vec<f64>> {
        let n = data.nrows() as f64;
        let mean = (0..data.nrows()).map(|i| data[(i, 0)]).sum::<f64>() / n;
        let var = (0..data.nrows())
            .map(|i| (data[(i, 0)] - mean).powi(2))
            .sum::<f64>()
            / n;
        Ok(vec![mean, var.sqrt()])
    };

    let settings = Settings::from_toml_str(
        r#"
        method = "mcmc"
        simulations = 10000
        keep = 200
        seed = 3

        [mcmc]
        chain_length = 5000
        burn = 500
        thin = 5
        kernel = "normal"
        "#,
    )?;
    let data = DataSource::ModelTest {
        model: 0,
        parameters: [("mu".to_string(), 1.5), ("sigma".to_string(), 2.0)].into(),
    };

    let result = Abc::new(AbcConfig::new(settings, data, summary).model(model))?.run()?;
    let posterior = result.posterior().expect("inference objective");
    for param in &posterior.summary {
        println!("{}: {:.3} +- {:.3}", param.name, param.mean, param.sd);
    }
    if let Some(chain) = &posterior.chain {
        println!("acceptance rate {:.3}", chain.acceptance_rate);
    }
    Ok(())
}
