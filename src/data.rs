//! Observed data: loaded from a delimited file, simulated from a model at
//! fixed parameters or passed in directly.

use std::{collections::BTreeMap, path::PathBuf};

use faer::Mat;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AbcError, Result},
    model::{Dataset, Model},
    particle::{particle_rng, OBSERVED_STREAM},
};

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DataSource {
    /// A numeric delimited text file, one observation per line.
    File {
        path: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default)]
        header: bool,
    },
    /// Pseudo-observed data simulated from `model` at fixed parameters.
    ModelTest {
        model: usize,
        parameters: BTreeMap<String, f64>,
    },
    #[serde(skip)]
    Matrix(Dataset),
}

impl DataSource {
    pub fn load(&self, models: &[Model], seed: u64) -> Result<Dataset> {
        let data = match self {
            DataSource::File {
                path,
                delimiter,
                header,
            } => {
                let text = std::fs::read_to_string(path)?;
                parse_delimited(&text, *delimiter, *header).map_err(|err| match err {
                    AbcError::Configuration(msg) => {
                        AbcError::Configuration(format!("{}: {}", path.display(), msg))
                    }
                    other => other,
                })?
            }
            DataSource::ModelTest { model, parameters } => {
                let Some(model) = models.get(*model) else {
                    return Err(AbcError::Configuration(format!(
                        "Model test refers to model {} but there are only {} models",
                        model,
                        models.len()
                    )));
                };
                if let Some(name) = model
                    .param_names()
                    .iter()
                    .find(|name| !parameters.contains_key(*name))
                {
                    return Err(AbcError::Configuration(format!(
                        "Model test needs a value for parameter '{}' of model '{}'",
                        name,
                        model.name()
                    )));
                }
                let fixed = parameters
                    .iter()
                    .map(|(name, val)| (name.clone(), *val))
                    .collect_vec();
                let mut rng = particle_rng(seed, OBSERVED_STREAM);
                model.simulate_named(&fixed, &mut rng).map_err(|err| {
                    AbcError::Configuration(format!(
                        "Simulating observed data from model '{}' failed: {:#}",
                        model.name(),
                        err
                    ))
                })?
            }
            DataSource::Matrix(data) => data.clone(),
        };
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(AbcError::Configuration(
                "The observed dataset is empty".to_string(),
            ));
        }
        log::debug!(
            "Observed data has {} rows and {} columns",
            data.nrows(),
            data.ncols()
        );
        Ok(data)
    }
}

/// Parse numeric delimited text. A whitespace delimiter splits on any run of
/// whitespace. Blank lines are skipped.
pub fn parse_delimited(text: &str, delimiter: char, header: bool) -> Result<Dataset> {
    if !delimiter.is_ascii() {
        return Err(AbcError::Configuration(format!(
            "delimiter '{}' is not an ASCII character",
            delimiter
        )));
    }
    let collapsed;
    let (text, delimiter) = if delimiter.is_ascii_whitespace() {
        collapsed = text
            .lines()
            .map(|line| line.split_whitespace().join(" "))
            .join("\n");
        (collapsed.as_str(), b' ')
    } else {
        (text, delimiter as u8)
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(header)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| {
            AbcError::Configuration(format!("malformed delimited data: {}", err))
        })?;
        let line = record.position().map_or(0, |pos| pos.line());
        let row = record
            .iter()
            .map(|field| {
                field.parse::<f64>().map_err(|_| {
                    AbcError::Configuration(format!("line {}: '{}' is not a number", line, field))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        rows.push(row);
    }

    let ncols = rows.first().map_or(0, Vec::len);
    Ok(Mat::from_fn(rows.len(), ncols, |i, j| rows[i][j]))
}
