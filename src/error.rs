use thiserror::Error;

/// Errors raised by the ABC engine.
///
/// User-supplied code (simulate, summary, distance) reports failures through
/// `anyhow::Error`; those are wrapped into [`AbcError::SimulationContract`]
/// together with the model name and particle index that triggered them.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AbcError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Could not resolve prior '{name}': {reason}")]
    PriorResolution { name: String, reason: String },

    #[error("Invalid parameter for prior '{name}': {reason}")]
    InvalidPriorParameter { name: String, reason: String },

    #[error("Model '{model}' violated its contract at particle {particle}: {source:#}")]
    SimulationContract {
        model: String,
        particle: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Model '{model}' exceeded the time limit of {limit:?} at particle {particle}")]
    SimulationTimeout {
        model: String,
        particle: usize,
        limit: std::time::Duration,
    },

    #[error("Summary statistic dimensions {dims:?} have zero median absolute deviation")]
    DegenerateScale { dims: Vec<usize> },

    #[error("Regression fit failed: {0}")]
    RegressionFit(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Could not serialize results")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AbcError>;

impl AbcError {
    pub(crate) fn contract(model: &str, particle: usize, source: anyhow::Error) -> Self {
        AbcError::SimulationContract {
            model: model.to_string(),
            particle,
            source,
        }
    }

    /// Fatal errors abort a run. Degenerate scales and regression failures
    /// are reported and recovered from by the orchestrator.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AbcError::DegenerateScale { .. } | AbcError::RegressionFit(_)
        )
    }
}
