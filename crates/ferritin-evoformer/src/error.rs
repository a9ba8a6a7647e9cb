use thiserror::Error;

/// Invalid hyperparameters, reported at construction time with the offending value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("dropout probability for `{name}` must lie in [0, 1], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },
    #[error("`{name}` must be greater than zero")]
    ZeroDimension { name: &'static str },
    #[error("`{name}` must be a positive finite number, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("axis `{axis}` of size {size} cannot be split across a parallel group of {group_size}")]
    IndivisibleShard {
        axis: &'static str,
        size: usize,
        group_size: usize,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to read config: {0}")]
    Io(String),
}

impl From<ConfigError> for candle_core::Error {
    fn from(err: ConfigError) -> Self {
        candle_core::Error::wrap(err)
    }
}
