//! Hyperparameters for the Evoformer stack and Invariant Point Attention.
//!
//! Defaults follow the AlphaFold2 / OpenFold model configuration.
use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn check_probability(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidProbability { name, value })
    }
}

fn check_nonzero(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::ZeroDimension { name })
    } else {
        Ok(())
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvoformerBlockConfig {
    /// MSA representation channels.
    pub c_m: usize,
    /// Pair representation channels.
    pub c_z: usize,
    pub c_hidden_msa_att: usize,
    pub c_hidden_opm: usize,
    pub c_hidden_tri_mul: usize,
    pub c_hidden_tri_att: usize,
    pub num_heads_msa: usize,
    pub num_heads_tri: usize,
    /// Channel multiplier in the transition layers.
    pub transition_n: usize,
    pub msa_dropout: f64,
    pub pair_dropout: f64,
    /// Safe infinity used for masking logits.
    pub inf: f64,
    pub eps_opm: f64,
}

impl Default for EvoformerBlockConfig {
    fn default() -> Self {
        Self {
            c_m: 256,
            c_z: 128,
            c_hidden_msa_att: 32,
            c_hidden_opm: 32,
            c_hidden_tri_mul: 128,
            c_hidden_tri_att: 32,
            num_heads_msa: 8,
            num_heads_tri: 4,
            transition_n: 4,
            msa_dropout: 0.15,
            pair_dropout: 0.25,
            inf: 1e9,
            eps_opm: 1e-3,
        }
    }
}

impl EvoformerBlockConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("c_m", self.c_m)?;
        check_nonzero("c_z", self.c_z)?;
        check_nonzero("c_hidden_msa_att", self.c_hidden_msa_att)?;
        check_nonzero("c_hidden_opm", self.c_hidden_opm)?;
        check_nonzero("c_hidden_tri_mul", self.c_hidden_tri_mul)?;
        check_nonzero("c_hidden_tri_att", self.c_hidden_tri_att)?;
        check_nonzero("num_heads_msa", self.num_heads_msa)?;
        check_nonzero("num_heads_tri", self.num_heads_tri)?;
        check_nonzero("transition_n", self.transition_n)?;
        check_probability("msa_dropout", self.msa_dropout)?;
        check_probability("pair_dropout", self.pair_dropout)?;
        check_positive("inf", self.inf)?;
        check_positive("eps_opm", self.eps_opm)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvoformerStackConfig {
    #[serde(flatten)]
    pub block: EvoformerBlockConfig,
    /// Single representation channels.
    pub c_s: usize,
    pub num_blocks: usize,
}

impl Default for EvoformerStackConfig {
    fn default() -> Self {
        Self {
            block: EvoformerBlockConfig::default(),
            c_s: 384,
            num_blocks: 48,
        }
    }
}

impl EvoformerStackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.block.validate()?;
        check_nonzero("c_s", self.c_s)?;
        check_nonzero("num_blocks", self.num_blocks)?;
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpaConfig {
    pub c_s: usize,
    pub c_z: usize,
    pub c_hidden: usize,
    pub num_heads: usize,
    pub num_qk_points: usize,
    pub num_v_points: usize,
    pub inf: f64,
    pub eps: f64,
}

impl Default for IpaConfig {
    fn default() -> Self {
        Self {
            c_s: 384,
            c_z: 128,
            c_hidden: 16,
            num_heads: 12,
            num_qk_points: 4,
            num_v_points: 8,
            inf: 1e5,
            eps: 1e-8,
        }
    }
}

impl IpaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("c_s", self.c_s)?;
        check_nonzero("c_z", self.c_z)?;
        check_nonzero("c_hidden", self.c_hidden)?;
        check_nonzero("num_heads", self.num_heads)?;
        check_nonzero("num_qk_points", self.num_qk_points)?;
        check_nonzero("num_v_points", self.num_v_points)?;
        check_positive("inf", self.inf)?;
        check_positive("eps", self.eps)?;
        Ok(())
    }

    /// Width of the concatenated per-head outputs fed to the output projection.
    pub fn concat_out_dim(&self) -> usize {
        self.num_heads * (self.c_z + self.c_hidden + self.num_v_points * 4)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

/// Switch for the fused kernel paths (see [`crate::utils::fusion`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub enabled: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
