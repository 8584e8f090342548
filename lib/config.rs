//! Per-train settings for compression and propagation.

use std::{ fmt, str::FromStr };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::rk::PropMethod;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Returned when setting an unrecognized compression method.
    #[error("invalid compress method '{0}': expected one of 'svd', 'variational'")]
    InvalidCompressMethod(String),

    /// Returned when setting an unrecognized propagation method.
    #[error("invalid propagation method: {0}")]
    InvalidPropMethod(#[from] crate::rk::RkError),

    /// Returned when setting a negative or non-finite truncation threshold.
    #[error("invalid truncation threshold {0}: must be finite and non-negative")]
    InvalidThreshold(f64),
}
use ConfigError::*;
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Methods available to reduce bond dimension.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressMethod {
    /// Truncated SVD sweep.
    #[default]
    Svd,
    /// Variational fitting. Accepted as a setting only; compression with this
    /// method is rejected.
    Variational,
}

impl CompressMethod {
    /// Return the name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Svd => "svd",
            Self::Variational => "variational",
        }
    }
}

impl fmt::Display for CompressMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CompressMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "svd" => Ok(Self::Svd),
            "variational" => Ok(Self::Variational),
            _ => Err(InvalidCompressMethod(s.to_string())),
        }
    }
}

/// Compression and propagation settings carried by every tensor train.
///
/// `threshold` is a relative singular-value cutoff. Values `>= 1` would be
/// interpreted as a number of kept states, which is not supported; they pass
/// [`Self::set_threshold`] but are rejected when compressing.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub threshold: f64,
    pub compress_method: CompressMethod,
    pub prop_method: PropMethod,
    /// Canonicalize and compress immediately after every addition.
    pub compress_add: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            threshold: 1e-3,
            compress_method: CompressMethod::Svd,
            prop_method: PropMethod::CRk4,
            compress_add: false,
        }
    }
}

impl TrainConfig {
    /// Set the compression method by name.
    pub fn set_compress_method(&mut self, name: &str) -> ConfigResult<&mut Self> {
        self.compress_method = name.parse()?;
        Ok(self)
    }

    /// Set the propagation method by name.
    pub fn set_prop_method(&mut self, name: &str) -> ConfigResult<&mut Self> {
        self.prop_method = name.parse()?;
        Ok(self)
    }

    /// Set the truncation threshold.
    pub fn set_threshold(&mut self, threshold: f64) -> ConfigResult<&mut Self> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(InvalidThreshold(threshold));
        }
        self.threshold = threshold;
        Ok(self)
    }
}
