//! Configuration (`lazylink.toml`)
//!
//! ```toml
//! [backend]
//! opt_level = "speed"
//! enable_verifier = true
//!
//! [tiering]
//! promotion_threshold = 8
//! dispatch_capacity = 4096
//! ```
//!
//! Every field is optional; missing ones take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::JitResult;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LazylinkConfig {
    /// Code generation settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Tiering and dispatch settings.
    #[serde(default)]
    pub tiering: TieringConfig,
}

impl LazylinkConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(source: &str) -> JitResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a configuration file
    pub fn from_path(path: impl AsRef<Path>) -> JitResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

/// Cranelift optimization level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// Value of the Cranelift `opt_level` setting
    #[must_use]
    pub const fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Code generation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackendConfig {
    /// Optimization level for stubs and translations.
    pub opt_level: OptLevel,

    /// Run the Cranelift IR verifier on every function.
    pub enable_verifier: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            enable_verifier: cfg!(debug_assertions),
        }
    }
}

/// Tiering and dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TieringConfig {
    /// Resolutions before a function is re-translated as optimized.
    pub promotion_threshold: u64,

    /// Number of entries in an indirect dispatch table.
    pub dispatch_capacity: usize,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: 8,
            dispatch_capacity: 4096,
        }
    }
}
