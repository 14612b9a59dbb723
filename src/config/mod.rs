//! Configuration for the orchestrator
//!
//! Settings are stored as TOML. Without an explicit path the file lives in
//! the platform configuration directory:
//! - **Linux**: `~/.config/dev.hxyulin.pcg-dispatch/config.toml`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.pcg-dispatch/config.toml`
//! - **Windows**: `%APPDATA%\dev.hxyulin.pcg-dispatch\config.toml`
//!
//! # Example
//!
//! ```toml
//! memory_budget_fraction = 0.5
//! device_memory_bytes = 2147483648
//! grid_sizes = [400, 800, 1600, 3200, 6400, 12800]
//!
//! [scheduling]
//! execution_group = "EndOfFrame"
//! debug_name_prefix = "PCG"
//!
//! [debug]
//! visualize = false
//! inspect = true
//! max_snapshots = 64
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{PcgError, Result};
use crate::gpu::DeviceBudget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for configuration directories
pub const APP_ID: &str = "dev.hxyulin.pcg-dispatch";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default fraction of device memory one allocation may use
pub const DEFAULT_MEMORY_BUDGET_FRACTION: f64 = 0.5;

/// Default simulated device memory (2GB)
pub const DEFAULT_DEVICE_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default grid sizes, smallest first
pub const DEFAULT_GRID_SIZES: [u32; 6] = [400, 800, 1600, 3200, 6400, 12800];

// ==================== Config Directory ====================

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Orchestrator Config ====================

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fraction of device memory a single allocation may use
    pub memory_budget_fraction: f64,

    /// Memory of the simulated device
    pub device_memory_bytes: u64,

    /// Grid sizes a generation extent is rounded up to
    pub grid_sizes: Vec<u32>,

    pub scheduling: SchedulingSettings,

    pub debug: DebugSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            memory_budget_fraction: DEFAULT_MEMORY_BUDGET_FRACTION,
            device_memory_bytes: DEFAULT_DEVICE_MEMORY_BYTES,
            grid_sizes: DEFAULT_GRID_SIZES.to_vec(),
            scheduling: SchedulingSettings::default(),
            debug: DebugSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PcgError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            PcgError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the default location when `None`.
    ///
    /// A missing file or any error falls back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(path) => path,
            None => return Self::default(),
        };

        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Self::default();
        }

        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PcgError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PcgError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            PcgError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.memory_budget_fraction > 0.0 && self.memory_budget_fraction <= 1.0) {
            return Err(PcgError::Config(format!(
                "memory_budget_fraction must be in (0, 1], got {}",
                self.memory_budget_fraction
            )));
        }
        if self.device_memory_bytes == 0 {
            return Err(PcgError::Config("device_memory_bytes must be non-zero".to_string()));
        }
        if self.grid_sizes.is_empty() {
            return Err(PcgError::Config("grid_sizes must not be empty".to_string()));
        }
        if self.grid_sizes.contains(&0) {
            return Err(PcgError::Config("grid_sizes must be non-zero".to_string()));
        }
        if self.grid_sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PcgError::Config(format!(
                "grid_sizes must be strictly increasing, got {:?}",
                self.grid_sizes
            )));
        }
        Ok(())
    }

    /// Per-allocation budget of the simulated device
    pub fn budget(&self) -> DeviceBudget {
        DeviceBudget::new(self.device_memory_bytes, self.memory_budget_fraction)
    }
}

// ==================== Tests ====================
