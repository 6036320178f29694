//! CLI configuration management.
//!
//! Values come from, in increasing precedence: built-in defaults, the config
//! file, environment variables (a `.env` file included) and finally the
//! command-line flags of the command being run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use color_gmm_gpu::fit::{FitConfig, MAX_FIT_CLUSTERS, MAX_ITERATIONS};
use color_gmm_gpu::{ColorSpace, EmSettings};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Overrides the directory holding `config.json`.
pub const CONFIG_DIR_ENV: &str = "CGMM_CONFIG_DIR";

/// Which engine runs the fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Gpu,
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Gpu => write!(f, "gpu"),
            Backend::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(Backend::Gpu),
            "cpu" | "reference" => Ok(Backend::Cpu),
            other => anyhow::bail!("Unknown backend: {}. Valid backends: gpu, cpu", other),
        }
    }
}

/// Application-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of mixture components.
    pub clusters: usize,

    /// Convergence steps per fit.
    pub iterations: u32,

    /// Pause between convergence steps, in milliseconds.
    pub step_delay_ms: u64,

    /// Interpretation of source pixel values.
    pub color_space: ColorSpace,

    pub backend: Backend,

    /// Numeric knobs of the EM iteration.
    pub em: EmSettings,
}

impl Default for Config {
    fn default() -> Self {
        let fit = FitConfig::default();
        Self {
            clusters: fit.num_clusters,
            iterations: fit.iterations,
            step_delay_ms: fit.step_delay_ms,
            color_space: fit.color_space,
            backend: Backend::default(),
            em: fit.em,
        }
    }
}

impl Config {
    /// Load configuration from the config file and environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if present (silently ignore if missing)
        let _ = dotenvy::dotenv();

        let mut config = match Self::config_file_path() {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config from {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            _ => Self::default(),
        };

        // Environment variables take precedence over the file
        if let Some(clusters) = env_value("CGMM_CLUSTERS")? {
            config.clusters = clusters;
        }
        if let Some(iterations) = env_value("CGMM_ITERATIONS")? {
            config.iterations = iterations;
        }
        if let Some(delay) = env_value("CGMM_STEP_DELAY_MS")? {
            config.step_delay_ms = delay;
        }
        if let Some(color_space) = env_value("CGMM_COLOR_SPACE")? {
            config.color_space = color_space;
        }
        if let Some(backend) = env_value("CGMM_BACKEND")? {
            config.backend = backend;
        }

        Ok(config)
    }

    /// Save current configuration to the config file.
    pub fn save(&self) -> Result<()> {
        if let Some(config_path) = Self::config_file_path() {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
            let contents = serde_json::to_string_pretty(self)?;
            std::fs::write(&config_path, contents)
                .with_context(|| format!("Failed to write config to {}", config_path.display()))?;
        }
        Ok(())
    }

    /// Get the path to the config file.
    pub fn config_file_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        ProjectDirs::from("dev", "color-gmm", "cgmm")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// The library-level fit configuration, validated.
    pub fn fit_config(&self) -> Result<FitConfig> {
        let fit = FitConfig {
            num_clusters: self.clusters,
            iterations: self.iterations,
            color_space: self.color_space,
            step_delay_ms: self.step_delay_ms,
            em: self.em,
        };
        fit.validate().with_context(|| {
            format!(
                "Invalid fit configuration (clusters 2..={}, iterations 1..={})",
                MAX_FIT_CLUSTERS, MAX_ITERATIONS
            )
        })?;
        Ok(fit)
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}
