//! Config command implementation.
//!
//! Manages CLI configuration.

use anyhow::Result;

use crate::config::{Config, CONFIG_DIR_ENV};

const KEYS: &str =
    "clusters, iterations, step-delay-ms, color-space, backend, initial-variance, min-variance, min-weight";

/// Show current configuration.
pub fn show(config: &Config) -> Result<()> {
    println!("Color GMM CLI Configuration");
    println!("{:-<40}", "");

    println!("Clusters:          {}", config.clusters);
    println!("Iterations:        {}", config.iterations);
    println!("Step Delay:        {} ms", config.step_delay_ms);
    println!("Color Space:       {}", config.color_space);
    println!("Backend:           {}", config.backend);
    println!("Initial Variance:  {}", config.em.initial_variance);
    println!("Min Variance:      {}", config.em.min_variance);
    println!("Min Weight:        {}", config.em.min_weight);

    if let Some(config_path) = Config::config_file_path() {
        println!("\nConfig file: {}", config_path.display());
    }

    Ok(())
}

/// Set a configuration value.
pub fn set(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "clusters" | "k" => config.clusters = value.parse()?,
        "iterations" => config.iterations = value.parse()?,
        "step-delay-ms" | "step-delay" => config.step_delay_ms = value.parse()?,
        "color-space" => config.color_space = value.parse()?,
        "backend" => config.backend = value.parse()?,
        "initial-variance" => config.em.initial_variance = value.parse()?,
        "min-variance" => config.em.min_variance = value.parse()?,
        "min-weight" => config.em.min_weight = value.parse()?,
        _ => {
            anyhow::bail!("Unknown config key: {}. Valid keys: {}", key, KEYS);
        }
    }

    // Never persist a configuration a fit would reject
    config.fit_config()?;
    config.save()?;
    println!("Set {} to: {}", key, value);
    Ok(())
}

/// Get a configuration value.
pub fn get(config: &Config, key: &str) -> Result<()> {
    let value = match key {
        "clusters" | "k" => config.clusters.to_string(),
        "iterations" => config.iterations.to_string(),
        "step-delay-ms" | "step-delay" => config.step_delay_ms.to_string(),
        "color-space" => config.color_space.to_string(),
        "backend" => config.backend.to_string(),
        "initial-variance" => config.em.initial_variance.to_string(),
        "min-variance" => config.em.min_variance.to_string(),
        "min-weight" => config.em.min_weight.to_string(),
        "config-dir" => std::env::var(CONFIG_DIR_ENV).unwrap_or_else(|_| "(platform default)".to_string()),
        _ => {
            anyhow::bail!("Unknown config key: {}", key);
        }
    };

    println!("{}", value);
    Ok(())
}

/// Reset configuration to defaults.
pub fn reset() -> Result<()> {
    let config = Config::default();
    config.save()?;
    println!("Configuration reset to defaults");
    Ok(())
}
