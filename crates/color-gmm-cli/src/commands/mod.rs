//! CLI command implementations.

use std::str::FromStr;

use color_gmm_gpu::color::linear_to_srgb;
use color_gmm_gpu::ColorSpace;
use glam::Vec3;

pub mod config;
pub mod fit;
pub mod seeds;

/// How a command prints its result to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => anyhow::bail!("Unknown format: {}. Use 'text' or 'json'", s),
        }
    }
}

/// `#rrggbb` of a mixture-space color, re-encoded for display.
pub fn hex_color(color: Vec3, color_space: ColorSpace) -> String {
    let encoded = match color_space {
        ColorSpace::Srgb => Vec3::new(
            linear_to_srgb(color.x),
            linear_to_srgb(color.y),
            linear_to_srgb(color.z),
        ),
        ColorSpace::Linear => color,
    };
    let [r, g, b] = (encoded.clamp(Vec3::ZERO, Vec3::ONE) * 255.0)
        .round()
        .to_array()
        .map(|c| c as u8);
    format!("#{r:02x}{g:02x}{b:02x}")
}
