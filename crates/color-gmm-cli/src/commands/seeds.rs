//! Seeds command: the hue-spaced starting means of a fit.

use anyhow::Result;
use color_gmm_gpu::fit::{MAX_FIT_CLUSTERS, MIN_CLUSTERS};
use color_gmm_gpu::hue_seeds;

use super::OutputFormat;

pub fn execute(clusters: usize, format: OutputFormat) -> Result<()> {
    if !(MIN_CLUSTERS..=MAX_FIT_CLUSTERS).contains(&clusters) {
        anyhow::bail!(
            "Cluster count must be between {} and {}, got {}",
            MIN_CLUSTERS,
            MAX_FIT_CLUSTERS,
            clusters
        );
    }

    let seeds = hue_seeds(clusters);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&seeds)?),
        OutputFormat::Text => {
            for (i, seed) in seeds.iter().enumerate() {
                println!("{:>3}  {:.4} {:.4} {:.4}", i, seed.x, seed.y, seed.z);
            }
        }
    }
    Ok(())
}
