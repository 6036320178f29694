//! Fit command implementation.
//!
//! Loads the image, builds the configured engine and runs the paced fit on
//! a blocking worker so Ctrl-C can stop it between steps.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use color_gmm_gpu::color::bin_position;
use color_gmm_gpu::fit::{fit, FitOutcome, MixtureModel};
use color_gmm_gpu::{
    ColorSpace, ExpectationMaximization, GpuContext, PackedCovariance, ReferenceEm, SourceImage,
};
use glam::Vec3;
use serde::Serialize;

use super::{hex_color, OutputFormat};
use crate::config::{Backend, Config};

pub struct FitArgs {
    pub image: PathBuf,
    pub output: Option<PathBuf>,
    pub format: OutputFormat,
    pub bins: Option<usize>,
}

/// Everything a fit reports, as printed in JSON mode.
#[derive(Debug, Serialize)]
pub struct FitReport {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub backend: &'static str,
    pub populated_bins: u32,
    pub iterations: u32,
    pub cancelled: bool,
    pub generation: u64,
    pub elapsed_ms: u64,
    pub clusters: Vec<ClusterReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bins: Option<Vec<BinReport>>,
}

#[derive(Debug, Serialize)]
pub struct ClusterReport {
    pub index: usize,
    pub mean: Vec3,
    pub hex: String,
    pub fraction: f32,
    pub covariance: PackedCovariance,
}

#[derive(Debug, Serialize)]
pub struct BinReport {
    pub index: u32,
    pub hex: String,
    pub count: u32,
    /// Cluster with the highest responsibility for this bin.
    pub cluster: Option<usize>,
    pub responsibility: f32,
}

/// Execute the fit command.
pub async fn execute(config: &Config, args: FitArgs) -> Result<()> {
    let fit_config = config.fit_config()?;
    let image = load_image(&args.image)?;

    let mut model: Box<dyn MixtureModel + Send> = match config.backend {
        Backend::Gpu => {
            let ctx = GpuContext::new()
                .await
                .context("Failed to create a GPU context (use `--backend cpu` to fit without one)")?;
            Box::new(ExpectationMaximization::new(Arc::new(ctx), fit_config.em)?)
        }
        Backend::Cpu => Box::new(ReferenceEm::new(fit_config.em)?),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let interrupt = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after the current step");
                cancel.store(true, Ordering::SeqCst);
            }
        })
    };

    let top_bins = args.bins;
    let started = Instant::now();
    let worker = tokio::task::spawn_blocking(move || -> Result<_> {
        let outcome = fit(&mut *model, &image, &fit_config, |report| {
            tracing::info!(
                "Step {}/{} (generation {})",
                report.iteration,
                report.iterations,
                report.snapshot.generation
            );
            if cancel.load(Ordering::SeqCst) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        let bins = top_bins
            .map(|n| bin_report(&*model, n, fit_config.color_space))
            .transpose()?;
        Ok((outcome, bins, image.width(), image.height()))
    });
    let result = worker.await.context("Fit worker panicked")?;
    interrupt.abort();
    let (outcome, bins, width, height) = result?;

    let report = build_report(&args.image, width, height, config.color_space, outcome, bins, started);

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text(&report),
    }

    if let Some(output) = &args.output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(output, json)
            .with_context(|| format!("Failed to write report to {}", output.display()))?;
        tracing::info!("Wrote report to {}", output.display());
    }

    Ok(())
}

/// Decode an image file into RGBA8.
pub fn load_image(path: &Path) -> Result<SourceImage> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .to_rgba8();
    let (width, height) = decoded.dimensions();
    tracing::debug!("Loaded {} ({}x{})", path.display(), width, height);
    SourceImage::from_rgba8(width, height, decoded.into_raw())
        .with_context(|| format!("Unusable image {}", path.display()))
}

/// The `n` most populated bins, each with its dominant cluster.
fn bin_report<M>(model: &M, n: usize, color_space: ColorSpace) -> Result<Vec<BinReport>>
where
    M: MixtureModel + ?Sized,
{
    let bins = model.populated_bins()?;
    let resps = model.responsibilities()?;

    let mut report: Vec<BinReport> = bins
        .iter()
        .enumerate()
        .map(|(i, bin)| {
            let best = resps.get(i).and_then(|r| {
                r.iter()
                    .copied()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(&b.1))
            });
            BinReport {
                index: bin.index,
                hex: hex_color(bin_position(bin.index), color_space),
                count: bin.count,
                cluster: best.map(|(c, _)| c),
                responsibility: best.map_or(0.0, |(_, r)| r),
            }
        })
        .collect();
    report.sort_by(|a, b| b.count.cmp(&a.count).then(a.index.cmp(&b.index)));
    report.truncate(n);
    Ok(report)
}

fn build_report(
    path: &Path,
    width: u32,
    height: u32,
    color_space: ColorSpace,
    outcome: FitOutcome,
    bins: Option<Vec<BinReport>>,
    started: Instant,
) -> FitReport {
    let snapshot = &outcome.snapshot;
    let clusters = snapshot
        .means
        .iter()
        .zip(&snapshot.covariances)
        .zip(&snapshot.fractions)
        .enumerate()
        .map(|(index, ((&mean, &covariance), &fraction))| ClusterReport {
            index,
            mean,
            hex: hex_color(mean, color_space),
            fraction,
            covariance,
        })
        .collect();

    FitReport {
        image: path.display().to_string(),
        width,
        height,
        color_space,
        backend: outcome.backend,
        populated_bins: outcome.populated_bins,
        iterations: outcome.iterations,
        cancelled: outcome.cancelled,
        generation: snapshot.generation,
        elapsed_ms: started.elapsed().as_millis() as u64,
        clusters,
        bins,
    }
}

fn print_text(report: &FitReport) {
    println!("Color GMM Fit");
    println!("{:-<60}", "");
    println!("Image:          {} ({}x{})", report.image, report.width, report.height);
    println!("Backend:        {}", report.backend);
    println!("Color space:    {}", report.color_space);
    println!("Populated bins: {}", report.populated_bins);
    println!(
        "Iterations:     {}{}",
        report.iterations,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    println!("Elapsed:        {} ms", report.elapsed_ms);
    println!();
    println!("{:>3}  {:<8}  {:>8}  {:>8}  {:>8}  {:>8}", "#", "color", "fraction", "var r", "var g", "var b");

    let mut order: Vec<&ClusterReport> = report.clusters.iter().collect();
    order.sort_by(|a, b| b.fraction.total_cmp(&a.fraction));
    for cluster in order {
        let [xx, yy, zz, _] = cluster.covariance.diag;
        println!(
            "{:>3}  {:<8}  {:>8.4}  {:>8.5}  {:>8.5}  {:>8.5}",
            cluster.index, cluster.hex, cluster.fraction, xx, yy, zz
        );
    }

    if let Some(bins) = &report.bins {
        println!();
        println!("{:>6}  {:<8}  {:>7}  {:>7}  {:>6}", "bin", "color", "pixels", "cluster", "resp");
        for bin in bins {
            let cluster = bin
                .cluster
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:>6}  {:<8}  {:>7}  {:>7}  {:>6.3}",
                bin.index, bin.hex, bin.count, cluster, bin.responsibility
            );
        }
    }
}
