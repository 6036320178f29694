//! Host-side orchestration shared by both engines.
//!
//! A fit initializes the model, waits for the populated-bin count, then
//! runs a paced number of convergence steps. The step callback can stop the
//! run between steps; cluster state is whatever the last completed step
//! produced.

use std::ops::ControlFlow;
use std::time::Duration;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::color::{hue_seeds, ColorSpace, SourceImage};
use crate::em::{EmSettings, ExpectationMaximization};
use crate::reference::ReferenceEm;
use crate::{CholeskyFactor, ColorBin, GmmError, PackedCovariance, Result};

/// Fewest clusters a host fit accepts.
pub const MIN_CLUSTERS: usize = 2;
/// Most clusters a host fit accepts.
pub const MAX_FIT_CLUSTERS: usize = crate::MAX_CLUSTERS;
/// Fewest iterations a host fit accepts.
pub const MIN_ITERATIONS: u32 = 1;
/// Most iterations a host fit accepts.
pub const MAX_ITERATIONS: u32 = 64;

/// Configuration of one fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Number of mixture components (K).
    pub num_clusters: usize,
    /// Convergence steps to run.
    pub iterations: u32,
    /// How source pixels are interpreted.
    pub color_space: ColorSpace,
    /// Pause between convergence steps, in milliseconds.
    pub step_delay_ms: u64,
    /// Numeric knobs of the iteration.
    pub em: EmSettings,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            num_clusters: 8,
            iterations: 16,
            color_space: ColorSpace::Srgb,
            step_delay_ms: 0,
            em: EmSettings::default(),
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CLUSTERS..=MAX_FIT_CLUSTERS).contains(&self.num_clusters) {
            return Err(GmmError::InvalidConfig(format!(
                "cluster count must be between {MIN_CLUSTERS} and {MAX_FIT_CLUSTERS}, got {}",
                self.num_clusters
            )));
        }
        self.validate_steps()
    }

    /// Bounds that hold whatever the cluster count: the iteration count and
    /// the numeric settings.
    pub fn validate_steps(&self) -> Result<()> {
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&self.iterations) {
            return Err(GmmError::InvalidConfig(format!(
                "iteration count must be between {MIN_ITERATIONS} and {MAX_ITERATIONS}, got {}",
                self.iterations
            )));
        }
        self.em.validate()
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// Cluster state at one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub generation: u64,
    pub means: Vec<Vec3>,
    pub covariances: Vec<PackedCovariance>,
    pub fractions: Vec<f32>,
}

/// Cheap change key for observers of a run: differs whenever the cluster
/// count or the generation differs.
pub fn visualization_key(num_clusters: usize, generation: u64) -> u64 {
    (num_clusters as u64).wrapping_mul(397) ^ generation
}

impl ClusterSnapshot {
    pub fn num_clusters(&self) -> usize {
        self.means.len()
    }

    pub fn visualization_key(&self) -> u64 {
        visualization_key(self.num_clusters(), self.generation)
    }

    pub fn fraction_sum(&self) -> f32 {
        self.fractions.iter().sum()
    }

    /// Whether every mean, covariance and fraction is finite.
    pub fn is_finite(&self) -> bool {
        self.means.iter().all(|m| m.is_finite())
            && self.covariances.iter().all(PackedCovariance::is_finite)
            && self.fractions.iter().all(|f| f.is_finite())
    }

    /// Clusters whose fraction is at or below `min_fraction`.
    pub fn dead_clusters(&self, min_fraction: f32) -> Vec<usize> {
        self.fractions
            .iter()
            .enumerate()
            .filter(|(_, &f)| f <= min_fraction)
            .map(|(c, _)| c)
            .collect()
    }

    /// Strict Cholesky factors computed on the host.
    pub fn factors(&self) -> Vec<CholeskyFactor> {
        self.covariances.iter().map(PackedCovariance::decompose).collect()
    }
}

/// Progress of a fit after one convergence step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 1-based step number.
    pub iteration: u32,
    pub iterations: u32,
    pub populated_bins: u32,
    pub snapshot: ClusterSnapshot,
}

/// Final state of a fit.
#[derive(Debug, Clone, Serialize)]
pub struct FitOutcome {
    pub backend: &'static str,
    pub populated_bins: u32,
    /// Convergence steps that completed.
    pub iterations: u32,
    /// Whether the step callback stopped the fit early.
    pub cancelled: bool,
    pub snapshot: ClusterSnapshot,
}

/// Common surface of the GPU and CPU engines.
pub trait MixtureModel {
    fn backend(&self) -> &'static str;

    fn initialize(&mut self, seeds: &[Vec3], image: &SourceImage, color_space: ColorSpace) -> Result<()>;

    fn converge(&mut self) -> Result<()>;

    /// Block until the populated-bin count of the current run is known.
    fn wait_for_bin_count(&self) -> Result<u32>;

    fn generation(&self) -> u64;

    fn num_clusters(&self) -> usize;

    fn snapshot(&self) -> Result<ClusterSnapshot>;

    fn populated_bins(&self) -> Result<Vec<ColorBin>>;

    /// `[bin][cluster]`, aligned with [`MixtureModel::populated_bins`].
    fn responsibilities(&self) -> Result<Vec<Vec<f32>>>;
}

impl MixtureModel for ExpectationMaximization {
    fn backend(&self) -> &'static str {
        "gpu"
    }

    fn initialize(&mut self, seeds: &[Vec3], image: &SourceImage, color_space: ColorSpace) -> Result<()> {
        ExpectationMaximization::initialize(self, seeds, image, color_space)
    }

    fn converge(&mut self) -> Result<()> {
        ExpectationMaximization::converge(self)
    }

    fn wait_for_bin_count(&self) -> Result<u32> {
        ExpectationMaximization::wait_for_bin_count(self)
    }

    fn generation(&self) -> u64 {
        ExpectationMaximization::generation(self)
    }

    fn num_clusters(&self) -> usize {
        ExpectationMaximization::num_clusters(self)
    }

    fn snapshot(&self) -> Result<ClusterSnapshot> {
        self.read_clusters()
    }

    fn populated_bins(&self) -> Result<Vec<ColorBin>> {
        self.read_populated_bins()
    }

    fn responsibilities(&self) -> Result<Vec<Vec<f32>>> {
        self.read_responsibilities()
    }
}

impl MixtureModel for ReferenceEm {
    fn backend(&self) -> &'static str {
        "cpu"
    }

    fn initialize(&mut self, seeds: &[Vec3], image: &SourceImage, color_space: ColorSpace) -> Result<()> {
        ReferenceEm::initialize(self, seeds, image, color_space)
    }

    fn converge(&mut self) -> Result<()> {
        ReferenceEm::converge(self)
    }

    fn wait_for_bin_count(&self) -> Result<u32> {
        Ok(self.bin_count())
    }

    fn generation(&self) -> u64 {
        ReferenceEm::generation(self)
    }

    fn num_clusters(&self) -> usize {
        ReferenceEm::num_clusters(self)
    }

    fn snapshot(&self) -> Result<ClusterSnapshot> {
        ReferenceEm::snapshot(self)
    }

    fn populated_bins(&self) -> Result<Vec<ColorBin>> {
        Ok(ReferenceEm::populated_bins(self).to_vec())
    }

    fn responsibilities(&self) -> Result<Vec<Vec<f32>>> {
        Ok(ReferenceEm::responsibilities(self).to_vec())
    }
}

/// Fit `model` to `image` starting from evenly spaced hues.
pub fn fit<M>(
    model: &mut M,
    image: &SourceImage,
    config: &FitConfig,
    on_step: impl FnMut(&StepReport) -> ControlFlow<()>,
) -> Result<FitOutcome>
where
    M: MixtureModel + ?Sized,
{
    config.validate()?;
    let seeds = hue_seeds(config.num_clusters);
    fit_with_seeds(model, &seeds, image, config, on_step)
}

/// Fit `model` to `image` starting from `seeds`.
///
/// `config.num_clusters` is ignored in favor of `seeds.len()`, which the
/// model validates.
pub fn fit_with_seeds<M>(
    model: &mut M,
    seeds: &[Vec3],
    image: &SourceImage,
    config: &FitConfig,
    mut on_step: impl FnMut(&StepReport) -> ControlFlow<()>,
) -> Result<FitOutcome>
where
    M: MixtureModel + ?Sized,
{
    config.validate_steps()?;
    model.initialize(seeds, image, config.color_space)?;
    let populated_bins = model.wait_for_bin_count()?;
    tracing::info!(
        "Fitting {} clusters to {} populated bins on {}",
        seeds.len(),
        populated_bins,
        model.backend()
    );

    let mut completed = 0;
    let mut cancelled = false;
    for iteration in 1..=config.iterations {
        if iteration > 1 && config.step_delay_ms > 0 {
            std::thread::sleep(config.step_delay());
        }

        model.converge()?;
        completed = iteration;

        let report = StepReport {
            iteration,
            iterations: config.iterations,
            populated_bins,
            snapshot: model.snapshot()?,
        };
        if on_step(&report).is_break() {
            tracing::info!("Fit stopped after {} of {} steps", iteration, config.iterations);
            cancelled = true;
            break;
        }
    }

    let snapshot = model.snapshot()?;
    warn_on_degenerate(&snapshot, populated_bins);

    Ok(FitOutcome {
        backend: model.backend(),
        populated_bins,
        iterations: completed,
        cancelled,
        snapshot,
    })
}

fn warn_on_degenerate(snapshot: &ClusterSnapshot, populated_bins: u32) {
    if !snapshot.is_finite() {
        tracing::warn!("Fitted mixture contains non-finite values");
    }
    let dead = snapshot.dead_clusters(0.0);
    if !dead.is_empty() {
        tracing::warn!(
            "Clusters {:?} received no weight ({} populated bins)",
            dead,
            populated_bins
        );
    }
}
