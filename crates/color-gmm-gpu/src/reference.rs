//! CPU implementation of the same EM iteration.
//!
//! Mirrors the GPU kernels step for step (same quantization, same guarded
//! Cholesky, same dead-cluster policy) so the two backends can be compared
//! directly. Populated bins are kept in ascending voxel order, which makes
//! every run deterministic.

use glam::Vec3;

use crate::color::{bin_position, quantize, ColorSpace, SourceImage};
use crate::covariance::GuardedCholesky;
use crate::em::{BinCountListener, EmSettings, RunState};
use crate::fit::ClusterSnapshot;
use crate::{ColorBin, GmmError, PackedCovariance, Result, MAX_CLUSTERS, VOXEL_COUNT};

/// CPU Gaussian mixture fitting over a quantized color histogram.
pub struct ReferenceEm {
    settings: EmSettings,
    bins: Vec<ColorBin>,
    means: Vec<Vec3>,
    covariances: Vec<PackedCovariance>,
    fractions: Vec<f32>,
    /// `[bin][cluster]`, from the last E-step.
    responsibilities: Vec<Vec<f32>>,
    total_samples: u32,
    state: RunState,
    steps: u32,
    generation: u64,
    listeners: Vec<BinCountListener>,
}

impl ReferenceEm {
    pub fn new(settings: EmSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            bins: Vec::new(),
            means: Vec::new(),
            covariances: Vec::new(),
            fractions: Vec::new(),
            responsibilities: Vec::new(),
            total_samples: 0,
            state: RunState::Uninitialized,
            steps: 0,
            generation: 0,
            listeners: Vec::new(),
        })
    }

    /// Start a new run from `seeds` over `image`.
    pub fn initialize(
        &mut self,
        seeds: &[Vec3],
        image: &SourceImage,
        color_space: ColorSpace,
    ) -> Result<()> {
        if seeds.is_empty() || seeds.len() > MAX_CLUSTERS {
            return Err(GmmError::InvalidConfig(format!(
                "expected 1 to {MAX_CLUSTERS} seed means, got {}",
                seeds.len()
            )));
        }
        if seeds.iter().any(|s| !s.is_finite()) {
            return Err(GmmError::InvalidConfig("seed means must be finite".into()));
        }

        let k = seeds.len();
        self.bins = build_histogram(image, color_space);
        self.means = seeds.to_vec();
        self.covariances = vec![PackedCovariance::isotropic(self.settings.initial_variance); k];
        self.fractions = vec![1.0 / k as f32; k];
        self.responsibilities.clear();
        self.total_samples = image.sample_count();
        self.state = RunState::Ready;
        self.steps = 0;
        self.generation += 1;

        let count = self.bins.len() as u32;
        tracing::debug!("Reference run with {} clusters has {} populated bins", k, count);
        for listener in &self.listeners {
            listener(count);
        }
        Ok(())
    }

    /// Run one EM iteration.
    pub fn converge(&mut self) -> Result<()> {
        match self.state {
            RunState::Ready => {}
            RunState::Uninitialized => return Err(GmmError::NotInitialized),
            RunState::Failed => return Err(GmmError::RunFailed),
        }

        let k = self.means.len();
        let EmSettings {
            min_variance,
            min_weight,
            ..
        } = self.settings;

        let factors: Vec<_> = self
            .covariances
            .iter()
            .map(|cov| GuardedCholesky::new(cov, min_variance))
            .collect();

        // E-step with weighted partial sums.
        let mut weights = vec![0.0f32; k];
        let mut sums = vec![Vec3::ZERO; k];
        self.responsibilities = self
            .bins
            .iter()
            .map(|bin| {
                let x = bin_position(bin.index);
                let count = bin.count as f32;
                let resps = responsibilities(x, &self.means, &factors, &self.fractions);
                for (c, &r) in resps.iter().enumerate() {
                    weights[c] += r * count;
                    sums[c] += x * r * count;
                }
                resps
            })
            .collect();

        // Means and fractions; dead clusters keep their mean.
        let total = self.total_samples as f32;
        for c in 0..k {
            self.fractions[c] = weights[c] / total;
            if weights[c] > min_weight {
                self.means[c] = sums[c] / weights[c];
            }
        }

        // Covariances against the updated means.
        let mut scatter = vec![PackedCovariance::ZERO; k];
        for (bin, resps) in self.bins.iter().zip(&self.responsibilities) {
            let x = bin_position(bin.index);
            for c in 0..k {
                let w = resps[c] * bin.count as f32;
                scatter[c] = scatter[c].add(&PackedCovariance::outer_product(x - self.means[c], w));
            }
        }
        for c in 0..k {
            if weights[c] > min_weight {
                let mut cov = scatter[c].scale(1.0 / weights[c]);
                for v in &mut cov.diag[..3] {
                    *v = v.max(0.0);
                }
                self.covariances[c] = cov;
            }
        }

        self.steps += 1;
        self.generation += 1;
        Ok(())
    }

    /// Register `listener` for the populated-bin count of every future
    /// initialization. Fires synchronously at the end of `initialize`.
    pub fn subscribe_bin_count(&mut self, listener: impl Fn(u32) + Send + Sync + 'static) {
        self.listeners.push(std::sync::Arc::new(listener));
    }

    pub fn bin_count(&self) -> u32 {
        self.bins.len() as u32
    }

    pub fn populated_bins(&self) -> &[ColorBin] {
        &self.bins
    }

    /// `[bin][cluster]` responsibilities of the last E-step.
    pub fn responsibilities(&self) -> &[Vec<f32>] {
        &self.responsibilities
    }

    pub fn means(&self) -> &[Vec3] {
        &self.means
    }

    pub fn covariances(&self) -> &[PackedCovariance] {
        &self.covariances
    }

    pub fn fractions(&self) -> &[f32] {
        &self.fractions
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn num_clusters(&self) -> usize {
        self.means.len()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn snapshot(&self) -> Result<ClusterSnapshot> {
        if self.state == RunState::Uninitialized {
            return Err(GmmError::NotInitialized);
        }
        Ok(ClusterSnapshot {
            generation: self.generation,
            means: self.means.clone(),
            covariances: self.covariances.clone(),
            fractions: self.fractions.clone(),
        })
    }

    /// Drop the current run.
    pub fn release(&mut self) {
        self.bins.clear();
        self.means.clear();
        self.covariances.clear();
        self.fractions.clear();
        self.responsibilities.clear();
        self.total_samples = 0;
        self.steps = 0;
        self.state = RunState::Uninitialized;
    }
}

/// Quantize every pixel and keep the populated voxels in ascending order.
pub fn build_histogram(image: &SourceImage, color_space: ColorSpace) -> Vec<ColorBin> {
    let mut counts = vec![0u32; VOXEL_COUNT as usize];
    for &pixel in image.pixels() {
        counts[quantize(SourceImage::normalized(pixel, color_space)) as usize] += 1;
    }
    counts
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 0)
        .map(|(index, &count)| ColorBin {
            index: index as u32,
            count,
        })
        .collect()
}

/// Posterior over clusters for one position, evaluated in log space.
///
/// Clusters with a zero fraction get zero responsibility. If no cluster is
/// live the posterior is uniform.
fn responsibilities(x: Vec3, means: &[Vec3], factors: &[GuardedCholesky], fractions: &[f32]) -> Vec<f32> {
    let k = means.len();
    let log_probs: Vec<Option<f32>> = (0..k)
        .map(|c| {
            (fractions[c] > 0.0).then(|| factors[c].log_density(x, means[c]) + fractions[c].ln())
        })
        .collect();

    let max_log = log_probs
        .iter()
        .flatten()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    let probs: Vec<f32> = log_probs
        .iter()
        .map(|lp| lp.map_or(0.0, |lp| (lp - max_log).exp()))
        .collect();
    let total: f32 = probs.iter().sum();

    if total > 0.0 {
        probs.iter().map(|p| p / total).collect()
    } else {
        vec![1.0 / k as f32; k]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::hue_seeds;

    fn red_blue() -> SourceImage {
        SourceImage::from_rgb_pixels(2, 1, &[[255, 0, 0], [0, 0, 255]]).unwrap()
    }

    #[test]
    fn test_histogram_counts_every_pixel() {
        let image = SourceImage::from_rgb_pixels(3, 1, &[[255, 0, 0], [255, 0, 0], [0, 0, 255]]).unwrap();
        let bins = build_histogram(&image, ColorSpace::Srgb);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins.iter().map(|b| b.count).sum::<u32>(), 3);
        assert!(bins.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn test_responsibilities_skip_dead_clusters() {
        let means = [Vec3::ZERO, Vec3::ONE];
        let cov = PackedCovariance::isotropic(0.01);
        let factors = [GuardedCholesky::new(&cov, 1e-6); 2];
        let r = responsibilities(Vec3::ONE, &means, &factors, &[1.0, 0.0]);
        assert_eq!(r, vec![1.0, 0.0]);
        let r = responsibilities(Vec3::ONE, &means, &factors, &[0.0, 0.0]);
        assert_eq!(r, vec![0.5, 0.5]);
    }

    #[test]
    fn test_far_clusters_do_not_underflow() {
        // Density of a tight cluster far away is ~exp(-5000); log space keeps it finite.
        let means = [Vec3::ZERO, Vec3::ONE];
        let cov = PackedCovariance::isotropic(1e-4);
        let factors = [GuardedCholesky::new(&cov, 1e-6); 2];
        let r = responsibilities(Vec3::splat(0.4), &means, &factors, &[0.5, 0.5]);
        assert!(r.iter().all(|v| v.is_finite()));
        assert!((r.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(r[0] > 0.99);
    }

    #[test]
    fn test_converge_requires_initialization() {
        let mut em = ReferenceEm::new(EmSettings::default()).unwrap();
        assert!(matches!(em.converge(), Err(GmmError::NotInitialized)));
        assert!(em.snapshot().is_err());
    }

    #[test]
    fn test_red_blue_separates() {
        let mut em = ReferenceEm::new(EmSettings::default()).unwrap();
        let seeds = [Vec3::new(0.5, 0.25, 0.25), Vec3::new(0.25, 0.25, 0.5)];
        em.initialize(&seeds, &red_blue(), ColorSpace::Srgb).unwrap();
        assert_eq!(em.bin_count(), 2);
        em.converge().unwrap();

        assert!((em.means()[0] - Vec3::X).length() < 1e-3);
        assert!((em.means()[1] - Vec3::Z).length() < 1e-3);
        for f in em.fractions() {
            assert!((f - 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn test_release_discards_run() {
        let mut em = ReferenceEm::new(EmSettings::default()).unwrap();
        em.initialize(&hue_seeds(4), &red_blue(), ColorSpace::Linear).unwrap();
        let generation = em.generation();
        em.release();
        assert_eq!(em.state(), RunState::Uninitialized);
        assert!(matches!(em.converge(), Err(GmmError::NotInitialized)));
        assert_eq!(em.generation(), generation);
    }
}
