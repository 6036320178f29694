//! GPU expectation-maximization engine.
//!
//! One [`ExpectationMaximization`] owns every device buffer of a fitting
//! run. A run starts with [`ExpectationMaximization::initialize`] and
//! advances one EM iteration per [`ExpectationMaximization::converge`].
//! Re-initializing replaces the run entirely.

mod converge;
mod init;
mod readback;

pub use readback::{BinCount, BinCountListener};

use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::color::{ColorSpace, SourceImage};
use crate::double_buffer::DoubleBuffer;
use crate::fit::ClusterSnapshot;
use crate::gpu::{allocate_buffer_if_needed, byte_size, read_buffer, release_buffer, GpuContext};
use crate::kernels::{Kernel, KernelTable};
use crate::{
    ColorBin, DispatchArgs, GmmError, GmmParams, PackedCovariance, PixelChunkParams, ReduceParams, Result,
    MAX_CLUSTERS, REDUCTION_LEVELS, VOXEL_COUNT,
};
use init::PixelChunks;
use readback::BinCountReadback;

/// Numeric knobs of the EM iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmSettings {
    /// Isotropic variance every cluster starts from.
    pub initial_variance: f32,
    /// Smallest pivot of the guarded Cholesky factor used by the E-step.
    pub min_variance: f32,
    /// Total weight at or below which a cluster counts as dead.
    pub min_weight: f32,
}

impl Default for EmSettings {
    fn default() -> Self {
        Self {
            initial_variance: 0.01,
            min_variance: 1e-6,
            min_weight: 1e-6,
        }
    }
}

impl EmSettings {
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("initial_variance", self.initial_variance),
            ("min_variance", self.min_variance),
            ("min_weight", self.min_weight),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(GmmError::InvalidConfig(format!(
                    "{name} must be a positive finite number, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn params(&self, num_clusters: u32, image: &SourceImage, color_space: ColorSpace) -> GmmParams {
        GmmParams {
            num_clusters,
            width: image.width(),
            height: image.height(),
            use_gamma: color_space.use_gamma() as u32,
            total_samples: image.sample_count() as f32,
            initial_variance: self.initial_variance,
            min_variance: self.min_variance,
            min_weight: self.min_weight,
        }
    }
}

/// Lifecycle of the current fitting run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run, or the previous one was released.
    Uninitialized,
    /// Initialized and accepting convergence steps.
    Ready,
    /// A device or transfer error ended the run.
    Failed,
}

/// Buffers whose size does not depend on the run.
struct FixedBuffers {
    color_bins: wgpu::Buffer,
    selected_bins: wgpu::Buffer,
    bin_counter: wgpu::Buffer,
    dispatch_args: wgpu::Buffer,
    params: wgpu::Buffer,
    /// Rows of the band the histogram pass is counting.
    pixel_chunk: wgpu::Buffer,
    /// One uniform per reduction level.
    reduce_params: [wgpu::Buffer; REDUCTION_LEVELS],
}

impl FixedBuffers {
    fn new(ctx: &GpuContext) -> Self {
        let storage = |label: &'static str, size: u64, extra: wgpu::BufferUsages| {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | extra,
                mapped_at_creation: false,
            })
        };

        let color_bins = storage(
            "Color Bins Buffer",
            byte_size::<u32>(VOXEL_COUNT as usize),
            wgpu::BufferUsages::COPY_DST,
        );
        let selected_bins = storage(
            "Selected Bins Buffer",
            byte_size::<ColorBin>(VOXEL_COUNT as usize),
            wgpu::BufferUsages::COPY_SRC,
        );
        let bin_counter = storage(
            "Bin Counter Buffer",
            byte_size::<u32>(1),
            wgpu::BufferUsages::COPY_DST,
        );
        let dispatch_args = storage(
            "Dispatch Args Buffer",
            byte_size::<DispatchArgs>(REDUCTION_LEVELS + 1),
            wgpu::BufferUsages::INDIRECT | wgpu::BufferUsages::COPY_SRC,
        );

        let params = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Params Buffer"),
            size: byte_size::<GmmParams>(1),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let pixel_chunk = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pixel Chunk Buffer"),
            size: byte_size::<PixelChunkParams>(1),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let reduce_params = std::array::from_fn(|level| {
            let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Reduce Params Buffer"),
                size: byte_size::<ReduceParams>(1),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let value = ReduceParams {
                level: level as u32,
                ..Default::default()
            };
            ctx.queue.write_buffer(&buffer, 0, bytemuck::bytes_of(&value));
            buffer
        });

        Self {
            color_bins,
            selected_bins,
            bin_counter,
            dispatch_args,
            params,
            pixel_chunk,
            reduce_params,
        }
    }
}

/// Buffers sized by the image or by `K × VOXEL_COUNT`, reallocated per run.
struct RunBuffers {
    pixels: Option<wgpu::Buffer>,
    stats: Option<wgpu::Buffer>,
    fractions: Option<wgpu::Buffer>,
    responsibilities: Option<wgpu::Buffer>,
    weights: DoubleBuffer,
    means: DoubleBuffer,
    covariances: DoubleBuffer,
}

impl RunBuffers {
    fn new() -> Self {
        Self {
            pixels: None,
            stats: None,
            fractions: None,
            responsibilities: None,
            weights: DoubleBuffer::new("Weights Buffer"),
            means: DoubleBuffer::new("Means Buffer"),
            covariances: DoubleBuffer::new("Covariances Buffer"),
        }
    }

    fn release(&mut self) {
        release_buffer(&mut self.pixels);
        release_buffer(&mut self.stats);
        release_buffer(&mut self.fractions);
        release_buffer(&mut self.responsibilities);
        self.weights.release();
        self.means.release();
        self.covariances.release();
    }
}

fn bound(buffer: &Option<wgpu::Buffer>) -> Result<&wgpu::Buffer> {
    buffer.as_ref().ok_or(GmmError::NotInitialized)
}

fn input(buffers: &DoubleBuffer) -> Result<&wgpu::Buffer> {
    buffers.input().ok_or(GmmError::NotInitialized)
}

fn output(buffers: &DoubleBuffer) -> Result<&wgpu::Buffer> {
    buffers.output().ok_or(GmmError::NotInitialized)
}

/// GPU Gaussian mixture fitting over a quantized color histogram.
pub struct ExpectationMaximization {
    ctx: Arc<GpuContext>,
    settings: EmSettings,
    kernels: KernelTable,
    fixed: FixedBuffers,
    run: RunBuffers,
    bin_count: BinCountReadback,
    state: RunState,
    num_clusters: u32,
    /// Convergence steps completed in the current run.
    steps: u32,
    generation: u64,
}

impl ExpectationMaximization {
    /// Create an engine on an existing device, compiling every kernel.
    pub fn new(ctx: Arc<GpuContext>, settings: EmSettings) -> Result<Self> {
        settings.validate()?;

        let kernels = KernelTable::new(&ctx, &Kernel::EM)?;
        let scope = ctx.error_scope();
        let fixed = FixedBuffers::new(&ctx);
        scope.finish(GmmError::ResourceCreation)?;

        Ok(Self {
            ctx,
            settings,
            kernels,
            fixed,
            run: RunBuffers::new(),
            bin_count: BinCountReadback::new(),
            state: RunState::Uninitialized,
            num_clusters: 0,
            steps: 0,
            generation: 0,
        })
    }

    /// Acquire a device and create an engine on it.
    pub async fn create(settings: EmSettings) -> Result<Self> {
        let ctx = GpuContext::new().await?;
        Self::new(Arc::new(ctx), settings)
    }

    /// Start a new run from `seeds` over `image`.
    ///
    /// Configuration is validated before any device work. On a device error
    /// the run is marked failed and the generation is left unchanged.
    pub fn initialize(
        &mut self,
        seeds: &[Vec3],
        image: &SourceImage,
        color_space: ColorSpace,
    ) -> Result<()> {
        validate_seeds(seeds)?;

        let num_clusters = seeds.len() as u32;
        let run = self.bin_count.begin();
        self.state = RunState::Uninitialized;
        self.steps = 0;

        let ctx = Arc::clone(&self.ctx);
        let scope = ctx.error_scope();
        let staging = PixelChunks::for_device(&ctx.device, image).and_then(|chunks| {
            self.allocate_run(num_clusters, &chunks)?;
            self.submit_initialization(seeds, image, color_space, &chunks)
        });
        let outcome = scope.finish(GmmError::ComputeExecution).and(staging);

        match outcome {
            Ok(staging) => {
                self.bin_count.watch(staging, run);
                self.num_clusters = num_clusters;
                self.state = RunState::Ready;
                self.generation += 1;
                tracing::info!(
                    "Initialized run {} with {} clusters over {}x{} pixels ({})",
                    run,
                    num_clusters,
                    image.width(),
                    image.height(),
                    color_space
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Initialization failed: {}", e);
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }

    /// Run one EM iteration.
    pub fn converge(&mut self) -> Result<()> {
        match self.state {
            RunState::Uninitialized => return Err(GmmError::NotInitialized),
            RunState::Failed => return Err(GmmError::RunFailed),
            RunState::Ready => {}
        }
        if let BinCount::Failed(message) = self.bin_count.count() {
            self.state = RunState::Failed;
            return Err(GmmError::Readback(message));
        }

        let ctx = Arc::clone(&self.ctx);
        let scope = ctx.error_scope();
        let submitted = self.submit_step();
        match scope.finish(GmmError::ComputeExecution).and(submitted) {
            Ok(()) => {
                self.steps += 1;
                self.generation += 1;
                tracing::debug!("Convergence step {} (generation {})", self.steps, self.generation);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Convergence step failed: {}", e);
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }

    /// Drive pending device callbacks without blocking.
    pub fn poll(&self) {
        self.ctx.device.poll(wgpu::Maintain::Poll);
    }

    /// Populated-bin count, 0 until the readback has completed.
    ///
    /// A failed readback is an error, never a count of 0.
    pub fn bin_count(&self) -> Result<u32> {
        match self.bin_count.count() {
            BinCount::Ready(count) => Ok(count),
            BinCount::Pending => Ok(0),
            BinCount::Failed(message) => Err(GmmError::Readback(message)),
        }
    }

    pub fn bin_count_state(&self) -> BinCount {
        self.bin_count.count()
    }

    /// Block until the populated-bin count of the current run is known.
    pub fn wait_for_bin_count(&self) -> Result<u32> {
        if self.state == RunState::Uninitialized {
            return Err(GmmError::NotInitialized);
        }
        // One blocking poll completes every submitted map; the retry covers
        // callbacks scheduled by the first poll itself.
        for _ in 0..2 {
            match self.bin_count.count() {
                BinCount::Ready(count) => return Ok(count),
                BinCount::Failed(message) => return Err(GmmError::Readback(message)),
                BinCount::Pending => {
                    self.ctx.device.poll(wgpu::Maintain::Wait);
                }
            }
        }
        match self.bin_count.count() {
            BinCount::Ready(count) => Ok(count),
            BinCount::Failed(message) => Err(GmmError::Readback(message)),
            BinCount::Pending => Err(GmmError::Readback(
                "populated bin count never arrived".into(),
            )),
        }
    }

    /// Register `listener` for the populated-bin count of every future
    /// initialization. It fires once per run, from inside a device poll.
    pub fn subscribe_bin_count(&self, listener: impl Fn(u32) + Send + Sync + 'static) {
        self.bin_count.subscribe(Arc::new(listener));
    }

    /// Bumped after every successful initialization and convergence step.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lifecycle of the current run. A run whose bin count readback failed
    /// reports [`RunState::Failed`] as soon as the failure is observed.
    pub fn state(&self) -> RunState {
        effective_state(self.state, &self.bin_count.count())
    }

    pub fn num_clusters(&self) -> usize {
        self.num_clusters as usize
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// Current means, one `vec4` per cluster (w unused).
    pub fn means_buffer(&self) -> Result<&wgpu::Buffer> {
        input(&self.run.means)
    }

    /// Current covariances, one [`PackedCovariance`] per cluster.
    pub fn covariances_buffer(&self) -> Result<&wgpu::Buffer> {
        input(&self.run.covariances)
    }

    /// Current mixing fractions, one `f32` per cluster.
    pub fn fractions_buffer(&self) -> Result<&wgpu::Buffer> {
        bound(&self.run.fractions)
    }

    /// Compacted populated bins; only the first [`Self::bin_count`] are valid.
    pub fn selected_bins_buffer(&self) -> &wgpu::Buffer {
        &self.fixed.selected_bins
    }

    pub(crate) fn params_buffer(&self) -> &wgpu::Buffer {
        &self.fixed.params
    }

    fn ensure_readable(&self) -> Result<()> {
        match self.state() {
            RunState::Ready => Ok(()),
            RunState::Uninitialized => Err(GmmError::NotInitialized),
            RunState::Failed => Err(GmmError::RunFailed),
        }
    }

    /// Read the current cluster state back (blocking).
    pub fn read_clusters(&self) -> Result<ClusterSnapshot> {
        self.ensure_readable()?;
        let k = self.num_clusters as usize;

        let means = read_buffer::<[f32; 4]>(&self.ctx, self.means_buffer()?, 0, k)?;
        let covariances = read_buffer::<PackedCovariance>(&self.ctx, self.covariances_buffer()?, 0, k)?;
        let fractions = read_buffer::<f32>(&self.ctx, self.fractions_buffer()?, 0, k)?;

        Ok(ClusterSnapshot {
            generation: self.generation,
            means: means.into_iter().map(|m| Vec3::new(m[0], m[1], m[2])).collect(),
            covariances,
            fractions,
        })
    }

    /// Read the compacted populated bins back (blocking).
    pub fn read_populated_bins(&self) -> Result<Vec<ColorBin>> {
        self.ensure_readable()?;
        let count = self.wait_for_bin_count()? as usize;
        read_buffer::<ColorBin>(&self.ctx, &self.fixed.selected_bins, 0, count)
    }

    /// Responsibilities of the last E-step, indexed `[bin][cluster]` in the
    /// order of [`Self::read_populated_bins`]. Empty before the first step.
    pub fn read_responsibilities(&self) -> Result<Vec<Vec<f32>>> {
        self.ensure_readable()?;
        if self.steps == 0 {
            return Ok(Vec::new());
        }
        let count = self.wait_for_bin_count()? as usize;
        let buffer = bound(&self.run.responsibilities)?;

        let mut per_bin = vec![Vec::with_capacity(self.num_clusters as usize); count];
        for cluster in 0..self.num_clusters as usize {
            let column = read_buffer::<f32>(&self.ctx, buffer, cluster * VOXEL_COUNT as usize, count)?;
            for (bin, r) in per_bin.iter_mut().zip(column) {
                bin.push(r);
            }
        }
        Ok(per_bin)
    }

    /// Free every per-run buffer. The next [`Self::initialize`] starts a
    /// brand-new run.
    pub fn release(&mut self) {
        self.bin_count.reset();
        self.run.release();
        self.state = RunState::Uninitialized;
        self.num_clusters = 0;
        self.steps = 0;
        tracing::debug!("Released run buffers");
    }

    /// Size every per-run buffer for `num_clusters`, with room for one band
    /// of pixels.
    fn allocate_run(&mut self, num_clusters: u32, chunks: &PixelChunks) -> Result<()> {
        let device = &self.ctx.device;
        let k = num_clusters as usize;
        let scratch = k * VOXEL_COUNT as usize;

        let max_binding = device.limits().max_storage_buffer_binding_size as u64;
        let largest = byte_size::<PackedCovariance>(scratch);
        if largest > max_binding {
            return Err(GmmError::ResourceCreation(format!(
                "{num_clusters} clusters need {largest} byte scratch buffers, device allows {max_binding}"
            )));
        }

        let storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
        allocate_buffer_if_needed(
            device,
            &mut self.run.pixels,
            "Pixels Buffer",
            chunks.buffer_size(),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            true,
        );
        allocate_buffer_if_needed(
            device,
            &mut self.run.stats,
            "Cluster Stats Buffer",
            byte_size::<crate::ClusterStats>(k),
            storage,
            false,
        );
        allocate_buffer_if_needed(
            device,
            &mut self.run.fractions,
            "Fractions Buffer",
            byte_size::<f32>(k),
            storage,
            false,
        );
        allocate_buffer_if_needed(
            device,
            &mut self.run.responsibilities,
            "Responsibilities Buffer",
            byte_size::<f32>(scratch),
            storage,
            false,
        );
        self.run.weights.allocate_if_needed(device, byte_size::<f32>(scratch));
        self.run.means.allocate_if_needed(device, byte_size::<[f32; 4]>(scratch));
        self.run
            .covariances
            .allocate_if_needed(device, byte_size::<PackedCovariance>(scratch));
        Ok(())
    }
}

fn effective_state(stored: RunState, count: &BinCount) -> RunState {
    match (stored, count) {
        (RunState::Ready, BinCount::Failed(_)) => RunState::Failed,
        (state, _) => state,
    }
}

fn validate_seeds(seeds: &[Vec3]) -> Result<()> {
    if seeds.is_empty() {
        return Err(GmmError::InvalidConfig("at least one seed mean is required".into()));
    }
    if seeds.len() > MAX_CLUSTERS {
        return Err(GmmError::InvalidConfig(format!(
            "{} seeds exceed the supported maximum of {MAX_CLUSTERS} clusters",
            seeds.len()
        )));
    }
    if let Some(seed) = seeds.iter().find(|s| !s.is_finite()) {
        return Err(GmmError::InvalidConfig(format!("seed mean {seed} is not finite")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = EmSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.initial_variance, 0.01);
    }

    #[test]
    fn test_settings_reject_non_positive_values() {
        let settings = EmSettings {
            min_weight: 0.0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(GmmError::InvalidConfig(_))));

        let settings = EmSettings {
            min_variance: f32::NAN,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_seed_validation() {
        assert!(validate_seeds(&[]).is_err());
        assert!(validate_seeds(&vec![Vec3::ZERO; MAX_CLUSTERS + 1]).is_err());
        assert!(validate_seeds(&[Vec3::new(f32::INFINITY, 0.0, 0.0)]).is_err());
        assert!(validate_seeds(&[Vec3::ONE]).is_ok());
        assert!(validate_seeds(&vec![Vec3::ONE; MAX_CLUSTERS]).is_ok());
    }

    #[test]
    fn test_failed_bin_count_fails_ready_run() {
        let failed = BinCount::Failed("mapping failed".into());
        assert_eq!(effective_state(RunState::Ready, &failed), RunState::Failed);
        assert_eq!(effective_state(RunState::Ready, &BinCount::Pending), RunState::Ready);
        assert_eq!(effective_state(RunState::Ready, &BinCount::Ready(0)), RunState::Ready);
        assert_eq!(effective_state(RunState::Uninitialized, &failed), RunState::Uninitialized);
    }

    #[test]
    fn test_params_carry_run_configuration() {
        let image = SourceImage::solid(4, 3, [0, 0, 0]).unwrap();
        let params = EmSettings::default().params(5, &image, ColorSpace::Linear);
        assert_eq!(params.num_clusters, 5);
        assert_eq!((params.width, params.height), (4, 3));
        assert_eq!(params.use_gamma, 0);
        assert_eq!(params.total_samples, 12.0);
        assert_eq!(std::mem::size_of::<GmmParams>(), 32);
    }
}
