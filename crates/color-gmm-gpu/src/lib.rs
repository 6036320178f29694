//! GPU expectation-maximization of Gaussian mixtures over image colors.
//!
//! This crate fits a Gaussian Mixture Model to the color distribution of an
//! image entirely on the GPU via wgpu. Instead of iterating over raw pixels,
//! the EM passes operate on a quantized 32³ color histogram compacted down
//! to its populated bins.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Initialization                           │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  Histogram  │───▶│   Compact   │───▶│  Indirect   │      │
//! │  │ (atomic +1) │    │  (append)   │    │    Args     │──┐   │
//! │  └─────────────┘    └─────────────┘    └─────────────┘  │   │
//! └─────────────────────────────────────────────────────────│───┘
//!                              │                  async bin count
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Convergence step (per iteration)            │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  Cholesky + │───▶│   E-step    │───▶│   Reduce    │      │
//! │  │   ln det    │    │   (resps)   │    │ (3 levels)  │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! │         ┌────────────────────────────────────┘              │
//! │         ▼                                                   │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  Normalize  │───▶│ Covariance  │───▶│   Reduce +  │      │
//! │  │means, fracs │    │  partials   │    │  Normalize  │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-bin dispatches are sized on the device from the populated-bin count,
//! so no CPU round-trip sits between initialization and the first step.
//! The count is still read back asynchronously for observers.
//!
//! [`reference::ReferenceEm`] implements the same math on the CPU; the
//! [`fit`] module drives either backend through [`fit::MixtureModel`].

mod error;

pub mod color;
pub mod covariance;
pub mod decompose;
pub mod double_buffer;
pub mod em;
pub mod fit;
pub mod gpu;
pub mod kernels;
pub mod reference;
mod shaders;

pub use color::{hue_seeds, ColorSpace, SourceImage};
pub use covariance::{CholeskyFactor, PackedCovariance};
pub use decompose::CovarianceDecomposer;
pub use em::{BinCount, EmSettings, ExpectationMaximization, RunState};
pub use error::GmmError;
pub use fit::{ClusterSnapshot, FitConfig, FitOutcome, MixtureModel, StepReport};
pub use gpu::GpuContext;
pub use reference::ReferenceEm;

/// Result type for mixture fitting operations.
pub type Result<T> = std::result::Result<T, GmmError>;

/// Side length of the color histogram grid.
pub const GRID_SIZE: u32 = 32;

/// Number of voxels in the color histogram grid.
pub const VOXEL_COUNT: u32 = GRID_SIZE * GRID_SIZE * GRID_SIZE;

/// Work-group size shared by the per-bin and reduction kernels.
pub const GROUP_SIZE: u32 = 32;

/// Reduction levels needed to fold `VOXEL_COUNT` partials into one value.
pub const REDUCTION_LEVELS: usize = 3;

/// Largest number of clusters a single run supports.
pub const MAX_CLUSTERS: usize = 32;

/// A populated histogram bin: flattened voxel index and occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ColorBin {
    /// `r + g * GRID_SIZE + b * GRID_SIZE²`
    pub index: u32,
    /// Number of pixels that quantized into this voxel.
    pub count: u32,
}

/// One indirect dispatch record (matches `DispatchArgs` in shaders).
///
/// The first three fields are consumed by `dispatch_workgroups_indirect`,
/// the last one carries the element count the dispatch covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct DispatchArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub count: u32,
}

impl DispatchArgs {
    /// Derive every dispatch record of a run from the populated-bin count.
    ///
    /// Slot 0 sizes the per-bin E-step, slot 1 the per-bin-per-cluster
    /// covariance pass and the first reduction level, slots 2 and 3 the
    /// remaining reduction levels. This is the host-side mirror of the
    /// `update_indirect_args` kernel.
    pub fn for_populated_bins(populated: u32, num_clusters: u32) -> [DispatchArgs; REDUCTION_LEVELS + 1] {
        let level1 = populated.div_ceil(GROUP_SIZE);
        let level2 = level1.div_ceil(GROUP_SIZE);
        let level3 = level2.div_ceil(GROUP_SIZE);
        [
            DispatchArgs { x: level1, y: 1, z: 1, count: populated },
            DispatchArgs { x: level1, y: num_clusters, z: 1, count: populated },
            DispatchArgs { x: level2, y: num_clusters, z: 1, count: level1 },
            DispatchArgs { x: level3, y: num_clusters, z: 1, count: level2 },
        ]
    }
}

/// Uniform parameters shared by all kernels (matches `Params` in shaders).
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct GmmParams {
    /// Number of clusters in the current run
    pub num_clusters: u32,
    /// Source image width in pixels
    pub width: u32,
    /// Source image height in pixels
    pub height: u32,
    /// Non-zero when the source must be converted from sRGB to linear
    pub use_gamma: u32,
    /// Pixel count of the source, the denominator of mixing fractions
    pub total_samples: f32,
    /// Isotropic variance clusters start from
    pub initial_variance: f32,
    /// Smallest pivot allowed in the guarded Cholesky factorization
    pub min_variance: f32,
    /// Total weight below which a cluster is considered dead
    pub min_weight: f32,
}

/// Per-level uniform for the reduction kernels.
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ReduceParams {
    pub level: u32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

/// Uniform of one `update_color_bins` dispatch over a band of image rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct PixelChunkParams {
    /// Rows held by the pixel buffer for this dispatch
    pub rows: u32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

/// Per-cluster statistics prepared at the start of every convergence step.
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ClusterStats {
    /// Mean going into the step (w unused)
    pub mean: [f32; 4],
    /// `(l00, l10, l20, l11)` of the guarded Cholesky factor
    pub chol0: [f32; 4],
    /// `(l21, l22, ln_det, 0)`
    pub chol1: [f32; 4],
    /// Covariance going into the step
    pub covariance: PackedCovariance,
}
