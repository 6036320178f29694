//! GPU Cholesky factorization of the fitted covariances for visualization.

use std::sync::Arc;

use crate::em::{ExpectationMaximization, RunState};
use crate::gpu::{allocate_buffer_if_needed, byte_size, read_buffer, release_buffer, GpuContext};
use crate::kernels::{Kernel, KernelTable, Workgroups};
use crate::{CholeskyFactor, GmmError, Result, GROUP_SIZE};

/// Factors every cluster covariance of an engine into `L` with `L Lᵗ = Σ`.
///
/// Safe to run after any convergence step: a covariance that is not
/// positive definite yields a finite diagonal factor flagged invalid.
pub struct CovarianceDecomposer {
    ctx: Arc<GpuContext>,
    kernels: KernelTable,
    factors: Option<wgpu::Buffer>,
}

impl CovarianceDecomposer {
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self> {
        let kernels = KernelTable::new(&ctx, &Kernel::VISUALIZATION)?;
        Ok(Self {
            ctx,
            kernels,
            factors: None,
        })
    }

    /// Share the device of `engine`.
    pub fn for_engine(engine: &ExpectationMaximization) -> Result<Self> {
        Self::new(Arc::clone(engine.context()))
    }

    /// Factor the engine's current covariances into [`Self::factors_buffer`].
    pub fn dispatch(&mut self, engine: &ExpectationMaximization) -> Result<()> {
        if !Arc::ptr_eq(&self.ctx, engine.context()) {
            return Err(GmmError::InvalidConfig(
                "decomposer and engine must share a GPU context".into(),
            ));
        }
        match engine.state() {
            RunState::Ready => {}
            RunState::Uninitialized => return Err(GmmError::NotInitialized),
            RunState::Failed => return Err(GmmError::RunFailed),
        }
        let covariances = engine.covariances_buffer()?;
        let num_clusters = engine.num_clusters() as u32;

        let scope = self.ctx.error_scope();

        allocate_buffer_if_needed(
            &self.ctx.device,
            &mut self.factors,
            "Cholesky Factors Buffer",
            byte_size::<CholeskyFactor>(num_clusters as usize),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            false,
        );
        let factors = self.factors.as_ref().ok_or(GmmError::NotInitialized)?;

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Decompose Encoder"),
            });
        self.kernels.encode(
            &self.ctx.device,
            &mut encoder,
            Kernel::DecomposeCovariances,
            &[covariances, factors, engine.params_buffer()],
            Workgroups::Direct(num_clusters.div_ceil(GROUP_SIZE), 1, 1),
        )?;
        self.ctx.queue.submit(Some(encoder.finish()));

        scope.finish(GmmError::ComputeExecution)
    }

    /// Factor and read back one [`CholeskyFactor`] per cluster (blocking).
    pub fn decompose(&mut self, engine: &ExpectationMaximization) -> Result<Vec<CholeskyFactor>> {
        self.dispatch(engine)?;
        let factors = self.factors.as_ref().ok_or(GmmError::NotInitialized)?;
        let factors = read_buffer::<CholeskyFactor>(&self.ctx, factors, 0, engine.num_clusters())?;

        let invalid = factors.iter().filter(|f| !f.is_valid()).count();
        if invalid > 0 {
            tracing::warn!(
                "{} of {} covariances are not positive definite, using diagonal factors",
                invalid,
                factors.len()
            );
        }
        Ok(factors)
    }

    /// Factors of the last dispatch, one per cluster.
    pub fn factors_buffer(&self) -> Option<&wgpu::Buffer> {
        self.factors.as_ref()
    }

    pub fn release(&mut self) {
        release_buffer(&mut self.factors);
    }
}
