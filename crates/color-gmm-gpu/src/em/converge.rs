//! One EM iteration as a single submission of seven stages.
//!
//! Double-buffer discipline: a stage that produces partials writes the
//! `out` side, every reduction level swaps and folds `in` into `out`, and a
//! final swap leaves the reduced totals on the `in` side. Each double buffer
//! is swapped an even number of times per step, so the compact per-cluster
//! results always land in the same physical buffer.

use super::{bound, input, output, ExpectationMaximization};
use crate::kernels::{Kernel, Workgroups};
use crate::{Result, GROUP_SIZE, REDUCTION_LEVELS};

/// Indirect record sizing the per-bin E-step.
const PER_BIN_SLOT: usize = 0;
/// Indirect record sizing per-bin-per-cluster work and reduction level 0.
const PER_BIN_CLUSTER_SLOT: usize = 1;

impl ExpectationMaximization {
    pub(super) fn submit_step(&mut self) -> Result<()> {
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Convergence Encoder"),
            });

        self.encode_statistics_and_expectation(&mut encoder)?;
        self.encode_weight_reduction(&mut encoder)?;
        self.encode_covariance_update(&mut encoder)?;

        self.ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// Record `kernel` on the engine's device.
    pub(super) fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        kernel: Kernel,
        buffers: &[&wgpu::Buffer],
        workgroups: Workgroups<'_>,
    ) -> Result<()> {
        self.kernels
            .encode(&self.ctx.device, encoder, kernel, buffers, workgroups)
    }

    fn cluster_groups(&self) -> u32 {
        self.num_clusters.div_ceil(GROUP_SIZE)
    }

    /// Stages 1 and 2: cluster statistics, then responsibilities with
    /// weighted partials into the `out` sides.
    fn encode_statistics_and_expectation(&self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        let fixed = &self.fixed;
        let stats = bound(&self.run.stats)?;
        let fractions = bound(&self.run.fractions)?;

        self.encode(
            encoder,
            Kernel::PrepareClusterStats,
            &[
                input(&self.run.means)?,
                input(&self.run.covariances)?,
                stats,
                &fixed.params,
            ],
            Workgroups::Direct(self.cluster_groups(), 1, 1),
        )?;

        self.encode(
            encoder,
            Kernel::UpdateRespsAndMeans,
            &[
                &fixed.selected_bins,
                &fixed.dispatch_args,
                stats,
                fractions,
                bound(&self.run.responsibilities)?,
                output(&self.run.weights)?,
                output(&self.run.means)?,
                &fixed.params,
            ],
            Workgroups::Indirect {
                args: &fixed.dispatch_args,
                slot: PER_BIN_SLOT,
            },
        )
    }

    /// Stages 3 and 4: fold weights and weighted positions, then normalize
    /// means and fractions in place.
    fn encode_weight_reduction(&mut self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        for level in 0..REDUCTION_LEVELS {
            self.run.weights.swap();
            self.run.means.swap();

            let fixed = &self.fixed;
            self.encode(
                encoder,
                Kernel::ReduceWeightsAndMeans,
                &[
                    &fixed.dispatch_args,
                    input(&self.run.weights)?,
                    output(&self.run.weights)?,
                    input(&self.run.means)?,
                    output(&self.run.means)?,
                    &fixed.reduce_params[level],
                ],
                Workgroups::Indirect {
                    args: &fixed.dispatch_args,
                    slot: PER_BIN_CLUSTER_SLOT + level,
                },
            )?;
        }
        self.run.weights.swap();
        self.run.means.swap();

        self.encode(
            encoder,
            Kernel::NormalizeMeansAndFracs,
            &[
                input(&self.run.weights)?,
                bound(&self.run.stats)?,
                input(&self.run.means)?,
                bound(&self.run.fractions)?,
                &self.fixed.params,
            ],
            Workgroups::Direct(self.cluster_groups(), 1, 1),
        )
    }

    /// Stages 5 to 7: outer-product partials against the updated means,
    /// reduction, then normalization by the stage 3 weights.
    fn encode_covariance_update(&mut self, encoder: &mut wgpu::CommandEncoder) -> Result<()> {
        let fixed = &self.fixed;
        self.encode(
            encoder,
            Kernel::UpdateCovariances,
            &[
                &fixed.selected_bins,
                &fixed.dispatch_args,
                input(&self.run.means)?,
                bound(&self.run.responsibilities)?,
                output(&self.run.covariances)?,
            ],
            Workgroups::Indirect {
                args: &fixed.dispatch_args,
                slot: PER_BIN_CLUSTER_SLOT,
            },
        )?;

        for level in 0..REDUCTION_LEVELS {
            self.run.covariances.swap();

            let fixed = &self.fixed;
            self.encode(
                encoder,
                Kernel::ReduceCovariances,
                &[
                    &fixed.dispatch_args,
                    input(&self.run.covariances)?,
                    output(&self.run.covariances)?,
                    &fixed.reduce_params[level],
                ],
                Workgroups::Indirect {
                    args: &fixed.dispatch_args,
                    slot: PER_BIN_CLUSTER_SLOT + level,
                },
            )?;
        }
        self.run.covariances.swap();

        self.encode(
            encoder,
            Kernel::NormalizeCovariances,
            &[
                input(&self.run.weights)?,
                bound(&self.run.stats)?,
                input(&self.run.covariances)?,
                &self.fixed.params,
            ],
            Workgroups::Direct(self.cluster_groups(), 1, 1),
        )
    }
}
