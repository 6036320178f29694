//! Compute kernel registry.
//!
//! Every entry point the engine dispatches is a [`Kernel`] variant. A
//! [`KernelTable`] compiles the requested kernels once, up front, and fails
//! with [`GmmError::MissingKernel`] if any entry point cannot be resolved, so
//! a renamed shader function is caught at engine creation instead of at the
//! first dispatch.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::gpu::GpuContext;
use crate::shaders;
use crate::{DispatchArgs, GmmError, Result};

/// How a kernel sees one of its bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    Uniform,
}

use Access::{ReadOnly as RO, ReadWrite as RW, Uniform as U};

/// One compute entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    UpdateColorBins,
    SelectColorBins,
    UpdateIndirectArgs,
    ResetClusters,
    PrepareClusterStats,
    UpdateRespsAndMeans,
    ReduceWeightsAndMeans,
    NormalizeMeansAndFracs,
    UpdateCovariances,
    ReduceCovariances,
    NormalizeCovariances,
    DecomposeCovariances,
}

impl Kernel {
    /// Kernels the EM engine dispatches during initialization and convergence.
    pub const EM: [Kernel; 11] = [
        Kernel::UpdateColorBins,
        Kernel::SelectColorBins,
        Kernel::UpdateIndirectArgs,
        Kernel::ResetClusters,
        Kernel::PrepareClusterStats,
        Kernel::UpdateRespsAndMeans,
        Kernel::ReduceWeightsAndMeans,
        Kernel::NormalizeMeansAndFracs,
        Kernel::UpdateCovariances,
        Kernel::ReduceCovariances,
        Kernel::NormalizeCovariances,
    ];

    /// Kernels used for visualization.
    pub const VISUALIZATION: [Kernel; 1] = [Kernel::DecomposeCovariances];

    /// WGSL function name.
    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::UpdateColorBins => "update_color_bins",
            Kernel::SelectColorBins => "select_color_bins",
            Kernel::UpdateIndirectArgs => "update_indirect_args",
            Kernel::ResetClusters => "reset_clusters",
            Kernel::PrepareClusterStats => "prepare_cluster_stats",
            Kernel::UpdateRespsAndMeans => "update_resps_and_means",
            Kernel::ReduceWeightsAndMeans => "reduce_weights_and_means",
            Kernel::NormalizeMeansAndFracs => "normalize_means_and_fracs",
            Kernel::UpdateCovariances => "update_covariances",
            Kernel::ReduceCovariances => "reduce_covariances",
            Kernel::NormalizeCovariances => "normalize_covariances",
            Kernel::DecomposeCovariances => "decompose_covariances",
        }
    }

    fn body(self) -> &'static str {
        match self {
            Kernel::UpdateColorBins => shaders::UPDATE_COLOR_BINS,
            Kernel::SelectColorBins => shaders::SELECT_COLOR_BINS,
            Kernel::UpdateIndirectArgs => shaders::UPDATE_INDIRECT_ARGS,
            Kernel::ResetClusters => shaders::RESET_CLUSTERS,
            Kernel::PrepareClusterStats => shaders::PREPARE_CLUSTER_STATS,
            Kernel::UpdateRespsAndMeans => shaders::UPDATE_RESPS_AND_MEANS,
            Kernel::ReduceWeightsAndMeans => shaders::REDUCE_WEIGHTS_AND_MEANS,
            Kernel::NormalizeMeansAndFracs => shaders::NORMALIZE_MEANS_AND_FRACS,
            Kernel::UpdateCovariances => shaders::UPDATE_COVARIANCES,
            Kernel::ReduceCovariances => shaders::REDUCE_COVARIANCES,
            Kernel::NormalizeCovariances => shaders::NORMALIZE_COVARIANCES,
            Kernel::DecomposeCovariances => shaders::DECOMPOSE_COVARIANCES,
        }
    }

    /// Full WGSL module: shared prelude followed by the kernel body.
    pub fn source(self) -> String {
        format!("{}\n{}", shaders::PRELUDE, self.body())
    }

    /// Binding layout of group 0, in binding order.
    pub fn bindings(self) -> &'static [Access] {
        match self {
            Kernel::UpdateColorBins => &[RO, RW, U, U],
            Kernel::SelectColorBins => &[RO, RW, RW],
            Kernel::UpdateIndirectArgs => &[RO, RW, U],
            Kernel::ResetClusters => &[RW, RW, U],
            Kernel::PrepareClusterStats => &[RO, RO, RW, U],
            Kernel::UpdateRespsAndMeans => &[RO, RO, RO, RO, RW, RW, RW, U],
            Kernel::ReduceWeightsAndMeans => &[RO, RO, RW, RO, RW, U],
            Kernel::NormalizeMeansAndFracs => &[RO, RO, RW, RW, U],
            Kernel::UpdateCovariances => &[RO, RO, RO, RO, RW],
            Kernel::ReduceCovariances => &[RO, RO, RW, U],
            Kernel::NormalizeCovariances => &[RO, RO, RW, U],
            Kernel::DecomposeCovariances => &[RO, RW, U],
        }
    }
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Check that `source` defines a compute function named `entry_point`.
fn resolve_entry_point(source: &str, entry_point: &'static str) -> Result<()> {
    let signature = format!("fn {entry_point}(");
    let declared = source
        .split("@compute")
        .skip(1)
        .any(|tail| tail.contains(&signature));
    if declared {
        Ok(())
    } else {
        Err(GmmError::MissingKernel(entry_point))
    }
}

fn layout_entry(binding: u32, access: Access) -> wgpu::BindGroupLayoutEntry {
    let ty = match access {
        Access::ReadOnly => wgpu::BufferBindingType::Storage { read_only: true },
        Access::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
        Access::Uniform => wgpu::BufferBindingType::Uniform,
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Workgroup count of one dispatch.
pub enum Workgroups<'a> {
    Direct(u32, u32, u32),
    /// Read from a `DispatchArgs` record at `slot` of `args`.
    Indirect { args: &'a wgpu::Buffer, slot: usize },
}

/// A compiled kernel and the layout of its only bind group.
pub struct CompiledKernel {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

/// Kernels resolved once and looked up by variant.
pub struct KernelTable {
    kernels: HashMap<Kernel, CompiledKernel>,
}

impl KernelTable {
    /// Compile `kernels`, failing on the first entry point that does not resolve.
    pub fn new(ctx: &GpuContext, kernels: &[Kernel]) -> Result<Self> {
        let mut compiled = HashMap::with_capacity(kernels.len());
        for &kernel in kernels {
            compiled.insert(kernel, Self::compile(ctx, kernel)?);
        }
        tracing::debug!("Compiled {} compute kernels", compiled.len());
        Ok(Self { kernels: compiled })
    }

    fn compile(ctx: &GpuContext, kernel: Kernel) -> Result<CompiledKernel> {
        let source = kernel.source();
        resolve_entry_point(&source, kernel.entry_point())?;

        let scope = ctx.error_scope();

        let module = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel.entry_point()),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
            });

        let entries: Vec<_> = kernel
            .bindings()
            .iter()
            .enumerate()
            .map(|(binding, &access)| layout_entry(binding as u32, access))
            .collect();

        let bind_group_layout =
            ctx.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(kernel.entry_point()),
                    entries: &entries,
                });

        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(kernel.entry_point()),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.entry_point()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(kernel.entry_point()),
                compilation_options: Default::default(),
                cache: None,
            });

        scope.finish(|message| {
            tracing::error!("Kernel {} failed to compile: {}", kernel, message);
            GmmError::MissingKernel(kernel.entry_point())
        })?;

        Ok(CompiledKernel {
            pipeline,
            bind_group_layout,
        })
    }

    pub fn get(&self, kernel: Kernel) -> Result<&CompiledKernel> {
        self.kernels
            .get(&kernel)
            .ok_or(GmmError::MissingKernel(kernel.entry_point()))
    }

    /// Bind `buffers` to `kernel`'s group 0 in binding order.
    pub fn bind_group(
        &self,
        device: &wgpu::Device,
        kernel: Kernel,
        buffers: &[&wgpu::Buffer],
    ) -> Result<wgpu::BindGroup> {
        let compiled = self.get(kernel)?;
        if buffers.len() != kernel.bindings().len() {
            return Err(GmmError::ResourceCreation(format!(
                "{kernel} expects {} bindings, got {}",
                kernel.bindings().len(),
                buffers.len()
            )));
        }

        let entries: Vec<_> = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.entry_point()),
            layout: &compiled.bind_group_layout,
            entries: &entries,
        }))
    }

    /// Record `kernel` as its own compute pass.
    ///
    /// Each pass boundary is a full barrier, so stages see every write of
    /// the previous one.
    pub fn encode(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        kernel: Kernel,
        buffers: &[&wgpu::Buffer],
        workgroups: Workgroups<'_>,
    ) -> Result<()> {
        let compiled = self.get(kernel)?;
        let bind_group = self.bind_group(device, kernel, buffers)?;

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(kernel.entry_point()),
            timestamp_writes: None,
        });
        pass.set_pipeline(&compiled.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        match workgroups {
            Workgroups::Direct(x, y, z) => pass.dispatch_workgroups(x, y, z),
            Workgroups::Indirect { args, slot } => pass.dispatch_workgroups_indirect(
                args,
                (slot * std::mem::size_of::<DispatchArgs>()) as u64,
            ),
        }
        Ok(())
    }
}
