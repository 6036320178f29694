//! GPU context and buffer lifecycle utilities.

use crate::{GmmError, Result};

/// GPU context holding device and queue.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Create a new GPU context.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| GmmError::GpuInit("No suitable GPU adapter found".into()))?;

        tracing::info!("Using GPU adapter: {:?}", adapter.get_info());

        // Large images and K × voxel scratch buffers need more than the
        // default binding limits when the adapter offers them.
        let limits = adapter.limits();
        tracing::debug!(
            "Storage binding limit {} bytes, buffer limit {} bytes",
            limits.max_storage_buffer_binding_size,
            limits.max_buffer_size
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Mixture GPU Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| GmmError::GpuInit(e.to_string()))?;

        Ok(Self { device, queue })
    }

    /// Create a new GPU context, blocking the current thread.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }

    /// Open error scopes for out-of-memory and validation errors.
    ///
    /// Every GPU operation that must surface device failures to the caller
    /// runs between this and [`ErrorScope::finish`].
    pub fn error_scope(&self) -> ErrorScope<'_> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        ErrorScope { ctx: self }
    }
}

/// Pair of open error scopes, see [`GpuContext::error_scope`].
#[must_use = "error scopes must be closed with `finish`"]
pub struct ErrorScope<'a> {
    ctx: &'a GpuContext,
}

impl ErrorScope<'_> {
    /// Close both scopes, turning any captured error into `wrap(message)`.
    pub fn finish(self, wrap: impl FnOnce(String) -> GmmError) -> Result<()> {
        let validation = pollster::block_on(self.ctx.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.ctx.device.pop_error_scope());
        match (validation, out_of_memory) {
            (None, None) => Ok(()),
            (Some(e), _) | (None, Some(e)) => Err(wrap(e.to_string())),
        }
    }
}

/// (Re)create `buffer` unless it already holds exactly `size` bytes.
///
/// With `allow_larger`, an existing buffer that is big enough is kept.
/// Reallocation discards the previous contents. Returns whether a new
/// buffer was created.
pub fn allocate_buffer_if_needed(
    device: &wgpu::Device,
    buffer: &mut Option<wgpu::Buffer>,
    label: &'static str,
    size: u64,
    usage: wgpu::BufferUsages,
    allow_larger: bool,
) -> bool {
    let needs_alloc = match buffer {
        None => true,
        Some(existing) if allow_larger => existing.size() < size,
        Some(existing) => existing.size() != size,
    };

    if needs_alloc {
        release_buffer(buffer);
        tracing::debug!("Allocating {} ({} bytes)", label, size);
        *buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        }));
    }

    needs_alloc
}

/// Destroy and forget `buffer` if it exists.
pub fn release_buffer(buffer: &mut Option<wgpu::Buffer>) {
    if let Some(existing) = buffer.take() {
        existing.destroy();
    }
}

/// Byte size of `count` elements of `T`.
pub fn byte_size<T>(count: usize) -> u64 {
    (count * std::mem::size_of::<T>()) as u64
}

/// Copy `count` elements of `T` starting at element `first` out of `source`
/// (blocking).
pub fn read_buffer<T: bytemuck::Pod>(
    ctx: &GpuContext,
    source: &wgpu::Buffer,
    first: usize,
    count: usize,
) -> Result<Vec<T>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let size = byte_size::<T>(count);
    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Readback Staging Buffer"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
    encoder.copy_buffer_to_buffer(source, byte_size::<T>(first), &staging, 0, size);
    ctx.queue.submit(Some(encoder.finish()));

    let buffer_slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();

    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        // The receiver only goes away if this function already returned.
        let _ = tx.send(result);
    });

    ctx.device.poll(wgpu::Maintain::Wait);

    rx.recv()
        .map_err(|_| GmmError::Readback("Channel closed".into()))?
        .map_err(|e| GmmError::Readback(e.to_string()))?;

    let values = {
        let data = buffer_slice.get_mapped_range();
        bytemuck::cast_slice::<u8, T>(&data).to_vec()
    };

    staging.unmap();
    staging.destroy();

    Ok(values)
}
