//! Ping-pong pair of equally sized storage buffers.
//!
//! Reductions and iterative updates read from [`DoubleBuffer::input`] and
//! write to [`DoubleBuffer::output`]; [`DoubleBuffer::swap`] then hands the
//! freshly written side to the next stage. Within a single dispatch the two
//! views never alias.

use crate::gpu::{allocate_buffer_if_needed, release_buffer};

pub struct DoubleBuffer {
    label: &'static str,
    buffers: [Option<wgpu::Buffer>; 2],
    /// Index of the buffer currently playing the "in" role.
    input: usize,
}

impl DoubleBuffer {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            buffers: [None, None],
            input: 0,
        }
    }

    /// Ensure both sides exist with exactly `size` bytes.
    ///
    /// Returns whether anything was reallocated, in which case previous
    /// contents are gone.
    pub fn allocate_if_needed(&mut self, device: &wgpu::Device, size: u64) -> bool {
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let mut reallocated = false;
        for buffer in &mut self.buffers {
            reallocated |= allocate_buffer_if_needed(device, buffer, self.label, size, usage, false);
        }
        reallocated
    }

    /// Exchange the in/out roles. No data moves.
    pub fn swap(&mut self) {
        self.input ^= 1;
    }

    /// Destroy both sides.
    pub fn release(&mut self) {
        for buffer in &mut self.buffers {
            release_buffer(buffer);
        }
        self.input = 0;
    }

    /// The readable side.
    pub fn input(&self) -> Option<&wgpu::Buffer> {
        self.buffers[self.input].as_ref()
    }

    /// The writable side.
    pub fn output(&self) -> Option<&wgpu::Buffer> {
        self.buffers[self.input ^ 1].as_ref()
    }
}

impl Drop for DoubleBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_flips_roles_without_allocation() {
        let mut buffers = DoubleBuffer::new("Test Double Buffer");
        assert!(buffers.input().is_none());
        assert!(buffers.output().is_none());
        buffers.swap();
        assert_eq!(buffers.input, 1);
        buffers.swap();
        assert_eq!(buffers.input, 0);
        buffers.release();
        assert!(buffers.input().is_none());
    }
}
