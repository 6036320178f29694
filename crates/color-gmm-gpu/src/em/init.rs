//! Initialization passes: histogram, compaction, dispatch sizing, cluster reset.

use glam::Vec3;

use super::{bound, input, ExpectationMaximization};
use crate::color::{ColorSpace, SourceImage};
use crate::kernels::{Kernel, Workgroups};
use crate::{GmmError, PixelChunkParams, Result, GROUP_SIZE, VOXEL_COUNT};

/// Tile edge of `update_color_bins`.
const PIXEL_TILE: u32 = 16;

/// Bytes of one packed pixel.
const PIXEL_BYTES: u64 = 4;

/// Bands of whole image rows small enough to bind and dispatch at once.
///
/// The histogram pass uploads one band into the pixel buffer and counts it
/// before the next band overwrites it, so the image size is bounded by host
/// memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PixelChunks {
    width: u32,
    height: u32,
    rows_per_chunk: u32,
}

impl PixelChunks {
    /// Split a `width × height` image for a device that binds at most
    /// `max_bytes` of storage and dispatches at most `max_workgroups` groups
    /// per dimension.
    pub fn plan(width: u32, height: u32, max_bytes: u64, max_workgroups: u32) -> Result<Self> {
        let row_bytes = width as u64 * PIXEL_BYTES;
        if row_bytes == 0 || row_bytes > max_bytes {
            return Err(GmmError::ResourceCreation(format!(
                "an image row of {width} pixels does not fit a {max_bytes} byte storage binding"
            )));
        }
        if width.div_ceil(PIXEL_TILE) > max_workgroups {
            return Err(GmmError::ResourceCreation(format!(
                "an image row of {width} pixels exceeds {max_workgroups} workgroups per dispatch"
            )));
        }

        let by_size = max_bytes / row_bytes;
        let by_dispatch = max_workgroups as u64 * PIXEL_TILE as u64;
        let rows_per_chunk = by_size.min(by_dispatch).min(height as u64).max(1) as u32;
        Ok(Self {
            width,
            height,
            rows_per_chunk,
        })
    }

    /// Plan for `image` on `device`.
    pub fn for_device(device: &wgpu::Device, image: &SourceImage) -> Result<Self> {
        let limits = device.limits();
        let max_bytes = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        Self::plan(
            image.width(),
            image.height(),
            max_bytes,
            limits.max_compute_workgroups_per_dimension,
        )
    }

    pub fn rows_per_chunk(&self) -> u32 {
        self.rows_per_chunk
    }

    /// Size of the pixel buffer holding one band.
    pub fn buffer_size(&self) -> u64 {
        self.width as u64 * self.rows_per_chunk as u64 * PIXEL_BYTES
    }

    pub fn band_count(&self) -> usize {
        self.height.div_ceil(self.rows_per_chunk) as usize
    }

    /// `(first_row, rows)` of every band, top to bottom.
    pub fn bands(&self) -> impl Iterator<Item = (u32, u32)> {
        let Self {
            height,
            rows_per_chunk,
            ..
        } = *self;
        (0..height)
            .step_by(rows_per_chunk as usize)
            .map(move |first| (first, rows_per_chunk.min(height - first)))
    }
}

impl ExpectationMaximization {
    /// Upload the run inputs and submit every initialization pass.
    ///
    /// Returns the staging buffer the populated-bin count is copied into.
    pub(super) fn submit_initialization(
        &self,
        seeds: &[Vec3],
        image: &SourceImage,
        color_space: ColorSpace,
        chunks: &PixelChunks,
    ) -> Result<wgpu::Buffer> {
        let ctx = &self.ctx;
        let fixed = &self.fixed;
        let num_clusters = seeds.len() as u32;

        let means = input(&self.run.means)?;
        let covariances = input(&self.run.covariances)?;
        let fractions = bound(&self.run.fractions)?;

        let params = self.settings.params(num_clusters, image, color_space);
        ctx.queue
            .write_buffer(&fixed.params, 0, bytemuck::bytes_of(&params));
        let seed_means: Vec<[f32; 4]> = seeds.iter().map(|s| s.extend(0.0).to_array()).collect();
        ctx.queue
            .write_buffer(means, 0, bytemuck::cast_slice(&seed_means));

        self.submit_histogram(image, chunks)?;

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Initialization Encoder"),
            });

        // === Compaction ===
        self.encode(
            &mut encoder,
            Kernel::SelectColorBins,
            &[&fixed.color_bins, &fixed.selected_bins, &fixed.bin_counter],
            Workgroups::Direct(VOXEL_COUNT / GROUP_SIZE, 1, 1),
        )?;

        // === Dispatch sizing ===
        self.encode(
            &mut encoder,
            Kernel::UpdateIndirectArgs,
            &[&fixed.bin_counter, &fixed.dispatch_args, &fixed.params],
            Workgroups::Direct(1, 1, 1),
        )?;

        // === Cluster reset ===
        self.encode(
            &mut encoder,
            Kernel::ResetClusters,
            &[covariances, fractions, &fixed.params],
            Workgroups::Direct(num_clusters.div_ceil(GROUP_SIZE), 1, 1),
        )?;

        let staging = self
            .bin_count
            .encode_copy(ctx, &mut encoder, &fixed.dispatch_args);

        ctx.queue.submit(Some(encoder.finish()));
        Ok(staging)
    }

    /// Count every band of `image` into the voxel grid, one submission per
    /// band. Queue writes land before the submission that follows them, so
    /// each band is counted before the next overwrites the pixel buffer.
    fn submit_histogram(&self, image: &SourceImage, chunks: &PixelChunks) -> Result<()> {
        let ctx = &self.ctx;
        let fixed = &self.fixed;
        let pixels = bound(&self.run.pixels)?;

        for (band, (first_row, rows)) in chunks.bands().enumerate() {
            ctx.queue
                .write_buffer(pixels, 0, bytemuck::cast_slice(&image.packed_rows(first_row, rows)));
            let chunk = PixelChunkParams {
                rows,
                ..Default::default()
            };
            ctx.queue
                .write_buffer(&fixed.pixel_chunk, 0, bytemuck::bytes_of(&chunk));

            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Histogram Encoder"),
                });
            if band == 0 {
                encoder.clear_buffer(&fixed.color_bins, 0, None);
                encoder.clear_buffer(&fixed.bin_counter, 0, None);
            }

            // === Histogram ===
            self.encode(
                &mut encoder,
                Kernel::UpdateColorBins,
                &[pixels, &fixed.color_bins, &fixed.params, &fixed.pixel_chunk],
                Workgroups::Direct(image.width().div_ceil(PIXEL_TILE), rows.div_ceil(PIXEL_TILE), 1),
            )?;
            ctx.queue.submit(Some(encoder.finish()));
        }

        if chunks.band_count() > 1 {
            tracing::debug!(
                "Counted {}x{} pixels in {} bands of {} rows",
                image.width(),
                image.height(),
                chunks.band_count(),
                chunks.rows_per_chunk()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Default `max_storage_buffer_binding_size`.
    const DEFAULT_BINDING: u64 = 128 << 20;
    const DEFAULT_WORKGROUPS: u32 = 65535;

    #[test]
    fn test_small_image_is_one_band() {
        let chunks = PixelChunks::plan(640, 480, DEFAULT_BINDING, DEFAULT_WORKGROUPS).unwrap();
        assert_eq!(chunks.band_count(), 1);
        assert_eq!(chunks.rows_per_chunk(), 480);
        assert_eq!(chunks.buffer_size(), 640 * 480 * 4);
        assert_eq!(chunks.bands().collect::<Vec<_>>(), vec![(0, 480)]);
    }

    #[test]
    fn test_large_photo_is_split_under_binding_limit() {
        // 48 MP is 192 MB of packed pixels.
        let chunks = PixelChunks::plan(8000, 6000, DEFAULT_BINDING, DEFAULT_WORKGROUPS).unwrap();
        assert_eq!(chunks.rows_per_chunk(), 4194);
        assert!(chunks.buffer_size() <= DEFAULT_BINDING);
        assert_eq!(chunks.band_count(), 2);
        assert_eq!(chunks.bands().collect::<Vec<_>>(), vec![(0, 4194), (4194, 1806)]);
    }

    #[test]
    fn test_bands_cover_every_row_once() {
        let chunks = PixelChunks::plan(10, 103, 10 * 4 * 7, DEFAULT_WORKGROUPS).unwrap();
        assert_eq!(chunks.rows_per_chunk(), 7);
        let mut next = 0;
        for (first, rows) in chunks.bands() {
            assert_eq!(first, next);
            assert!(rows > 0 && rows <= 7);
            next += rows;
        }
        assert_eq!(next, 103);
        assert_eq!(chunks.bands().count(), chunks.band_count());
    }

    #[test]
    fn test_band_height_respects_dispatch_limit() {
        let chunks = PixelChunks::plan(1, 5000, DEFAULT_BINDING, 4).unwrap();
        assert_eq!(chunks.rows_per_chunk(), 4 * PIXEL_TILE);
    }

    #[test]
    fn test_unbindable_row_is_rejected() {
        let err = PixelChunks::plan(1000, 2, 3999, DEFAULT_WORKGROUPS).unwrap_err();
        assert!(matches!(err, GmmError::ResourceCreation(_)));
        assert!(PixelChunks::plan(1000, 2, 4000, DEFAULT_WORKGROUPS).is_ok());
        assert!(PixelChunks::plan(65, 1, DEFAULT_BINDING, 4).is_err());
    }
}
