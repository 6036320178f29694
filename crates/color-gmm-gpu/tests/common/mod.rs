#![allow(dead_code)]

use std::sync::Arc;

use color_gmm_gpu::{GpuContext, SourceImage};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A shared GPU context, or `None` (with a notice) on machines without an adapter.
pub async fn gpu() -> Option<Arc<GpuContext>> {
    init_tracing();
    match GpuContext::new().await {
        Ok(ctx) => Some(Arc::new(ctx)),
        Err(e) => {
            eprintln!("skipping GPU test: {e}");
            None
        }
    }
}

/// Pure red next to pure blue.
pub fn red_blue() -> SourceImage {
    SourceImage::from_rgb_pixels(2, 1, &[[255, 0, 0], [0, 0, 255]]).unwrap()
}

/// Deterministic pseudo-random colors.
pub fn noisy_image(width: u32, height: u32, seed: u32) -> SourceImage {
    let mut state = seed;
    let pixels: Vec<[u8; 3]> = (0..width * height)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let [_, r, g, b] = state.to_le_bytes();
            [r, g, b]
        })
        .collect();
    SourceImage::from_rgb_pixels(width, height, &pixels).unwrap()
}

/// A few color blobs with jitter, closer to a real photo than noise.
pub fn blob_image(width: u32, height: u32) -> SourceImage {
    let centers = [[200u8, 40, 40], [40, 160, 60], [50, 60, 210], [230, 220, 200]];
    let mut state = 7u32;
    let pixels: Vec<[u8; 3]> = (0..width * height)
        .map(|i| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let jitter = state.to_le_bytes();
            let center = centers[i as usize % centers.len()];
            std::array::from_fn(|c| center[c].saturating_add(jitter[c] % 24))
        })
        .collect();
    SourceImage::from_rgb_pixels(width, height, &pixels).unwrap()
}

pub fn assert_close(actual: f32, expected: f32, tolerance: f32, what: &str) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "{what}: expected {expected}, got {actual} (tolerance {tolerance})"
    );
}
