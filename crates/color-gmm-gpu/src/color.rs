//! Source images, color quantization and seeding.

use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::{GmmError, Result, GRID_SIZE};

/// How source pixel values are interpreted before quantization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    /// Pixels are sRGB encoded and are converted to linear before binning.
    #[default]
    Srgb,
    /// Pixels are binned as they are.
    Linear,
}

impl ColorSpace {
    /// Value of the `use_gamma` kernel flag.
    pub fn use_gamma(self) -> bool {
        matches!(self, ColorSpace::Srgb)
    }
}

impl std::fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColorSpace::Srgb => write!(f, "srgb"),
            ColorSpace::Linear => write!(f, "linear"),
        }
    }
}

impl std::str::FromStr for ColorSpace {
    type Err = GmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "srgb" | "gamma" => Ok(ColorSpace::Srgb),
            "linear" => Ok(ColorSpace::Linear),
            other => Err(GmmError::InvalidConfig(format!(
                "unknown color space `{other}`, expected `srgb` or `linear`"
            ))),
        }
    }
}

/// An 8-bit RGBA image held in host memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    width: u32,
    height: u32,
    pixels: Vec<[u8; 4]>,
}

impl SourceImage {
    /// Wrap tightly packed RGBA8 bytes.
    pub fn from_rgba8(width: u32, height: u32, bytes: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 {
            return Err(GmmError::InvalidConfig(format!(
                "source image has zero area ({width}x{height})"
            )));
        }
        if bytes.len() != expected {
            return Err(GmmError::InvalidConfig(format!(
                "source image data is {} bytes, expected {expected} for {width}x{height} RGBA8",
                bytes.len()
            )));
        }
        let pixels = bytes
            .chunks_exact(4)
            .map(|p| [p[0], p[1], p[2], p[3]])
            .collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Build an image from opaque RGB pixels in row-major order.
    pub fn from_rgb_pixels(width: u32, height: u32, rgb: &[[u8; 3]]) -> Result<Self> {
        let bytes = rgb.iter().flat_map(|&[r, g, b]| [r, g, b, 255]).collect();
        Self::from_rgba8(width, height, bytes)
    }

    /// A single-color image.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let count = width as usize * height as usize;
        Self::from_rgb_pixels(width, height, &vec![rgb; count])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of pixels, the sample count of the mixture.
    pub fn sample_count(&self) -> u32 {
        self.width * self.height
    }

    pub fn pixels(&self) -> &[[u8; 4]] {
        &self.pixels
    }

    /// Rows `first_row..first_row + rows`, packed little-endian into `u32`s
    /// for `unpack4x8unorm`. Rows past the bottom edge are skipped.
    pub fn packed_rows(&self, first_row: u32, rows: u32) -> Vec<u32> {
        let width = self.width as usize;
        let start = (first_row as usize * width).min(self.pixels.len());
        let end = (start + rows as usize * width).min(self.pixels.len());
        self.pixels[start..end]
            .iter()
            .map(|&p| u32::from_le_bytes(p))
            .collect()
    }

    /// Normalized color of a pixel, optionally converted from sRGB.
    pub fn normalized(pixel: [u8; 4], color_space: ColorSpace) -> Vec3 {
        let c = Vec3::new(pixel[0] as f32, pixel[1] as f32, pixel[2] as f32) / 255.0;
        if color_space.use_gamma() {
            Vec3::new(srgb_to_linear(c.x), srgb_to_linear(c.y), srgb_to_linear(c.z))
        } else {
            c
        }
    }
}

/// sRGB electro-optical transfer function.
pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Inverse of [`srgb_to_linear`].
pub fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

/// Flattened voxel index of a normalized color.
pub fn quantize(color: Vec3) -> u32 {
    let max = (GRID_SIZE - 1) as f32;
    let cell = (color.clamp(Vec3::ZERO, Vec3::ONE) * max + Vec3::splat(0.5))
        .as_uvec3()
        .min(UVec3::splat(GRID_SIZE - 1));
    cell.x + cell.y * GRID_SIZE + cell.z * GRID_SIZE * GRID_SIZE
}

/// Grid coordinate of a flattened voxel index.
pub fn bin_coordinate(index: u32) -> UVec3 {
    UVec3::new(
        index % GRID_SIZE,
        (index / GRID_SIZE) % GRID_SIZE,
        index / (GRID_SIZE * GRID_SIZE),
    )
}

/// Normalized color a voxel stands for.
pub fn bin_position(index: u32) -> Vec3 {
    bin_coordinate(index).as_vec3() / (GRID_SIZE - 1) as f32
}

/// HSV to RGB, all components in `[0, 1]`.
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Vec3 {
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 {
        0 => Vec3::new(v, t, p),
        1 => Vec3::new(q, v, p),
        2 => Vec3::new(p, v, t),
        3 => Vec3::new(p, q, v),
        4 => Vec3::new(t, p, v),
        _ => Vec3::new(v, p, q),
    }
}

/// Initial means spread over evenly spaced hues at half saturation and value.
pub fn hue_seeds(count: usize) -> Vec<Vec3> {
    (0..count)
        .map(|i| hsv_to_rgb(i as f32 / count as f32, 0.5, 0.5))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VOXEL_COUNT;

    #[test]
    fn test_quantize_maps_primaries_to_corners() {
        assert_eq!(quantize(Vec3::ZERO), 0);
        assert_eq!(quantize(Vec3::X), GRID_SIZE - 1);
        assert_eq!(quantize(Vec3::Z), (GRID_SIZE - 1) * GRID_SIZE * GRID_SIZE);
        assert_eq!(quantize(Vec3::ONE), VOXEL_COUNT - 1);
        assert_eq!(bin_position(quantize(Vec3::X)), Vec3::X);
        assert_eq!(bin_position(quantize(Vec3::Z)), Vec3::Z);
    }

    #[test]
    fn test_quantize_clamps_out_of_range() {
        assert_eq!(quantize(Vec3::splat(-3.0)), 0);
        assert_eq!(quantize(Vec3::splat(7.0)), VOXEL_COUNT - 1);
    }

    #[test]
    fn test_bin_coordinate_inverts_flattening() {
        let index = 5 + 7 * GRID_SIZE + 11 * GRID_SIZE * GRID_SIZE;
        assert_eq!(bin_coordinate(index), UVec3::new(5, 7, 11));
    }

    #[test]
    fn test_srgb_endpoints_are_fixed() {
        assert_eq!(srgb_to_linear(0.0), 0.0);
        assert!((srgb_to_linear(1.0) - 1.0).abs() < 1e-6);
        assert!(srgb_to_linear(0.5) < 0.5);
    }

    #[test]
    fn test_linear_to_srgb_inverts_decoding() {
        for c in [0.0, 0.002, 0.2, 0.5, 0.9, 1.0] {
            assert!((linear_to_srgb(srgb_to_linear(c)) - c).abs() < 1e-5, "{c}");
        }
    }

    #[test]
    fn test_hue_seeds_are_distinct() {
        let seeds = hue_seeds(6);
        assert_eq!(seeds.len(), 6);
        assert!((seeds[0] - Vec3::new(0.5, 0.25, 0.25)).length() < 1e-6);
        for (i, a) in seeds.iter().enumerate() {
            for b in &seeds[i + 1..] {
                assert!((*a - *b).length() > 1e-3);
            }
        }
    }

    #[test]
    fn test_source_image_validation() {
        assert!(SourceImage::from_rgba8(0, 4, Vec::new()).is_err());
        assert!(SourceImage::from_rgba8(2, 2, vec![0; 15]).is_err());
        let image = SourceImage::solid(3, 2, [10, 20, 30]).unwrap();
        assert_eq!(image.sample_count(), 6);
        assert_eq!(image.packed_rows(0, 2)[0], u32::from_le_bytes([10, 20, 30, 255]));
    }

    #[test]
    fn test_packed_rows_slices_bands() {
        let rgb: Vec<[u8; 3]> = (0..6u8).map(|i| [i, 0, 0]).collect();
        let image = SourceImage::from_rgb_pixels(2, 3, &rgb).unwrap();
        let band = image.packed_rows(1, 1);
        assert_eq!(band, vec![u32::from_le_bytes([2, 0, 0, 255]), u32::from_le_bytes([3, 0, 0, 255])]);
        // The last band may be shorter than requested.
        assert_eq!(image.packed_rows(2, 4).len(), 2);
        assert!(image.packed_rows(3, 1).is_empty());
        assert_eq!(image.packed_rows(0, 3).len(), 6);
    }

    #[test]
    fn test_color_space_parsing() {
        assert_eq!("sRGB".parse::<ColorSpace>().unwrap(), ColorSpace::Srgb);
        assert_eq!("linear".parse::<ColorSpace>().unwrap(), ColorSpace::Linear);
        assert!("cmyk".parse::<ColorSpace>().is_err());
    }
}
