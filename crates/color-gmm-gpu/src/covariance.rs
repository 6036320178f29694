//! Packed symmetric 3×3 covariance and its Cholesky factorizations.
//!
//! The canonical layout is two 4-vectors, `diag = (xx, yy, zz, 0)` and
//! `off = (xy, xz, yz, 0)`, shared bit-for-bit with the WGSL kernels. Two
//! factorizations are provided:
//!
//! - [`GuardedCholesky`] clamps every pivot to a minimum variance. It never
//!   fails and feeds the log-density evaluation of the E-step.
//! - [`CholeskyFactor`] is strict and flags non positive-definite input,
//!   substituting a diagonal factor. It feeds ellipsoid visualization.

use glam::{Mat3, Vec3};
use serde::{Deserialize, Serialize};

/// `ln(2π)`
pub const LN_TWO_PI: f32 = 1.837_877_1;

/// Symmetric 3×3 matrix stored as its six independent components.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct PackedCovariance {
    /// `(xx, yy, zz, 0)`
    pub diag: [f32; 4],
    /// `(xy, xz, yz, 0)`
    pub off: [f32; 4],
}

impl PackedCovariance {
    pub const ZERO: Self = Self {
        diag: [0.0; 4],
        off: [0.0; 4],
    };

    pub fn new(xx: f32, yy: f32, zz: f32, xy: f32, xz: f32, yz: f32) -> Self {
        Self {
            diag: [xx, yy, zz, 0.0],
            off: [xy, xz, yz, 0.0],
        }
    }

    /// `variance * I`
    pub fn isotropic(variance: f32) -> Self {
        Self::new(variance, variance, variance, 0.0, 0.0, 0.0)
    }

    /// `weight * d dᵗ`
    pub fn outer_product(d: Vec3, weight: f32) -> Self {
        Self::new(
            d.x * d.x * weight,
            d.y * d.y * weight,
            d.z * d.z * weight,
            d.x * d.y * weight,
            d.x * d.z * weight,
            d.y * d.z * weight,
        )
    }

    pub fn from_mat3(m: Mat3) -> Self {
        Self::new(m.x_axis.x, m.y_axis.y, m.z_axis.z, m.y_axis.x, m.z_axis.x, m.z_axis.y)
    }

    pub fn to_mat3(&self) -> Mat3 {
        let [xx, yy, zz, _] = self.diag;
        let [xy, xz, yz, _] = self.off;
        Mat3::from_cols(
            Vec3::new(xx, xy, xz),
            Vec3::new(xy, yy, yz),
            Vec3::new(xz, yz, zz),
        )
    }

    pub fn add(&self, other: &Self) -> Self {
        let mut out = *self;
        for i in 0..3 {
            out.diag[i] += other.diag[i];
            out.off[i] += other.off[i];
        }
        out
    }

    pub fn scale(&self, s: f32) -> Self {
        let mut out = *self;
        for i in 0..3 {
            out.diag[i] *= s;
            out.off[i] *= s;
        }
        out
    }

    pub fn is_finite(&self) -> bool {
        self.diag.iter().chain(self.off.iter()).all(|v| v.is_finite())
    }

    /// Strict factorization for visualization.
    pub fn decompose(&self) -> CholeskyFactor {
        CholeskyFactor::from_covariance(self)
    }
}

/// Cholesky factor with every pivot clamped to `min_variance`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardedCholesky {
    /// `(l00, l10, l20, l11, l21, l22)`
    pub l: [f32; 6],
    /// `ln det Σ = 2 Σ ln l_ii`
    pub ln_det: f32,
}

impl GuardedCholesky {
    pub fn new(cov: &PackedCovariance, min_variance: f32) -> Self {
        let [xx, yy, zz, _] = cov.diag;
        let [xy, xz, yz, _] = cov.off;

        let l00 = xx.max(min_variance).sqrt();
        let l10 = xy / l00;
        let l20 = xz / l00;
        let l11 = (yy - l10 * l10).max(min_variance).sqrt();
        let l21 = (yz - l20 * l10) / l11;
        let l22 = (zz - l20 * l20 - l21 * l21).max(min_variance).sqrt();

        let ln_det = 2.0 * (l00.ln() + l11.ln() + l22.ln());
        Self {
            l: [l00, l10, l20, l11, l21, l22],
            ln_det,
        }
    }

    /// Solve `L y = d` by forward substitution.
    pub fn whiten(&self, d: Vec3) -> Vec3 {
        let [l00, l10, l20, l11, l21, l22] = self.l;
        let y0 = d.x / l00;
        let y1 = (d.y - l10 * y0) / l11;
        let y2 = (d.z - l20 * y0 - l21 * y1) / l22;
        Vec3::new(y0, y1, y2)
    }

    /// Log of the multivariate normal density at `x`.
    pub fn log_density(&self, x: Vec3, mean: Vec3) -> f32 {
        let y = self.whiten(x - mean);
        -0.5 * (y.length_squared() + self.ln_det + 3.0 * LN_TWO_PI)
    }

    pub fn to_mat3(&self) -> Mat3 {
        let [l00, l10, l20, l11, l21, l22] = self.l;
        Mat3::from_cols(
            Vec3::new(l00, l10, l20),
            Vec3::new(0.0, l11, l21),
            Vec3::new(0.0, 0.0, l22),
        )
    }
}

/// Lower-triangular factor `L` with `L Lᵗ = Σ` (matches `CholeskyFactor` in shaders).
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct CholeskyFactor {
    /// Column 0 `(l00, l10, l20, 0)`
    pub col0: [f32; 4],
    /// Column 1 `(0, l11, l21, 0)`
    pub col1: [f32; 4],
    /// Column 2 `(0, 0, l22, 0)`
    pub col2: [f32; 4],
    /// 1 when the input was positive definite, 0 when the fallback was used
    pub valid: u32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

impl CholeskyFactor {
    /// Pivots at or below this are treated as non positive-definite.
    pub const PIVOT_EPSILON: f32 = 1e-12;

    pub fn from_covariance(cov: &PackedCovariance) -> Self {
        match strict_cholesky(cov) {
            Some([l00, l10, l20, l11, l21, l22]) => Self {
                col0: [l00, l10, l20, 0.0],
                col1: [0.0, l11, l21, 0.0],
                col2: [0.0, 0.0, l22, 0.0],
                valid: 1,
                ..Default::default()
            },
            None => {
                let [xx, yy, zz, _] = cov.diag;
                let safe = |v: f32| if v.is_finite() { v.max(0.0).sqrt() } else { 0.0 };
                Self {
                    col0: [safe(xx), 0.0, 0.0, 0.0],
                    col1: [0.0, safe(yy), 0.0, 0.0],
                    col2: [0.0, 0.0, safe(zz), 0.0],
                    valid: 0,
                    ..Default::default()
                }
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }

    pub fn to_mat3(&self) -> Mat3 {
        Mat3::from_cols(
            Vec3::from_slice(&self.col0[..3]),
            Vec3::from_slice(&self.col1[..3]),
            Vec3::from_slice(&self.col2[..3]),
        )
    }
}

fn strict_cholesky(cov: &PackedCovariance) -> Option<[f32; 6]> {
    let [xx, yy, zz, _] = cov.diag;
    let [xy, xz, yz, _] = cov.off;
    let eps = CholeskyFactor::PIVOT_EPSILON;

    if !cov.is_finite() || xx <= eps {
        return None;
    }
    let l00 = xx.sqrt();
    let l10 = xy / l00;
    let l20 = xz / l00;
    let p11 = yy - l10 * l10;
    if p11 <= eps {
        return None;
    }
    let l11 = p11.sqrt();
    let l21 = (yz - l20 * l10) / l11;
    let p22 = zz - l20 * l20 - l21 * l21;
    if p22 <= eps {
        return None;
    }
    Some([l00, l10, l20, l11, l21, p22.sqrt()])
}
