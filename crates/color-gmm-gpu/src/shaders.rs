//! WGSL compute shaders for histogram construction and EM.
//!
//! Every kernel lives in its own module so its bind group layout contains
//! exactly the resources it touches. [`PRELUDE`] is prepended to each body.
//!
//! Buffer conventions:
//! - Per-bin-per-cluster scratch is cluster-major: `cluster * VOXEL_COUNT + bin`.
//! - After a reduction, the total for `cluster` sits at `cluster * VOXEL_COUNT`.
//! - Normalization writes compact per-cluster values to index `cluster`,
//!   which never collides with another cluster's reduced slot.

/// Shared constants, data structures and helpers.
pub const PRELUDE: &str = r#"
// ============================================================================
// Constants (mirrored in lib.rs)
// ============================================================================

const GRID_SIZE: u32 = 32u;
const VOXEL_COUNT: u32 = 32768u;
const GROUP_SIZE: u32 = 32u;
const LN_TWO_PI: f32 = 1.8378771;
const NEG_INF: f32 = -3.402823e38;

// ============================================================================
// Data structures
// ============================================================================

struct Params {
    num_clusters: u32,
    width: u32,
    height: u32,
    use_gamma: u32,
    total_samples: f32,
    initial_variance: f32,
    min_variance: f32,
    min_weight: f32,
}

struct ReduceParams {
    level: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

struct ColorBin {
    index: u32,
    count: u32,
}

struct DispatchArgs {
    x: u32,
    y: u32,
    z: u32,
    count: u32,
}

// diag = (xx, yy, zz, 0), off = (xy, xz, yz, 0)
struct PackedCovariance {
    diag: vec4<f32>,
    off: vec4<f32>,
}

struct ClusterStats {
    mean: vec4<f32>,
    // (l00, l10, l20, l11)
    chol0: vec4<f32>,
    // (l21, l22, ln_det, 0)
    chol1: vec4<f32>,
    covariance: PackedCovariance,
}

struct CholeskyFactor {
    col0: vec4<f32>,
    col1: vec4<f32>,
    col2: vec4<f32>,
    valid: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

// ============================================================================
// Helpers
// ============================================================================

fn bin_position(index: u32) -> vec3<f32> {
    let cell = vec3<u32>(
        index % GRID_SIZE,
        (index / GRID_SIZE) % GRID_SIZE,
        index / (GRID_SIZE * GRID_SIZE),
    );
    return vec3<f32>(cell) / f32(GRID_SIZE - 1u);
}
"#;

// ============================================================================
// Initialization kernels
// ============================================================================

/// Quantize one band of image rows and count voxel occupancy.
pub const UPDATE_COLOR_BINS: &str = r#"
@group(0) @binding(0) var<storage, read> pixels: array<u32>;
@group(0) @binding(1) var<storage, read_write> color_bins: array<atomic<u32>>;
@group(0) @binding(2) var<uniform> params: Params;
@group(0) @binding(3) var<uniform> chunk: PixelChunk;

struct PixelChunk {
    rows: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

fn srgb_to_linear(c: vec3<f32>) -> vec3<f32> {
    let low = c / 12.92;
    let high = pow((c + vec3<f32>(0.055)) / 1.055, vec3<f32>(2.4));
    return select(high, low, c <= vec3<f32>(0.04045));
}

fn quantize(color: vec3<f32>) -> u32 {
    let scaled = clamp(color, vec3<f32>(0.0), vec3<f32>(1.0)) * f32(GRID_SIZE - 1u) + vec3<f32>(0.5);
    let cell = min(vec3<u32>(scaled), vec3<u32>(GRID_SIZE - 1u));
    return cell.x + cell.y * GRID_SIZE + cell.z * GRID_SIZE * GRID_SIZE;
}

@compute @workgroup_size(16, 16)
fn update_color_bins(@builtin(global_invocation_id) global_id: vec3<u32>) {
    if (global_id.x >= params.width || global_id.y >= chunk.rows) {
        return;
    }

    let pixel = pixels[global_id.y * params.width + global_id.x];
    var color = unpack4x8unorm(pixel).rgb;
    if (params.use_gamma != 0u) {
        color = srgb_to_linear(color);
    }

    atomicAdd(&color_bins[quantize(color)], 1u);
}
"#;

/// Append every populated voxel to the compacted bin list.
pub const SELECT_COLOR_BINS: &str = r#"
@group(0) @binding(0) var<storage, read> color_bins: array<u32>;
@group(0) @binding(1) var<storage, read_write> selected_bins: array<ColorBin>;
@group(0) @binding(2) var<storage, read_write> bin_counter: atomic<u32>;

@compute @workgroup_size(32)
fn select_color_bins(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let index = global_id.x;
    if (index >= VOXEL_COUNT) {
        return;
    }

    let count = color_bins[index];
    if (count > 0u) {
        let slot = atomicAdd(&bin_counter, 1u);
        selected_bins[slot] = ColorBin(index, count);
    }
}
"#;

/// Turn the append counter into indirect dispatch records.
///
/// Slot 0: per-bin (E-step). Slot 1: per-bin per-cluster (covariance
/// partials, reduction level 0). Slots 2-3: reduction levels 1-2. The
/// `count` field is the number of inputs the dispatch covers.
pub const UPDATE_INDIRECT_ARGS: &str = r#"
@group(0) @binding(0) var<storage, read> bin_counter: u32;
@group(0) @binding(1) var<storage, read_write> dispatch_args: array<DispatchArgs, 4>;
@group(0) @binding(2) var<uniform> params: Params;

fn groups_for(count: u32) -> u32 {
    return (count + GROUP_SIZE - 1u) / GROUP_SIZE;
}

@compute @workgroup_size(1)
fn update_indirect_args() {
    let populated = min(bin_counter, VOXEL_COUNT);
    let level1 = groups_for(populated);
    let level2 = groups_for(level1);
    let level3 = groups_for(level2);
    let k = params.num_clusters;

    dispatch_args[0] = DispatchArgs(level1, 1u, 1u, populated);
    dispatch_args[1] = DispatchArgs(level1, k, 1u, populated);
    dispatch_args[2] = DispatchArgs(level2, k, 1u, level1);
    dispatch_args[3] = DispatchArgs(level3, k, 1u, level2);
}
"#;

/// Isotropic covariances and uniform mixing fractions.
pub const RESET_CLUSTERS: &str = r#"
@group(0) @binding(0) var<storage, read_write> covariances: array<PackedCovariance>;
@group(0) @binding(1) var<storage, read_write> fractions: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(32)
fn reset_clusters(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let cluster = global_id.x;
    if (cluster >= params.num_clusters) {
        return;
    }

    let v = params.initial_variance;
    covariances[cluster] = PackedCovariance(vec4<f32>(v, v, v, 0.0), vec4<f32>(0.0));
    fractions[cluster] = 1.0 / f32(params.num_clusters);
}
"#;

// ============================================================================
// Convergence kernels
// ============================================================================

/// Guarded Cholesky factor and log-determinant per cluster.
pub const PREPARE_CLUSTER_STATS: &str = r#"
@group(0) @binding(0) var<storage, read> means: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read> covariances: array<PackedCovariance>;
@group(0) @binding(2) var<storage, read_write> stats: array<ClusterStats>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(32)
fn prepare_cluster_stats(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let cluster = global_id.x;
    if (cluster >= params.num_clusters) {
        return;
    }

    let cov = covariances[cluster];
    let m = params.min_variance;

    let l00 = sqrt(max(cov.diag.x, m));
    let l10 = cov.off.x / l00;
    let l20 = cov.off.y / l00;
    let l11 = sqrt(max(cov.diag.y - l10 * l10, m));
    let l21 = (cov.off.z - l20 * l10) / l11;
    let l22 = sqrt(max(cov.diag.z - l20 * l20 - l21 * l21, m));
    let ln_det = 2.0 * (log(l00) + log(l11) + log(l22));

    stats[cluster] = ClusterStats(
        means[cluster],
        vec4<f32>(l00, l10, l20, l11),
        vec4<f32>(l21, l22, ln_det, 0.0),
        cov,
    );
}
"#;

/// E-step: responsibilities per bin plus weighted partial sums.
pub const UPDATE_RESPS_AND_MEANS: &str = r#"
@group(0) @binding(0) var<storage, read> selected_bins: array<ColorBin>;
@group(0) @binding(1) var<storage, read> dispatch_args: array<DispatchArgs, 4>;
@group(0) @binding(2) var<storage, read> stats: array<ClusterStats>;
@group(0) @binding(3) var<storage, read> fractions: array<f32>;
@group(0) @binding(4) var<storage, read_write> responsibilities: array<f32>;
@group(0) @binding(5) var<storage, read_write> weights_out: array<f32>;
@group(0) @binding(6) var<storage, read_write> means_out: array<vec4<f32>>;
@group(0) @binding(7) var<uniform> params: Params;

// Solve L y = x - mean, then evaluate the Gaussian log-density.
fn log_density(x: vec3<f32>, s: ClusterStats) -> f32 {
    let d = x - s.mean.xyz;
    let y0 = d.x / s.chol0.x;
    let y1 = (d.y - s.chol0.y * y0) / s.chol0.w;
    let y2 = (d.z - s.chol0.z * y0 - s.chol1.x * y1) / s.chol1.y;
    return -0.5 * (y0 * y0 + y1 * y1 + y2 * y2 + s.chol1.z + 3.0 * LN_TWO_PI);
}

@compute @workgroup_size(32)
fn update_resps_and_means(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= dispatch_args[0].count) {
        return;
    }

    let bin = selected_bins[i];
    let x = bin_position(bin.index);
    let count = f32(bin.count);
    let k = params.num_clusters;

    // Log-space evaluation, clusters with zero fraction are skipped.
    var probs: array<f32, 32>;
    var max_log = NEG_INF;
    for (var c = 0u; c < k; c += 1u) {
        var lp = NEG_INF;
        let frac = fractions[c];
        if (frac > 0.0) {
            lp = log_density(x, stats[c]) + log(frac);
            max_log = max(max_log, lp);
        }
        probs[c] = lp;
    }

    var total = 0.0;
    for (var c = 0u; c < k; c += 1u) {
        var p = 0.0;
        if (fractions[c] > 0.0) {
            p = exp(probs[c] - max_log);
        }
        probs[c] = p;
        total += p;
    }

    for (var c = 0u; c < k; c += 1u) {
        var r = 1.0 / f32(k);
        if (total > 0.0) {
            r = probs[c] / total;
        }

        let slot = c * VOXEL_COUNT + i;
        let w = r * count;
        responsibilities[slot] = r;
        weights_out[slot] = w;
        means_out[slot] = vec4<f32>(x * w, 0.0);
    }
}
"#;

/// One tree-reduction level over weights and weighted positions.
pub const REDUCE_WEIGHTS_AND_MEANS: &str = r#"
@group(0) @binding(0) var<storage, read> dispatch_args: array<DispatchArgs, 4>;
@group(0) @binding(1) var<storage, read> weights_in: array<f32>;
@group(0) @binding(2) var<storage, read_write> weights_out: array<f32>;
@group(0) @binding(3) var<storage, read> means_in: array<vec4<f32>>;
@group(0) @binding(4) var<storage, read_write> means_out: array<vec4<f32>>;
@group(0) @binding(5) var<uniform> level_params: ReduceParams;

var<workgroup> shared_weights: array<f32, 32>;
var<workgroup> shared_means: array<vec3<f32>, 32>;

@compute @workgroup_size(32)
fn reduce_weights_and_means(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) wg_id: vec3<u32>
) {
    let lid = local_id.x;
    let base = wg_id.y * VOXEL_COUNT;
    let input_len = dispatch_args[level_params.level + 1u].count;
    let i = wg_id.x * GROUP_SIZE + lid;

    var w = 0.0;
    var m = vec3<f32>(0.0);
    if (i < input_len) {
        w = weights_in[base + i];
        m = means_in[base + i].xyz;
    }
    shared_weights[lid] = w;
    shared_means[lid] = m;

    workgroupBarrier();

    for (var stride = 16u; stride > 0u; stride >>= 1u) {
        if (lid < stride) {
            shared_weights[lid] += shared_weights[lid + stride];
            shared_means[lid] += shared_means[lid + stride];
        }
        workgroupBarrier();
    }

    if (lid == 0u) {
        weights_out[base + wg_id.x] = shared_weights[0];
        means_out[base + wg_id.x] = vec4<f32>(shared_means[0], 0.0);
    }
}
"#;

/// Means and fractions from reduced sums, in place.
pub const NORMALIZE_MEANS_AND_FRACS: &str = r#"
@group(0) @binding(0) var<storage, read> weights: array<f32>;
@group(0) @binding(1) var<storage, read> stats: array<ClusterStats>;
@group(0) @binding(2) var<storage, read_write> means: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read_write> fractions: array<f32>;
@group(0) @binding(4) var<uniform> params: Params;

@compute @workgroup_size(32)
fn normalize_means_and_fracs(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let cluster = global_id.x;
    if (cluster >= params.num_clusters) {
        return;
    }

    let slot = cluster * VOXEL_COUNT;
    let w = weights[slot];
    fractions[cluster] = w / params.total_samples;

    // A dead cluster keeps the mean it entered the step with.
    if (w > params.min_weight) {
        means[cluster] = vec4<f32>(means[slot].xyz / w, 0.0);
    } else {
        means[cluster] = stats[cluster].mean;
    }
}
"#;

/// M-step: weighted outer-product deviation per bin and cluster.
pub const UPDATE_COVARIANCES: &str = r#"
@group(0) @binding(0) var<storage, read> selected_bins: array<ColorBin>;
@group(0) @binding(1) var<storage, read> dispatch_args: array<DispatchArgs, 4>;
@group(0) @binding(2) var<storage, read> means: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read> responsibilities: array<f32>;
@group(0) @binding(4) var<storage, read_write> covariances_out: array<PackedCovariance>;

@compute @workgroup_size(32)
fn update_covariances(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    let cluster = global_id.y;
    if (i >= dispatch_args[1].count) {
        return;
    }

    let bin = selected_bins[i];
    let slot = cluster * VOXEL_COUNT + i;
    let w = responsibilities[slot] * f32(bin.count);
    let d = bin_position(bin.index) - means[cluster].xyz;

    covariances_out[slot] = PackedCovariance(
        vec4<f32>(d * d * w, 0.0),
        vec4<f32>(d.x * d.y * w, d.x * d.z * w, d.y * d.z * w, 0.0),
    );
}
"#;

/// One tree-reduction level over packed covariances.
pub const REDUCE_COVARIANCES: &str = r#"
@group(0) @binding(0) var<storage, read> dispatch_args: array<DispatchArgs, 4>;
@group(0) @binding(1) var<storage, read> covariances_in: array<PackedCovariance>;
@group(0) @binding(2) var<storage, read_write> covariances_out: array<PackedCovariance>;
@group(0) @binding(3) var<uniform> level_params: ReduceParams;

var<workgroup> shared_diag: array<vec3<f32>, 32>;
var<workgroup> shared_off: array<vec3<f32>, 32>;

@compute @workgroup_size(32)
fn reduce_covariances(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) wg_id: vec3<u32>
) {
    let lid = local_id.x;
    let base = wg_id.y * VOXEL_COUNT;
    let input_len = dispatch_args[level_params.level + 1u].count;
    let i = wg_id.x * GROUP_SIZE + lid;

    var diag = vec3<f32>(0.0);
    var off = vec3<f32>(0.0);
    if (i < input_len) {
        let cov = covariances_in[base + i];
        diag = cov.diag.xyz;
        off = cov.off.xyz;
    }
    shared_diag[lid] = diag;
    shared_off[lid] = off;

    workgroupBarrier();

    for (var stride = 16u; stride > 0u; stride >>= 1u) {
        if (lid < stride) {
            shared_diag[lid] += shared_diag[lid + stride];
            shared_off[lid] += shared_off[lid + stride];
        }
        workgroupBarrier();
    }

    if (lid == 0u) {
        covariances_out[base + wg_id.x] = PackedCovariance(
            vec4<f32>(shared_diag[0], 0.0),
            vec4<f32>(shared_off[0], 0.0),
        );
    }
}
"#;

/// Covariances from reduced sums, in place.
pub const NORMALIZE_COVARIANCES: &str = r#"
@group(0) @binding(0) var<storage, read> weights: array<f32>;
@group(0) @binding(1) var<storage, read> stats: array<ClusterStats>;
@group(0) @binding(2) var<storage, read_write> covariances: array<PackedCovariance>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(32)
fn normalize_covariances(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let cluster = global_id.x;
    if (cluster >= params.num_clusters) {
        return;
    }

    let slot = cluster * VOXEL_COUNT;
    let w = weights[slot];

    if (w > params.min_weight) {
        let sum = covariances[slot];
        covariances[cluster] = PackedCovariance(
            vec4<f32>(max(sum.diag.xyz / w, vec3<f32>(0.0)), 0.0),
            vec4<f32>(sum.off.xyz / w, 0.0),
        );
    } else {
        covariances[cluster] = stats[cluster].covariance;
    }
}
"#;

// ============================================================================
// Visualization kernels
// ============================================================================

/// Strict Cholesky factor per cluster, diagonal fallback when not SPD.
pub const DECOMPOSE_COVARIANCES: &str = r#"
@group(0) @binding(0) var<storage, read> covariances: array<PackedCovariance>;
@group(0) @binding(1) var<storage, read_write> factors: array<CholeskyFactor>;
@group(0) @binding(2) var<uniform> params: Params;

const PIVOT_EPSILON: f32 = 1e-12;

// Exponent bits all set means inf or NaN.
fn is_finite(v: f32) -> bool {
    return (bitcast<u32>(v) & 0x7f800000u) != 0x7f800000u;
}

fn safe_sqrt(v: f32) -> f32 {
    if (is_finite(v)) {
        return sqrt(max(v, 0.0));
    }
    return 0.0;
}

@compute @workgroup_size(32)
fn decompose_covariances(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let cluster = global_id.x;
    if (cluster >= params.num_clusters) {
        return;
    }

    let cov = covariances[cluster];
    let finite = is_finite(cov.diag.x) && is_finite(cov.diag.y) && is_finite(cov.diag.z)
        && is_finite(cov.off.x) && is_finite(cov.off.y) && is_finite(cov.off.z);

    var valid = finite && cov.diag.x > PIVOT_EPSILON;
    var l00 = 0.0;
    var l10 = 0.0;
    var l20 = 0.0;
    var l11 = 0.0;
    var l21 = 0.0;
    var l22 = 0.0;

    if (valid) {
        l00 = sqrt(cov.diag.x);
        l10 = cov.off.x / l00;
        l20 = cov.off.y / l00;
        let p11 = cov.diag.y - l10 * l10;
        valid = p11 > PIVOT_EPSILON;
        if (valid) {
            l11 = sqrt(p11);
            l21 = (cov.off.z - l20 * l10) / l11;
            let p22 = cov.diag.z - l20 * l20 - l21 * l21;
            valid = p22 > PIVOT_EPSILON;
            if (valid) {
                l22 = sqrt(p22);
            }
        }
    }

    if (valid) {
        factors[cluster] = CholeskyFactor(
            vec4<f32>(l00, l10, l20, 0.0),
            vec4<f32>(0.0, l11, l21, 0.0),
            vec4<f32>(0.0, 0.0, l22, 0.0),
            1u, 0u, 0u, 0u,
        );
    } else {
        factors[cluster] = CholeskyFactor(
            vec4<f32>(safe_sqrt(cov.diag.x), 0.0, 0.0, 0.0),
            vec4<f32>(0.0, safe_sqrt(cov.diag.y), 0.0, 0.0),
            vec4<f32>(0.0, 0.0, safe_sqrt(cov.diag.z), 0.0),
            0u, 0u, 0u, 0u,
        );
    }
}
"#;
