// convolution.rs — Gaussian kernel derivation and the CPU reference filter.
//
// A separable N-D Gaussian is N one-dimensional passes with the same 1-D
// kernel, one per axis:
//
//   horizontal  (along width,  the fastest-varying axis)
//   vertical    (along height)
//   depth       (along depth,  3-D only)
//
// cutting the per-sample cost from O(kᴺ) to O(N·k).
//
// The per-sample routine `convolve_sample` is the single definition of a
// pass: the CPU reference below, the host backend and the WGSL shader all
// compute exactly this, in the same summation order.
//
// BORDER HANDLING: Clamp (replicate edge samples). Taps that fall outside
// the volume read the nearest edge sample, so a constant input stays
// constant everywhere, borders included.

use ndarray::{ArrayD, IxDyn};

use crate::error::{Error, Result};

/// Default truncation radius, in standard deviations.
pub const DEFAULT_TRUNCATE: f64 = 4.0;

/// Largest radius whose kernel length `2 * lw + 1` still fits the `i32`
/// tap count the kernels receive.
pub const MAX_KERNEL_RADIUS: usize = (i32::MAX as usize - 1) / 2;

/// Kernel radius in samples: `floor(truncate * sigma + 0.5)`.
///
/// Fails with `InvalidSigma` for a negative or non-finite `sigma`, and for
/// radii beyond [`MAX_KERNEL_RADIUS`].
pub fn kernel_radius(sigma: f64, truncate: f64) -> Result<usize> {
    if !sigma.is_finite() || sigma < 0.0 {
        return Err(Error::InvalidSigma(sigma));
    }
    let r = (truncate * sigma + 0.5).floor();
    if !r.is_finite() || r > MAX_KERNEL_RADIUS as f64 {
        return Err(Error::InvalidSigma(sigma));
    }
    Ok(r.max(0.0) as usize)
}

/// Derive a normalized 1-D Gaussian kernel.
///
/// Returns `2 * lw + 1` weights with `lw = kernel_radius(sigma, truncate)`,
/// symmetric about the centre and summing to 1. `sigma == 0` gives the
/// identity kernel `[1.0]`.
///
/// # Examples
/// ```
/// let k = sepconv::convolution::gaussian_kernel_1d(1.0, 4.0).unwrap();
/// assert_eq!(k.len(), 9);
/// assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
/// ```
pub fn gaussian_kernel_1d(sigma: f64, truncate: f64) -> Result<Vec<f64>> {
    let lw = kernel_radius(sigma, truncate)?;
    let mut weights = vec![0.0f64; 2 * lw + 1];
    weights[lw] = 1.0;
    let mut sum = 1.0;
    let var = sigma * sigma;
    for i in 1..=lw {
        let w = (-0.5 * (i * i) as f64 / var).exp();
        weights[lw + i] = w;
        weights[lw - i] = w;
        sum += 2.0 * w;
    }
    for w in &mut weights {
        *w /= sum;
    }
    Ok(weights)
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

/// Axis of one 1-D pass, named by the WGSL entry point that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Horizontal,
    Vertical,
    Depth,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::Horizontal, Axis::Vertical, Axis::Depth];

    pub fn entry_point(self) -> &'static str {
        match self {
            Axis::Horizontal => "horizontal_convolution",
            Axis::Vertical => "vertical_convolution",
            Axis::Depth => "depth_convolution",
        }
    }

    pub fn from_entry_point(name: &str) -> Option<Axis> {
        Axis::ALL.into_iter().find(|a| a.entry_point() == name)
    }

    /// The passes a rank-`rank` filter runs, in order.
    pub fn passes(rank: usize) -> &'static [Axis] {
        if rank == 3 {
            &Axis::ALL
        } else {
            &Axis::ALL[..2]
        }
    }
}

/// Volume extent, fastest-varying axis first: `[width, height, depth]`.
/// A 2-D image has depth 1.
pub type Extent = [usize; 3];

/// The extent of a row-major shape `[height, width]` or `[depth, height, width]`.
pub fn extent_of(shape: &[usize]) -> Result<Extent> {
    match *shape {
        [h, w] => Ok([w, h, 1]),
        [d, h, w] => Ok([w, h, d]),
        _ => Err(Error::UnsupportedRank(shape.len())),
    }
}

/// One output sample of a 1-D pass along `axis` at `(x, y, z)`.
///
/// `src` is row-major with `extent = [w, h, d]`; `(x, y, z)` must be in
/// bounds and `weights` odd-length.
#[inline]
pub fn convolve_sample(
    src: &[f32],
    extent: Extent,
    weights: &[f32],
    axis: Axis,
    x: usize,
    y: usize,
    z: usize,
) -> f32 {
    let [w, h, d] = extent;
    let half = (weights.len() / 2) as isize;
    let (pos, len) = match axis {
        Axis::Horizontal => (x, w),
        Axis::Vertical => (y, h),
        Axis::Depth => (z, d),
    };
    let last = len as isize - 1;
    let mut acc = 0.0f32;
    for (k, &wk) in weights.iter().enumerate() {
        let s = (pos as isize + k as isize - half).clamp(0, last) as usize;
        let (sx, sy, sz) = match axis {
            Axis::Horizontal => (s, y, z),
            Axis::Vertical => (x, s, z),
            Axis::Depth => (x, y, s),
        };
        acc += src[(sz * h + sy) * w + sx] * wk;
    }
    acc
}

/// Run one full 1-D pass over a row-major volume.
pub fn convolve_axis(src: &[f32], extent: Extent, weights: &[f32], axis: Axis) -> Vec<f32> {
    let [w, h, d] = extent;
    let mut dst = vec![0.0f32; w * h * d];
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                dst[(z * h + y) * w + x] = convolve_sample(src, extent, weights, axis, x, y, z);
            }
        }
    }
    dst
}

/// CPU reference separable filter for 2-D and 3-D arrays.
///
/// Runs the same passes in the same order as the GPU pipeline, with the
/// weights rounded to `f32` the same way.
pub fn separable_filter(image: &ArrayD<f32>, weights: &[f64]) -> Result<ArrayD<f32>> {
    let extent = extent_of(image.shape())?;
    let weights: Vec<f32> = weights.iter().map(|&w| w as f32).collect();
    let mut data: Vec<f32> = image.iter().copied().collect();
    for &axis in Axis::passes(image.ndim()) {
        data = convolve_axis(&data, extent, &weights, axis);
    }
    ArrayD::from_shape_vec(IxDyn(image.shape()), data).map_err(|_| Error::ShapeMismatch {
        expected: image.shape().to_vec(),
        actual: vec![extent.iter().product()],
    })
}

/// Gaussian-filter `image` on the CPU.
pub fn gaussian_filter(image: &ArrayD<f32>, sigma: f64, truncate: f64) -> Result<ArrayD<f32>> {
    let weights = gaussian_kernel_1d(sigma, truncate)?;
    separable_filter(image, &weights)
}
