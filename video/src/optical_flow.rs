//! Optical Flow Algorithms
//!
//! Alternatives to the Horn-Schunck solver:
//! - Lucas-Kanade: sparse, pyramidal, iterative point tracking
//! - Farneback: dense flow from quadratic polynomial expansion, refined
//!   coarse to fine
//!
//! Both take frames on the 0-255 scale and report displacement from the
//! previous frame to the next one.

use crate::{check_frame_pair, FlowField, Result, VideoError};
use cv_core::Field;
use cv_imgproc::{
    box_kernel, build_pyramid, correlate, sample_bilinear, BorderMode, Kernel,
};
use image::GrayImage;
use nalgebra::{Matrix2, Matrix6, Vector2, Vector6};
use rayon::prelude::*;
use tracing::debug;

/// Added to the Farneback normal-equation determinant so untextured pixels
/// resolve to zero motion.
const FARNEBACK_REGULARIZATION: f32 = 1e-3;

fn require_odd(value: usize, min: usize, what: &str) -> Result<()> {
    if value < min || value % 2 == 0 {
        return Err(VideoError::InvalidParameters(format!(
            "{what} must be odd and >= {min}, got {value}"
        )));
    }
    Ok(())
}

/// Lucas-Kanade optical flow tracker
///
/// Sparse optical flow that tracks points between frames. Each point is
/// refined on every pyramid level, coarsest first, by Gauss-Newton steps over
/// a square window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LucasKanade {
    /// Side of the square integration window, odd.
    pub window_size: usize,
    /// Gauss-Newton steps per pyramid level.
    pub max_iterations: usize,
    /// A level stops early once a step moves the point less than this.
    pub epsilon: f32,
    /// Levels including the full-resolution frame.
    pub pyramid_levels: usize,
    /// Smallest accepted eigenvalue of the window's gradient matrix divided by
    /// the window area; flatter windows lose the point.
    pub min_eigenvalue: f32,
}

impl Default for LucasKanade {
    fn default() -> Self {
        Self {
            window_size: 15,
            max_iterations: 10,
            epsilon: 0.03,
            pyramid_levels: 3,
            min_eigenvalue: 1e-4,
        }
    }
}

struct LkLevel {
    prev: Field,
    next: Field,
    ix: Field,
    iy: Field,
    scale_x: f32,
    scale_y: f32,
}

impl LucasKanade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_pyramid_levels(mut self, levels: usize) -> Self {
        self.pyramid_levels = levels;
        self
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn validate(&self) -> Result<()> {
        require_odd(self.window_size, 3, "window_size")?;
        if self.max_iterations == 0 {
            return Err(VideoError::InvalidParameters(
                "max_iterations must be >= 1".to_string(),
            ));
        }
        if self.pyramid_levels == 0 {
            return Err(VideoError::InvalidParameters(
                "pyramid_levels must be >= 1".to_string(),
            ));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(VideoError::InvalidParameters(format!(
                "epsilon must be a positive finite number, got {}",
                self.epsilon
            )));
        }
        if !(self.min_eigenvalue.is_finite() && self.min_eigenvalue >= 0.0) {
            return Err(VideoError::InvalidParameters(format!(
                "min_eigenvalue must be finite and >= 0, got {}",
                self.min_eigenvalue
            )));
        }
        Ok(())
    }

    /// Track a single point from `prev` to `next`
    pub fn track_point(
        &self,
        prev: &Field,
        next: &Field,
        point: (f32, f32),
    ) -> Result<Option<(f32, f32)>> {
        Ok(self
            .track_points(prev, next, &[point])?
            .into_iter()
            .next()
            .flatten())
    }

    /// Track multiple points
    ///
    /// `None` marks a point that started or ended outside the frame, or whose
    /// window had too little texture to solve.
    pub fn track_points(
        &self,
        prev: &Field,
        next: &Field,
        points: &[(f32, f32)],
    ) -> Result<Vec<Option<(f32, f32)>>> {
        self.validate()?;
        check_frame_pair(prev, next)?;

        let levels = build_lk_levels(prev, next, self.pyramid_levels)?;
        debug!(
            points = points.len(),
            levels = levels.len(),
            window = self.window_size,
            "lucas-kanade tracking"
        );

        Ok(points
            .par_iter()
            .map(|&p| self.track(&levels, p))
            .collect())
    }

    pub fn track_images(
        &self,
        prev_frame: &GrayImage,
        next_frame: &GrayImage,
        points: &[(f32, f32)],
    ) -> Result<Vec<Option<(f32, f32)>>> {
        self.track_points(
            &Field::from_gray(prev_frame),
            &Field::from_gray(next_frame),
            points,
        )
    }

    fn track(&self, levels: &[LkLevel], (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let base = levels.first()?;
        if !inside(&base.prev, x, y) {
            return None;
        }

        let mut guess = Vector2::<f64>::zeros();
        for (i, level) in levels.iter().enumerate().rev() {
            let total = self.refine_level(level, (x * level.scale_x, y * level.scale_y), guess)?;
            guess = match i.checked_sub(1).and_then(|j| levels.get(j)) {
                Some(finer) => Vector2::new(
                    total.x * (finer.scale_x / level.scale_x) as f64,
                    total.y * (finer.scale_y / level.scale_y) as f64,
                ),
                None => total,
            };
        }

        let (nx, ny) = (x + guess.x as f32, y + guess.y as f32);
        inside(&base.next, nx, ny).then_some((nx, ny))
    }

    /// Displacement at one level, starting from `guess`.
    fn refine_level(
        &self,
        level: &LkLevel,
        (px, py): (f32, f32),
        guess: Vector2<f64>,
    ) -> Option<Vector2<f64>> {
        let half = (self.window_size / 2) as isize;
        let mut window = Vec::with_capacity(self.window_size * self.window_size);
        let mut g = Matrix2::<f64>::zeros();

        for oy in -half..=half {
            for ox in -half..=half {
                let (wx, wy) = (px + ox as f32, py + oy as f32);
                let gx = sample_bilinear(&level.ix, wx, wy, BorderMode::Replicate) as f64;
                let gy = sample_bilinear(&level.iy, wx, wy, BorderMode::Replicate) as f64;
                let i0 = sample_bilinear(&level.prev, wx, wy, BorderMode::Replicate);

                g[(0, 0)] += gx * gx;
                g[(0, 1)] += gx * gy;
                g[(1, 0)] += gx * gy;
                g[(1, 1)] += gy * gy;
                window.push((wx, wy, gx, gy, i0));
            }
        }

        let area = window.len() as f64;
        if min_eigenvalue(&g) / area < self.min_eigenvalue as f64 {
            return None;
        }
        let g_inv = g.try_inverse()?;

        let mut v = Vector2::<f64>::zeros();
        for _ in 0..self.max_iterations {
            let (dx, dy) = ((guess.x + v.x) as f32, (guess.y + v.y) as f32);
            let mut b = Vector2::<f64>::zeros();
            for &(wx, wy, gx, gy, i0) in &window {
                let j = sample_bilinear(&level.next, wx + dx, wy + dy, BorderMode::Replicate);
                let diff = (i0 - j) as f64;
                b.x += diff * gx;
                b.y += diff * gy;
            }

            let step = g_inv * b;
            v += step;
            if !v.x.is_finite() || !v.y.is_finite() {
                return None;
            }
            if step.norm() < self.epsilon as f64 {
                break;
            }
        }

        Some(guess + v)
    }
}

fn build_lk_levels(prev: &Field, next: &Field, levels: usize) -> Result<Vec<LkLevel>> {
    let prev_pyramid = build_pyramid(prev, levels, 0.5)?;
    let next_pyramid = build_pyramid(next, levels, 0.5)?;
    let (dx, dy) = central_difference_kernels();
    let (w0, h0) = (prev.width() as f32, prev.height() as f32);

    Ok(prev_pyramid
        .into_iter()
        .zip(next_pyramid)
        .map(|(p, n)| LkLevel {
            ix: correlate(&p, &dx, BorderMode::Replicate),
            iy: correlate(&p, &dy, BorderMode::Replicate),
            scale_x: p.width() as f32 / w0,
            scale_y: p.height() as f32 / h0,
            prev: p,
            next: n,
        })
        .collect())
}

/// `(d/dx, d/dy)` as half the central difference.
fn central_difference_kernels() -> (Kernel, Kernel) {
    let dx = Kernel {
        data: vec![-0.5, 0.0, 0.5],
        width: 3,
        height: 1,
    };
    let dy = dx.transposed();
    (dx, dy)
}

fn inside(field: &Field, x: f32, y: f32) -> bool {
    x >= 0.0 && y >= 0.0 && x <= (field.width() - 1) as f32 && y <= (field.height() - 1) as f32
}

fn min_eigenvalue(g: &Matrix2<f64>) -> f64 {
    let (a, b, c) = (g[(0, 0)], g[(0, 1)], g[(1, 1)]);
    let half_diff = (a - c) * 0.5;
    (a + c) * 0.5 - (half_diff * half_diff + b * b).sqrt()
}

/// Farneback dense optical flow
///
/// Every pixel neighbourhood of both frames is approximated by a quadratic
/// polynomial; the displacement that best maps one polynomial onto the other,
/// averaged over a `window_size` box, is refined `iterations` times per
/// pyramid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Farneback {
    pub pyramid_scale: f32,
    pub pyramid_levels: usize,
    pub window_size: usize,
    pub iterations: usize,
    /// Side of the polynomial fitting neighbourhood, odd.
    pub poly_n: usize,
    /// Gaussian weight applied across the fitting neighbourhood.
    pub poly_sigma: f32,
}

impl Default for Farneback {
    fn default() -> Self {
        Self {
            pyramid_scale: 0.5,
            pyramid_levels: 3,
            window_size: 15,
            iterations: 3,
            poly_n: 5,
            poly_sigma: 1.2,
        }
    }
}

/// Per-pixel polynomial coefficients in basis order `1, x, y, x^2, y^2, xy`.
struct PolyExpansion {
    coeffs: Vec<Field>,
}

impl PolyExpansion {
    fn compute(frame: &Field, kernels: &[Kernel]) -> Self {
        Self {
            coeffs: kernels
                .iter()
                .map(|k| correlate(frame, k, BorderMode::Replicate))
                .collect(),
        }
    }

    /// `(A, b)` of `x^T A x + b^T x + c` at a grid sample, `A` as `(a11, a12, a22)`.
    fn at(&self, idx: usize) -> ([f32; 3], [f32; 2]) {
        let c = |j: usize| self.coeffs[j].as_slice()[idx];
        ([c(3), c(5) * 0.5, c(4)], [c(1), c(2)])
    }

    fn sample(&self, x: f32, y: f32) -> ([f32; 3], [f32; 2]) {
        let c = |j: usize| sample_bilinear(&self.coeffs[j], x, y, BorderMode::Replicate);
        ([c(3), c(5) * 0.5, c(4)], [c(1), c(2)])
    }
}

impl Farneback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pyramid_levels(mut self, levels: usize) -> Self {
        self.pyramid_levels = levels;
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.pyramid_scale > 0.0 && self.pyramid_scale < 1.0) {
            return Err(VideoError::InvalidParameters(format!(
                "pyramid_scale must be in (0, 1), got {}",
                self.pyramid_scale
            )));
        }
        if self.pyramid_levels == 0 || self.iterations == 0 {
            return Err(VideoError::InvalidParameters(
                "pyramid_levels and iterations must be >= 1".to_string(),
            ));
        }
        require_odd(self.window_size, 3, "window_size")?;
        require_odd(self.poly_n, 3, "poly_n")?;
        if !(self.poly_sigma.is_finite() && self.poly_sigma > 0.0) {
            return Err(VideoError::InvalidParameters(format!(
                "poly_sigma must be a positive finite number, got {}",
                self.poly_sigma
            )));
        }
        Ok(())
    }

    /// Compute dense optical flow
    pub fn compute(&self, prev_frame: &GrayImage, next_frame: &GrayImage) -> Result<FlowField> {
        self.compute_fields(&Field::from_gray(prev_frame), &Field::from_gray(next_frame))
    }

    pub fn compute_fields(&self, prev: &Field, next: &Field) -> Result<FlowField> {
        self.validate()?;
        check_frame_pair(prev, next)?;

        let kernels = expansion_kernels(self.poly_n, self.poly_sigma)?;
        let window = box_kernel(self.window_size)?;
        let prev_pyramid = build_pyramid(prev, self.pyramid_levels, self.pyramid_scale)?;
        let next_pyramid = build_pyramid(next, self.pyramid_levels, self.pyramid_scale)?;
        debug!(
            width = prev.width(),
            height = prev.height(),
            levels = prev_pyramid.len(),
            "farneback solve"
        );

        let mut flow: Option<FlowField> = None;
        for (p, n) in prev_pyramid.iter().zip(&next_pyramid).rev() {
            let (w, h) = p.dimensions();
            let mut current = match flow.take() {
                Some(coarse) => upscale_flow(&coarse, w, h),
                None => FlowField::new(w, h),
            };

            let r1 = PolyExpansion::compute(p, &kernels);
            let r2 = PolyExpansion::compute(n, &kernels);
            for _ in 0..self.iterations {
                current = refine(&r1, &r2, &current, &window);
            }
            flow = Some(current);
        }

        let flow = flow.ok_or_else(|| {
            VideoError::InvalidParameters("farneback pyramid is empty".to_string())
        })?;
        if let Some((what, x, y)) = flow.first_non_finite() {
            return Err(VideoError::NonFinite { what, x, y });
        }
        Ok(flow)
    }
}

/// One correlation kernel per polynomial coefficient: the Gaussian-weighted
/// least-squares fit of `1, x, y, x^2, y^2, xy` over an `n` x `n`
/// neighbourhood, written as a linear filter.
fn expansion_kernels(n: usize, sigma: f32) -> Result<Vec<Kernel>> {
    let half = (n / 2) as i32;
    let sigma = sigma as f64;
    let mut normal = Matrix6::<f64>::zeros();
    let mut taps = Vec::with_capacity(n * n);

    for oy in -half..=half {
        for ox in -half..=half {
            let (x, y) = (ox as f64, oy as f64);
            let weight = (-(x * x + y * y) / (2.0 * sigma * sigma)).exp();
            let basis = Vector6::new(1.0, x, y, x * x, y * y, x * y);
            normal += basis * basis.transpose() * weight;
            taps.push(basis * weight);
        }
    }

    let inverse = normal.try_inverse().ok_or_else(|| {
        VideoError::InvalidParameters(format!(
            "polynomial fit is singular for poly_n {n}, poly_sigma {sigma}"
        ))
    })?;

    let mut data = vec![vec![0.0f32; n * n]; 6];
    for (k, &tap) in taps.iter().enumerate() {
        let row = inverse * tap;
        for (j, coeff) in data.iter_mut().enumerate() {
            coeff[k] = row[j] as f32;
        }
    }

    data.into_iter()
        .map(|d| Kernel::new(d, n, n).map_err(VideoError::from))
        .collect()
}

/// One displacement update at a pyramid level.
fn refine(r1: &PolyExpansion, r2: &PolyExpansion, flow: &FlowField, window: &Kernel) -> FlowField {
    let (w, h) = flow.dimensions();
    let width = w as usize;

    // Per-pixel normal equations G d = h with G = A^T A, h = A^T db.
    let terms: Vec<[f32; 5]> = (0..width * h as usize)
        .into_par_iter()
        .map(|idx| {
            let (x, y) = ((idx % width) as f32, (idx / width) as f32);
            let (u, v) = (flow.u.as_slice()[idx], flow.v.as_slice()[idx]);

            let (a1, b1) = r1.at(idx);
            let (a2, b2) = r2.sample(x + u, y + v);
            let a11 = (a1[0] + a2[0]) * 0.5;
            let a12 = (a1[1] + a2[1]) * 0.5;
            let a22 = (a1[2] + a2[2]) * 0.5;

            let db1 = -0.5 * (b2[0] - b1[0]) + a11 * u + a12 * v;
            let db2 = -0.5 * (b2[1] - b1[1]) + a12 * u + a22 * v;

            [
                a11 * a11 + a12 * a12,
                a11 * a12 + a12 * a22,
                a12 * a12 + a22 * a22,
                a11 * db1 + a12 * db2,
                a12 * db1 + a22 * db2,
            ]
        })
        .collect();

    let averaged: Vec<Field> = (0..5)
        .map(|j| {
            let field = Field::from_fn(w, h, |x, y| terms[y as usize * width + x as usize][j]);
            correlate(&field, window, BorderMode::Replicate)
        })
        .collect();
    let g = |j: usize, idx: usize| averaged[j].as_slice()[idx];

    let mut next = FlowField::new(w, h);
    next.u
        .as_mut_slice()
        .par_iter_mut()
        .zip(next.v.as_mut_slice().par_iter_mut())
        .enumerate()
        .for_each(|(idx, (u, v))| {
            let (g11, g12, g22) = (g(0, idx), g(1, idx), g(2, idx));
            let (h1, h2) = (g(3, idx), g(4, idx));
            let inv_det = 1.0 / (g11 * g22 - g12 * g12 + FARNEBACK_REGULARIZATION);
            *u = (g22 * h1 - g12 * h2) * inv_det;
            *v = (g11 * h2 - g12 * h1) * inv_det;
        });
    next
}

/// Resample a coarse flow field to `width` x `height`, rescaling the vectors.
fn upscale_flow(flow: &FlowField, width: u32, height: u32) -> FlowField {
    let sx = width as f32 / flow.width() as f32;
    let sy = height as f32 / flow.height() as f32;
    FlowField {
        u: cv_imgproc::resize_bilinear(&flow.u, width, height).map(|u| u * sx),
        v: cv_imgproc::resize_bilinear(&flow.v, width, height).map(|v| v * sy),
    }
}

/// Convenience function for sparse optical flow
pub fn calc_optical_flow_lk(
    prev_frame: &GrayImage,
    next_frame: &GrayImage,
    points: &[(f32, f32)],
) -> Result<Vec<Option<(f32, f32)>>> {
    LucasKanade::new().track_images(prev_frame, next_frame, points)
}

/// Convenience function for dense optical flow
pub fn calc_optical_flow_farneback(
    prev_frame: &GrayImage,
    next_frame: &GrayImage,
) -> Result<FlowField> {
    Farneback::new().compute(prev_frame, next_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn expansion_recovers_quadratic_coefficients() {
        // f = 3 + 2x - y + 0.5x^2 + 0.25y^2 - 0.75xy around (6, 5)
        let frame = Field::from_fn(12, 10, |x, y| {
            let (x, y) = (x as f32 - 6.0, y as f32 - 5.0);
            3.0 + 2.0 * x - y + 0.5 * x * x + 0.25 * y * y - 0.75 * x * y
        });
        let kernels = expansion_kernels(5, 1.2).unwrap();
        let r = PolyExpansion::compute(&frame, &kernels);
        let idx = 5 * 12 + 6;

        let (a, b) = r.at(idx);
        assert_abs_diff_eq!(a[0], 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(a[1], -0.375, epsilon = 1e-3);
        assert_abs_diff_eq!(a[2], 0.25, epsilon = 1e-3);
        assert_abs_diff_eq!(b[0], 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(b[1], -1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(r.coeffs[0].as_slice()[idx], 3.0, epsilon = 1e-3);
    }

    #[test]
    fn min_eigenvalue_of_diagonal() {
        let g = Matrix2::new(4.0, 0.0, 0.0, 9.0);
        assert_abs_diff_eq!(min_eigenvalue(&g), 4.0, epsilon = 1e-12);
        let flat = Matrix2::zeros();
        assert_eq!(min_eigenvalue(&flat), 0.0);
    }

    #[test]
    fn upscale_doubles_vectors() {
        let mut coarse = FlowField::new(4, 3);
        coarse.u.fill(1.0);
        coarse.v.fill(-0.5);
        let fine = upscale_flow(&coarse, 8, 6);
        assert_eq!(fine.dimensions(), (8, 6));
        assert!(fine.u.as_slice().iter().all(|&u| (u - 2.0).abs() < 1e-6));
        assert!(fine.v.as_slice().iter().all(|&v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn invalid_parameters_rejected() {
        let frame = Field::filled(16, 16, 1.0);
        for lk in [
            LucasKanade::new().with_window_size(4),
            LucasKanade::new().with_window_size(1),
            LucasKanade::new().with_max_iterations(0),
            LucasKanade::new().with_pyramid_levels(0),
            LucasKanade::new().with_epsilon(f32::NAN),
        ] {
            assert!(matches!(
                lk.track_points(&frame, &frame, &[(8.0, 8.0)]),
                Err(VideoError::InvalidParameters(_))
            ));
        }
        for fb in [
            Farneback::new().with_window_size(8),
            Farneback::new().with_iterations(0),
            Farneback::new().with_pyramid_levels(0),
            Farneback {
                pyramid_scale: 1.0,
                ..Farneback::default()
            },
            Farneback {
                poly_n: 1,
                ..Farneback::default()
            },
        ] {
            assert!(matches!(
                fb.compute_fields(&frame, &frame),
                Err(VideoError::InvalidParameters(_))
            ));
        }
    }
}
