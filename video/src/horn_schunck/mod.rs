//! Horn-Schunck dense optical flow
//!
//! Global method: the flow minimises the brightness-constancy residual
//! `Ix*u + Iy*v + It` plus `alpha^2` times the flow's spatial variation. The
//! minimiser is approached with Jacobi sweeps that read only the previous
//! sweep's field, starting from zero flow.
//!
//! Frames are expected on the 0-255 intensity scale; `alpha` is calibrated
//! against that scale.

mod driver;
mod gradient;
mod relax;

pub use driver::{FlowIteration, FlowSolution, Phase, Termination};
pub use gradient::{derivative_kernels, Gradients};
pub use relax::{relax, STABILITY};

use crate::{check_frame_pair, FlowField, Result, VideoError};
use cv_core::Field;
use cv_imgproc::BorderMode;
use image::GrayImage;
use rayon::ThreadPool;
use std::env;
use std::str::FromStr;
use tracing::debug;

pub const DEFAULT_ALPHA: f32 = 20.0;
pub const DEFAULT_ITERATIONS: usize = 40;
/// Threshold used by [`HornSchunck::with_early_stop`].
pub const DEFAULT_EPSILON: f32 = 0.001;

pub const ALPHA_ENV: &str = "RUSTCV_HS_ALPHA";
pub const ITERATIONS_ENV: &str = "RUSTCV_HS_ITERATIONS";
pub const EPSILON_ENV: &str = "RUSTCV_HS_EPSILON";

/// Horn-Schunck solver configuration.
///
/// By default every solve runs exactly `iterations` sweeps. Setting `epsilon`
/// additionally stops as soon as a sweep changes no velocity sample by
/// `epsilon` or more.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HornSchunck {
    /// Smoothness weight. Larger values give smoother, smaller flow.
    pub alpha: f32,
    pub iterations: usize,
    pub epsilon: Option<f32>,
    /// Edge extension for the derivative masks and the neighbour mean.
    pub border: BorderMode,
}

impl Default for HornSchunck {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            iterations: DEFAULT_ITERATIONS,
            epsilon: None,
            border: BorderMode::Reflect101,
        }
    }
}

impl HornSchunck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    pub fn with_early_stop(self) -> Self {
        self.with_epsilon(DEFAULT_EPSILON)
    }

    pub fn without_early_stop(mut self) -> Self {
        self.epsilon = None;
        self
    }

    pub fn with_border(mut self, border: BorderMode) -> Self {
        self.border = border;
        self
    }

    /// Defaults overridden by `RUSTCV_HS_ALPHA`, `RUSTCV_HS_ITERATIONS` and
    /// `RUSTCV_HS_EPSILON` when set. The result is validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(alpha) = read_env::<f32>(ALPHA_ENV)? {
            config.alpha = alpha;
        }
        if let Some(iterations) = read_env::<usize>(ITERATIONS_ENV)? {
            config.iterations = iterations;
        }
        if let Some(epsilon) = read_env::<f32>(EPSILON_ENV)? {
            config.epsilon = Some(epsilon);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(VideoError::InvalidParameters(format!(
                "alpha must be a positive finite number, got {}",
                self.alpha
            )));
        }
        if self.iterations == 0 {
            return Err(VideoError::InvalidParameters(
                "iterations must be >= 1".to_string(),
            ));
        }
        if let Some(eps) = self.epsilon {
            if !(eps.is_finite() && eps > 0.0) {
                return Err(VideoError::InvalidParameters(format!(
                    "epsilon must be a positive finite number, got {}",
                    eps
                )));
            }
        }
        if let BorderMode::Constant(c) = self.border {
            if !c.is_finite() {
                return Err(VideoError::InvalidParameters(format!(
                    "constant border value must be finite, got {}",
                    c
                )));
            }
        }
        Ok(())
    }

    /// Validate the request and compute the frame-pair derivatives.
    ///
    /// Every precondition is checked here, so a returned [`FlowIteration`]
    /// can always be stepped to completion.
    pub fn begin(&self, prev: &Field, next: &Field) -> Result<FlowIteration> {
        self.validate()?;
        check_frame_pair(prev, next)?;

        debug!(
            width = prev.width(),
            height = prev.height(),
            alpha = self.alpha,
            iterations = self.iterations,
            epsilon = self.epsilon,
            border = self.border.name(),
            "horn-schunck solve"
        );

        let gradients = Gradients::compute(prev, next, self.border)?;
        Ok(FlowIteration::new(self, gradients))
    }

    pub fn solve(&self, prev: &Field, next: &Field) -> Result<FlowSolution> {
        self.begin(prev, next)?.run()
    }

    /// [`solve`](Self::solve) inside `pool`, or the global pool when `None`.
    pub fn solve_in_pool(
        &self,
        prev: &Field,
        next: &Field,
        pool: Option<&ThreadPool>,
    ) -> Result<FlowSolution> {
        match pool {
            Some(p) => p.install(|| self.solve(prev, next)),
            None => self.solve(prev, next),
        }
    }

    pub fn compute_fields(&self, prev: &Field, next: &Field) -> Result<FlowField> {
        Ok(self.solve(prev, next)?.flow)
    }

    /// Dense flow between two 8-bit frames.
    pub fn compute(&self, prev_frame: &GrayImage, next_frame: &GrayImage) -> Result<FlowField> {
        self.compute_fields(&Field::from_gray(prev_frame), &Field::from_gray(next_frame))
    }
}

fn read_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    let raw = match env::var(key) {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(e) => {
            return Err(VideoError::InvalidParameters(format!(
                "failed to read {key}: {e}"
            )))
        }
    };
    raw.trim().parse().map(Some).map_err(|_| {
        VideoError::InvalidParameters(format!("{key} has an unparsable value '{raw}'"))
    })
}

/// Convenience function for dense optical flow with default parameters
pub fn calc_optical_flow_horn_schunck(
    prev_frame: &GrayImage,
    next_frame: &GrayImage,
) -> Result<FlowField> {
    HornSchunck::new().compute(prev_frame, next_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn create_moving_square(prev_pos: (u32, u32), next_pos: (u32, u32)) -> (GrayImage, GrayImage) {
        let (width, height, size) = (32u32, 32u32, 10u32);
        let mut prev = GrayImage::new(width, height);
        let mut next = GrayImage::new(width, height);

        for y in 0..size {
            for x in 0..size {
                prev.put_pixel(prev_pos.0 + x, prev_pos.1 + y, Luma([255]));
                next.put_pixel(next_pos.0 + x, next_pos.1 + y, Luma([255]));
            }
        }

        (prev, next)
    }

    #[test]
    fn test_defaults() {
        let hs = HornSchunck::default();
        assert_eq!(hs.alpha, 20.0);
        assert_eq!(hs.iterations, 40);
        assert_eq!(hs.epsilon, None);
        assert_eq!(hs.border, BorderMode::Reflect101);
        assert_eq!(hs.with_early_stop().epsilon, Some(DEFAULT_EPSILON));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let frame = Field::zeros(4, 4);
        for hs in [
            HornSchunck::new().with_alpha(0.0),
            HornSchunck::new().with_alpha(-1.0),
            HornSchunck::new().with_alpha(f32::NAN),
            HornSchunck::new().with_iterations(0),
            HornSchunck::new().with_epsilon(0.0),
            HornSchunck::new().with_border(BorderMode::Constant(f32::INFINITY)),
        ] {
            let err = hs.begin(&frame, &frame).unwrap_err();
            assert!(matches!(err, VideoError::InvalidParameters(_)), "{hs:?}");
        }
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let err = HornSchunck::new()
            .begin(&Field::zeros(4, 4), &Field::zeros(4, 5))
            .unwrap_err();
        assert!(matches!(err, VideoError::SizeMismatch(_)));
    }

    #[test]
    fn test_empty_and_non_finite_frames_rejected() {
        let hs = HornSchunck::new();
        let empty = Field::zeros(0, 3);
        assert!(matches!(
            hs.begin(&empty, &empty),
            Err(VideoError::InvalidParameters(_))
        ));

        let clean = Field::zeros(3, 3);
        let mut dirty = Field::zeros(3, 3);
        dirty.set(1, 2, f32::INFINITY);
        match hs.begin(&clean, &dirty) {
            Err(VideoError::NonFinite { what, x, y }) => {
                assert_eq!((what, x, y), ("next frame", 1, 2));
            }
            other => panic!("expected NonFinite, got {other:?}"),
        }
    }

    #[test]
    fn test_moving_square_direction() {
        let (prev, next) = create_moving_square((10, 11), (11, 11));
        let flow = HornSchunck::new().compute(&prev, &next).unwrap();

        // The trailing and leading edges move right.
        let (u, v) = flow.get_motion(11, 15);
        assert!(u > 0.5, "expected rightward flow, got u={u}");
        assert!(v.abs() < 0.1);
    }

    #[test]
    fn test_fixed_iteration_count_by_default() {
        let (prev, next) = create_moving_square((10, 11), (11, 11));
        let solution = HornSchunck::new()
            .with_iterations(7)
            .solve(&Field::from_gray(&prev), &Field::from_gray(&next))
            .unwrap();
        assert_eq!(solution.iterations, 7);
        assert_eq!(solution.termination, Termination::Exhausted);
        assert!(solution.last_delta.is_some());
    }

    #[test]
    fn test_overflowing_solve_reports_non_finite_flow() {
        // Finite but full-range frames overflow the derivative sums.
        let prev = Field::from_fn(8, 8, |x, _| if x < 4 { -f32::MAX } else { f32::MAX });
        let next = Field::from_fn(8, 8, |x, _| if x < 5 { f32::MAX } else { -f32::MAX });

        let iteration = HornSchunck::new().begin(&prev, &next).unwrap();
        match iteration.run() {
            Err(VideoError::NonFinite { what, .. }) => assert_eq!(what, "u"),
            other => panic!("expected NonFinite, got {other:?}"),
        }
    }
}
