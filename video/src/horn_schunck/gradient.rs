//! Brightness derivatives for a frame pair.
//!
//! All three derivatives use 2x2 masks anchored at their lower-right tap, so
//! the estimate at `(x, y)` covers the cell spanned by `x - 1..=x` and
//! `y - 1..=y` of both frames. Out-of-range taps follow the configured
//! [`BorderMode`]; with the default `Reflect101` the sample at `-1` is taken
//! from index `1`.

use crate::{ensure_same_size, Result};
use cv_core::Field;
use cv_imgproc::{correlate, BorderMode, Kernel};
use rayon::prelude::*;

/// Spatial and temporal intensity derivatives, all shaped like the input frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub ix: Field,
    pub iy: Field,
    /// `mean(next) - mean(prev)`: positive where the scene brightens, so the
    /// solved flow points along the apparent motion.
    pub it: Field,
}

impl Gradients {
    /// Derivatives between two equally sized frames.
    pub fn compute(prev: &Field, next: &Field, border: BorderMode) -> Result<Self> {
        ensure_same_size(prev, next, "gradient frames")?;
        let (dx, dy, mean) = derivative_kernels();

        // Spatial masks are applied to both frames so the estimate sits halfway
        // between them in time.
        let ix = combine(
            correlate(prev, &dx, border),
            &correlate(next, &dx, border),
            |a, b| a + b,
        );
        let iy = combine(
            correlate(prev, &dy, border),
            &correlate(next, &dy, border),
            |a, b| a + b,
        );
        let it = combine(
            correlate(next, &mean, border),
            &correlate(prev, &mean, border),
            |a, b| a - b,
        );

        Ok(Self { ix, iy, it })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.ix.dimensions()
    }
}

/// `(d/dx, d/dy, mean)` masks, each scaled by 1/4.
pub fn derivative_kernels() -> (Kernel, Kernel, Kernel) {
    let dx = Kernel {
        data: vec![-0.25, 0.25, -0.25, 0.25],
        width: 2,
        height: 2,
    };
    let dy = Kernel {
        data: vec![-0.25, -0.25, 0.25, 0.25],
        width: 2,
        height: 2,
    };
    let mean = Kernel {
        data: vec![0.25; 4],
        width: 2,
        height: 2,
    };
    (dx, dy, mean)
}

fn combine<F>(mut lhs: Field, rhs: &Field, f: F) -> Field
where
    F: Fn(f32, f32) -> f32 + Sync,
{
    lhs.as_mut_slice()
        .par_iter_mut()
        .zip(rhs.as_slice().par_iter())
        .for_each(|(a, &b)| *a = f(*a, b));
    lhs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_x(width: u32, height: u32) -> Field {
        Field::from_fn(width, height, |x, _| x as f32)
    }

    #[test]
    fn identical_frames_have_no_temporal_derivative() {
        let frame = Field::from_fn(9, 7, |x, y| ((x * 31 + y * 17) % 23) as f32);
        let g = Gradients::compute(&frame, &frame, BorderMode::Reflect101).unwrap();
        assert!(g.it.as_slice().iter().all(|&v| v == 0.0));
        assert_eq!(g.dimensions(), (9, 7));
    }

    #[test]
    fn horizontal_ramp_interior_and_border() {
        let frame = ramp_x(6, 4);

        let reflect = Gradients::compute(&frame, &frame, BorderMode::Reflect101).unwrap();
        for y in 0..4 {
            for x in 1..6 {
                assert_eq!(reflect.ix.get(x, y), 1.0);
            }
            // Column -1 mirrors column 1, so the first column sees a falling edge.
            assert_eq!(reflect.ix.get(0, y), -1.0);
        }
        assert!(reflect.iy.as_slice().iter().all(|&v| v == 0.0));

        let replicate = Gradients::compute(&frame, &frame, BorderMode::Replicate).unwrap();
        for y in 0..4 {
            assert_eq!(replicate.ix.get(0, y), 0.0);
            assert_eq!(replicate.ix.get(3, y), 1.0);
        }
    }

    #[test]
    fn vertical_ramp_gives_iy() {
        let frame = Field::from_fn(5, 5, |_, y| 2.0 * y as f32);
        let g = Gradients::compute(&frame, &frame, BorderMode::Replicate).unwrap();
        assert_eq!(g.iy.get(2, 3), 2.0);
        assert_eq!(g.iy.get(2, 0), 0.0);
        assert!(g.ix.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn temporal_derivative_is_next_minus_prev() {
        let prev = Field::filled(4, 4, 10.0);
        let next = Field::filled(4, 4, 14.0);
        let g = Gradients::compute(&prev, &next, BorderMode::Reflect101).unwrap();
        assert!(g.it.as_slice().iter().all(|&v| v == 4.0));
        assert!(g.ix.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn single_pixel_frames_have_no_spatial_derivative() {
        let prev = Field::filled(1, 1, 10.0);
        let next = Field::filled(1, 1, 200.0);
        let g = Gradients::compute(&prev, &next, BorderMode::Reflect101).unwrap();
        assert_eq!(g.ix.get(0, 0), 0.0);
        assert_eq!(g.iy.get(0, 0), 0.0);
        assert_eq!(g.it.get(0, 0), 190.0);
    }

    #[test]
    fn mismatched_frames_rejected() {
        let prev = Field::filled(4, 4, 1.0);
        let next = Field::filled(2, 2, 9.0);
        let err = Gradients::compute(&prev, &next, BorderMode::Reflect101).unwrap_err();
        assert!(matches!(err, crate::VideoError::SizeMismatch(_)), "{err:?}");
    }
}
