use crate::{correlate, sample, BorderMode, ImgprocError, Kernel, Result};
use cv_core::Field;
use rayon::prelude::*;

/// Bilinear interpolation at a fractional position. Taps outside the grid
/// follow `border`.
pub fn sample_bilinear(src: &Field, x: f32, y: f32, border: BorderMode) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (xi, yi) = (x0 as isize, y0 as isize);

    let v00 = sample(src, xi, yi, border);
    let v10 = sample(src, xi + 1, yi, border);
    let v01 = sample(src, xi, yi + 1, border);
    let v11 = sample(src, xi + 1, yi + 1, border);

    let top = v00 + (v10 - v00) * fx;
    let bottom = v01 + (v11 - v01) * fx;
    top + (bottom - top) * fy
}

/// Normalised 1D Gaussian as a row kernel of radius `ceil(3 * sigma)`.
pub fn gaussian_kernel(sigma: f32) -> Result<Kernel> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(ImgprocError::InvalidParameters(format!(
            "gaussian sigma must be a positive finite number, got {}",
            sigma
        )));
    }
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let mut data: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = data.iter().sum();
    for v in &mut data {
        *v /= sum;
    }
    let size = data.len();
    Kernel::new(data, size, 1)
}

/// Separable Gaussian smoothing.
pub fn gaussian_blur(src: &Field, sigma: f32, border: BorderMode) -> Result<Field> {
    let row = gaussian_kernel(sigma)?;
    let horizontal = correlate(src, &row, border);
    Ok(correlate(&horizontal, &row.transposed(), border))
}

/// Bilinear resize with pixel-centre alignment and replicated edges.
pub fn resize_bilinear(src: &Field, width: u32, height: u32) -> Field {
    let mut dst = Field::zeros(width, height);
    if width == 0 || height == 0 || src.is_empty() {
        return dst;
    }
    let sx = src.width() as f32 / width as f32;
    let sy = src.height() as f32 / height as f32;

    dst.as_mut_slice()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let src_y = (y as f32 + 0.5) * sy - 0.5;
            for (x, out) in row.iter_mut().enumerate() {
                let src_x = (x as f32 + 0.5) * sx - 0.5;
                *out = sample_bilinear(src, src_x, src_y, BorderMode::Replicate);
            }
        });

    dst
}

/// Gaussian pyramid, finest level first.
///
/// Each level is the previous one smoothed with
/// `sigma = (1 / scale - 1) / 2` and resized by `scale`. Building stops early
/// once a level would be narrower or shorter than two samples, so the result
/// may hold fewer than `levels` entries.
pub fn build_pyramid(src: &Field, levels: usize, scale: f32) -> Result<Vec<Field>> {
    if levels == 0 {
        return Err(ImgprocError::InvalidParameters(
            "pyramid needs at least one level".to_string(),
        ));
    }
    if !(scale > 0.0 && scale < 1.0) {
        return Err(ImgprocError::InvalidParameters(format!(
            "pyramid scale must be in (0, 1), got {}",
            scale
        )));
    }
    let sigma = (1.0 / scale - 1.0) * 0.5;

    let mut pyramid = vec![src.clone()];
    while pyramid.len() < levels {
        let Some(last) = pyramid.last() else {
            break;
        };
        let width = (last.width() as f32 * scale).round() as u32;
        let height = (last.height() as f32 * scale).round() as u32;
        if width < 2 || height < 2 {
            break;
        }
        let next = resize_bilinear(&gaussian_blur(last, sigma, BorderMode::Reflect101)?, width, height);
        pyramid.push(next);
    }

    Ok(pyramid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn bilinear_interpolates_between_taps() {
        let src = Field::from_fn(3, 2, |x, y| (x + 10 * y) as f32);
        assert_abs_diff_eq!(sample_bilinear(&src, 0.5, 0.0, BorderMode::Replicate), 0.5);
        assert_abs_diff_eq!(sample_bilinear(&src, 1.25, 0.5, BorderMode::Replicate), 6.25);
        // Replicated edge beyond the last column.
        assert_abs_diff_eq!(sample_bilinear(&src, 2.5, 0.0, BorderMode::Replicate), 2.0);
    }

    #[test]
    fn gaussian_kernel_is_normalised() {
        let k = gaussian_kernel(0.5).unwrap();
        assert_eq!(k.size(), (5, 1));
        assert_abs_diff_eq!(k.data.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert!(k.get(2, 0) > k.get(1, 0));
        assert_abs_diff_eq!(k.get(1, 0), k.get(3, 0));
        assert!(gaussian_kernel(0.0).is_err());
    }

    #[test]
    fn resize_keeps_linear_ramp() {
        let ramp = Field::from_fn(8, 4, |x, _| x as f32);
        let half = resize_bilinear(&ramp, 4, 2);
        assert_eq!(half.dimensions(), (4, 2));
        // Output pixel x covers source pixels 2x and 2x + 1.
        assert_abs_diff_eq!(half.get(1, 0), 2.5, epsilon = 1e-5);
        assert_abs_diff_eq!(half.get(3, 1), 6.5, epsilon = 1e-5);
    }

    #[test]
    fn pyramid_halves_until_too_small() {
        let src = Field::filled(20, 9, 7.0);
        let pyramid = build_pyramid(&src, 5, 0.5).unwrap();
        let dims: Vec<_> = pyramid.iter().map(|l| l.dimensions()).collect();
        // 9 * 0.5 rounds to 5 (ties away from zero), 5 -> 3, 3 -> 2.
        assert_eq!(dims, vec![(20, 9), (10, 5), (5, 3), (3, 2)]);
        for level in &pyramid {
            for v in level.as_slice() {
                assert_abs_diff_eq!(*v, 7.0, epsilon = 1e-4);
            }
        }

        assert!(build_pyramid(&src, 0, 0.5).is_err());
        assert!(build_pyramid(&src, 2, 1.0).is_err());
    }
}
