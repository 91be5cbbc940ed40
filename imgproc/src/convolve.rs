use crate::{ImgprocError, Result};
use cv_core::Field;
use rayon::prelude::*;
use rayon::ThreadPool;

#[derive(Debug, Clone)]
pub struct Kernel {
    pub data: Vec<f32>,
    pub width: usize,
    pub height: usize,
}

impl Kernel {
    pub fn new(data: Vec<f32>, width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 || data.len() != width * height {
            return Err(ImgprocError::DimensionMismatch(format!(
                "{}x{} kernel with {} taps",
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn from_slice(data: &[f32], width: usize, height: usize) -> Result<Self> {
        Self::new(data.to_vec(), width, height)
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Anchor tap. For even sizes this is the lower-right of the two middle
    /// taps, so a 2x2 kernel reaches offsets {-1, 0} on both axes.
    pub fn center(&self) -> (isize, isize) {
        ((self.width / 2) as isize, (self.height / 2) as isize)
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Swap rows and columns, turning a row kernel into a column kernel.
    pub fn transposed(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len());
        for x in 0..self.width {
            for y in 0..self.height {
                data.push(self.get(x, y));
            }
        }
        Self {
            data,
            width: self.height,
            height: self.width,
        }
    }

    pub fn scaled(mut self, factor: f32) -> Self {
        for v in &mut self.data {
            *v *= factor;
        }
        self
    }
}

/// How samples outside the grid are synthesized.
///
/// For `n = 4` and coordinate `-1`: `Replicate` reads 0, `Reflect` reads 0,
/// `Reflect101` reads 1, `Wrap` reads 3, `Constant(c)` reads `c`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BorderMode {
    Constant(f32),
    Replicate,
    Reflect,
    #[default]
    Reflect101,
    Wrap,
}

impl BorderMode {
    pub fn name(&self) -> &'static str {
        match self {
            BorderMode::Constant(_) => "constant",
            BorderMode::Replicate => "replicate",
            BorderMode::Reflect => "reflect",
            BorderMode::Reflect101 => "reflect101",
            BorderMode::Wrap => "wrap",
        }
    }
}

pub fn map_coord(coord: isize, len: usize, mode: BorderMode) -> Option<usize> {
    let n = len as isize;
    if n <= 0 {
        return None;
    }

    match mode {
        BorderMode::Constant(_) => {
            if coord < 0 || coord >= n {
                None
            } else {
                Some(coord as usize)
            }
        }
        BorderMode::Replicate => Some(coord.clamp(0, n - 1) as usize),
        BorderMode::Wrap => Some(coord.rem_euclid(n) as usize),
        BorderMode::Reflect => {
            if n == 1 {
                return Some(0);
            }
            let period = 2 * n;
            let mut c = coord.rem_euclid(period);
            if c >= n {
                c = period - c - 1;
            }
            Some(c as usize)
        }
        BorderMode::Reflect101 => {
            if n == 1 {
                return Some(0);
            }
            let period = 2 * n - 2;
            let mut c = coord.rem_euclid(period);
            if c >= n {
                c = period - c;
            }
            Some(c as usize)
        }
    }
}

/// Sample `src` at a possibly out-of-range coordinate.
#[inline]
pub fn sample(src: &Field, x: isize, y: isize, border: BorderMode) -> f32 {
    let width = src.width() as usize;
    let height = src.height() as usize;
    match (map_coord(x, width, border), map_coord(y, height, border)) {
        (Some(ix), Some(iy)) => src.as_slice()[iy * width + ix],
        _ => match border {
            BorderMode::Constant(v) => v,
            _ => 0.0,
        },
    }
}

/// 2D correlation of `src` with `kernel` (the kernel is not flipped).
///
/// `out(x, y) = sum k(i, j) * src(x + i - cx, y + j - cy)` where `(cx, cy)` is
/// [`Kernel::center`]. Output is unclamped and has the shape of `src`.
pub fn correlate(src: &Field, kernel: &Kernel, border: BorderMode) -> Field {
    correlate_in_pool(src, kernel, border, None)
}

pub fn correlate_in_pool(
    src: &Field,
    kernel: &Kernel,
    border: BorderMode,
    pool: Option<&ThreadPool>,
) -> Field {
    let mut output = Field::zeros(src.width(), src.height());
    match pool {
        Some(p) => p.install(|| correlate_into(src, &mut output, kernel, border)),
        None => correlate_into(src, &mut output, kernel, border),
    }
    output
}

pub fn correlate_into(src: &Field, output: &mut Field, kernel: &Kernel, border: BorderMode) {
    if !output.same_shape(src) {
        *output = Field::zeros(src.width(), src.height());
    }
    let width = src.width() as usize;
    if width == 0 {
        return;
    }
    let (kx_center, ky_center) = kernel.center();

    output
        .as_mut_slice()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for ky in 0..kernel.height {
                    for kx in 0..kernel.width {
                        let k = kernel.get(kx, ky);
                        if k == 0.0 {
                            continue;
                        }
                        let src_x = x as isize + kx as isize - kx_center;
                        let src_y = y as isize + ky as isize - ky_center;
                        sum += k * sample(src, src_x, src_y, border);
                    }
                }
                *out = sum;
            }
        });
}

/// Mean of the four orthogonal neighbours of every sample, written to `dst`.
///
/// Equivalent to correlating with `[[0, 1/4, 0], [1/4, 0, 1/4], [0, 1/4, 0]]`,
/// with out-of-range neighbours resolved by `border`.
pub fn neighbor_mean_into(src: &Field, dst: &mut Field, border: BorderMode) {
    if !dst.same_shape(src) {
        *dst = Field::zeros(src.width(), src.height());
    }
    let width = src.width() as usize;
    let height = src.height() as usize;
    if width == 0 {
        return;
    }
    let data = src.as_slice();

    dst.as_mut_slice()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let above = (y > 0).then(|| &data[(y - 1) * width..y * width]);
            let below = (y + 1 < height).then(|| &data[(y + 1) * width..(y + 2) * width]);
            let center = &data[y * width..(y + 1) * width];
            let yi = y as isize;

            for (x, out) in row.iter_mut().enumerate() {
                let xi = x as isize;
                let up = match above {
                    Some(r) => r[x],
                    None => sample(src, xi, yi - 1, border),
                };
                let down = match below {
                    Some(r) => r[x],
                    None => sample(src, xi, yi + 1, border),
                };
                let left = if x > 0 {
                    center[x - 1]
                } else {
                    sample(src, xi - 1, yi, border)
                };
                let right = if x + 1 < width {
                    center[x + 1]
                } else {
                    sample(src, xi + 1, yi, border)
                };
                *out = 0.25 * (up + down + left + right);
            }
        });
}

pub fn neighbor_mean(src: &Field, border: BorderMode) -> Field {
    let mut dst = Field::zeros(src.width(), src.height());
    neighbor_mean_into(src, &mut dst, border);
    dst
}

pub fn neighbor_mean_kernel() -> Kernel {
    Kernel {
        data: vec![0.0, 0.25, 0.0, 0.25, 0.0, 0.25, 0.0, 0.25, 0.0],
        width: 3,
        height: 3,
    }
}

/// Normalised `size` x `size` averaging kernel.
pub fn box_kernel(size: usize) -> Result<Kernel> {
    if size == 0 {
        return Err(ImgprocError::InvalidParameters(
            "box kernel size must be >= 1".to_string(),
        ));
    }
    let value = 1.0 / (size * size) as f32;
    Kernel::new(vec![value; size * size], size, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn map_coord_border_modes() {
        assert_eq!(map_coord(-1, 4, BorderMode::Replicate), Some(0));
        assert_eq!(map_coord(-1, 4, BorderMode::Reflect), Some(0));
        assert_eq!(map_coord(-1, 4, BorderMode::Reflect101), Some(1));
        assert_eq!(map_coord(4, 4, BorderMode::Reflect101), Some(2));
        assert_eq!(map_coord(-1, 4, BorderMode::Wrap), Some(3));
        assert_eq!(map_coord(-1, 4, BorderMode::Constant(0.0)), None);
        assert_eq!(map_coord(-1, 1, BorderMode::Reflect101), Some(0));
        assert_eq!(map_coord(1, 1, BorderMode::Reflect), Some(0));
    }

    #[test]
    fn kernel_rejects_bad_shape() {
        assert!(Kernel::new(vec![1.0; 3], 2, 2).is_err());
        assert!(Kernel::new(vec![], 0, 0).is_err());
    }

    #[test]
    fn even_kernel_anchor_looks_back() {
        // Single tap in the top-left of a 2x2 kernel reads (x - 1, y - 1).
        let kernel = Kernel::from_slice(&[1.0, 0.0, 0.0, 0.0], 2, 2).unwrap();
        let src = Field::from_fn(4, 3, |x, y| (10 * y + x) as f32);
        let out = correlate(&src, &kernel, BorderMode::Replicate);
        assert_eq!(out.get(2, 2), src.get(1, 1));
        assert_eq!(out.get(0, 0), src.get(0, 0));
    }

    #[test]
    fn neighbor_mean_matches_kernel_correlation() {
        let src = Field::from_fn(7, 5, |x, y| ((x * 13 + y * 7) % 11) as f32);
        let kernel = neighbor_mean_kernel();
        for border in [
            BorderMode::Reflect101,
            BorderMode::Replicate,
            BorderMode::Reflect,
            BorderMode::Wrap,
            BorderMode::Constant(0.0),
        ] {
            let fast = neighbor_mean(&src, border);
            let reference = correlate(&src, &kernel, border);
            for (a, b) in fast.as_slice().iter().zip(reference.as_slice()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn neighbor_mean_zero_padding_corner() {
        let src = Field::filled(3, 3, 4.0);
        let out = neighbor_mean(&src, BorderMode::Constant(0.0));
        assert_eq!(out.get(0, 0), 2.0);
        assert_eq!(out.get(1, 0), 3.0);
        assert_eq!(out.get(1, 1), 4.0);
    }

    #[test]
    fn transpose_swaps_axes() {
        let row = Kernel::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 2).unwrap();
        let col = row.transposed();
        assert_eq!(col.size(), (2, 3));
        assert_eq!(col.get(1, 0), row.get(0, 1));
        assert_eq!(col.get(0, 2), row.get(2, 0));
    }

    #[test]
    fn box_kernel_keeps_constant_field() {
        assert!(box_kernel(0).is_err());
        let src = Field::filled(6, 4, 42.0);
        let out = correlate(&src, &box_kernel(3).unwrap(), BorderMode::Reflect101);
        for v in out.as_slice() {
            assert_abs_diff_eq!(*v, 42.0, epsilon = 1e-4);
        }
    }
}
