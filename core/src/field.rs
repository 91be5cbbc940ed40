use crate::{Error, Result};
use image::GrayImage;
use rayon::prelude::*;

/// Dense single-channel grid of `f32` samples stored row-major.
///
/// Used for grey-scale frames (0-255 scale), derivative fields and velocity
/// components alike, so every per-pixel stage of the flow pipeline shares one
/// memory layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    data: Vec<f32>,
    width: u32,
    height: u32,
}

impl Field {
    pub fn zeros(width: u32, height: u32) -> Self {
        Self::filled(width, height, 0.0)
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            data: vec![value; width as usize * height as usize],
            width,
            height,
        }
    }

    pub fn from_vec(data: Vec<f32>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(Error::DimensionMismatch(format!(
                "{}x{} field needs {} samples, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn from_fn<F>(width: u32, height: u32, f: F) -> Self
    where
        F: Fn(u32, u32) -> f32,
    {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            data,
            width,
            height,
        }
    }

    /// Widen an 8-bit grey image to `f32`, keeping the 0-255 scale.
    pub fn from_gray(img: &GrayImage) -> Self {
        Self {
            data: img.as_raw().iter().map(|&p| p as f32).collect(),
            width: img.width(),
            height: img.height(),
        }
    }

    /// Narrow back to 8 bits, clamping to 0-255.
    pub fn to_gray(&self) -> GrayImage {
        let data = self
            .data
            .iter()
            .map(|&v| v.round().clamp(0.0, 255.0) as u8)
            .collect();
        GrayImage::from_raw(self.width, self.height, data)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn same_shape(&self, other: &Field) -> bool {
        self.dimensions() == other.dimensions()
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let idx = y as usize * self.width as usize + x as usize;
        self.data[idx] = value;
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    pub fn row(&self, y: u32) -> &[f32] {
        let w = self.width as usize;
        let start = y as usize * w;
        &self.data[start..start + w]
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn map<F>(&self, f: F) -> Field
    where
        F: Fn(f32) -> f32 + Sync,
    {
        Field {
            data: self.data.par_iter().map(|&v| f(v)).collect(),
            width: self.width,
            height: self.height,
        }
    }

    /// Combine two equally sized fields sample by sample.
    pub fn zip_map<F>(&self, other: &Field, f: F) -> Result<Field>
    where
        F: Fn(f32, f32) -> f32 + Sync,
    {
        ensure_same_shape(self, other, "zip_map")?;
        Ok(Field {
            data: self
                .data
                .par_iter()
                .zip(other.data.par_iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
            width: self.width,
            height: self.height,
        })
    }

    /// Position of the first NaN or infinite sample in row-major order.
    pub fn first_non_finite(&self) -> Option<(u32, u32)> {
        if self.width == 0 {
            return None;
        }
        self.data.iter().position(|v| !v.is_finite()).map(|idx| {
            let w = self.width as usize;
            ((idx % w) as u32, (idx / w) as u32)
        })
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }

    /// Largest absolute per-sample difference between two fields.
    pub fn max_abs_diff(&self, other: &Field) -> Result<f32> {
        ensure_same_shape(self, other, "max_abs_diff")?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .fold(0.0f32, |m, (a, b)| m.max((a - b).abs())))
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.data.iter().map(|&v| v as f64).sum();
        (sum / self.data.len() as f64) as f32
    }

    /// Population variance.
    pub fn variance(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let mean = self.mean() as f64;
        let sum: f64 = self
            .data
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum();
        (sum / self.data.len() as f64) as f32
    }

    /// Copy out the `width` x `height` window whose top-left corner is `(x, y)`.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Field> {
        if x.checked_add(width).map_or(true, |r| r > self.width)
            || y.checked_add(height).map_or(true, |b| b > self.height)
        {
            return Err(Error::DimensionMismatch(format!(
                "crop {}x{}+{}+{} exceeds {}x{} field",
                width, height, x, y, self.width, self.height
            )));
        }
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for row in y..y + height {
            let src = self.row(row);
            data.extend_from_slice(&src[x as usize..(x + width) as usize]);
        }
        Ok(Field {
            data,
            width,
            height,
        })
    }
}

/// Fail with `DimensionMismatch` unless `a` and `b` have identical dimensions.
pub fn ensure_same_shape(a: &Field, b: &Field, what: &str) -> Result<()> {
    if a.same_shape(b) {
        Ok(())
    } else {
        Err(Error::DimensionMismatch(format!(
            "{}: {}x{} vs {}x{}",
            what,
            a.width(),
            a.height(),
            b.width(),
            b.height()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Luma;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Field::from_vec(vec![0.0; 6], 3, 2).is_ok());
        let err = Field::from_vec(vec![0.0; 5], 3, 2).unwrap_err();
        assert!(err.to_string().contains("needs 6 samples"));
    }

    #[test]
    fn test_gray_round_trip_keeps_scale() {
        let mut img = GrayImage::new(4, 3);
        img.put_pixel(2, 1, Luma([200]));
        let field = Field::from_gray(&img);
        assert_eq!(field.get(2, 1), 200.0);
        assert_eq!(field.get(0, 0), 0.0);
        assert_eq!(field.to_gray(), img);
    }

    #[test]
    fn test_statistics() {
        let field = Field::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        assert_relative_eq!(field.mean(), 2.5);
        assert_relative_eq!(field.variance(), 1.25);
        assert_eq!(field.max_abs(), 4.0);
    }

    #[test]
    fn test_crop_bounds() {
        let field = Field::from_fn(5, 4, |x, y| (y * 5 + x) as f32);
        let window = field.crop(1, 2, 3, 2).unwrap();
        assert_eq!(window.dimensions(), (3, 2));
        assert_eq!(window.as_slice(), &[11.0, 12.0, 13.0, 16.0, 17.0, 18.0]);
        assert!(field.crop(3, 0, 3, 1).is_err());
    }

    #[test]
    fn test_first_non_finite() {
        let mut field = Field::zeros(3, 3);
        assert_eq!(field.first_non_finite(), None);
        field.set(2, 1, f32::NAN);
        assert_eq!(field.first_non_finite(), Some((2, 1)));
        assert!(!field.is_finite());
    }

    #[test]
    fn test_zip_map_rejects_mismatch() {
        let a = Field::zeros(3, 3);
        let b = Field::zeros(3, 2);
        assert!(a.zip_map(&b, |x, y| x + y).is_err());
    }
}
