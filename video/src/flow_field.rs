use crate::{Result, VideoError};
use cv_core::Field;
use std::f32::consts::TAU;

/// Per-pixel displacement between two frames.
///
/// `u` is the horizontal component (positive to the right), `v` the vertical
/// component (positive downwards), both in pixels per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    pub u: Field,
    pub v: Field,
}

impl FlowField {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            u: Field::zeros(width, height),
            v: Field::zeros(width, height),
        }
    }

    pub fn from_components(u: Field, v: Field) -> Result<Self> {
        if !u.same_shape(&v) {
            return Err(VideoError::SizeMismatch(format!(
                "flow components differ: u is {}x{}, v is {}x{}",
                u.width(),
                u.height(),
                v.width(),
                v.height()
            )));
        }
        Ok(Self { u, v })
    }

    pub fn width(&self) -> u32 {
        self.u.width()
    }

    pub fn height(&self) -> u32 {
        self.u.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.u.dimensions()
    }

    pub fn get_motion(&self, x: u32, y: u32) -> (f32, f32) {
        (self.u.get(x, y), self.v.get(x, y))
    }

    pub fn set_motion(&mut self, x: u32, y: u32, u: f32, v: f32) {
        self.u.set(x, y, u);
        self.v.set(x, y, v);
    }

    /// Euclidean length of the flow vector at each pixel.
    pub fn magnitude(&self) -> Field {
        let mut out = self.u.clone();
        for (m, &v) in out.as_mut_slice().iter_mut().zip(self.v.as_slice()) {
            *m = m.hypot(v);
        }
        out
    }

    /// Direction of the flow vector in radians, in `[0, 2*pi)`.
    pub fn angle(&self) -> Field {
        let mut out = self.u.clone();
        for (a, &v) in out.as_mut_slice().iter_mut().zip(self.v.as_slice()) {
            *a = v.atan2(*a).rem_euclid(TAU);
        }
        out
    }

    /// Flow with both components sign-flipped.
    pub fn negated(&self) -> Self {
        Self {
            u: self.u.map(|x| -x),
            v: self.v.map(|x| -x),
        }
    }

    pub fn mean(&self) -> (f32, f32) {
        (self.u.mean(), self.v.mean())
    }

    /// Mean `(u, v)` over the `width` x `height` window at `(x, y)`.
    pub fn mean_in(&self, x: u32, y: u32, width: u32, height: u32) -> Result<(f32, f32)> {
        Ok(self.crop(x, y, width, height)?.mean())
    }

    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            u: self.u.crop(x, y, width, height)?,
            v: self.v.crop(x, y, width, height)?,
        })
    }

    /// First NaN or infinite sample, checking `u` before `v`.
    pub fn first_non_finite(&self) -> Option<(&'static str, u32, u32)> {
        self.u
            .first_non_finite()
            .map(|(x, y)| ("u", x, y))
            .or_else(|| self.v.first_non_finite().map(|(x, y)| ("v", x, y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    #[test]
    fn test_motion_field() {
        let mut field = FlowField::new(10, 10);

        field.set_motion(5, 5, 3.0, 4.0);
        let (u, v) = field.get_motion(5, 5);

        assert_eq!(u, 3.0);
        assert_eq!(v, 4.0);

        let mag = field.magnitude();
        assert_eq!(mag.get(5, 5), 5.0); // sqrt(3^2 + 4^2) = 5
        assert_eq!(mag.get(0, 0), 0.0);
    }

    #[test]
    fn test_angle_range() {
        let mut field = FlowField::new(4, 1);
        field.set_motion(0, 0, 1.0, 0.0);
        field.set_motion(1, 0, 0.0, 1.0);
        field.set_motion(2, 0, -1.0, 0.0);
        field.set_motion(3, 0, 0.0, -1.0);

        let angle = field.angle();
        assert_relative_eq!(angle.get(0, 0), 0.0);
        assert_relative_eq!(angle.get(1, 0), PI / 2.0, epsilon = 1e-6);
        assert_relative_eq!(angle.get(2, 0), PI, epsilon = 1e-6);
        assert_relative_eq!(angle.get(3, 0), 3.0 * PI / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_negated_and_mean_in() {
        let mut field = FlowField::new(4, 4);
        field.set_motion(1, 1, 2.0, -2.0);
        field.set_motion(2, 1, 4.0, -4.0);

        let (mu, mv) = field.mean_in(1, 1, 2, 1).unwrap();
        assert_relative_eq!(mu, 3.0);
        assert_relative_eq!(mv, -3.0);

        let flipped = field.negated();
        assert_eq!(flipped.get_motion(2, 1), (-4.0, 4.0));
        assert!(field.mean_in(3, 3, 2, 2).is_err());
    }

    #[test]
    fn test_component_shape_check() {
        assert!(FlowField::from_components(Field::zeros(3, 2), Field::zeros(3, 2)).is_ok());
        let err = FlowField::from_components(Field::zeros(3, 2), Field::zeros(2, 3)).unwrap_err();
        assert!(matches!(err, VideoError::SizeMismatch(_)));
    }
}
