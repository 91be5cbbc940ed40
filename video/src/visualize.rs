//! Flow-field rendering
//!
//! Direction is mapped to hue and amplified magnitude to brightness, with a
//! colour-wheel legend that shows which hue means which direction.

use crate::{FlowField, Result};
use cv_imgproc::{convert_gray_to_rgb, hsv_to_rgb, hstack};
use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use rayon::prelude::*;
use std::f32::consts::TAU;

/// Gap between the legend and the bottom-right image corner.
pub const LEGEND_MARGIN: u32 = 20;

/// Legend pixels darker than this keep the background.
const LEGEND_MASK_LEVEL: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowVisualizer {
    /// Brightness per pixel of motion.
    pub sensitivity: f32,
    /// Amplified magnitudes below this render black.
    pub threshold: f32,
    /// Legend radius; `None` disables the legend.
    pub legend_size: Option<u32>,
}

impl Default for FlowVisualizer {
    fn default() -> Self {
        Self {
            sensitivity: 100.0,
            threshold: 5.0,
            legend_size: Some(60),
        }
    }
}

impl FlowVisualizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_legend_size(mut self, legend_size: Option<u32>) -> Self {
        self.legend_size = legend_size;
        self
    }

    /// HSV-coded flow image with the flow's dimensions.
    pub fn render(&self, flow: &FlowField) -> RgbImage {
        let (width, height) = flow.dimensions();
        let mut img = RgbImage::new(width, height);
        let row_bytes = width as usize * 3;
        if row_bytes == 0 {
            return img;
        }

        img.as_mut()
            .par_chunks_mut(row_bytes)
            .zip(flow.u.as_slice().par_chunks(width as usize))
            .zip(flow.v.as_slice().par_chunks(width as usize))
            .for_each(|((row, us), vs)| {
                for ((px, &u), &v) in row.chunks_exact_mut(3).zip(us).zip(vs) {
                    px.copy_from_slice(&self.flow_color(u, v));
                }
            });

        img
    }

    fn flow_color(&self, u: f32, v: f32) -> [u8; 3] {
        let mut value = u.hypot(v) * self.sensitivity;
        if value < self.threshold {
            value = 0.0;
        }
        let hue = v.atan2(u).rem_euclid(TAU).to_degrees();
        hsv_to_rgb(hue, 1.0, value.clamp(0.0, 255.0) / 255.0)
    }

    /// Paste the colour wheel into the bottom-right corner of `img`.
    ///
    /// Images too small to hold the legend plus margin are left untouched.
    pub fn overlay_legend(&self, img: &mut RgbImage) {
        let Some(size) = self.legend_size else {
            return;
        };
        let legend = color_wheel(size);
        let (lw, lh) = legend.dimensions();
        if img.width() < lw + LEGEND_MARGIN || img.height() < lh + LEGEND_MARGIN {
            return;
        }
        let x_off = img.width() - lw - LEGEND_MARGIN;
        let y_off = img.height() - lh - LEGEND_MARGIN;

        for (x, y, px) in legend.enumerate_pixels() {
            let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            if luma > LEGEND_MASK_LEVEL {
                img.put_pixel(x_off + x, y_off + y, *px);
            }
        }
    }

    /// `original` on the left, its flow rendering (scaled to match, with
    /// legend) on the right.
    pub fn compose(&self, original: &GrayImage, flow: &FlowField) -> Result<RgbImage> {
        let mut rendered = self.render(flow);
        if rendered.dimensions() != original.dimensions() {
            rendered = imageops::resize(
                &rendered,
                original.width(),
                original.height(),
                FilterType::Triangle,
            );
        }
        self.overlay_legend(&mut rendered);
        Ok(hstack(&convert_gray_to_rgb(original), &rendered)?)
    }

    /// `original` next to a black panel, for a frame with no predecessor.
    pub fn compose_blank(&self, original: &GrayImage) -> Result<RgbImage> {
        let blank = RgbImage::new(original.width(), original.height());
        Ok(hstack(&convert_gray_to_rgb(original), &blank)?)
    }
}

/// `2*size` square legend: each pixel inside radius `size` is coloured by
/// its direction from the centre, with a white outline on the rim.
pub fn color_wheel(size: u32) -> RgbImage {
    let side = size * 2;
    let radius = size as f32;
    let mut wheel = RgbImage::new(side, side);

    for (x, y, px) in wheel.enumerate_pixels_mut() {
        let dx = x as f32 - radius;
        let dy = y as f32 - radius;
        let dist = dx.hypot(dy);

        *px = if (dist - radius).abs() <= 0.5 {
            Rgb([255, 255, 255])
        } else if dist <= radius {
            let hue = dy.atan2(dx).rem_euclid(TAU).to_degrees();
            Rgb(hsv_to_rgb(hue, 1.0, 1.0))
        } else {
            Rgb([0, 0, 0])
        };
    }

    wheel
}
