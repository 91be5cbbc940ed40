use crate::{ImgprocError, Result};
use image::{GrayImage, RgbImage};
use rayon::prelude::*;
use rayon::ThreadPool;

pub fn convert_gray_to_rgb(gray: &GrayImage) -> RgbImage {
    convert_gray_to_rgb_in_pool(gray, None)
}

pub fn convert_gray_to_rgb_in_pool(gray: &GrayImage, pool: Option<&ThreadPool>) -> RgbImage {
    let run = || {
        let (w, h) = gray.dimensions();
        let mut rgb = RgbImage::new(w, h);

        rgb.as_mut()
            .par_chunks_mut(3)
            .zip(gray.as_raw().par_iter())
            .for_each(|(rgb_pixel, &g)| {
                rgb_pixel[0] = g;
                rgb_pixel[1] = g;
                rgb_pixel[2] = g;
            });

        rgb
    };

    if let Some(p) = pool {
        p.install(run)
    } else {
        run()
    }
}

pub fn convert_rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    convert_rgb_to_gray_in_pool(rgb, None)
}

/// ITU-R BT.601 luma, rounded to nearest.
pub fn convert_rgb_to_gray_in_pool(rgb: &RgbImage, pool: Option<&ThreadPool>) -> GrayImage {
    let run = || {
        let (w, h) = rgb.dimensions();
        let mut gray = GrayImage::new(w, h);

        gray.as_mut()
            .par_iter_mut()
            .zip(rgb.as_raw().par_chunks(3))
            .for_each(|(g, p)| {
                let luma = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
                *g = luma.round().clamp(0.0, 255.0) as u8;
            });

        gray
    };

    if let Some(p) = pool {
        p.install(run)
    } else {
        run()
    }
}

/// HSV to RGB with hue in degrees `[0, 360)` and saturation/value in `[0, 1]`.
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let h = h.rem_euclid(360.0);
    let s = s.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);

    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    [
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    ]
}

/// Place `left` and `right` next to each other. Heights must agree.
pub fn hstack(left: &RgbImage, right: &RgbImage) -> Result<RgbImage> {
    if left.height() != right.height() {
        return Err(ImgprocError::DimensionMismatch(format!(
            "hstack needs equal heights, got {} and {}",
            left.height(),
            right.height()
        )));
    }
    let (lw, rw) = (left.width() as usize * 3, right.width() as usize * 3);
    if lw == 0 {
        return Ok(right.clone());
    }
    if rw == 0 {
        return Ok(left.clone());
    }
    let mut out = RgbImage::new(left.width() + right.width(), left.height());

    out.as_mut()
        .par_chunks_mut(lw + rw)
        .zip(left.as_raw().par_chunks(lw))
        .zip(right.as_raw().par_chunks(rw))
        .for_each(|((row, l), r)| {
            row[..lw].copy_from_slice(l);
            row[lw..].copy_from_slice(r);
        });

    Ok(out)
}
