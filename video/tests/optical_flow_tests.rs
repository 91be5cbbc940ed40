use approx::assert_abs_diff_eq;
use cv_core::Field;
use cv_video::*;
use image::{GrayImage, Luma};

/// Low-frequency texture translated by `(dx, dy)` pixels.
fn textured(width: u32, height: u32, dx: f32, dy: f32) -> Field {
    Field::from_fn(width, height, |x, y| {
        let xs = x as f32 - dx;
        let ys = y as f32 - dy;
        128.0 + 50.0 * (0.15 * xs + 0.1 * ys).sin() + 40.0 * (0.2 * ys - 0.07 * xs).cos()
    })
}

#[test]
fn test_lk_tracks_translated_texture() {
    let prev = textured(64, 64, 0.0, 0.0);
    let next = textured(64, 64, 1.5, -1.0);
    let points = [(32.0, 32.0), (20.0, 40.0), (44.0, 24.0)];

    let tracked = LucasKanade::new().track_points(&prev, &next, &points).unwrap();
    assert_eq!(tracked.len(), points.len());
    for (&(x, y), result) in points.iter().zip(&tracked) {
        let (nx, ny) = result.expect("textured point should be tracked");
        assert_abs_diff_eq!(nx - x, 1.5, epsilon = 0.3);
        assert_abs_diff_eq!(ny - y, -1.0, epsilon = 0.3);
    }
}

#[test]
fn test_lk_static_frames_keep_points() {
    let frame = textured(48, 48, 0.0, 0.0);
    let tracked = LucasKanade::new()
        .track_point(&frame, &frame, (24.0, 20.0))
        .unwrap()
        .unwrap();
    assert_abs_diff_eq!(tracked.0, 24.0, epsilon = 1e-3);
    assert_abs_diff_eq!(tracked.1, 20.0, epsilon = 1e-3);
}

#[test]
fn test_lk_loses_untrackable_points() {
    let flat = Field::filled(32, 32, 90.0);
    assert_eq!(
        LucasKanade::new().track_point(&flat, &flat, (16.0, 16.0)).unwrap(),
        None
    );

    let frame = textured(32, 32, 0.0, 0.0);
    let tracked = LucasKanade::new()
        .track_points(&frame, &frame, &[(-1.0, 5.0), (5.0, 40.0)])
        .unwrap();
    assert_eq!(tracked, vec![None, None]);
}

#[test]
fn test_lk_rejects_mismatched_frames() {
    let a = Field::filled(16, 16, 0.0);
    let b = Field::filled(16, 8, 0.0);
    assert!(matches!(
        LucasKanade::new().track_points(&a, &b, &[(4.0, 4.0)]),
        Err(VideoError::SizeMismatch(_))
    ));
}

#[test]
fn test_farneback_identical_frames_give_zero_flow() {
    let frame = textured(40, 32, 0.0, 0.0);
    let flow = Farneback::new().compute_fields(&frame, &frame).unwrap();
    assert_eq!(flow.dimensions(), (40, 32));
    assert_eq!(flow.u.max_abs(), 0.0);
    assert_eq!(flow.v.max_abs(), 0.0);
}

#[test]
fn test_farneback_recovers_translation() {
    let prev = textured(64, 64, 0.0, 0.0);
    let next = textured(64, 64, 1.0, 0.5);
    let flow = Farneback::new().compute_fields(&prev, &next).unwrap();

    assert_eq!(flow.dimensions(), (64, 64));
    assert!(flow.first_non_finite().is_none());
    let (mu, mv) = flow.mean_in(16, 16, 32, 32).unwrap();
    assert_abs_diff_eq!(mu, 1.0, epsilon = 0.3);
    assert_abs_diff_eq!(mv, 0.5, epsilon = 0.3);
}

#[test]
fn test_farneback_rejects_non_finite_frames() {
    let mut next = textured(24, 24, 0.0, 0.0);
    let prev = next.clone();
    next.set(3, 7, f32::INFINITY);
    assert!(matches!(
        Farneback::new().compute_fields(&prev, &next),
        Err(VideoError::NonFinite { x: 3, y: 7, .. })
    ));
}

#[test]
fn test_convenience_functions_on_gray_images() {
    let to_gray = |field: &Field| {
        GrayImage::from_fn(field.width(), field.height(), |x, y| {
            Luma([field.get(x, y).round().clamp(0.0, 255.0) as u8])
        })
    };
    let prev = to_gray(&textured(48, 48, 0.0, 0.0));
    let next = to_gray(&textured(48, 48, 1.0, 0.0));

    let tracked = calc_optical_flow_lk(&prev, &next, &[(24.0, 24.0)]).unwrap();
    let (x, _) = tracked[0].unwrap();
    assert!(x > 24.5, "tracked x {x}");

    let flow = calc_optical_flow_farneback(&prev, &next).unwrap();
    let (mu, _) = flow.mean_in(12, 12, 24, 24).unwrap();
    assert!(mu > 0.5, "mean u {mu}");
}
