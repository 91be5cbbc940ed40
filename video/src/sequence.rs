//! Frame sources and the pairwise flow driver.

use crate::{FlowField, HornSchunck, Result, Termination, VideoError, VideoFrame};
use cv_core::Field;
use cv_imgproc::convert_rgb_to_gray;
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tiff"];

/// Downscale applied before solving unless configured otherwise.
pub const DEFAULT_SCALE: f32 = 0.75;

pub const DEFAULT_FRAME_RATE: f64 = 20.0;

/// Yields grey-scale frames in presentation order.
pub trait FrameSource {
    /// `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<VideoFrame>>;
}

/// Still images in a directory, read in file-name order.
#[derive(Debug, Clone)]
pub struct ImageDirectorySource {
    paths: Vec<PathBuf>,
    cursor: usize,
    frame_rate: f64,
}

impl ImageDirectorySource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(VideoError::Source(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && has_image_extension(&path) {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(VideoError::Source(format!(
                "no images found in {}",
                dir.display()
            )));
        }
        paths.sort();

        debug!(dir = %dir.display(), frames = paths.len(), "opened image directory");
        Ok(Self {
            paths,
            cursor: 0,
            frame_rate: DEFAULT_FRAME_RATE,
        })
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

impl FrameSource for ImageDirectorySource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        let Some(path) = self.paths.get(self.cursor) else {
            return Ok(None);
        };
        let image = convert_rgb_to_gray(&image::open(path)?.to_rgb8());
        let frame_number = self.cursor;
        self.cursor += 1;
        Ok(Some(VideoFrame::new(
            image,
            frame_number as f64 / self.frame_rate,
            frame_number,
        )))
    }
}

/// Frames already held in memory.
#[derive(Debug)]
pub struct InMemorySource {
    frames: std::vec::IntoIter<GrayImage>,
    next_number: usize,
    frame_rate: f64,
}

impl InMemorySource {
    pub fn new(frames: Vec<GrayImage>) -> Self {
        Self {
            frames: frames.into_iter(),
            next_number: 0,
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

impl FrameSource for InMemorySource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        Ok(self.frames.next().map(|image| {
            let n = self.next_number;
            self.next_number += 1;
            VideoFrame::new(image, n as f64 / self.frame_rate, n)
        }))
    }
}

/// Flow between one frame and its predecessor.
#[derive(Debug, Clone)]
pub struct FlowStep {
    /// The later frame of the pair, at source resolution.
    pub frame: VideoFrame,
    /// Flow at the solver's (possibly downscaled) resolution.
    pub flow: FlowField,
    pub iterations: usize,
    pub termination: Termination,
}

/// Runs a [`HornSchunck`] solve over every consecutive pair of a source.
///
/// The first frame only primes the sequence, so `n` frames give `n - 1`
/// steps. A caller that has already consumed the first frame hands it over
/// with [`FlowSequence::primed_with`]. A failed solve is reported for that pair and the sequence moves
/// on; a failing source ends it.
pub struct FlowSequence<S: FrameSource> {
    source: S,
    solver: HornSchunck,
    scale: f32,
    prev: Option<Field>,
    finished: bool,
}

impl<S: FrameSource> FlowSequence<S> {
    pub fn new(source: S, solver: HornSchunck) -> Self {
        Self {
            source,
            solver,
            scale: DEFAULT_SCALE,
            prev: None,
            finished: false,
        }
    }

    /// Downscale factor in `(0, 1]` applied to every frame before solving.
    pub fn with_scale(mut self, scale: f32) -> Result<Self> {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(VideoError::InvalidParameters(format!(
                "scale must be in (0, 1], got {}",
                scale
            )));
        }
        self.scale = scale;
        Ok(self)
    }

    /// Use `image` as the frame preceding the source's first one.
    ///
    /// Call after [`FlowSequence::with_scale`] so the frame is downscaled the
    /// same way as the rest.
    pub fn primed_with(mut self, image: &GrayImage) -> Self {
        self.prev = Some(self.prepare(image));
        self
    }

    pub fn solver(&self) -> &HornSchunck {
        &self.solver
    }

    fn prepare(&self, image: &GrayImage) -> Field {
        if self.scale >= 1.0 {
            return Field::from_gray(image);
        }
        let width = ((image.width() as f32 * self.scale) as u32).max(1);
        let height = ((image.height() as f32 * self.scale) as u32).max(1);
        Field::from_gray(&imageops::resize(image, width, height, FilterType::Triangle))
    }

    pub fn next_step(&mut self) -> Result<Option<FlowStep>> {
        loop {
            let Some(frame) = self.source.next_frame()? else {
                return Ok(None);
            };
            let current = self.prepare(&frame.image);

            let Some(prev) = self.prev.take() else {
                self.prev = Some(current);
                continue;
            };
            let solved = self.solver.solve(&prev, &current);
            self.prev = Some(current);
            let solution = solved?;

            debug!(
                frame = frame.frame_number,
                iterations = solution.iterations,
                "flow step"
            );
            return Ok(Some(FlowStep {
                frame,
                flow: solution.flow,
                iterations: solution.iterations,
                termination: solution.termination,
            }));
        }
    }
}

impl<S: FrameSource> Iterator for FlowSequence<S> {
    type Item = Result<FlowStep>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_step() {
            Ok(Some(step)) => Some(Ok(step)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                // Only source failures are fatal; a bad pair is skipped.
                if matches!(e, VideoError::Source(_) | VideoError::Io(_) | VideoError::Image(_)) {
                    self.finished = true;
                }
                Some(Err(e))
            }
        }
    }
}
