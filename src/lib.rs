pub use cv_core as core;
pub use cv_imgproc as imgproc;
pub use cv_video as video;

pub use cv_video::{
    calc_optical_flow_farneback, calc_optical_flow_horn_schunck, calc_optical_flow_lk, Farneback,
    FlowField, FlowSequence, FlowSolution, FlowVisualizer, FrameSource, HornSchunck,
    ImageDirectorySource, LucasKanade, Termination, VideoError,
};

use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Initialize a single global Rayon thread pool for the flow kernels.
///
/// Call this once at application startup before solving. Repeated calls are
/// idempotent and return the first initialization result.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `RUSTCV_CPU_THREADS` env var
/// 3. Rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> cv_core::Result<()> {
    cv_core::init_global_thread_pool(num_threads)
}

/// One image written by [`write_flow_sequence`].
#[derive(Debug, Clone)]
pub struct WrittenFrame {
    pub path: PathBuf,
    pub frame_number: usize,
    /// Mean flow over the whole field; `None` for the first frame.
    pub mean_flow: Option<(f32, f32)>,
    pub termination: Option<Termination>,
}

#[derive(Debug, Clone, Default)]
pub struct SequenceReport {
    pub written: Vec<WrittenFrame>,
    /// Frame pairs that failed to solve and were skipped.
    pub failed: usize,
}

/// Solve every consecutive frame pair of `source` and write the composites
/// to `output_dir` as `flow_000000.png`, `flow_000001.png`, ...
///
/// The first frame has no predecessor and is written next to a black panel,
/// so a source of `n` frames that all solve yields `n` images.
pub fn write_flow_sequence<S: FrameSource>(
    mut source: S,
    solver: HornSchunck,
    scale: f32,
    visualizer: &FlowVisualizer,
    output_dir: &Path,
) -> cv_video::Result<SequenceReport> {
    let mut report = SequenceReport::default();
    let Some(first) = source.next_frame()? else {
        return Ok(report);
    };
    fs::create_dir_all(output_dir)?;

    let path = save_composite(&visualizer.compose_blank(&first.image)?, output_dir, 0)?;
    report.written.push(WrittenFrame {
        path,
        frame_number: first.frame_number,
        mean_flow: None,
        termination: None,
    });

    let sequence = FlowSequence::new(source, solver)
        .with_scale(scale)?
        .primed_with(&first.image);

    for step in sequence {
        let step = match step {
            Ok(step) => step,
            Err(e @ (VideoError::Source(_) | VideoError::Io(_) | VideoError::Image(_))) => {
                return Err(e)
            }
            Err(e) => {
                warn!("skipping frame pair: {e}");
                report.failed += 1;
                continue;
            }
        };

        let composite = visualizer.compose(&step.frame.image, &step.flow)?;
        let path = save_composite(&composite, output_dir, report.written.len())?;
        info!(
            frame = step.frame.frame_number,
            iterations = step.iterations,
            termination = ?step.termination,
            "wrote {}",
            path.display()
        );
        report.written.push(WrittenFrame {
            path,
            frame_number: step.frame.frame_number,
            mean_flow: Some(step.flow.mean()),
            termination: Some(step.termination),
        });
    }

    Ok(report)
}

fn save_composite(image: &RgbImage, output_dir: &Path, index: usize) -> cv_video::Result<PathBuf> {
    let path = output_dir.join(format!("flow_{:06}.png", index));
    image.save(&path)?;
    debug!(path = %path.display(), "saved composite");
    Ok(path)
}
