//! Horn-Schunck flow over an image sequence.
//!
//! Usage: `horn_schunck <input_dir> [output_dir]`
//!
//! Every consecutive pair of images in `input_dir` (sorted by file name) is
//! solved and written to `output_dir` (default `hs_output`) as
//! `flow_000000.png`, `flow_000001.png`, ... with the later frame on the left
//! and the colour-coded flow on the right. The first image is written next to
//! a black panel.
//!
//! Solver parameters come from `RUSTCV_HS_ALPHA`, `RUSTCV_HS_ITERATIONS` and
//! `RUSTCV_HS_EPSILON`; log verbosity from `RUST_LOG`.

use cv_flow::video::DEFAULT_SCALE;
use cv_flow::{init_thread_pool, write_flow_sequence, FlowVisualizer, HornSchunck, ImageDirectorySource};
use std::env;
use std::error::Error;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_OUTPUT_DIR: &str = "hs_output";

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let Some(input_dir) = args.next().map(PathBuf::from) else {
        eprintln!("usage: horn_schunck <input_dir> [output_dir]");
        std::process::exit(2);
    };
    let output_dir = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));

    init_thread_pool(None)?;
    let solver = HornSchunck::from_env()?;
    let source = ImageDirectorySource::open(&input_dir)?;

    info!(
        input = %input_dir.display(),
        output = %output_dir.display(),
        frames = source.len(),
        alpha = solver.alpha,
        iterations = solver.iterations,
        "starting flow sequence"
    );

    let report = write_flow_sequence(
        source,
        solver,
        DEFAULT_SCALE,
        &FlowVisualizer::new(),
        &output_dir,
    )?;

    info!(written = report.written.len(), failed = report.failed, "done");
    Ok(())
}
