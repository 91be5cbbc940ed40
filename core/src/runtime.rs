use crate::{Error, Result};
use rayon::ThreadPoolBuilder;
use std::env;
use std::sync::OnceLock;

pub const CPU_THREADS_ENV: &str = "RUSTCV_CPU_THREADS";

static THREAD_POOL_INIT: OnceLock<Result<()>> = OnceLock::new();

/// Initialize the global Rayon thread pool used by the per-row flow kernels.
///
/// Priority:
/// 1. `num_threads` argument
/// 2. `RUSTCV_CPU_THREADS` environment variable
/// 3. Rayon default
///
/// Only the first call configures the pool; later calls return its outcome.
pub fn init_global_thread_pool(num_threads: Option<usize>) -> Result<()> {
    THREAD_POOL_INIT
        .get_or_init(|| {
            let configured_threads = match num_threads {
                Some(n) => Some(n),
                None => read_cpu_threads_from_env()?,
            };

            let mut builder = ThreadPoolBuilder::new();
            if let Some(n) = configured_threads {
                if n == 0 {
                    return Err(Error::InvalidParameters(format!(
                        "{CPU_THREADS_ENV} must be >= 1"
                    )));
                }
                builder = builder.num_threads(n);
            }

            builder
                .build_global()
                .map_err(|e| Error::RuntimeError(e.to_string()))
        })
        .clone()
}

pub fn current_cpu_threads() -> usize {
    rayon::current_num_threads()
}

fn read_cpu_threads_from_env() -> Result<Option<usize>> {
    let raw = match env::var(CPU_THREADS_ENV) {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(e) => {
            return Err(Error::InvalidParameters(format!(
                "failed to read {CPU_THREADS_ENV}: {e}"
            )))
        }
    };

    let parsed: usize = raw.trim().parse().map_err(|_| {
        Error::InvalidParameters(format!(
            "{CPU_THREADS_ENV} must be a positive integer, got '{raw}'"
        ))
    })?;
    if parsed == 0 {
        return Err(Error::InvalidParameters(format!(
            "{CPU_THREADS_ENV} must be >= 1"
        )));
    }
    Ok(Some(parsed))
}
