//! Test harness for Strata.
//!
//! Provides an in-memory [`GpuDevice`](strata_gpu::GpuDevice) with
//! controllable fences and host-executed compute kernels, plus helpers for
//! building contexts and pipelines against it.

pub mod harness;
pub mod mock;

#[cfg(test)]
mod scenarios;

pub use harness::{compute_shader, fragment_shader, vertex_shader, MockImages, TestRig};
pub use mock::{add_kernel, Command, FenceMode, Kernel, KernelContext, MockDevice, MockStats, ObjectKind};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] strata_gpu::GpuError),
    #[error("Mock device violation: {0}")]
    Violation(String),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
