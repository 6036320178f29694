//! Error types for mixture fitting.

use thiserror::Error;

/// Errors that can occur while fitting a mixture.
#[derive(Error, Debug)]
pub enum GmmError {
    /// Failed to initialize GPU device.
    #[error("GPU initialization failed: {0}")]
    GpuInit(String),

    /// Failed to create GPU resources.
    #[error("GPU resource creation failed: {0}")]
    ResourceCreation(String),

    /// Failed to execute GPU compute.
    #[error("GPU compute execution failed: {0}")]
    ComputeExecution(String),

    /// Failed to read back data from GPU.
    #[error("GPU readback failed: {0}")]
    Readback(String),

    /// Invalid fitting configuration (cluster count, seeds, source image).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A compute entry point could not be resolved.
    #[error("Compute kernel `{0}` is missing from its shader module")]
    MissingKernel(&'static str),

    /// No run has been initialized.
    #[error("Fitting run not initialized")]
    NotInitialized,

    /// The current run hit a fatal error and must be re-initialized.
    #[error("Fitting run failed, re-initialize before stepping")]
    RunFailed,
}
