//! Shared helpers for the binaries and the retrying parts of the pipeline.

pub mod bootstrap;
pub mod retry;
