//! Storage-buffer copy throughput benchmark for compute devices.

pub mod benchmarks;
pub mod config;
pub mod error;
pub mod gpu;
pub mod harness;
pub mod spirv;
pub mod staging;

pub use error::{Error, Result};
