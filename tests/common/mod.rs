//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use copy_storage_bench::benchmarks::copy_storage_buffer::CopyStorageBufferBenchmark;
use copy_storage_bench::benchmarks::{register_benchmarks, BenchmarkCase};
use copy_storage_bench::config::TransferPath;
use copy_storage_bench::gpu::{Device, SoftBackend};
use copy_storage_bench::harness::{Registry, RunSummary, Runner};

pub fn require_gpu() -> bool {
    let Ok(raw) = std::env::var("COPY_BENCH_REQUIRE_GPU") else {
        return false;
    };

    let v = raw.trim();
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

pub fn skip_or_panic(test_name: &str, reason: &str) {
    if require_gpu() {
        panic!("COPY_BENCH_REQUIRE_GPU is enabled but {test_name} cannot run: {reason}");
    }
    eprintln!("skipping {test_name}: {reason}");
}

pub fn soft_device() -> (Arc<SoftBackend>, Device) {
    let backend = Arc::new(SoftBackend::new());
    let device = Device::new(backend.clone());
    (backend, device)
}

/// Runs the copy benchmark for `cases` on `devices` through the harness.
pub fn run_cases(
    devices: &[Device],
    cases: Vec<BenchmarkCase>,
    transfer: TransferPath,
    iterations: u64,
) -> RunSummary {
    let benchmark = CopyStorageBufferBenchmark::new(transfer);
    let mut registry = Registry::new();
    register_benchmarks(&mut registry, &benchmark, devices, cases);
    Runner::new(iterations).run(registry)
}
