use std::process::ExitCode;
use std::sync::Arc;

use copy_storage_bench::benchmarks::copy_storage_buffer::CopyStorageBufferBenchmark;
use copy_storage_bench::benchmarks::{
    enumerate_cases, register_benchmarks, supported_cases, GpuBenchmark,
};
use copy_storage_bench::config::{BackendChoice, BenchConfig};
use copy_storage_bench::gpu::{wgpu_backend, Device, SoftBackend};
use copy_storage_bench::harness::{Registry, Runner};
use copy_storage_bench::Result;

async fn open_devices(choice: BackendChoice) -> Result<Vec<Device>> {
    let mut devices = Vec::new();
    if matches!(choice, BackendChoice::Wgpu | BackendChoice::All) {
        match wgpu_backend::enumerate_devices().await {
            Ok(backends) => devices.extend(
                backends
                    .into_iter()
                    .map(|backend| Device::new(Arc::new(backend))),
            ),
            Err(err) if choice == BackendChoice::All => log::warn!("no wgpu devices: {err}"),
            Err(err) => return Err(err),
        }
    }
    if matches!(choice, BackendChoice::Soft | BackendChoice::All) {
        devices.push(Device::new(Arc::new(SoftBackend::new())));
    }
    Ok(devices)
}

async fn run() -> Result<bool> {
    let config = BenchConfig::from_env()?;
    log::debug!("{config:?}");

    let devices = open_devices(config.backend).await?;
    for device in &devices {
        println!("Device: {}", device.name());
    }

    let names: Vec<&str> = devices.iter().map(Device::name).collect();
    let cases = enumerate_cases(&names, config.buffer_sizes());
    let cases = supported_cases(&devices, cases)?;
    let benchmark = CopyStorageBufferBenchmark::new(config.transfer);
    println!("\nRunning {} ({} cases)", benchmark.name(), cases.len());

    let mut registry = Registry::new();
    register_benchmarks(&mut registry, &benchmark, &devices, cases);
    let summary = Runner::new(config.iterations)
        .with_filter(config.filter.clone())
        .run(registry);
    summary.print();
    Ok(summary.failures.is_empty())
}

fn main() -> ExitCode {
    env_logger::init();
    match pollster::block_on(run()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            log::error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
