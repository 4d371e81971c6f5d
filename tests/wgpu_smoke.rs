mod common;

use std::sync::Arc;

use copy_storage_bench::benchmarks::{
    enumerate_cases, supported_cases, BenchmarkCase, ShaderVariant,
};
use copy_storage_bench::config::{BenchConfig, TransferPath};
use copy_storage_bench::gpu::{wgpu_backend, Device};
use copy_storage_bench::Error;

fn first_device(test_name: &str) -> Option<Device> {
    let backends = match pollster::block_on(wgpu_backend::enumerate_devices()) {
        Ok(backends) => backends,
        Err(Error::AdapterNotFound) => {
            common::skip_or_panic(test_name, "no wgpu adapter available");
            return None;
        }
        Err(err) => panic!("enumerating adapters failed: {err}"),
    };
    let Some(backend) = backends.into_iter().next() else {
        common::skip_or_panic(test_name, "no wgpu adapter available");
        return None;
    };
    Some(Device::new(Arc::new(backend)))
}

#[test]
fn copy_case_runs_on_first_adapter() {
    let Some(device) = first_device("copy_case_runs_on_first_adapter") else {
        return;
    };
    let devices = [device];
    let cases = ShaderVariant::ALL
        .into_iter()
        .map(|variant| BenchmarkCase::new(0, devices[0].name(), variant, 1 << 20))
        .collect();

    // Pipeline creation checks the bind group layout against the shader's
    // declared storage access, then the dispatch is verified on readback.
    let summary = common::run_cases(&devices, cases, TransferPath::Helper, 2);
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);
    assert_eq!(summary.reports.len(), 2);
}

#[test]
fn default_sweep_runs_on_first_adapter() {
    let Some(device) = first_device("default_sweep_runs_on_first_adapter") else {
        return;
    };
    let devices = [device];
    let config = BenchConfig::default();
    let cases = enumerate_cases(&[devices[0].name()], config.buffer_sizes());
    let cases = supported_cases(&devices, cases).unwrap();
    assert!(!cases.is_empty());

    let summary = common::run_cases(&devices, cases, TransferPath::Explicit, 1);
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);
}
