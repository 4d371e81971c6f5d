use crate::error::{Error, Result};
use crate::gpu::Device;
use crate::harness::{BenchState, Registry, TimeUnit};
use crate::spirv;

pub mod copy_storage_buffer;

pub const NUM_ITERATIONS: u64 = 100;
/// Entry point of every embedded kernel.
pub const ENTRY_POINT: &str = "main";
/// Buffer sizes sweep from 1 MiB up to, but excluding, 64 MiB.
pub const MIN_SIZE_SHIFT: u32 = 20;
pub const MAX_SIZE_SHIFT: u32 = 26;

/// Largest f32 element count whose indices are all exactly representable.
const MAX_EXACT_F32_ELEMENTS: u64 = 1 << 24;

/// A benchmark driven once per [`BenchmarkCase`].
pub trait GpuBenchmark {
    fn name(&self) -> &str;
    fn run(&self, device: &Device, case: &BenchmarkCase, state: &mut BenchState) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderVariant {
    /// One `float` per invocation.
    Scalar,
    /// One `vec4` per invocation.
    Vector,
}

impl ShaderVariant {
    pub const ALL: [ShaderVariant; 2] = [ShaderVariant::Scalar, ShaderVariant::Vector];

    pub fn name(self) -> &'static str {
        match self {
            ShaderVariant::Scalar => "scalar",
            ShaderVariant::Vector => "vector",
        }
    }

    /// Bytes moved by one kernel invocation.
    pub fn element_bytes(self) -> u64 {
        match self {
            ShaderVariant::Scalar => 4,
            ShaderVariant::Vector => 16,
        }
    }

    pub fn spirv_bytes(self) -> &'static [u8] {
        match self {
            ShaderVariant::Scalar => {
                &include_bytes!("../../shaders/copy_storage_buffer_scalar.spv")[..]
            }
            ShaderVariant::Vector => {
                &include_bytes!("../../shaders/copy_storage_buffer_vector.spv")[..]
            }
        }
    }

    pub fn spirv_words(self) -> Result<Vec<u32>> {
        spirv::words_from_bytes(self.spirv_bytes())
    }

    /// Workgroup size of the kernel's `main` entry point.
    pub fn workgroup_size(self) -> Result<[u32; 3]> {
        let reflection = spirv::reflect(&self.spirv_words()?)?;
        reflection
            .entry_point(ENTRY_POINT)
            .map(|e| e.workgroup_size)
            .ok_or_else(|| Error::EntryPointNotFound(ENTRY_POINT.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkCase {
    /// `<device>/<variant>/<bytes>`
    pub name: String,
    pub device_index: usize,
    pub variant: ShaderVariant,
    pub buffer_size: u64,
    /// Kernel invocations needed to cover the buffer.
    pub element_count: u64,
}

impl BenchmarkCase {
    pub fn new(
        device_index: usize,
        device_name: &str,
        variant: ShaderVariant,
        buffer_size: u64,
    ) -> Self {
        Self {
            name: format!("{device_name}/{}/{buffer_size}", variant.name()),
            device_index,
            variant,
            buffer_size,
            element_count: buffer_size / variant.element_bytes(),
        }
    }

    /// Rejects sizes the copy protocol cannot run or verify.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 || self.buffer_size % self.variant.element_bytes() != 0 {
            return Err(Error::InvalidCase(format!(
                "{}: buffer size {} is not a positive multiple of {} bytes",
                self.name,
                self.buffer_size,
                self.variant.element_bytes()
            )));
        }
        if self.buffer_size / 4 > MAX_EXACT_F32_ELEMENTS {
            return Err(Error::InvalidCase(format!(
                "{}: {} f32 values cannot all be represented exactly",
                self.name,
                self.buffer_size / 4
            )));
        }
        Ok(())
    }

    /// Workgroups to dispatch along x for a kernel with `workgroup_size`
    /// invocations per group, on a device accepting at most `max_groups`
    /// groups per dimension.
    pub fn dispatch_groups(&self, workgroup_size: u32, max_groups: u32) -> Result<u32> {
        let workgroup_size = u64::from(workgroup_size);
        if workgroup_size == 0 || self.element_count % workgroup_size != 0 {
            return Err(Error::InvalidCase(format!(
                "{}: {} elements is not a multiple of the workgroup size {workgroup_size}",
                self.name, self.element_count
            )));
        }
        let groups = self.element_count / workgroup_size;
        if groups > u64::from(max_groups) {
            return Err(Error::InvalidCase(format!(
                "{}: {groups} workgroups exceed the device limit of {max_groups} per dimension",
                self.name
            )));
        }
        u32::try_from(groups)
            .map_err(|_| Error::InvalidCase(format!("{}: too many workgroups", self.name)))
    }

    /// Bytes read plus bytes written by one dispatch.
    pub fn bytes_per_iteration(&self) -> u64 {
        self.buffer_size * 2
    }
}

/// Every device × variant × size combination, in that nesting order.
pub fn enumerate_cases(
    device_names: &[&str],
    sizes: impl Iterator<Item = u64> + Clone,
) -> Vec<BenchmarkCase> {
    let mut cases = Vec::new();
    for (device_index, device_name) in device_names.iter().enumerate() {
        for variant in ShaderVariant::ALL {
            for size in sizes.clone() {
                cases.push(BenchmarkCase::new(device_index, device_name, variant, size));
            }
        }
    }
    cases
}

/// Drops the cases whose single dispatch would exceed their device's
/// workgroup-count limit, logging each one.
pub fn supported_cases(
    devices: &[Device],
    cases: Vec<BenchmarkCase>,
) -> Result<Vec<BenchmarkCase>> {
    let mut workgroup_sizes = Vec::new();
    for variant in ShaderVariant::ALL {
        workgroup_sizes.push((variant, variant.workgroup_size()?[0]));
    }

    let mut supported = Vec::with_capacity(cases.len());
    for case in cases {
        let Some(device) = devices.get(case.device_index) else {
            return Err(Error::InvalidCase(format!(
                "{}: no device #{}",
                case.name, case.device_index
            )));
        };
        let workgroup_size = workgroup_sizes
            .iter()
            .find(|(variant, _)| *variant == case.variant)
            .map_or(1, |&(_, size)| size);
        let max_groups = device.limits().max_compute_workgroups_per_dimension;
        if case.element_count / u64::from(workgroup_size.max(1)) > u64::from(max_groups) {
            log::warn!(
                "skipping {}: more than {max_groups} workgroups on {}",
                case.name,
                device.name()
            );
        } else {
            supported.push(case);
        }
    }
    Ok(supported)
}

/// Registers `benchmark` for every case, timed manually in microseconds.
pub fn register_benchmarks<'a>(
    registry: &mut Registry<'a>,
    benchmark: &'a dyn GpuBenchmark,
    devices: &'a [Device],
    cases: Vec<BenchmarkCase>,
) {
    for case in cases {
        let device = &devices[case.device_index];
        registry
            .register(case.name.clone(), move |state: &mut BenchState| {
                benchmark.run(device, &case, state)
            })
            .use_manual_time()
            .unit(TimeUnit::Microsecond);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gpu::SoftBackend;

    #[test]
    fn case_geometry_for_one_mebibyte() {
        let scalar = BenchmarkCase::new(0, "gpu", ShaderVariant::Scalar, 1 << 20);
        assert_eq!(scalar.name, "gpu/scalar/1048576");
        assert_eq!(scalar.element_count, 262_144);
        assert_eq!(scalar.dispatch_groups(32, 65535).unwrap(), 8192);

        let vector = BenchmarkCase::new(0, "gpu", ShaderVariant::Vector, 1 << 20);
        assert_eq!(vector.element_count, 65_536);
        assert_eq!(vector.dispatch_groups(32, 65535).unwrap(), 2048);
        assert_eq!(vector.bytes_per_iteration(), 2 << 20);
    }

    #[test]
    fn indivisible_element_count_is_rejected() {
        let case = BenchmarkCase::new(0, "gpu", ShaderVariant::Vector, 16 * 40);
        assert!(case.validate().is_ok());
        assert!(matches!(
            case.dispatch_groups(32, 65535),
            Err(Error::InvalidCase(_))
        ));

        let odd = BenchmarkCase::new(0, "gpu", ShaderVariant::Vector, 20);
        assert!(matches!(odd.validate(), Err(Error::InvalidCase(_))));
    }

    #[test]
    fn sizes_beyond_exact_f32_indices_are_rejected() {
        assert!(BenchmarkCase::new(0, "gpu", ShaderVariant::Scalar, 1 << 26)
            .validate()
            .is_ok());
        assert!(BenchmarkCase::new(0, "gpu", ShaderVariant::Scalar, 1 << 27)
            .validate()
            .is_err());
    }

    #[test]
    fn group_count_is_checked_against_the_device_limit() {
        let scalar = BenchmarkCase::new(0, "gpu", ShaderVariant::Scalar, 8 << 20);
        assert!(matches!(
            scalar.dispatch_groups(32, 65535),
            Err(Error::InvalidCase(_))
        ));
        assert_eq!(scalar.dispatch_groups(32, 65536).unwrap(), 65536);
    }

    #[test]
    fn sweep_skips_cases_beyond_the_dispatch_limit() {
        let devices = [Device::new(Arc::new(SoftBackend::new()))];
        let cases = enumerate_cases(&["soft"], (20..26).map(|s| 1u64 << s));
        let names: Vec<String> = supported_cases(&devices, cases)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        // 65535 groups of 32 invocations: scalar stops at 4 MiB, vector at 16 MiB.
        assert_eq!(
            names,
            [
                "soft/scalar/1048576",
                "soft/scalar/2097152",
                "soft/scalar/4194304",
                "soft/vector/1048576",
                "soft/vector/2097152",
                "soft/vector/4194304",
                "soft/vector/8388608",
                "soft/vector/16777216",
            ]
        );
    }

    #[test]
    fn embedded_kernels_use_32_wide_workgroups() {
        for variant in ShaderVariant::ALL {
            assert_eq!(variant.workgroup_size().unwrap(), [32, 1, 1]);
        }
    }

    #[test]
    fn cases_are_the_cartesian_product() {
        let cases = enumerate_cases(&["a", "b"], (20..26).map(|s| 1u64 << s));
        assert_eq!(cases.len(), 2 * 2 * 6);
        assert_eq!(cases[0].name, "a/scalar/1048576");
        assert_eq!(cases[6].name, "a/vector/1048576");
        assert_eq!(cases[12].name, "b/scalar/1048576");
        assert_eq!(cases[23].name, "b/vector/33554432");
        assert_eq!(cases[23].device_index, 1);
    }

    #[test]
    fn embedded_kernels_are_spirv() {
        for variant in ShaderVariant::ALL {
            let words = variant.spirv_words().unwrap();
            assert_eq!(words[0], spirv::SPIRV_MAGIC, "{}", variant.name());
        }
    }
}
