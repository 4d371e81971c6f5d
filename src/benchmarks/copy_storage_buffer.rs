use instant::Instant;

use crate::config::TransferPath;
use crate::error::{Error, Result};
use crate::gpu::{
    BoundBuffer, BoundDescriptorSet, Buffer, BufferUsage, Device, MemoryClass, SpecConstant,
};
use crate::harness::BenchState;
use crate::staging;

use super::{BenchmarkCase, GpuBenchmark, ENTRY_POINT};

/// Specialization constant holding the number of active invocations.
const NUM_ELEMENTS_CONSTANT_ID: u32 = 0;

/// Device-to-device copy throughput through a storage-buffer compute kernel.
pub struct CopyStorageBufferBenchmark {
    transfer: TransferPath,
}

impl CopyStorageBufferBenchmark {
    pub fn new(transfer: TransferPath) -> Self {
        Self { transfer }
    }
}

impl GpuBenchmark for CopyStorageBufferBenchmark {
    fn name(&self) -> &str {
        "copy_storage_buffer"
    }

    fn run(&self, device: &Device, case: &BenchmarkCase, state: &mut BenchState) -> Result<()> {
        run_case(device, case, self.transfer, state)
    }
}

/// Checks that `values[i] == i` for every index.
pub fn verify_sequence(values: &[f32]) -> Result<()> {
    match values.iter().enumerate().find(|&(i, &v)| v != i as f32) {
        Some((index, &actual)) => Err(Error::VerificationFailure {
            index,
            expected: index as f32,
            actual,
        }),
        None => Ok(()),
    }
}

fn fill_sequence(bytes: &mut [u8]) {
    for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
        chunk.copy_from_slice(&(i as f32).to_ne_bytes());
    }
}

fn verify_bytes(bytes: &[u8]) -> Result<()> {
    let values: &[f32] = bytemuck::try_cast_slice(bytes).map_err(|e| {
        Error::InvalidOperation(format!("readback is not a whole number of f32 values: {e}"))
    })?;
    verify_sequence(values)
}

/// Staging buffers owned by the case for its whole run.
struct ExplicitStaging {
    upload: Buffer,
    readback: Buffer,
}

impl ExplicitStaging {
    fn new(device: &Device, size: u64) -> Result<Self> {
        Ok(Self {
            upload: device.create_labeled_buffer(
                "source staging",
                BufferUsage::COPY_SRC,
                MemoryClass::HostVisibleCoherent,
                size,
            )?,
            readback: device.create_labeled_buffer(
                "destination staging",
                BufferUsage::COPY_DST,
                MemoryClass::HostVisibleCoherent,
                size,
            )?,
        })
    }

    fn upload(&mut self, device: &Device, dst: &Buffer, size: u64) -> Result<()> {
        let mut mapping = self.upload.map(0, size)?;
        fill_sequence(mapping.bytes_mut());
        mapping.unmap()?;
        staging::copy_buffer_and_wait(device, &self.upload, dst, size)
    }

    fn verify(&mut self, device: &Device, src: &Buffer, size: u64) -> Result<()> {
        staging::copy_buffer_and_wait(device, src, &self.readback, size)?;
        let mapping = self.readback.map(0, size)?;
        let result = verify_bytes(mapping.bytes());
        mapping.unmap()?;
        result
    }
}

/// Runs one case end to end: setup, fill, a verified dispatch, then the timed
/// loop. Every object created here is released when the function returns,
/// whether it succeeds or not.
pub fn run_case(
    device: &Device,
    case: &BenchmarkCase,
    transfer: TransferPath,
    state: &mut BenchState,
) -> Result<()> {
    case.validate()?;
    let size = case.buffer_size;
    let num_elements = i32::try_from(case.element_count).map_err(|_| {
        Error::InvalidCase(format!(
            "{}: {} elements do not fit the kernel's element count",
            case.name, case.element_count
        ))
    })?;

    // Shader module, pipeline and descriptor sets.
    let words = case.variant.spirv_words()?;
    let module = device.create_shader_module(&words)?;
    let pipeline = device.create_pipeline(
        &module,
        ENTRY_POINT,
        &[SpecConstant::s32(NUM_ELEMENTS_CONSTANT_ID, num_elements)],
    )?;
    let groups = case.dispatch_groups(
        pipeline.workgroup_size()[0],
        device.limits().max_compute_workgroups_per_dimension,
    )?;

    let layouts = module.descriptor_set_layouts();
    let [layout] = layouts else {
        return Err(Error::BindingMismatch(format!(
            "expected exactly one descriptor set layout, found {}",
            layouts.len()
        )));
    };
    let mut pool = device.create_descriptor_pool(&module)?;
    let mut sets = pool.allocate_descriptor_sets(layouts)?;

    // Buffers.
    let src = device.create_labeled_buffer(
        "source",
        BufferUsage::COPY_DST | BufferUsage::STORAGE,
        MemoryClass::DeviceLocal,
        size,
    )?;
    let dst = device.create_labeled_buffer(
        "destination",
        BufferUsage::COPY_SRC | BufferUsage::STORAGE,
        MemoryClass::DeviceLocal,
        size,
    )?;
    let mut explicit = match transfer {
        TransferPath::Helper => None,
        TransferPath::Explicit => Some(ExplicitStaging::new(device, size)?),
    };

    // Source data: 0.0, 1.0, 2.0, ...
    match explicit.as_mut() {
        Some(buffers) => buffers.upload(device, &src, size)?,
        None => staging::set_device_buffer_via_staging(device, &src, size, fill_sequence)?,
    }

    device.attach_buffer_to_descriptor(
        &module,
        &mut sets,
        &[
            BoundBuffer {
                buffer: &src,
                set: 0,
                binding: 0,
            },
            BoundBuffer {
                buffer: &dst,
                set: 0,
                binding: 1,
            },
        ],
    )?;
    let set = sets.get(layout).ok_or_else(|| {
        Error::BindingMismatch(format!("no descriptor set allocated for set {}", layout.set()))
    })?;
    let bound_sets = [BoundDescriptorSet { index: 0, set }];

    // One dispatch, then check every element arrived.
    let mut dispatch_cmd = device.allocate_command_buffer()?;
    dispatch_cmd.begin()?;
    dispatch_cmd.bind_pipeline_and_descriptor_sets(&pipeline, &bound_sets)?;
    dispatch_cmd.dispatch(groups, 1, 1)?;
    dispatch_cmd.end()?;
    device.queue_submit_and_wait(&mut dispatch_cmd)?;

    match explicit.as_mut() {
        Some(buffers) => buffers.verify(device, &dst, size)?,
        None => staging::get_device_buffer_via_staging(device, &dst, size, verify_bytes)?,
    }
    log::debug!("{}: destination verified ({} elements)", case.name, case.element_count);

    // Benchmarking.
    let mut cmd = device.allocate_command_buffer()?;
    while state.keep_running() {
        cmd.begin()?;
        cmd.bind_pipeline_and_descriptor_sets(&pipeline, &bound_sets)?;
        cmd.dispatch(groups, 1, 1)?;
        cmd.end()?;
        let start = Instant::now();
        device.queue_submit_and_wait(&mut cmd)?;
        state.set_iteration_time(start.elapsed());
        cmd.reset()?;
    }
    state.set_bytes_processed(state.iterations() * case.bytes_per_iteration());

    // Release every command buffer used by the loop.
    device.reset_command_pool()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_verification_reports_first_mismatch() {
        assert!(verify_sequence(&[0.0, 1.0, 2.0, 3.0]).is_ok());
        let err = verify_sequence(&[0.0, 1.0, 7.5, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::VerificationFailure {
                index: 2,
                expected,
                actual
            } if expected == 2.0 && actual == 7.5
        ));
        assert_eq!(
            err.to_string(),
            "destination buffer element #2 has incorrect value: expected to be 2 but found 7.5"
        );
    }

    #[test]
    fn fill_writes_indices() {
        let mut words = [0u32; 4];
        fill_sequence(bytemuck::cast_slice_mut(&mut words));
        assert_eq!(bytemuck::cast_slice::<u32, f32>(&words), &[0.0, 1.0, 2.0, 3.0]);
    }
}
