//! Host reference backend.
//!
//! Executes everything on the CPU. A dispatch runs the kernel as a plain copy
//! from the storage binding the module only reads to the one it writes, which
//! is what the copy kernels do. Faults can be injected to exercise error paths,
//! and the number of live objects is observable for leak checks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::spirv::{BindingKind, Reflection};

use super::backend::{
    Backend, BufferDesc, DescriptorWrite, DeviceLimits, PipelineDesc, RawCommand, RawHandle,
};
use super::buffer::{BufferUsage, MemoryClass};
use super::pipeline::SpecValue;

pub const SOFT_DEVICE_NAME: &str = "soft-reference";

const DEFAULT_LIMITS: DeviceLimits = DeviceLimits {
    max_buffer_size: 1 << 30,
    max_storage_buffer_binding_size: 1 << 27,
    max_compute_workgroups_per_dimension: 65535,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    /// After every dispatch, overwrite f32 element `index` of the destination.
    CorruptAfterDispatch { index: usize, value: f32 },
    /// The submission with this zero-based index, and every later one, fails
    /// with `DeviceLost`.
    LoseDeviceOnSubmit { submission: u64 },
    /// Buffer allocations fail once `after` buffers have been created.
    FailAllocation { after: u64 },
}

#[derive(Debug)]
enum Object {
    Buffer {
        data: Vec<u8>,
    },
    Module {
        reflection: Reflection,
    },
    Pipeline {
        module: RawHandle,
        workgroup_size: [u32; 3],
        element_limit: Option<u64>,
    },
    DescriptorSet {
        slots: BTreeMap<u32, RawHandle>,
    },
    Encoded,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    objects: HashMap<RawHandle, Object>,
    faults: Vec<Fault>,
    buffers_created: u64,
    submissions: u64,
}

impl State {
    fn insert(&mut self, object: Object) -> RawHandle {
        self.next_id += 1;
        let handle = RawHandle(self.next_id);
        self.objects.insert(handle, object);
        handle
    }

    fn buffer(&self, handle: RawHandle) -> Result<&Vec<u8>> {
        match self.objects.get(&handle) {
            Some(Object::Buffer { data }) => Ok(data),
            _ => Err(Error::SubmissionError(format!(
                "{handle} is not a live buffer"
            ))),
        }
    }

    fn buffer_mut(&mut self, handle: RawHandle) -> Result<&mut Vec<u8>> {
        match self.objects.get_mut(&handle) {
            Some(Object::Buffer { data }) => Ok(data),
            _ => Err(Error::SubmissionError(format!(
                "{handle} is not a live buffer"
            ))),
        }
    }
}

pub struct SoftBackend {
    limits: DeviceLimits,
    state: Mutex<State>,
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftBackend {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_LIMITS)
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::default()),
        }
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.lock().objects.len()
    }

    /// Submissions attempted so far.
    pub fn submissions(&self) -> u64 {
        self.lock().submissions
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for SoftBackend {
    fn name(&self) -> &str {
        SOFT_DEVICE_NAME
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<RawHandle> {
        if desc.memory == MemoryClass::HostVisibleCoherent
            && (desc.usage.contains(BufferUsage::STORAGE)
                || desc
                    .usage
                    .contains(BufferUsage::COPY_SRC | BufferUsage::COPY_DST))
        {
            return Err(Error::AllocationError(format!(
                "no host-visible memory type supports usage {:?}",
                desc.usage
            )));
        }

        let mut state = self.lock();
        let created = state.buffers_created;
        let exhausted = state
            .faults
            .iter()
            .any(|f| matches!(f, Fault::FailAllocation { after } if created >= *after));
        if exhausted {
            return Err(Error::AllocationError(format!(
                "out of device memory allocating '{}' ({} bytes)",
                desc.label, desc.size
            )));
        }
        let size = usize::try_from(desc.size).map_err(|_| {
            Error::AllocationError(format!("buffer size {} exceeds host memory", desc.size))
        })?;
        state.buffers_created += 1;
        Ok(state.insert(Object::Buffer {
            data: vec![0; size],
        }))
    }

    fn read_buffer(&self, buffer: RawHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.lock();
        let data = state.buffer(buffer)?;
        let start = offset as usize;
        let src = data
            .get(start..start + out.len())
            .ok_or_else(|| Error::InvalidOperation(format!("read out of bounds of {buffer}")))?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn write_buffer(&self, buffer: RawHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let data = state.buffer_mut(buffer)?;
        let start = offset as usize;
        let dst = data
            .get_mut(start..start + bytes.len())
            .ok_or_else(|| Error::InvalidOperation(format!("write out of bounds of {buffer}")))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn create_shader_module(&self, _words: &[u32], reflection: &Reflection) -> Result<RawHandle> {
        Ok(self.lock().insert(Object::Module {
            reflection: reflection.clone(),
        }))
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<RawHandle> {
        let workgroup_size = desc
            .reflection
            .entry_point(desc.entry_point)
            .map(|e| e.workgroup_size)
            .ok_or_else(|| Error::EntryPointNotFound(desc.entry_point.to_string()))?;
        // The first integer constant bounds the number of active invocations.
        let element_limit = desc.constants.iter().find_map(|c| match c.value {
            SpecValue::I32(v) => Some(u64::try_from(v).unwrap_or(0)),
            SpecValue::U32(v) => Some(u64::from(v)),
            _ => None,
        });
        Ok(self.lock().insert(Object::Pipeline {
            module: desc.module,
            workgroup_size,
            element_limit,
        }))
    }

    fn create_descriptor_set(&self, _module: RawHandle, _set: u32) -> Result<RawHandle> {
        Ok(self.lock().insert(Object::DescriptorSet {
            slots: BTreeMap::new(),
        }))
    }

    fn write_descriptor_set(&self, set: RawHandle, writes: &[DescriptorWrite]) -> Result<()> {
        let mut state = self.lock();
        match state.objects.get_mut(&set) {
            Some(Object::DescriptorSet { slots }) => {
                for write in writes {
                    slots.insert(write.binding, write.buffer);
                }
                Ok(())
            }
            _ => Err(Error::BindingMismatch(format!(
                "{set} is not a live descriptor set"
            ))),
        }
    }

    fn encode(&self, _commands: &[RawCommand]) -> Result<RawHandle> {
        Ok(self.lock().insert(Object::Encoded))
    }

    fn submit_and_wait(&self, encoded: RawHandle, commands: &[RawCommand]) -> Result<()> {
        let mut state = self.lock();
        let index = state.submissions;
        state.submissions += 1;

        if let Some(Fault::LoseDeviceOnSubmit { submission }) = state
            .faults
            .iter()
            .find(|f| matches!(f, Fault::LoseDeviceOnSubmit { submission } if index >= *submission))
        {
            return Err(Error::DeviceLost(format!(
                "injected loss at submission {submission}"
            )));
        }
        if !matches!(state.objects.get(&encoded), Some(Object::Encoded)) {
            return Err(Error::SubmissionError(format!(
                "{encoded} is not an encoded command buffer"
            )));
        }

        let mut pipeline = None;
        let mut sets: BTreeMap<u32, RawHandle> = BTreeMap::new();
        for command in commands {
            match *command {
                RawCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let (start, len) = (src_offset as usize, size as usize);
                    let bytes = state.buffer(src)?[start..start + len].to_vec();
                    let start = dst_offset as usize;
                    state.buffer_mut(dst)?[start..start + len].copy_from_slice(&bytes);
                }
                RawCommand::BindPipeline { pipeline: p } => pipeline = Some(p),
                RawCommand::BindDescriptorSet { index, set } => {
                    sets.insert(index, set);
                }
                RawCommand::Dispatch { x, y, z } => {
                    let pipeline = pipeline.ok_or_else(|| {
                        Error::SubmissionError("dispatch without a bound pipeline".into())
                    })?;
                    execute_copy_kernel(&mut state, pipeline, &sets, [x, y, z])?;
                }
            }
        }
        Ok(())
    }

    fn destroy(&self, handle: RawHandle) {
        if self.lock().objects.remove(&handle).is_none() {
            log::warn!("destroying unknown soft object {handle}");
        }
    }
}

fn execute_copy_kernel(
    state: &mut State,
    pipeline: RawHandle,
    sets: &BTreeMap<u32, RawHandle>,
    groups: [u32; 3],
) -> Result<()> {
    let Some(Object::Pipeline {
        module,
        workgroup_size,
        element_limit,
    }) = state.objects.get(&pipeline)
    else {
        return Err(Error::SubmissionError(format!(
            "{pipeline} is not a live pipeline"
        )));
    };
    let Some(Object::Module { reflection }) = state.objects.get(module) else {
        return Err(Error::SubmissionError(format!(
            "module of pipeline {pipeline} was destroyed"
        )));
    };

    let storage = || {
        reflection
            .bindings
            .iter()
            .filter(|b| b.kind == BindingKind::StorageBuffer)
    };
    let (Some(src_info), Some(dst_info)) = (
        storage().find(|b| !b.written),
        storage().find(|b| b.written),
    ) else {
        return Err(Error::SubmissionError(
            "kernel does not read one storage binding and write another".into(),
        ));
    };
    let stride = src_info.array_stride.unwrap_or(4) as usize;

    let slot = |set: u32, binding: u32| -> Result<RawHandle> {
        let Some(Object::DescriptorSet { slots }) =
            sets.get(&set).and_then(|h| state.objects.get(h))
        else {
            return Err(Error::SubmissionError(format!(
                "descriptor set {set} is not bound"
            )));
        };
        slots.get(&binding).copied().ok_or_else(|| {
            Error::SubmissionError(format!("binding ({set}, {binding}) has no buffer"))
        })
    };
    let src = slot(src_info.set, src_info.binding)?;
    let dst = slot(dst_info.set, dst_info.binding)?;

    let invocations: u64 = groups
        .iter()
        .zip(workgroup_size)
        .map(|(g, w)| u64::from(*g) * u64::from(*w))
        .product();
    let active = element_limit.map_or(invocations, |limit| invocations.min(limit));

    let source = state.buffer(src)?.clone();
    let destination = state.buffer_mut(dst)?;
    let elements = (active as usize)
        .min(source.len() / stride)
        .min(destination.len() / stride);
    let bytes = elements * stride;
    destination[..bytes].copy_from_slice(&source[..bytes]);

    let corruptions: Vec<(usize, f32)> = state
        .faults
        .iter()
        .filter_map(|f| match *f {
            Fault::CorruptAfterDispatch { index, value } => Some((index, value)),
            _ => None,
        })
        .collect();
    let destination = state.buffer_mut(dst)?;
    for (index, value) in corruptions {
        if let Some(word) = destination.get_mut(index * 4..index * 4 + 4) {
            word.copy_from_slice(&value.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gpu::Device;

    #[test]
    fn staging_buffers_cannot_be_both_source_and_destination() {
        let device = Device::new(Arc::new(SoftBackend::new()));
        assert!(matches!(
            device.create_buffer(
                BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
                MemoryClass::HostVisibleCoherent,
                16
            ),
            Err(Error::AllocationError(_))
        ));
    }

    #[test]
    fn injected_allocation_failure() {
        let backend = Arc::new(SoftBackend::new());
        backend.inject(Fault::FailAllocation { after: 1 });
        let device = Device::new(backend.clone());
        let first = device
            .create_buffer(BufferUsage::STORAGE, MemoryClass::DeviceLocal, 16)
            .unwrap();
        assert!(matches!(
            device.create_buffer(BufferUsage::STORAGE, MemoryClass::DeviceLocal, 16),
            Err(Error::AllocationError(_))
        ));
        drop(first);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn dropped_objects_are_destroyed() {
        let backend = Arc::new(SoftBackend::new());
        let device = Device::new(backend.clone());
        {
            let _a = device
                .create_buffer(BufferUsage::STORAGE, MemoryClass::DeviceLocal, 16)
                .unwrap();
            let mut cmd = device.allocate_command_buffer().unwrap();
            cmd.begin().unwrap();
            cmd.end().unwrap();
            assert_eq!(backend.live_objects(), 2);
        }
        assert_eq!(backend.live_objects(), 0);
    }
}
