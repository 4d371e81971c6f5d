//! The compute-device capability interface.
//!
//! A backend owns every device object behind an opaque [`RawHandle`] and knows
//! how to execute a flat list of [`RawCommand`]s. All validation of the
//! buffer/pipeline/descriptor/command-buffer protocol lives in the front-end
//! types of this module's parent, so backends only translate.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::spirv::Reflection;

use super::buffer::{BufferUsage, MemoryClass};
use super::pipeline::SpecConstant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u64,
    /// Largest group count accepted along any one dispatch dimension.
    pub max_compute_workgroups_per_dimension: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryClass,
}

pub struct PipelineDesc<'a> {
    pub module: RawHandle,
    pub reflection: &'a Reflection,
    pub entry_point: &'a str,
    pub constants: &'a [SpecConstant],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub buffer: RawHandle,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawCommand {
    CopyBuffer {
        src: RawHandle,
        src_offset: u64,
        dst: RawHandle,
        dst_offset: u64,
        size: u64,
    },
    BindPipeline {
        pipeline: RawHandle,
    },
    BindDescriptorSet {
        index: u32,
        set: RawHandle,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

pub trait Backend: Send + Sync {
    /// Display name of the physical device.
    fn name(&self) -> &str;

    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<RawHandle>;

    /// Copies `out.len()` bytes starting at `offset` out of a host-visible buffer.
    fn read_buffer(&self, buffer: RawHandle, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Copies `data` into a host-visible buffer at `offset`. Returns once the
    /// write is visible to the device.
    fn write_buffer(&self, buffer: RawHandle, offset: u64, data: &[u8]) -> Result<()>;

    fn create_shader_module(&self, words: &[u32], reflection: &Reflection) -> Result<RawHandle>;

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<RawHandle>;

    /// Creates an empty descriptor set for descriptor set `set` of `module`.
    fn create_descriptor_set(&self, module: RawHandle, set: u32) -> Result<RawHandle>;

    fn write_descriptor_set(&self, set: RawHandle, writes: &[DescriptorWrite]) -> Result<()>;

    /// Translates recorded commands into a submittable object.
    fn encode(&self, commands: &[RawCommand]) -> Result<RawHandle>;

    /// Submits previously encoded work and blocks until the device has
    /// finished executing it. `commands` is the list `encoded` was built from;
    /// backends whose encoded objects are single-use re-encode from it.
    fn submit_and_wait(&self, encoded: RawHandle, commands: &[RawCommand]) -> Result<()>;

    /// Releases any object created by this backend.
    fn destroy(&self, handle: RawHandle);
}

/// A backend object released when the last reference is dropped.
pub(crate) struct OwnedHandle {
    backend: Arc<dyn Backend>,
    raw: RawHandle,
}

impl OwnedHandle {
    pub(crate) fn new(backend: Arc<dyn Backend>, raw: RawHandle) -> Self {
        Self { backend, raw }
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.raw
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.backend.destroy(self.raw);
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedHandle({})", self.raw)
    }
}
