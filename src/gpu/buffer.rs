use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::Pod;

use crate::error::{Error, Result};

use super::backend::{Backend, OwnedHandle, RawHandle};

/// Alignment required for the start of a mapped range.
pub const MAP_ALIGNMENT: u64 = 8;
/// Alignment required for copy offsets/sizes and mapped range lengths.
pub const COPY_ALIGNMENT: u64 = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Can be the source of a copy command.
        const COPY_SRC = 1 << 0;
        /// Can be the destination of a copy command.
        const COPY_DST = 1 << 1;
        /// Can be bound as a shader storage buffer.
        const STORAGE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// GPU-resident, never mapped by the host.
    DeviceLocal,
    /// Mappable by the host; host writes are visible to the device without
    /// an explicit flush once unmapped.
    HostVisibleCoherent,
}

#[derive(Debug)]
pub(crate) struct BufferShared {
    pub(crate) handle: OwnedHandle,
    label: String,
    size: u64,
    usage: BufferUsage,
    memory: MemoryClass,
    mapped: AtomicBool,
}

impl BufferShared {
    pub(crate) fn raw(&self) -> RawHandle {
        self.handle.raw()
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }
}

/// A device-resident buffer.
///
/// Descriptor sets and recorded command buffers keep the underlying object
/// alive, so dropping a `Buffer` while it is still referenced only releases it
/// once those references are gone.
pub struct Buffer {
    shared: Arc<BufferShared>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.shared.label)
            .field("size", &self.shared.size)
            .field("usage", &self.shared.usage)
            .field("memory", &self.shared.memory)
            .finish()
    }
}

impl Buffer {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        raw: RawHandle,
        label: &str,
        size: u64,
        usage: BufferUsage,
        memory: MemoryClass,
    ) -> Self {
        let shared = Arc::new(BufferShared {
            handle: OwnedHandle::new(backend, raw),
            label: label.to_string(),
            size,
            usage,
            memory,
            mapped: AtomicBool::new(false),
        });
        Self { shared }
    }

    pub fn size(&self) -> u64 {
        self.shared.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.shared.usage
    }

    pub fn memory(&self) -> MemoryClass {
        self.shared.memory
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn is_mapped(&self) -> bool {
        self.shared.is_mapped()
    }

    pub(crate) fn shared(&self) -> &Arc<BufferShared> {
        &self.shared
    }

    /// Maps `len` bytes starting at `offset` into host memory.
    ///
    /// The returned mapping holds a copy of the current contents; writes made
    /// through it reach the buffer when it is unmapped (explicitly or on drop).
    pub fn map(&mut self, offset: u64, len: u64) -> Result<Mapping<'_>> {
        if self.memory() != MemoryClass::HostVisibleCoherent {
            return Err(Error::InvalidOperation(format!(
                "buffer '{}' is device-local and cannot be mapped",
                self.label()
            )));
        }
        if offset % MAP_ALIGNMENT != 0 || len % COPY_ALIGNMENT != 0 {
            return Err(Error::InvalidOperation(format!(
                "map range {offset}+{len} of '{}' is misaligned",
                self.label()
            )));
        }
        if offset.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(Error::InvalidOperation(format!(
                "map range {offset}+{len} exceeds size {} of '{}'",
                self.size(),
                self.label()
            )));
        }
        if self.shared.mapped.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidOperation(format!(
                "buffer '{}' is already mapped",
                self.label()
            )));
        }

        let mut data = vec![0u32; (len / 4) as usize];
        if let Err(err) =
            self.shared
                .handle
                .backend()
                .read_buffer(self.shared.raw(), offset, bytemuck::cast_slice_mut(&mut data))
        {
            self.shared.mapped.store(false, Ordering::Release);
            return Err(err);
        }

        Ok(Mapping {
            buffer: self,
            offset,
            data,
            dirty: false,
            finished: false,
        })
    }
}

/// Host view of a mapped buffer range.
#[derive(Debug)]
pub struct Mapping<'a> {
    buffer: &'a Buffer,
    offset: u64,
    data: Vec<u32>,
    dirty: bool,
    finished: bool,
}

impl Mapping<'_> {
    pub fn len(&self) -> usize {
        self.data.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        bytemuck::cast_slice_mut(&mut self.data)
    }

    /// Reinterprets the mapped range as a slice of `T`.
    pub fn as_slice<T: Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(&self.data).map_err(|e| {
            Error::InvalidOperation(format!("cannot view mapped range as typed slice: {e}"))
        })
    }

    pub fn as_mut_slice<T: Pod>(&mut self) -> Result<&mut [T]> {
        self.dirty = true;
        bytemuck::try_cast_slice_mut(&mut self.data).map_err(|e| {
            Error::InvalidOperation(format!("cannot view mapped range as typed slice: {e}"))
        })
    }

    /// Commits host writes and releases the mapping.
    pub fn unmap(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let result = if self.dirty {
            self.buffer.shared.handle.backend().write_buffer(
                self.buffer.shared.raw(),
                self.offset,
                bytemuck::cast_slice(&self.data),
            )
        } else {
            Ok(())
        };
        self.buffer.shared.mapped.store(false, Ordering::Release);
        result
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.finish() {
                log::error!(
                    "failed to commit mapping of '{}': {err}",
                    self.buffer.label()
                );
            }
        }
    }
}
