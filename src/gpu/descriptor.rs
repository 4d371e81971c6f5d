use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::spirv::BindingKind;

use super::backend::{DescriptorWrite, DeviceLimits, OwnedHandle, RawHandle};
use super::buffer::{Buffer, BufferShared, BufferUsage};
use super::pipeline::{DescriptorSetLayout, ModuleShared, ShaderModule};

/// A buffer to attach to a `(set, binding)` slot.
#[derive(Debug, Clone, Copy)]
pub struct BoundBuffer<'a> {
    pub buffer: &'a Buffer,
    pub set: u32,
    pub binding: u32,
}

/// A descriptor set bound at a pipeline set index during recording.
#[derive(Debug, Clone, Copy)]
pub struct BoundDescriptorSet<'a> {
    pub index: u32,
    pub set: &'a DescriptorSet,
}

#[derive(Debug)]
pub struct DescriptorSet {
    pub(crate) handle: Arc<OwnedHandle>,
    layout: DescriptorSetLayout,
    pub(crate) bound: BTreeMap<u32, Arc<BufferShared>>,
    _module: Arc<ModuleShared>,
}

impl DescriptorSet {
    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    /// Whether every binding of the layout has a buffer attached.
    pub fn is_complete(&self) -> bool {
        self.layout
            .bindings()
            .iter()
            .all(|b| self.bound.contains_key(&b.binding))
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.handle.raw()
    }
}

/// Descriptor sets allocated from one pool, keyed by their layout.
#[derive(Debug, Default)]
pub struct LayoutSetMap {
    sets: HashMap<DescriptorSetLayout, DescriptorSet>,
}

impl LayoutSetMap {
    pub fn get(&self, layout: &DescriptorSetLayout) -> Option<&DescriptorSet> {
        self.sets.get(layout)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    fn set_for_index_mut(&mut self, module: RawHandle, set: u32) -> Option<&mut DescriptorSet> {
        self.sets
            .iter_mut()
            .find(|(layout, _)| layout.module() == module && layout.set() == set)
            .map(|(_, s)| s)
    }

    /// Validates every entry of `bound` first, then writes them all.
    pub(crate) fn attach(
        &mut self,
        module: &ShaderModule,
        bound: &[BoundBuffer<'_>],
        limits: &DeviceLimits,
    ) -> Result<()> {
        for entry in bound {
            let Some(info) = module.reflection().binding(entry.set, entry.binding) else {
                return Err(Error::BindingMismatch(format!(
                    "shader module declares no binding ({}, {}) for buffer '{}'",
                    entry.set,
                    entry.binding,
                    entry.buffer.label()
                )));
            };
            if !self
                .sets
                .keys()
                .any(|l| l.module() == module.raw() && l.set() == entry.set)
            {
                return Err(Error::BindingMismatch(format!(
                    "no descriptor set allocated for set {}",
                    entry.set
                )));
            }
            if info.kind == BindingKind::StorageBuffer
                && !entry.buffer.usage().contains(BufferUsage::STORAGE)
            {
                return Err(Error::BindingMismatch(format!(
                    "buffer '{}' bound to storage binding ({}, {}) lacks STORAGE usage",
                    entry.buffer.label(),
                    entry.set,
                    entry.binding
                )));
            }
            if entry.buffer.size() > limits.max_storage_buffer_binding_size {
                return Err(Error::BindingMismatch(format!(
                    "buffer '{}' ({} bytes) exceeds the maximum binding size {}",
                    entry.buffer.label(),
                    entry.buffer.size(),
                    limits.max_storage_buffer_binding_size
                )));
            }
        }

        let mut by_set: BTreeMap<u32, Vec<&BoundBuffer<'_>>> = BTreeMap::new();
        for entry in bound {
            by_set.entry(entry.set).or_default().push(entry);
        }

        for (set_index, entries) in by_set {
            let Some(set) = self.set_for_index_mut(module.raw(), set_index) else {
                continue;
            };
            let writes: Vec<DescriptorWrite> = entries
                .iter()
                .map(|e| DescriptorWrite {
                    binding: e.binding,
                    buffer: e.buffer.shared().raw(),
                    size: e.buffer.size(),
                })
                .collect();
            set.handle.backend().write_descriptor_set(set.raw(), &writes)?;
            for e in entries {
                set.bound.insert(e.binding, e.buffer.shared().clone());
            }
        }
        Ok(())
    }
}

/// Allocates descriptor sets for exactly the layouts one shader module declares.
#[derive(Debug)]
pub struct DescriptorPool {
    module: Arc<ModuleShared>,
    layouts: Vec<DescriptorSetLayout>,
    allocated: bool,
}

impl DescriptorPool {
    pub(crate) fn new(module: &ShaderModule) -> Self {
        Self {
            module: module.shared().clone(),
            layouts: module.descriptor_set_layouts().to_vec(),
            allocated: false,
        }
    }

    /// Number of descriptor sets one allocation can produce.
    pub fn capacity(&self) -> usize {
        self.layouts.len()
    }

    pub fn allocate_descriptor_sets(
        &mut self,
        layouts: &[DescriptorSetLayout],
    ) -> Result<LayoutSetMap> {
        if self.allocated {
            return Err(Error::PoolExhausted(
                "descriptor sets were already allocated from this pool".into(),
            ));
        }

        let mut map = LayoutSetMap::default();
        for layout in layouts {
            if map.sets.contains_key(layout) {
                continue;
            }
            if !self.layouts.contains(layout) {
                return Err(Error::PoolExhausted(format!(
                    "pool was not sized for a layout of set {}",
                    layout.set()
                )));
            }
            let backend = self.module.handle.backend();
            let raw = backend.create_descriptor_set(self.module.handle.raw(), layout.set())?;
            map.sets.insert(
                layout.clone(),
                DescriptorSet {
                    handle: Arc::new(OwnedHandle::new(backend.clone(), raw)),
                    layout: layout.clone(),
                    bound: BTreeMap::new(),
                    _module: self.module.clone(),
                },
            );
        }
        self.allocated = true;
        Ok(map)
    }

    /// Makes the pool's capacity available again.
    pub fn reset(&mut self) {
        self.allocated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmarks::ShaderVariant;
    use crate::gpu::{Device, MemoryClass, SoftBackend};

    fn setup() -> (Device, ShaderModule) {
        let device = Device::new(Arc::new(SoftBackend::new()));
        let words = ShaderVariant::Scalar.spirv_words().unwrap();
        let module = device.create_shader_module(&words).unwrap();
        (device, module)
    }

    #[test]
    fn pool_is_sized_to_module_layouts() {
        let (device, module) = setup();
        let mut pool = device.create_descriptor_pool(&module).unwrap();
        assert_eq!(pool.capacity(), 1);

        let sets = pool
            .allocate_descriptor_sets(module.descriptor_set_layouts())
            .unwrap();
        assert_eq!(sets.len(), 1);
        assert!(matches!(
            pool.allocate_descriptor_sets(module.descriptor_set_layouts()),
            Err(Error::PoolExhausted(_))
        ));

        pool.reset();
        assert!(pool
            .allocate_descriptor_sets(module.descriptor_set_layouts())
            .is_ok());
    }

    #[test]
    fn undeclared_binding_is_rejected_without_touching_valid_ones() {
        let (device, module) = setup();
        let mut pool = device.create_descriptor_pool(&module).unwrap();
        let mut sets = pool
            .allocate_descriptor_sets(module.descriptor_set_layouts())
            .unwrap();
        let src = device
            .create_buffer(BufferUsage::STORAGE, MemoryClass::DeviceLocal, 256)
            .unwrap();
        let dst = device
            .create_buffer(BufferUsage::STORAGE, MemoryClass::DeviceLocal, 256)
            .unwrap();
        let stray = device
            .create_buffer(BufferUsage::STORAGE, MemoryClass::DeviceLocal, 256)
            .unwrap();

        device
            .attach_buffer_to_descriptor(
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
            )
            .unwrap();

        let err = device
            .attach_buffer_to_descriptor(
                &module,
                &mut sets,
                &[
                    BoundBuffer {
                        buffer: &stray,
                        set: 0,
                        binding: 0,
                    },
                    BoundBuffer {
                        buffer: &stray,
                        set: 0,
                        binding: 5,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::BindingMismatch(_)));

        let set = sets.get(&module.descriptor_set_layouts()[0]).unwrap();
        assert!(set.is_complete());
        assert_eq!(set.bound[&0].raw(), src.shared().raw());
        assert_eq!(set.bound[&1].raw(), dst.shared().raw());
    }

    #[test]
    fn non_storage_buffer_is_rejected() {
        let (device, module) = setup();
        let mut pool = device.create_descriptor_pool(&module).unwrap();
        let mut sets = pool
            .allocate_descriptor_sets(module.descriptor_set_layouts())
            .unwrap();
        let staging = device
            .create_buffer(BufferUsage::COPY_SRC, MemoryClass::HostVisibleCoherent, 256)
            .unwrap();
        let err = device
            .attach_buffer_to_descriptor(
                &module,
                &mut sets,
                &[BoundBuffer {
                    buffer: &staging,
                    set: 0,
                    binding: 0,
                }],
            )
            .unwrap_err();
        assert!(matches!(err, Error::BindingMismatch(_)));
    }
}
