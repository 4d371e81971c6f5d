//! [`Backend`] implemented on top of wgpu.
//!
//! wgpu bind groups are immutable, so a descriptor set only becomes a real
//! bind group once every binding of its layout has been written. Command
//! buffers are single-use in wgpu; a resubmission re-encodes from the
//! recorded command list.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use wgpu::{
    Adapter, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout,
    BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingResource, BindingType, BufferBinding,
    BufferBindingType, BufferDescriptor, BufferUsages, CommandEncoderDescriptor,
    ComputePassDescriptor, ComputePipeline, ComputePipelineDescriptor, DeviceDescriptor,
    DownlevelFlags, ErrorFilter, Features, Instance, InstanceDescriptor, Maintain, MapMode,
    MemoryHints, PipelineCompilationOptions, PipelineLayout, PipelineLayoutDescriptor,
    RequestAdapterOptions, ShaderModuleDescriptor, ShaderSource, ShaderStages,
};

use crate::error::{Error, Result};
use crate::spirv::{BindingKind, Reflection};

use super::backend::{
    Backend, BufferDesc, DescriptorWrite, DeviceLimits, PipelineDesc, RawCommand, RawHandle,
};
use super::buffer::{BufferUsage, MemoryClass};

enum Object {
    Buffer(wgpu::Buffer),
    Module {
        module: wgpu::ShaderModule,
        /// Per set index: the layout and the bindings it declares.
        layouts: Vec<(BindGroupLayout, Vec<u32>)>,
        pipeline_layout: PipelineLayout,
    },
    Pipeline(ComputePipeline),
    DescriptorSet {
        layout: BindGroupLayout,
        expected: Vec<u32>,
        entries: BTreeMap<u32, (RawHandle, u64)>,
        group: Option<BindGroup>,
    },
    Encoded(Option<wgpu::CommandBuffer>),
}

pub struct WgpuBackend {
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: DeviceLimits,
    lost: Arc<Mutex<Option<String>>>,
    next_id: AtomicU64,
    objects: Mutex<HashMap<RawHandle, Object>>,
}

/// Opens one device per compute-capable adapter on every available backend.
pub async fn enumerate_devices() -> Result<Vec<WgpuBackend>> {
    let instance = Instance::new(&InstanceDescriptor::default());
    let mut adapters = instance.enumerate_adapters(wgpu::Backends::all());
    if adapters.is_empty() {
        if let Some(adapter) = instance
            .request_adapter(&RequestAdapterOptions::default())
            .await
        {
            adapters.push(adapter);
        }
    }

    let mut devices = Vec::new();
    for adapter in adapters {
        let info = adapter.get_info();
        if !adapter
            .get_downlevel_capabilities()
            .flags
            .contains(DownlevelFlags::COMPUTE_SHADERS)
        {
            log::info!(
                "skipping adapter {} ({:?}): no compute support",
                info.name,
                info.backend
            );
            continue;
        }
        match WgpuBackend::from_adapter(&adapter).await {
            Ok(device) => devices.push(device),
            Err(err) => log::warn!(
                "skipping adapter {} ({:?}): {err}",
                info.name,
                info.backend
            ),
        }
    }

    if devices.is_empty() {
        return Err(Error::AdapterNotFound);
    }
    Ok(devices)
}

impl WgpuBackend {
    pub async fn from_adapter(adapter: &Adapter) -> Result<Self> {
        let info = adapter.get_info();
        let adapter_limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("copy-storage-bench"),
                    required_features: Features::empty(),
                    required_limits: adapter_limits.clone(),
                    memory_hints: MemoryHints::Performance,
                },
                None,
            )
            .await?;

        let name = format!("{} ({:?})", info.name, info.backend);
        let lost = Arc::new(Mutex::new(None));
        {
            let lost = lost.clone();
            let name = name.clone();
            device.set_device_lost_callback(move |reason, message| {
                log::error!("device {name} lost ({reason:?}): {message}");
                let mut lost = lost.lock().unwrap_or_else(PoisonError::into_inner);
                lost.get_or_insert(format!("{reason:?}: {message}"));
            });
        }

        log::info!("opened {name}, driver {} {}", info.driver, info.driver_info);
        Ok(Self {
            name,
            device,
            queue,
            limits: DeviceLimits {
                max_buffer_size: adapter_limits.max_buffer_size,
                max_storage_buffer_binding_size: u64::from(
                    adapter_limits.max_storage_buffer_binding_size,
                ),
                max_compute_workgroups_per_dimension: adapter_limits
                    .max_compute_workgroups_per_dimension,
            },
            lost,
            next_id: AtomicU64::new(0),
            objects: Mutex::new(HashMap::new()),
        })
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<RawHandle, Object>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, object: Object) -> RawHandle {
        let handle = RawHandle(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.objects().insert(handle, object);
        handle
    }

    fn check_lost(&self) -> Result<()> {
        match &*self.lost.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(reason) => Err(Error::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Runs `f` inside out-of-memory and validation error scopes. Validation
    /// errors are reported through `wrap`.
    fn scoped<T>(&self, wrap: fn(String) -> Error, f: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        self.device.push_error_scope(ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = out_of_memory {
            return Err(Error::AllocationError(err.to_string()));
        }
        if let Some(err) = validation {
            return Err(wrap(err.to_string()));
        }
        Ok(value)
    }

    fn map_and<T>(
        &self,
        buffer: &wgpu::Buffer,
        mode: MapMode,
        range: std::ops::Range<u64>,
        f: impl FnOnce(&wgpu::BufferSlice<'_>) -> T,
    ) -> Result<T> {
        let slice = buffer.slice(range);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(mode, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(Maintain::Wait);
        self.check_lost()?;
        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {
                let value = f(&slice);
                buffer.unmap();
                Ok(value)
            }
            Some(Err(err)) => Err(Error::InvalidOperation(format!(
                "buffer mapping failed: {err}"
            ))),
            None => Err(Error::InvalidOperation(
                "buffer mapping callback was dropped".into(),
            )),
        }
    }

    fn record(
        &self,
        objects: &HashMap<RawHandle, Object>,
        commands: &[RawCommand],
    ) -> Result<wgpu::CommandBuffer> {
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        let mut pipeline = None;
        let mut groups: BTreeMap<u32, &BindGroup> = BTreeMap::new();

        for command in commands {
            match *command {
                RawCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    encoder.copy_buffer_to_buffer(
                        buffer(objects, src)?,
                        src_offset,
                        buffer(objects, dst)?,
                        dst_offset,
                        size,
                    );
                }
                RawCommand::BindPipeline { pipeline: handle } => match objects.get(&handle) {
                    Some(Object::Pipeline(p)) => pipeline = Some(p),
                    _ => return Err(stale("pipeline", handle)),
                },
                RawCommand::BindDescriptorSet { index, set } => match objects.get(&set) {
                    Some(Object::DescriptorSet {
                        group: Some(group), ..
                    }) => {
                        groups.insert(index, group);
                    }
                    Some(Object::DescriptorSet { .. }) => {
                        return Err(Error::BindingMismatch(format!(
                            "descriptor set {set} is bound before all of its bindings were written"
                        )))
                    }
                    _ => return Err(stale("descriptor set", set)),
                },
                RawCommand::Dispatch { x, y, z } => {
                    let pipeline = pipeline.ok_or_else(|| {
                        Error::SubmissionError("dispatch without a bound pipeline".into())
                    })?;
                    let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                        label: None,
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(pipeline);
                    for (index, group) in &groups {
                        pass.set_bind_group(*index, *group, &[]);
                    }
                    pass.dispatch_workgroups(x, y, z);
                }
            }
        }
        Ok(encoder.finish())
    }
}

fn buffer(objects: &HashMap<RawHandle, Object>, handle: RawHandle) -> Result<&wgpu::Buffer> {
    match objects.get(&handle) {
        Some(Object::Buffer(b)) => Ok(b),
        _ => Err(stale("buffer", handle)),
    }
}

fn stale(what: &str, handle: RawHandle) -> Error {
    Error::SubmissionError(format!("{handle} is not a live {what}"))
}

fn buffer_usages(usage: BufferUsage, memory: MemoryClass) -> Result<BufferUsages> {
    match memory {
        MemoryClass::DeviceLocal => {
            let mut usages = BufferUsages::empty();
            if usage.contains(BufferUsage::COPY_SRC) {
                usages |= BufferUsages::COPY_SRC;
            }
            if usage.contains(BufferUsage::COPY_DST) {
                usages |= BufferUsages::COPY_DST;
            }
            if usage.contains(BufferUsage::STORAGE) {
                usages |= BufferUsages::STORAGE;
            }
            Ok(usages)
        }
        MemoryClass::HostVisibleCoherent => {
            if usage.contains(BufferUsage::STORAGE)
                || usage.contains(BufferUsage::COPY_SRC | BufferUsage::COPY_DST)
            {
                return Err(Error::AllocationError(format!(
                    "no host-visible memory type supports usage {usage:?}"
                )));
            }
            if usage.contains(BufferUsage::COPY_DST) {
                Ok(BufferUsages::MAP_READ | BufferUsages::COPY_DST)
            } else {
                Ok(BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC)
            }
        }
    }
}

fn layout_entries(reflection: &Reflection, set: u32) -> Vec<BindGroupLayoutEntry> {
    reflection
        .bindings
        .iter()
        .filter(|b| b.set == set)
        .map(|b| BindGroupLayoutEntry {
            binding: b.binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: match b.kind {
                    BindingKind::StorageBuffer => BufferBindingType::Storage {
                        read_only: b.read_only,
                    },
                    BindingKind::UniformBuffer => BufferBindingType::Uniform,
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect()
}

impl Backend for WgpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<RawHandle> {
        self.check_lost()?;
        let usage = buffer_usages(desc.usage, desc.memory)?;
        let buffer = self.scoped(Error::AllocationError, || {
            self.device.create_buffer(&BufferDescriptor {
                label: Some(desc.label),
                size: desc.size,
                usage,
                mapped_at_creation: false,
            })
        })?;
        Ok(self.insert(Object::Buffer(buffer)))
    }

    fn read_buffer(&self, handle: RawHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        let buffer = buffer(&self.objects(), handle)?.clone();
        let mode = if buffer.usage().contains(BufferUsages::MAP_READ) {
            MapMode::Read
        } else {
            MapMode::Write
        };
        let end = offset + out.len() as u64;
        self.map_and(&buffer, mode, offset..end, |slice| {
            out.copy_from_slice(&slice.get_mapped_range());
        })
    }

    fn write_buffer(&self, handle: RawHandle, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = buffer(&self.objects(), handle)?.clone();
        if buffer.usage().contains(BufferUsages::MAP_WRITE) {
            let end = offset + data.len() as u64;
            self.map_and(&buffer, MapMode::Write, offset..end, |slice| {
                slice.get_mapped_range_mut().copy_from_slice(data);
            })
        } else {
            // Readback buffers cannot be mapped for writing; go through the queue.
            self.queue.write_buffer(&buffer, offset, data);
            let index = self.queue.submit([]);
            self.device.poll(Maintain::wait_for(index));
            self.check_lost()
        }
    }

    fn create_shader_module(&self, words: &[u32], reflection: &Reflection) -> Result<RawHandle> {
        self.check_lost()?;
        let set_count = reflection
            .bindings
            .iter()
            .map(|b| b.set + 1)
            .max()
            .unwrap_or(0);

        let (module, layouts, pipeline_layout) = self.scoped(Error::InvalidShaderBinary, || {
            let module = self.device.create_shader_module(ShaderModuleDescriptor {
                label: None,
                source: ShaderSource::SpirV(Cow::Borrowed(words)),
            });
            let layouts: Vec<(BindGroupLayout, Vec<u32>)> = (0..set_count)
                .map(|set| {
                    let entries = layout_entries(reflection, set);
                    let layout = self
                        .device
                        .create_bind_group_layout(&BindGroupLayoutDescriptor {
                            label: None,
                            entries: &entries,
                        });
                    (layout, entries.iter().map(|e| e.binding).collect())
                })
                .collect();
            let pipeline_layout = self
                .device
                .create_pipeline_layout(&PipelineLayoutDescriptor {
                    label: None,
                    bind_group_layouts: &layouts.iter().map(|(l, _)| l).collect::<Vec<_>>(),
                    push_constant_ranges: &[],
                });
            (module, layouts, pipeline_layout)
        })?;

        Ok(self.insert(Object::Module {
            module,
            layouts,
            pipeline_layout,
        }))
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<RawHandle> {
        self.check_lost()?;
        let (module, pipeline_layout) = match self.objects().get(&desc.module) {
            Some(Object::Module {
                module,
                pipeline_layout,
                ..
            }) => (module.clone(), pipeline_layout.clone()),
            _ => {
                return Err(Error::PipelineCreation(format!(
                    "{} is not a live shader module",
                    desc.module
                )))
            }
        };
        // naga keys SPIR-V specialization constants by their numeric id.
        let constants: HashMap<String, f64> = desc
            .constants
            .iter()
            .map(|c| (c.id.to_string(), c.value.as_f64()))
            .collect();

        let pipeline = self.scoped(Error::PipelineCreation, || {
            self.device
                .create_compute_pipeline(&ComputePipelineDescriptor {
                    label: None,
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(desc.entry_point),
                    compilation_options: PipelineCompilationOptions {
                        constants: &constants,
                        zero_initialize_workgroup_memory: true,
                    },
                    cache: None,
                })
        })?;
        Ok(self.insert(Object::Pipeline(pipeline)))
    }

    fn create_descriptor_set(&self, module: RawHandle, set: u32) -> Result<RawHandle> {
        let layout = match self.objects().get(&module) {
            Some(Object::Module { layouts, .. }) => layouts.get(set as usize).cloned(),
            _ => None,
        };
        let Some((layout, expected)) = layout else {
            return Err(Error::BindingMismatch(format!(
                "module {module} has no descriptor set {set}"
            )));
        };
        Ok(self.insert(Object::DescriptorSet {
            layout,
            expected,
            entries: BTreeMap::new(),
            group: None,
        }))
    }

    fn write_descriptor_set(&self, set: RawHandle, writes: &[DescriptorWrite]) -> Result<()> {
        let mut objects = self.objects();
        let (layout, merged, complete) = match objects.get(&set) {
            Some(Object::DescriptorSet {
                layout,
                expected,
                entries,
                ..
            }) => {
                let mut merged = entries.clone();
                for write in writes {
                    merged.insert(write.binding, (write.buffer, write.size));
                }
                let complete = expected.iter().all(|b| merged.contains_key(b));
                (layout.clone(), merged, complete)
            }
            _ => {
                return Err(Error::BindingMismatch(format!(
                    "{set} is not a live descriptor set"
                )))
            }
        };

        // The set keeps its previous entries and bind group unless the new
        // group is built successfully.
        let built = if complete {
            let resources = merged
                .iter()
                .map(|(&binding, &(handle, size))| {
                    Ok(BindGroupEntry {
                        binding,
                        resource: BindingResource::Buffer(BufferBinding {
                            buffer: buffer(&objects, handle)?,
                            offset: 0,
                            size: wgpu::BufferSize::new(size),
                        }),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Some(self.scoped(Error::BindingMismatch, || {
                self.device.create_bind_group(&BindGroupDescriptor {
                    label: None,
                    layout: &layout,
                    entries: &resources,
                })
            })?)
        } else {
            None
        };

        if let Some(Object::DescriptorSet { entries, group, .. }) = objects.get_mut(&set) {
            *entries = merged;
            *group = built;
        }
        Ok(())
    }

    fn encode(&self, commands: &[RawCommand]) -> Result<RawHandle> {
        self.check_lost()?;
        let recorded = {
            let objects = self.objects();
            self.scoped(Error::SubmissionError, || self.record(&objects, commands))??
        };
        Ok(self.insert(Object::Encoded(Some(recorded))))
    }

    fn submit_and_wait(&self, encoded: RawHandle, commands: &[RawCommand]) -> Result<()> {
        self.check_lost()?;
        let command_buffer = {
            let mut objects = self.objects();
            let cached = match objects.get_mut(&encoded) {
                Some(Object::Encoded(cached)) => cached.take(),
                _ => return Err(stale("command buffer", encoded)),
            };
            match cached {
                Some(command_buffer) => command_buffer,
                None => self.scoped(Error::SubmissionError, || self.record(&objects, commands))??,
            }
        };

        let index = self.scoped(Error::SubmissionError, || {
            self.queue.submit(Some(command_buffer))
        })?;
        self.device.poll(Maintain::wait_for(index));
        self.check_lost()
    }

    fn destroy(&self, handle: RawHandle) {
        match self.objects().remove(&handle) {
            Some(Object::Buffer(buffer)) => buffer.destroy(),
            Some(_) => {}
            None => log::warn!("destroying unknown wgpu object {handle}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmarks::ShaderVariant;
    use crate::spirv;

    #[test]
    fn staging_usages_follow_transfer_direction() {
        assert_eq!(
            buffer_usages(BufferUsage::COPY_SRC, MemoryClass::HostVisibleCoherent).unwrap(),
            BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC
        );
        assert_eq!(
            buffer_usages(BufferUsage::COPY_DST, MemoryClass::HostVisibleCoherent).unwrap(),
            BufferUsages::MAP_READ | BufferUsages::COPY_DST
        );
        assert!(buffer_usages(BufferUsage::STORAGE, MemoryClass::HostVisibleCoherent).is_err());
    }

    #[test]
    fn device_local_usages_map_one_to_one() {
        assert_eq!(
            buffer_usages(
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
                MemoryClass::DeviceLocal
            )
            .unwrap(),
            BufferUsages::STORAGE | BufferUsages::COPY_DST
        );
    }

    #[test]
    fn copy_kernel_layouts_match_declared_storage_access() {
        for variant in ShaderVariant::ALL {
            let reflection = spirv::reflect(&variant.spirv_words().unwrap()).unwrap();
            let entries = layout_entries(&reflection, 0);
            assert_eq!(entries.len(), 2);
            for entry in entries {
                assert!(
                    matches!(
                        entry.ty,
                        BindingType::Buffer {
                            ty: BufferBindingType::Storage { read_only: false },
                            ..
                        }
                    ),
                    "{} binding {}",
                    variant.name(),
                    entry.binding
                );
            }
        }
    }

    fn first_backend() -> Option<WgpuBackend> {
        match pollster::block_on(enumerate_devices()) {
            Ok(backends) => backends.into_iter().next(),
            Err(err) => {
                eprintln!("skipping: {err}");
                None
            }
        }
    }

    #[test]
    fn rejected_descriptor_write_keeps_previous_bind_group() {
        let Some(backend) = first_backend() else {
            return;
        };
        let words = ShaderVariant::Scalar.spirv_words().unwrap();
        let reflection = spirv::reflect(&words).unwrap();
        let module = backend.create_shader_module(&words, &reflection).unwrap();
        let buffer = |label, usage| {
            backend
                .create_buffer(&BufferDesc {
                    label,
                    size: 256,
                    usage,
                    memory: MemoryClass::DeviceLocal,
                })
                .unwrap()
        };
        let src = buffer("src", BufferUsage::STORAGE);
        let dst = buffer("dst", BufferUsage::STORAGE);
        let plain = buffer("plain", BufferUsage::COPY_DST);

        let set = backend.create_descriptor_set(module, 0).unwrap();
        let write = |binding, buffer| DescriptorWrite {
            binding,
            buffer,
            size: 256,
        };
        backend
            .write_descriptor_set(set, &[write(0, src), write(1, dst)])
            .unwrap();
        let bind = [RawCommand::BindDescriptorSet { index: 0, set }];
        backend.encode(&bind).unwrap();

        assert!(matches!(
            backend.write_descriptor_set(set, &[write(1, plain)]),
            Err(Error::BindingMismatch(_))
        ));
        backend.encode(&bind).unwrap();
    }
}
