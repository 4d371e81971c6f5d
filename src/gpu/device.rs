use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::spirv;

use super::backend::{Backend, BufferDesc, DeviceLimits, OwnedHandle, PipelineDesc};
use super::buffer::{Buffer, BufferUsage, MemoryClass};
use super::command::{CommandBuffer, CommandBufferState};
use super::descriptor::{BoundBuffer, DescriptorPool, LayoutSetMap};
use super::pipeline::{resolve_spec_constants, Pipeline, ShaderModule, SpecConstant};

/// Front-end over a [`Backend`]: creates device objects, validates their use
/// and provides the single synchronous submission queue.
pub struct Device {
    backend: Arc<dyn Backend>,
    pool_epoch: Arc<AtomicU64>,
    lost: OnceLock<String>,
}

impl Device {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            pool_epoch: Arc::new(AtomicU64::new(0)),
            lost: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn limits(&self) -> DeviceLimits {
        self.backend.limits()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.get().is_some()
    }

    pub fn create_buffer(
        &self,
        usage: BufferUsage,
        memory: MemoryClass,
        size: u64,
    ) -> Result<Buffer> {
        self.create_labeled_buffer("buffer", usage, memory, size)
    }

    pub fn create_labeled_buffer(
        &self,
        label: &str,
        usage: BufferUsage,
        memory: MemoryClass,
        size: u64,
    ) -> Result<Buffer> {
        if size == 0 {
            return Err(Error::AllocationError(format!(
                "buffer '{label}' has zero size"
            )));
        }
        let max = self.limits().max_buffer_size;
        if size > max {
            return Err(Error::AllocationError(format!(
                "buffer '{label}' of {size} bytes exceeds the device limit of {max} bytes"
            )));
        }
        let raw = self.backend.create_buffer(&BufferDesc {
            label,
            size,
            usage,
            memory,
        })?;
        log::debug!("created {memory:?} buffer '{label}' ({size} bytes, {usage:?})");
        Ok(Buffer::new(
            self.backend.clone(),
            raw,
            label,
            size,
            usage,
            memory,
        ))
    }

    pub fn create_shader_module(&self, words: &[u32]) -> Result<ShaderModule> {
        let reflection = spirv::reflect(words)?;
        let raw = self.backend.create_shader_module(words, &reflection)?;
        log::debug!(
            "created shader module with {} bindings, {} specialization constants",
            reflection.bindings.len(),
            reflection.spec_constants.len()
        );
        Ok(ShaderModule::new(
            OwnedHandle::new(self.backend.clone(), raw),
            reflection,
        ))
    }

    pub fn create_pipeline(
        &self,
        module: &ShaderModule,
        entry_point: &str,
        constants: &[SpecConstant],
    ) -> Result<Pipeline> {
        let entry = module
            .reflection()
            .entry_point(entry_point)
            .ok_or_else(|| Error::EntryPointNotFound(entry_point.to_string()))?;
        let workgroup_size = entry.workgroup_size;
        let constants = resolve_spec_constants(module.reflection(), constants)?;
        let raw = self.backend.create_pipeline(&PipelineDesc {
            module: module.raw(),
            reflection: module.reflection(),
            entry_point,
            constants: &constants,
        })?;
        Ok(Pipeline::new(
            OwnedHandle::new(self.backend.clone(), raw),
            module,
            entry_point,
            workgroup_size,
            constants,
        ))
    }

    pub fn create_descriptor_pool(&self, module: &ShaderModule) -> Result<DescriptorPool> {
        Ok(DescriptorPool::new(module))
    }

    /// Attaches all of `bound` to their slots in one step. Nothing is written
    /// unless every entry names a binding the module declares.
    pub fn attach_buffer_to_descriptor(
        &self,
        module: &ShaderModule,
        sets: &mut LayoutSetMap,
        bound: &[BoundBuffer<'_>],
    ) -> Result<()> {
        sets.attach(module, bound, &self.limits())
    }

    pub fn allocate_command_buffer(&self) -> Result<CommandBuffer> {
        self.check_lost()?;
        Ok(CommandBuffer::new(
            self.backend.clone(),
            self.pool_epoch.clone(),
        ))
    }

    /// Invalidates every command buffer allocated so far.
    pub fn reset_command_pool(&self) -> Result<()> {
        let epoch = self.pool_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("command pool reset (epoch {epoch})");
        Ok(())
    }

    /// Submits `cmd` and blocks until the device has finished executing it.
    pub fn queue_submit_and_wait(&self, cmd: &mut CommandBuffer) -> Result<()> {
        self.check_lost()?;
        cmd.expect_state(CommandBufferState::Executable, "queue_submit_and_wait")?;
        if let Some(label) = cmd.mapped_buffer() {
            return Err(Error::InvalidOperation(format!(
                "buffer '{label}' is still mapped and cannot be used in a submission"
            )));
        }
        let Some(encoded) = cmd.encoded() else {
            return Err(Error::InvalidState(
                "executable command buffer has no encoded commands".into(),
            ));
        };

        cmd.set_state(CommandBufferState::Pending);
        let result = self.backend.submit_and_wait(encoded, cmd.commands());
        cmd.set_state(CommandBufferState::Executable);

        if let Err(Error::DeviceLost(reason)) = &result {
            log::error!("device '{}' lost: {reason}", self.name());
            let _ = self.lost.set(reason.clone());
        }
        result
    }

    fn check_lost(&self) -> Result<()> {
        match self.lost.get() {
            Some(reason) => Err(Error::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmarks::ShaderVariant;
    use crate::gpu::soft::{Fault, SoftBackend};

    #[test]
    fn rejects_oversized_and_empty_buffers() {
        let device = Device::new(Arc::new(SoftBackend::new()));
        let max = device.limits().max_buffer_size;
        assert!(matches!(
            device.create_buffer(BufferUsage::STORAGE, MemoryClass::DeviceLocal, max + 4),
            Err(Error::AllocationError(_))
        ));
        assert!(matches!(
            device.create_buffer(BufferUsage::STORAGE, MemoryClass::DeviceLocal, 0),
            Err(Error::AllocationError(_))
        ));
    }

    #[test]
    fn host_visible_storage_is_unavailable() {
        let device = Device::new(Arc::new(SoftBackend::new()));
        assert!(matches!(
            device.create_buffer(BufferUsage::STORAGE, MemoryClass::HostVisibleCoherent, 64),
            Err(Error::AllocationError(_))
        ));
    }

    #[test]
    fn unknown_entry_point_and_missing_constant() {
        let device = Device::new(Arc::new(SoftBackend::new()));
        let words = ShaderVariant::Scalar.spirv_words().unwrap();
        let module = device.create_shader_module(&words).unwrap();

        assert!(matches!(
            device.create_pipeline(&module, "copy", &[SpecConstant::s32(0, 32)]),
            Err(Error::EntryPointNotFound(name)) if name == "copy"
        ));
        assert!(matches!(
            device.create_pipeline(&module, "main", &[]),
            Err(Error::MissingSpecializationConstant { id: 0 })
        ));

        let pipeline = device
            .create_pipeline(&module, "main", &[SpecConstant::s32(0, 32)])
            .unwrap();
        assert_eq!(pipeline.workgroup_size(), [32, 1, 1]);
    }

    #[test]
    fn malformed_binary_is_rejected() {
        let device = Device::new(Arc::new(SoftBackend::new()));
        assert!(matches!(
            device.create_shader_module(&[1, 2, 3, 4, 5, 6]),
            Err(Error::InvalidShaderBinary(_))
        ));
    }

    #[test]
    fn mapped_buffers_cannot_be_submitted() {
        let device = Device::new(Arc::new(SoftBackend::new()));
        let mut staging = device
            .create_buffer(BufferUsage::COPY_SRC, MemoryClass::HostVisibleCoherent, 64)
            .unwrap();
        let dst = device
            .create_buffer(BufferUsage::COPY_DST, MemoryClass::HostVisibleCoherent, 64)
            .unwrap();

        let mut cmd = device.allocate_command_buffer().unwrap();
        cmd.begin().unwrap();
        cmd.copy_buffer(&staging, 0, &dst, 0, 64).unwrap();
        cmd.end().unwrap();

        let mapping = staging.map(0, 64).unwrap();
        assert!(matches!(
            device.queue_submit_and_wait(&mut cmd),
            Err(Error::InvalidOperation(_))
        ));
        mapping.unmap().unwrap();
        device.queue_submit_and_wait(&mut cmd).unwrap();
    }

    #[test]
    fn device_loss_is_sticky() {
        let backend = Arc::new(SoftBackend::new());
        backend.inject(Fault::LoseDeviceOnSubmit { submission: 1 });
        let device = Device::new(backend);

        let mut cmd = device.allocate_command_buffer().unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        device.queue_submit_and_wait(&mut cmd).unwrap();
        assert!(matches!(
            device.queue_submit_and_wait(&mut cmd),
            Err(Error::DeviceLost(_))
        ));
        assert!(device.is_lost());
        assert!(matches!(
            device.allocate_command_buffer(),
            Err(Error::DeviceLost(_))
        ));
    }
}
