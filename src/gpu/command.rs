use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

use super::backend::{Backend, OwnedHandle, RawCommand, RawHandle};
use super::buffer::{Buffer, BufferShared, BufferUsage, COPY_ALIGNMENT};
use super::descriptor::BoundDescriptorSet;
use super::pipeline::{Pipeline, PipelineShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

/// A recorded sequence of copy/bind/dispatch commands submitted as a unit.
pub struct CommandBuffer {
    backend: Arc<dyn Backend>,
    pool_epoch: Arc<AtomicU64>,
    epoch: u64,
    state: CommandBufferState,
    commands: Vec<RawCommand>,
    buffers: Vec<Arc<BufferShared>>,
    pipelines: Vec<Arc<PipelineShared>>,
    sets: Vec<Arc<OwnedHandle>>,
    encoded: Option<OwnedHandle>,
    bound_pipeline: bool,
}

impl CommandBuffer {
    pub(crate) fn new(backend: Arc<dyn Backend>, pool_epoch: Arc<AtomicU64>) -> Self {
        let epoch = pool_epoch.load(Ordering::Acquire);
        Self {
            backend,
            pool_epoch,
            epoch,
            state: CommandBufferState::Initial,
            commands: Vec::new(),
            buffers: Vec::new(),
            pipelines: Vec::new(),
            sets: Vec::new(),
            encoded: None,
            bound_pipeline: false,
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn begin(&mut self) -> Result<()> {
        self.expect_state(CommandBufferState::Initial, "begin")?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Finishes recording. The backend encodes the commands here so that
    /// submission only pays for submit and wait.
    pub fn end(&mut self) -> Result<()> {
        self.expect_state(CommandBufferState::Recording, "end")?;
        let raw = self.backend.encode(&self.commands)?;
        self.encoded = Some(OwnedHandle::new(self.backend.clone(), raw));
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Returns the buffer to the initial state and drops every reference it
    /// held to recorded resources.
    pub fn reset(&mut self) -> Result<()> {
        self.check_pool("reset")?;
        if self.state == CommandBufferState::Pending {
            return Err(Error::InvalidState(
                "cannot reset a command buffer while it is pending".into(),
            ));
        }
        self.commands.clear();
        self.buffers.clear();
        self.pipelines.clear();
        self.sets.clear();
        self.encoded = None;
        self.bound_pipeline = false;
        self.state = CommandBufferState::Initial;
        Ok(())
    }

    pub fn bind_pipeline_and_descriptor_sets(
        &mut self,
        pipeline: &Pipeline,
        sets: &[BoundDescriptorSet<'_>],
    ) -> Result<()> {
        self.expect_state(CommandBufferState::Recording, "bind_pipeline_and_descriptor_sets")?;
        for bound in sets {
            let layout = bound.set.layout();
            if layout.module() != pipeline.module_raw() || layout.set() != bound.index {
                return Err(Error::BindingMismatch(format!(
                    "descriptor set for set {} cannot be bound at index {} of this pipeline",
                    layout.set(),
                    bound.index
                )));
            }
            if !bound.set.is_complete() {
                return Err(Error::BindingMismatch(format!(
                    "descriptor set {} has unattached bindings",
                    bound.index
                )));
            }
        }

        self.commands.push(RawCommand::BindPipeline {
            pipeline: pipeline.shared().handle.raw(),
        });
        self.pipelines.push(pipeline.shared().clone());
        for bound in sets {
            self.commands.push(RawCommand::BindDescriptorSet {
                index: bound.index,
                set: bound.set.raw(),
            });
            self.sets.push(bound.set.handle.clone());
            self.buffers.extend(bound.set.bound.values().cloned());
        }
        self.bound_pipeline = true;
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.expect_state(CommandBufferState::Recording, "dispatch")?;
        if !self.bound_pipeline {
            return Err(Error::InvalidState(
                "dispatch recorded before any pipeline was bound".into(),
            ));
        }
        let max = self.backend.limits().max_compute_workgroups_per_dimension;
        if [x, y, z].iter().any(|&groups| groups > max) {
            return Err(Error::InvalidOperation(format!(
                "dispatch of ({x}, {y}, {z}) groups exceeds the device limit of {max} per dimension"
            )));
        }
        self.commands.push(RawCommand::Dispatch { x, y, z });
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.expect_state(CommandBufferState::Recording, "copy_buffer")?;
        if !src.usage().contains(BufferUsage::COPY_SRC) {
            return Err(Error::InvalidOperation(format!(
                "copy source '{}' lacks COPY_SRC usage",
                src.label()
            )));
        }
        if !dst.usage().contains(BufferUsage::COPY_DST) {
            return Err(Error::InvalidOperation(format!(
                "copy destination '{}' lacks COPY_DST usage",
                dst.label()
            )));
        }
        if [src_offset, dst_offset, size]
            .iter()
            .any(|v| v % COPY_ALIGNMENT != 0)
        {
            return Err(Error::InvalidOperation(format!(
                "copy of {size} bytes at {src_offset} -> {dst_offset} is not {COPY_ALIGNMENT}-byte aligned"
            )));
        }
        let fits = |offset: u64, buffer: &Buffer| {
            offset
                .checked_add(size)
                .is_some_and(|end| end <= buffer.size())
        };
        if !fits(src_offset, src) || !fits(dst_offset, dst) {
            return Err(Error::InvalidOperation(format!(
                "copy of {size} bytes from '{}'+{src_offset} to '{}'+{dst_offset} is out of bounds",
                src.label(),
                dst.label()
            )));
        }

        self.commands.push(RawCommand::CopyBuffer {
            src: src.shared().raw(),
            src_offset,
            dst: dst.shared().raw(),
            dst_offset,
            size,
        });
        self.buffers.push(src.shared().clone());
        self.buffers.push(dst.shared().clone());
        Ok(())
    }

    pub(crate) fn commands(&self) -> &[RawCommand] {
        &self.commands
    }

    pub(crate) fn encoded(&self) -> Option<RawHandle> {
        self.encoded.as_ref().map(OwnedHandle::raw)
    }

    pub(crate) fn mapped_buffer(&self) -> Option<&str> {
        self.buffers
            .iter()
            .find(|b| b.is_mapped())
            .map(|b| b.label())
    }

    pub(crate) fn set_state(&mut self, state: CommandBufferState) {
        self.state = state;
    }

    pub(crate) fn check_pool(&self, op: &str) -> Result<()> {
        if self.epoch != self.pool_epoch.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!(
                "{op} on a command buffer whose pool has been reset"
            )));
        }
        Ok(())
    }

    pub(crate) fn expect_state(&self, expected: CommandBufferState, op: &str) -> Result<()> {
        self.check_pool(op)?;
        if self.state != expected {
            return Err(Error::InvalidState(format!(
                "{op} requires the {expected:?} state but the command buffer is {:?}",
                self.state
            )));
        }
        Ok(())
    }
}
